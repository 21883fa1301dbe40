//! Pluggable payload transform applied to every message on the wire.
//!
//! The messaging layer never looks inside a scheme: it calls
//! [`EncryptionScheme::encrypt`] on every outgoing request or reply and
//! [`EncryptionScheme::decrypt`] on every incoming one.

use std::sync::Arc;

use crate::Result;
use crate::log::Logger;

/// A reversible string transform.
///
/// Implementations must not depend on call order: encrypt and decrypt may
/// be invoked any number of times, from any thread, in any interleaving.
pub trait EncryptionScheme: Send + Sync {
    /// Transforms an outgoing message. Fails with [`Error::Encrypt`](crate::Error::Encrypt).
    fn encrypt(&self, message: &str) -> Result<String>;

    /// Reverses [`encrypt`](Self::encrypt). Fails with [`Error::Decrypt`](crate::Error::Decrypt).
    fn decrypt(&self, message: &str) -> Result<String>;
}

/// Scheme that leaves messages untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl EncryptionScheme for Identity {
    fn encrypt(&self, message: &str) -> Result<String> {
        Ok(message.to_owned())
    }

    fn decrypt(&self, message: &str) -> Result<String> {
        Ok(message.to_owned())
    }
}

/// Pass-through scheme that records every message it sees.
///
/// Useful when debugging a deployment: point it at a logger and every
/// payload crossing the wire shows up at debug level.
pub struct Tap {
    /// Where observed payloads go.
    logger: Arc<dyn Logger>,
}

impl Tap {
    /// Creates a tap reporting to `logger`.
    pub fn new(logger: Arc<dyn Logger>) -> Self {
        Self { logger }
    }
}

impl std::fmt::Debug for Tap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tap").finish_non_exhaustive()
    }
}

impl EncryptionScheme for Tap {
    fn encrypt(&self, message: &str) -> Result<String> {
        self.logger.debug(&format!("outgoing: {message}"));
        Ok(message.to_owned())
    }

    fn decrypt(&self, message: &str) -> Result<String> {
        self.logger.debug(&format!("incoming: {message}"));
        Ok(message.to_owned())
    }
}
