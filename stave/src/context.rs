//! Process-wide transport context.
//!
//! ZeroMQ requires one context per process; every socket a [`Client`],
//! [`Server`], or [`Subscription`] opens is created from it. The context
//! is built once by the application and handed to each instance, which
//! keeps a reference-counted clone. `inproc://` endpoints only connect
//! sockets that share the same context.
//!
//! The context terminates when the last clone drops. Sockets are opened
//! with a zero linger period, so termination never waits on undelivered
//! messages.
//!
//! [`Client`]: crate::Client
//! [`Server`]: crate::Server
//! [`Subscription`]: crate::Subscription

use std::time::Duration;

use crate::Result;

/// Shared handle to the ZeroMQ context.
#[derive(Clone)]
pub struct Context {
    /// Underlying context; cloning shares it.
    inner: zmq::Context,
}

impl Context {
    /// Creates a new transport context.
    pub fn new() -> Self {
        Self {
            inner: zmq::Context::new(),
        }
    }

    /// Opens a socket of the given type with linger disabled.
    pub(crate) fn socket(&self, kind: zmq::SocketType) -> Result<zmq::Socket> {
        let socket = self.inner.socket(kind)?;
        socket.set_linger(0)?;
        Ok(socket)
    }
}

/// Converts a poll timeout to the millisecond count ZeroMQ expects.
pub(crate) fn poll_millis(timeout: Duration) -> i64 {
    i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX)
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").finish_non_exhaustive()
    }
}
