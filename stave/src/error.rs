//! Error types for stave messaging operations.

use stave_proto::DeserializationFailure;

/// Alias for `Result<T, stave::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by clients, servers, and their collaborators.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The encryption scheme could not encrypt an outgoing message.
    #[error("encryption failed: {0}")]
    Encrypt(String),

    /// The encryption scheme could not decrypt an incoming message.
    #[error("decryption failed: {0}")]
    Decrypt(String),

    /// Wire data did not have the expected shape.
    #[error(transparent)]
    Deserialization(#[from] DeserializationFailure),

    /// Catch-all failure raised by handlers and pre/postprocessors.
    #[error("{0}")]
    Generic(String),

    /// The underlying ZeroMQ socket reported an error.
    #[error("transport: {0}")]
    Transport(#[from] zmq::Error),

    /// The instance has been stopped.
    #[error("endpoint is closed")]
    Closed,

    /// The server rejected our handshake.
    #[error("version mismatch: remote runs {remote}")]
    VersionMismatch {
        /// Version reported by the remote end.
        remote: String,
    },

    /// The background listener thread could not be spawned.
    #[error("failed to spawn listener thread: {0}")]
    Spawn(#[source] std::io::Error),
}

impl Error {
    /// Builds an [`Error::Generic`] from any displayable message.
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic(msg.into())
    }
}
