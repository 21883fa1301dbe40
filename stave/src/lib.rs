//! Request/reply and broadcast messaging for collaborative score editing.
//!
//! A [`Server`] binds two ZeroMQ endpoints: an interactive request/reply
//! socket answered one request at a time by a background listener, and a
//! publish socket for broadcasting state changes. A [`Client`] connects to
//! both, sends synchronous requests from the caller's thread, and drains
//! broadcasts into a handler on its own listener thread.
//!
//! Every payload passes through an injected [`EncryptionScheme`], and both
//! ends report through an injected [`Logger`].
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use stave::{Client, Context, Pipeline, Response, Server};
//!
//! # fn main() -> stave::Result<()> {
//! let ctx = Context::new();
//!
//! let server = Server::builder(&ctx, "tcp://127.0.0.1:5000", "tcp://127.0.0.1:5001").bind()?;
//! server.start_background(Pipeline::new(|server: &Server, msg: String| {
//!     server.broadcast(&msg)?;
//!     Ok(Response::ok([msg]).encode())
//! }))?;
//!
//! let client = Client::builder(&ctx, "tcp://127.0.0.1:5000", "tcp://127.0.0.1:5001")
//!     .logger(Arc::new(stave::log::Tracing))
//!     .connect()?;
//! let reply = client.send("hello")?;
//! assert_eq!(stave::decode_response(&reply).payload, ["hello"]);
//!
//! client.stop()?;
//! server.stop()?;
//! # Ok(())
//! # }
//! ```

mod client;
mod context;
pub mod crypto;
mod error;
mod gate;
mod lifecycle;
pub mod log;
mod server;
mod subscription;

use std::any::Any;

pub use client::{Client, ClientBuilder, DEFAULT_CLIENT_POLL_TIMEOUT, Listener};
pub use context::Context;
pub use crypto::EncryptionScheme;
pub use error::{Error, Result};
pub use lifecycle::State;
pub use log::Logger;
pub use server::{
    DEFAULT_SERVER_POLL_TIMEOUT, FailReason, Pipeline, Server, ServerBuilder, Stage, failure_reply,
};
pub use stave_proto::{
    Request, Response, decode_request, decode_response, encode_request, encode_response,
};
pub use subscription::{BACKLOG_CAPACITY, Subscription};

/// A fallible message transform used as a pre- or postprocessor.
pub type Transform = Box<dyn Fn(String) -> Result<String> + Send>;

/// The pass-through transform; default pre- and postprocessor.
pub fn identity(message: String) -> Result<String> {
    Ok(message)
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shared fixtures for unit tests.

    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::log::{Level, Logger};
    use crate::{EncryptionScheme, Error, Result};

    /// Returns a fresh `inproc://` address.
    pub(crate) fn endpoint(tag: &str) -> String {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        format!("inproc://{tag}-{}", NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Gives subscriptions time to reach their publisher.
    pub(crate) fn settle() {
        std::thread::sleep(Duration::from_millis(100));
    }

    /// Logger that records `(level, message)` pairs.
    #[derive(Default)]
    pub(crate) struct Recorder(Mutex<Vec<(Level, String)>>);

    impl Recorder {
        pub(crate) fn messages(&self) -> Vec<(Level, String)> {
            self.0.lock().unwrap().clone()
        }

        pub(crate) fn contains(&self, level: Level, needle: &str) -> bool {
            self.messages()
                .iter()
                .any(|(l, m)| *l == level && m.contains(needle))
        }

        fn push(&self, level: Level, m: &str) {
            self.0.lock().unwrap().push((level, m.to_owned()));
        }
    }

    impl Logger for Recorder {
        fn info(&self, m: &str) {
            self.push(Level::Info, m);
        }
        fn debug(&self, m: &str) {
            self.push(Level::Debug, m);
        }
        fn warn(&self, m: &str) {
            self.push(Level::Warning, m);
        }
        fn error(&self, m: &str) {
            self.push(Level::Error, m);
        }
        fn critical(&self, m: &str) {
            self.push(Level::Critical, m);
        }
    }

    /// Reverses strings; decryption rejects anything starting with `!`.
    #[derive(Debug, Clone, Copy, Default)]
    pub(crate) struct Mirror;

    impl EncryptionScheme for Mirror {
        fn encrypt(&self, message: &str) -> Result<String> {
            if message.contains("unencryptable") {
                return Err(Error::Encrypt("refused".into()));
            }
            Ok(message.chars().rev().collect())
        }

        fn decrypt(&self, message: &str) -> Result<String> {
            if message.starts_with('!') {
                return Err(Error::Decrypt("bad header".into()));
            }
            Ok(message.chars().rev().collect())
        }
    }
}
