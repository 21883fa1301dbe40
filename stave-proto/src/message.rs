//! Protocol message types for client↔server communication.

use serde::{Deserialize, Serialize};

/// Status tag of a successful [`Response`].
pub const OK: &str = "ok";

/// Status tag of a failed [`Response`].
pub const FAIL: &str = "fail";

/// Request name of the version check every client performs first.
pub const HANDSHAKE: &str = "handshake";

/// Protocol version exchanged during the handshake.
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Remote procedure call sent from client to server.
///
/// Arguments always travel as strings; coercing them is the receiver's job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Name of the function to invoke.
    #[serde(rename = "fName")]
    pub name: String,
    /// Positional arguments, in call order.
    pub args: Vec<String>,
}

impl Request {
    /// Creates a request, stringifying every argument.
    pub fn new<A: ToString>(name: impl Into<String>, args: impl IntoIterator<Item = A>) -> Self {
        Self {
            name: name.into(),
            args: args.into_iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Returns the argument at `index`, if present.
    pub fn arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(String::as_str)
    }
}

/// Reply sent from server to client: a status tag and its payload.
///
/// On the wire this is the two-element array `[status, [payload...]]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// `"ok"`, `"fail"`, or a caller-defined tag.
    pub status: String,
    /// Result values, in order.
    pub payload: Vec<String>,
}

impl Response {
    /// Creates a response with an arbitrary status tag.
    pub fn new<A: ToString>(
        status: impl Into<String>,
        payload: impl IntoIterator<Item = A>,
    ) -> Self {
        Self {
            status: status.into(),
            payload: payload.into_iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Creates an `"ok"` response.
    pub fn ok<A: ToString>(payload: impl IntoIterator<Item = A>) -> Self {
        Self::new(OK, payload)
    }

    /// Creates a `"fail"` response.
    pub fn fail<A: ToString>(payload: impl IntoIterator<Item = A>) -> Self {
        Self::new(FAIL, payload)
    }

    /// Returns `true` if the status tag is `"ok"`.
    pub fn is_ok(&self) -> bool {
        self.status == OK
    }

    /// Returns `true` if the status tag is `"fail"`.
    pub fn is_fail(&self) -> bool {
        self.status == FAIL
    }
}

/// Answers a [`HANDSHAKE`] request on behalf of a server running `server_version`.
///
/// A mismatch yields `fail ["version mismatch", server_version]`, so the
/// client can report which version the server expects.
pub fn check_version(req: &Request, server_version: &str) -> Response {
    match req.arg(0) {
        Some(v) if v == server_version => Response::ok([server_version]),
        _ => Response::fail(["version mismatch", server_version]),
    }
}
