//! JSON wire codec for requests and responses.
//!
//! A request is the object `{"fName": name, "args": [..]}`; a response is
//! the array `[status, [..]]`. Every argument is carried as a string.

use serde::de;
use serde_json::{Value, json};

use crate::message::{FAIL, Request, Response};

/// Raised when a request body is not a well-formed [`Request`].
#[derive(Debug, thiserror::Error)]
#[error("received malformed data: {data}")]
pub struct DeserializationFailure {
    /// The offending wire text.
    pub data: String,
    /// Why the parser rejected it.
    #[source]
    pub source: serde_json::Error,
}

/// Serializes a call to `name` with stringified `args`.
pub fn encode_request<A: ToString>(name: &str, args: impl IntoIterator<Item = A>) -> String {
    let args: Vec<String> = args.into_iter().map(|a| a.to_string()).collect();
    json!({ "fName": name, "args": args }).to_string()
}

/// Parses a request produced by [`encode_request`].
///
/// Only a JSON object is accepted; serde would otherwise also take a
/// `[name, args]` array as a struct.
pub fn decode_request(wire: &str) -> Result<Request, DeserializationFailure> {
    let fail = |source| DeserializationFailure {
        data: wire.to_owned(),
        source,
    };
    let value: Value = serde_json::from_str(wire).map_err(fail)?;
    if !value.is_object() {
        return Err(fail(de::Error::custom("expected a mapping")));
    }
    serde_json::from_value(value).map_err(fail)
}

/// Serializes a response with status tag `status` and stringified `args`.
pub fn encode_response<A: ToString>(status: &str, args: impl IntoIterator<Item = A>) -> String {
    let args: Vec<String> = args.into_iter().map(|a| a.to_string()).collect();
    json!([status, args]).to_string()
}

/// Parses a response produced by [`encode_response`].
///
/// Never fails: anything that is not a `[status, [..]]` pair decodes to
/// `("fail", [wire])` so callers always get a usable response.
pub fn decode_response(wire: &str) -> Response {
    match serde_json::from_str::<(String, Vec<String>)>(wire) {
        Ok((status, payload)) => Response { status, payload },
        Err(_) => Response {
            status: FAIL.to_owned(),
            payload: vec![wire.to_owned()],
        },
    }
}

impl Request {
    /// Serializes this request with [`encode_request`].
    pub fn encode(&self) -> String {
        encode_request(&self.name, &self.args)
    }
}

impl Response {
    /// Serializes this response with [`encode_response`].
    pub fn encode(&self) -> String {
        encode_response(&self.status, &self.payload)
    }
}
