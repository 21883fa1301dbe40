//! Wire protocol for stave client↔server messaging.
//!
//! Requests and responses are JSON documents whose arguments are all
//! strings, carried as single frames over a request/reply channel.

mod codec;
mod message;

pub use codec::{
    DeserializationFailure, decode_request, decode_response, encode_request, encode_response,
};
pub use message::{FAIL, HANDSHAKE, OK, PROTOCOL_VERSION, Request, Response, check_version};
