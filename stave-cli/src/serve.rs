//! `stave serve`: a small reference server.
//!
//! Understands three calls: `handshake`, `echo` and `broadcast`. Anything
//! else is answered with `fail ["unknown function", name]`.

use anyhow::{Context as _, Result};
use stave::{Context, Pipeline, Server};
use stave_proto::{HANDSHAKE, PROTOCOL_VERSION, Request, Response, check_version, decode_request};

use crate::GlobalOpts;

pub(crate) fn run(opts: &GlobalOpts) -> Result<()> {
    let ctx = Context::new();
    let logger = opts.logger("server")?;
    let server = Server::builder(&ctx, &opts.interactive, &opts.broadcast)
        .encryption(opts.encryption(&logger))
        .logger(logger)
        .bind()
        .with_context(|| format!("failed to bind {} and {}", opts.interactive, opts.broadcast))?;

    let mut pipeline = Pipeline::new(handle);
    if let Some(timeout) = opts.poll_timeout() {
        pipeline = pipeline.poll_timeout(timeout);
    }
    server.start_background(pipeline)?;
    tracing::info!(
        interactive = server.interactive_endpoint(),
        broadcast = server.broadcast_endpoint(),
        version = PROTOCOL_VERSION,
        "serving"
    );

    crate::wait_for_shutdown()?;
    server.stop()?;
    Ok(())
}

/// Decodes one request and encodes the answer.
fn handle(server: &Server, message: String) -> stave::Result<String> {
    let req = decode_request(&message)?;
    Ok(respond(server, &req)?.encode())
}

fn respond(server: &Server, req: &Request) -> stave::Result<Response> {
    match req.name.as_str() {
        HANDSHAKE => Ok(check_version(req, PROTOCOL_VERSION)),
        "echo" => Ok(Response::ok(&req.args)),
        "broadcast" => {
            server.broadcast(&Response::ok(&req.args).encode())?;
            Ok(Response::ok(Vec::<String>::new()))
        }
        other => Ok(Response::fail(["unknown function", other])),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use stave::Subscription;
    use stave::log::Discard;
    use stave_proto::{decode_response, encode_request};

    use super::*;

    fn server(ctx: &Context, tag: &str) -> Server {
        Server::builder(
            ctx,
            &format!("inproc://cli-{tag}-rep"),
            &format!("inproc://cli-{tag}-pub"),
        )
        .bind()
        .unwrap()
    }

    fn call(server: &Server, name: &str, args: &[&str]) -> Response {
        let reply = handle(server, encode_request(name, args)).unwrap();
        decode_response(&reply)
    }

    #[test]
    fn handshake_checks_version() {
        let ctx = Context::new();
        let server = server(&ctx, "handshake");
        assert!(call(&server, HANDSHAKE, &[PROTOCOL_VERSION]).is_ok());
        assert_eq!(
            call(&server, HANDSHAKE, &["0.0.1"]),
            Response::fail(["version mismatch", PROTOCOL_VERSION])
        );
        server.stop().unwrap();
    }

    #[test]
    fn echo_and_unknown() {
        let ctx = Context::new();
        let server = server(&ctx, "echo");
        assert_eq!(call(&server, "echo", &["a", "b"]), Response::ok(["a", "b"]));
        assert_eq!(
            call(&server, "frobnicate", &[]),
            Response::fail(["unknown function", "frobnicate"])
        );
        server.stop().unwrap();
    }

    #[test]
    fn broadcast_call_publishes() {
        let ctx = Context::new();
        let server = server(&ctx, "broadcast");
        let sub =
            Subscription::connect(&ctx, server.broadcast_endpoint(), Arc::new(Discard)).unwrap();
        std::thread::sleep(Duration::from_millis(100));

        assert_eq!(call(&server, "broadcast", &["tick"]), Response::ok(Vec::<String>::new()));
        let got = sub.receive(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(decode_response(&got), Response::ok(["tick"]));
        server.stop().unwrap();
    }

    #[test]
    fn malformed_request_is_an_error() {
        let ctx = Context::new();
        let server = server(&ctx, "malformed");
        assert!(matches!(
            handle(&server, "not json".to_owned()),
            Err(stave::Error::Deserialization(_))
        ));
        server.stop().unwrap();
    }
}
