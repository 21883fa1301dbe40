//! Server side: a request/reply pipeline plus a broadcast publisher.
//!
//! A `REP` socket allows exactly one outstanding request: the reply to
//! request N must be sent before request N+1 can be read. The listener
//! therefore handles receive → pipeline → reply as a single unit under the
//! interactive lock, and handler invocations never overlap.
//!
//! Each request passes through five [`Stage`]s:
//!
//! ```text
//! decrypt → preprocess → handler → postprocess → encrypt
//! ```
//!
//! A failing stage is turned into a [`FailReason`] and answered with a
//! [`failure_reply`]; a panic anywhere is contained and answered as
//! [`FailReason::Malformed`]. The listener itself never dies from a bad
//! request.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use crate::context::{self, Context};
use crate::crypto::{EncryptionScheme, Identity};
use crate::lifecycle::{self, Background, State};
use crate::log::{Discard, Logger};
use crate::{Error, Result, Transform};

/// Default time the listener waits for a request before re-checking for shutdown.
pub const DEFAULT_SERVER_POLL_TIMEOUT: Duration = Duration::from_millis(2000);

/// Callback producing the reply to one decrypted, preprocessed request.
type RequestHandler = Box<dyn Fn(&Server, String) -> Result<String> + Send>;

/// One step of request processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Stage {
    /// Reading the request off the wire.
    Receive,
    /// [`EncryptionScheme::decrypt`].
    Decrypt,
    /// The pipeline's preprocessor.
    Preprocess,
    /// The request handler.
    Handle,
    /// The pipeline's postprocessor.
    Postprocess,
    /// [`EncryptionScheme::encrypt`].
    Encrypt,
}

impl Stage {
    /// Reason reported to the client when this stage fails.
    pub const fn fail_reason(self) -> FailReason {
        match self {
            Self::Receive => FailReason::Malformed,
            Self::Decrypt => FailReason::Decryption,
            Self::Preprocess | Self::Handle | Self::Postprocess => FailReason::Internal,
            Self::Encrypt => FailReason::Encryption,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Receive => "receive",
            Self::Decrypt => "decrypt",
            Self::Preprocess => "preprocess",
            Self::Handle => "handle",
            Self::Postprocess => "postprocess",
            Self::Encrypt => "encrypt",
        })
    }
}

/// Why a request was answered with a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum FailReason {
    /// The request could not be decrypted.
    Decryption,
    /// Pre/postprocessing or the handler failed.
    Internal,
    /// The reply could not be encrypted.
    Encryption,
    /// The request was unreadable or processing panicked.
    Malformed,
}

impl std::fmt::Display for FailReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Decryption => "Decryption failure",
            Self::Internal => "Internal server error",
            Self::Encryption => "Encryption failure",
            Self::Malformed => "Malformed message",
        })
    }
}

/// Formats the text sent back for a failed request.
pub fn failure_reply(message: &str, reason: FailReason) -> String {
    format!("Failure ({reason}): {message}")
}

/// A stage-tagged pipeline failure.
#[derive(Debug)]
struct StageFailure {
    /// Stage that failed.
    stage: Stage,
    /// The message as it entered the failed stage.
    message: String,
    /// What went wrong.
    error: Error,
}

impl StageFailure {
    /// Builds a `map_err` adapter tagging errors with `stage` and `message`.
    fn at(stage: Stage, message: &str) -> impl FnOnce(Error) -> Self + '_ {
        move |error| Self {
            stage,
            message: message.to_owned(),
            error,
        }
    }
}

/// Request-processing configuration for [`Server::start_background`].
///
/// Defaults: identity pre- and postprocessing, 2000 ms poll timeout.
#[must_use = "a Pipeline does nothing until passed to Server::start_background"]
pub struct Pipeline {
    /// Produces the reply.
    handler: RequestHandler,
    /// Applied after decryption.
    preprocess: Transform,
    /// Applied to the handler's reply before encryption.
    postprocess: Transform,
    /// Upper bound on one poll; also bounds `stop` latency.
    poll_timeout: Duration,
}

impl Pipeline {
    /// Creates a pipeline answering requests with `handler`.
    pub fn new(handler: impl Fn(&Server, String) -> Result<String> + Send + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            preprocess: Box::new(crate::identity),
            postprocess: Box::new(crate::identity),
            poll_timeout: DEFAULT_SERVER_POLL_TIMEOUT,
        }
    }

    /// Sets the transform applied to decrypted requests.
    pub fn preprocess(mut self, f: impl Fn(String) -> Result<String> + Send + 'static) -> Self {
        self.preprocess = Box::new(f);
        self
    }

    /// Sets the transform applied to replies.
    pub fn postprocess(mut self, f: impl Fn(String) -> Result<String> + Send + 'static) -> Self {
        self.postprocess = Box::new(f);
        self
    }

    /// Sets the poll timeout.
    pub const fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("poll_timeout", &self.poll_timeout)
            .finish_non_exhaustive()
    }
}

/// Builder for a [`Server`].
///
/// Defaults: [`Discard`] logger, [`Identity`] encryption.
#[must_use = "a ServerBuilder does nothing until .bind() is called"]
pub struct ServerBuilder<'a> {
    /// Transport context the sockets are created from.
    ctx: &'a Context,
    /// Request/reply bind address.
    interactive: String,
    /// Broadcast bind address.
    broadcast: String,
    /// Where failures are reported.
    logger: Arc<dyn Logger>,
    /// Payload transform.
    encryption: Arc<dyn EncryptionScheme>,
}

impl std::fmt::Debug for ServerBuilder<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("interactive", &self.interactive)
            .field("broadcast", &self.broadcast)
            .finish_non_exhaustive()
    }
}

impl ServerBuilder<'_> {
    /// Sets the logger.
    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    /// Sets the encryption scheme.
    pub fn encryption(mut self, scheme: Arc<dyn EncryptionScheme>) -> Self {
        self.encryption = scheme;
        self
    }

    /// Binds both endpoints.
    pub fn bind(self) -> Result<Server> {
        let interactive = self.ctx.socket(zmq::REP)?;
        interactive.bind(&self.interactive)?;
        let publisher = self.ctx.socket(zmq::PUB)?;
        publisher.bind(&self.broadcast)?;

        let interactive_endpoint = resolved(&interactive, &self.interactive);
        let broadcast_endpoint = resolved(&publisher, &self.broadcast);
        self.logger.info(&format!(
            "Listening on {interactive_endpoint}, broadcasting on {broadcast_endpoint}"
        ));

        Ok(Server {
            inner: Arc::new(Inner {
                interactive: Mutex::new(Some(interactive)),
                publisher: Mutex::new(Some(publisher)),
                interactive_endpoint,
                broadcast_endpoint,
                done: AtomicBool::new(false),
                background: Background::new(),
                logger: self.logger,
                encryption: self.encryption,
            }),
        })
    }
}

/// Address a socket actually bound to, with wildcard ports resolved.
fn resolved(socket: &zmq::Socket, requested: &str) -> String {
    match socket.get_last_endpoint() {
        Ok(Ok(endpoint)) if !endpoint.is_empty() => endpoint,
        _ => requested.to_owned(),
    }
}

/// State shared between a server's handles and its listener thread.
struct Inner {
    /// `REP` socket; its lock covers a whole receive/answer cycle.
    interactive: Mutex<Option<zmq::Socket>>,
    /// `PUB` socket, independent of request handling.
    publisher: Mutex<Option<zmq::Socket>>,
    /// Bound request/reply address.
    interactive_endpoint: String,
    /// Bound broadcast address.
    broadcast_endpoint: String,
    /// Terminal flag polled by the listener.
    done: AtomicBool,
    /// Listener thread lifecycle.
    background: Background,
    /// Failure reporting.
    logger: Arc<dyn Logger>,
    /// Payload transform.
    encryption: Arc<dyn EncryptionScheme>,
}

/// A stave server.
///
/// Cloning is cheap and yields another handle to the same sockets; the
/// request handler receives one so it can broadcast.
#[derive(Clone)]
pub struct Server {
    /// Shared state.
    inner: Arc<Inner>,
}

impl Server {
    /// Starts building a server bound to the given addresses.
    pub fn builder<'a>(ctx: &'a Context, interactive: &str, broadcast: &str) -> ServerBuilder<'a> {
        ServerBuilder {
            ctx,
            interactive: interactive.to_owned(),
            broadcast: broadcast.to_owned(),
            logger: Arc::new(Discard),
            encryption: Arc::new(Identity),
        }
    }

    /// Publishes `message`, as given, to every subscribed client.
    ///
    /// Broadcasts are not encrypted here; see
    /// [`broadcast_sealed`](Self::broadcast_sealed).
    pub fn broadcast(&self, message: &str) -> Result<()> {
        self.inner.logger.info(&format!("Broadcasting {message}"));
        let guard = self.inner.publisher.lock().unwrap_or_else(PoisonError::into_inner);
        let socket = guard.as_ref().ok_or(Error::Closed)?;
        socket.send(message, 0)?;
        Ok(())
    }

    /// Encrypts `message` with the server's scheme, then broadcasts it.
    pub fn broadcast_sealed(&self, message: &str) -> Result<()> {
        let sealed = self.inner.encryption.encrypt(message)?;
        self.broadcast(&sealed)
    }

    /// Starts the request listener thread.
    ///
    /// Does nothing if the listener is already running; fails with
    /// [`Error::Closed`] after [`stop`](Self::stop).
    pub fn start_background(&self, pipeline: Pipeline) -> Result<()> {
        let server = self.clone();
        if self
            .inner
            .background
            .start("stave-server-listener", move || server.listen(&pipeline))?
        {
            self.inner.logger.debug("Request listener started");
        }
        Ok(())
    }

    /// Stops the server: unbinds both endpoints and joins the listener.
    ///
    /// Takes up to one poll timeout while the listener notices. Fails with
    /// [`Error::Closed`] if already stopped.
    pub fn stop(&self) -> Result<()> {
        let listener = self.inner.background.stop()?;
        self.inner.logger.info("Shutting down server");
        self.inner.done.store(true, Ordering::Release);

        // Called from a handler: the listener holds the interactive lock
        // until its reply is out, and releases the socket when it exits.
        if !listener.as_ref().is_some_and(lifecycle::is_current) {
            self.release(
                &self.inner.interactive,
                &self.inner.interactive_endpoint,
                "interactive",
            );
        }
        self.release(
            &self.inner.publisher,
            &self.inner.broadcast_endpoint,
            "broadcast",
        );

        if let Some(handle) = listener {
            lifecycle::join(handle, self.inner.logger.as_ref());
        }
        self.inner.logger.info("Server stopped");
        Ok(())
    }

    /// Takes `socket` out of its slot and unbinds it from `endpoint`.
    fn release(&self, socket: &Mutex<Option<zmq::Socket>>, endpoint: &str, role: &str) {
        let socket = socket.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(socket) = socket {
            self.inner
                .logger
                .info(&format!("Unbinding {role} socket from {endpoint}"));
            let _ = socket.unbind(endpoint);
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        self.inner.background.state()
    }

    /// Address the request/reply socket is bound to.
    pub fn interactive_endpoint(&self) -> &str {
        &self.inner.interactive_endpoint
    }

    /// Address the broadcast socket is bound to.
    pub fn broadcast_endpoint(&self) -> &str {
        &self.inner.broadcast_endpoint
    }

    /// Listener loop: answers one request per iteration until stopped.
    fn listen(&self, pipeline: &Pipeline) {
        let timeout = context::poll_millis(pipeline.poll_timeout);
        while !self.inner.done.load(Ordering::Acquire) {
            let guard = self.lock_interactive();
            let Some(socket) = guard.as_ref() else {
                break;
            };
            match socket.poll(zmq::POLLIN, timeout) {
                Ok(0) => continue,
                Ok(_) => {}
                Err(zmq::Error::ETERM) => break,
                Err(e) => {
                    self.inner.logger.error(&format!("Poll failed: {e}"));
                    drop(guard);
                    thread::sleep(pipeline.poll_timeout);
                    continue;
                }
            }
            let raw = match socket.recv_bytes(0) {
                Ok(raw) => raw,
                Err(e) => {
                    self.inner.logger.error(&format!("Receive failed: {e}"));
                    drop(guard);
                    thread::sleep(pipeline.poll_timeout);
                    continue;
                }
            };

            let sent = match self.answer(&raw, pipeline) {
                Ok(reply) => socket.send(reply.as_str(), 0).map_err(Error::from),
                Err((message, reason)) => self.fail(socket, &message, reason),
            };
            if let Err(e) = sent {
                self.inner.logger.error(&format!("Failed to send reply: {e}"));
            }
        }
        self.release(
            &self.inner.interactive,
            &self.inner.interactive_endpoint,
            "interactive",
        );
        self.inner.logger.debug("Request listener exited");
    }

    /// Runs the pipeline and maps any failure to the text and reason to report.
    ///
    /// This is the single place stage failures and panics are interpreted.
    fn answer(
        &self,
        raw: &[u8],
        pipeline: &Pipeline,
    ) -> std::result::Result<String, (String, FailReason)> {
        match panic::catch_unwind(AssertUnwindSafe(|| self.process(raw, pipeline))) {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(failure)) => {
                self.inner.logger.debug(&format!(
                    "{} stage failed: {}",
                    failure.stage, failure.error
                ));
                Err((failure.message, failure.stage.fail_reason()))
            }
            Err(payload) => {
                self.inner.logger.error(&format!(
                    "Uncaught panic: {}",
                    crate::panic_message(payload.as_ref())
                ));
                Err((String::from_utf8_lossy(raw).into_owned(), FailReason::Malformed))
            }
        }
    }

    /// decrypt → preprocess → handler → postprocess → encrypt.
    fn process(&self, raw: &[u8], p: &Pipeline) -> std::result::Result<String, StageFailure> {
        let received = std::str::from_utf8(raw).map_err(|e| StageFailure {
            stage: Stage::Receive,
            message: String::from_utf8_lossy(raw).into_owned(),
            error: Error::generic(e.to_string()),
        })?;

        let enc = &self.inner.encryption;
        let message = enc
            .decrypt(received)
            .map_err(StageFailure::at(Stage::Decrypt, received))?;
        let message =
            (p.preprocess)(message.clone()).map_err(StageFailure::at(Stage::Preprocess, &message))?;
        let reply =
            (p.handler)(self, message.clone()).map_err(StageFailure::at(Stage::Handle, &message))?;
        let reply = (p.postprocess)(reply).map_err(StageFailure::at(Stage::Postprocess, &message))?;
        enc.encrypt(&reply)
            .map_err(StageFailure::at(Stage::Encrypt, &message))
    }

    /// Reports a failed request and answers it with a [`failure_reply`].
    ///
    /// Must be given the socket holding the unanswered request. The reply
    /// is encrypted when the scheme allows, and sent as plain text otherwise.
    fn fail(&self, socket: &zmq::Socket, message: &str, reason: FailReason) -> Result<()> {
        self.inner
            .logger
            .error(&format!("Failure ({message}): {reason}"));
        let text = failure_reply(message, reason);
        let wire = self.inner.encryption.encrypt(&text).unwrap_or(text);
        socket.send(wire.as_str(), 0)?;
        Ok(())
    }

    /// Locks the interactive socket.
    fn lock_interactive(&self) -> MutexGuard<'_, Option<zmq::Socket>> {
        self.inner
            .interactive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("interactive", &self.inner.interactive_endpoint)
            .field("broadcast", &self.inner.broadcast_endpoint)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
