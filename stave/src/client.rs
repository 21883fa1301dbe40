//! Client side: synchronous requests plus a background broadcast listener.
//!
//! A [`Client`] owns a `REQ` socket for request/reply exchanges and a
//! [`Subscription`] to the server's broadcasts. Requests run on the
//! caller's thread; broadcasts are handled on a dedicated listener thread
//! started by [`Client::start_background`].

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use stave_proto::{HANDSHAKE, Response};

use crate::context::Context;
use crate::crypto::{EncryptionScheme, Identity};
use crate::gate::Gate;
use crate::lifecycle::{self, Background, State};
use crate::log::{Discard, Logger};
use crate::subscription::Subscription;
use crate::{Error, Result, Transform};

/// Default time the listener waits for a broadcast before re-checking for shutdown.
pub const DEFAULT_CLIENT_POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// Callback invoked with every decrypted, preprocessed broadcast.
type BroadcastHandler = Box<dyn Fn(&Client, String) -> Result<()> + Send>;

/// Configuration of the background broadcast listener.
///
/// Defaults: identity preprocessing, 500 ms poll timeout.
#[must_use = "a Listener does nothing until passed to Client::start_background"]
pub struct Listener {
    /// Receives each broadcast.
    handler: BroadcastHandler,
    /// Applied to each decrypted broadcast before the handler.
    preprocess: Transform,
    /// Upper bound on one poll; also bounds `stop` latency.
    poll_timeout: Duration,
}

impl Listener {
    /// Creates a listener feeding broadcasts to `handler`.
    pub fn new(handler: impl Fn(&Client, String) -> Result<()> + Send + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            preprocess: Box::new(crate::identity),
            poll_timeout: DEFAULT_CLIENT_POLL_TIMEOUT,
        }
    }

    /// Sets the transform applied before the handler.
    pub fn preprocess(mut self, f: impl Fn(String) -> Result<String> + Send + 'static) -> Self {
        self.preprocess = Box::new(f);
        self
    }

    /// Sets the poll timeout.
    pub const fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("poll_timeout", &self.poll_timeout)
            .finish_non_exhaustive()
    }
}

/// Builder for a [`Client`].
///
/// Defaults: [`Discard`] logger, [`Identity`] encryption.
#[must_use = "a ClientBuilder does nothing until .connect() is called"]
pub struct ClientBuilder<'a> {
    /// Transport context the sockets are created from.
    ctx: &'a Context,
    /// Server request/reply address.
    interactive: String,
    /// Server broadcast address.
    broadcast: String,
    /// Where failures are reported.
    logger: Arc<dyn Logger>,
    /// Payload transform.
    encryption: Arc<dyn EncryptionScheme>,
}

impl std::fmt::Debug for ClientBuilder<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("interactive", &self.interactive)
            .field("broadcast", &self.broadcast)
            .finish_non_exhaustive()
    }
}

impl ClientBuilder<'_> {
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

    /// Opens the interactive connection and the broadcast subscription.
    pub fn connect(self) -> Result<Client> {
        let socket = self.ctx.socket(zmq::REQ)?;
        // A failed receive must not wedge the socket: allow the next send
        // and drop any late reply to the abandoned request.
        socket.set_req_relaxed(true)?;
        socket.set_req_correlate(true)?;
        socket.connect(&self.interactive)?;
        let subscription = Subscription::connect(self.ctx, &self.broadcast, self.logger.clone())?;
        self.logger.info(&format!(
            "Connected to {} and {}",
            self.interactive, self.broadcast
        ));

        Ok(Client {
            inner: Arc::new(Inner {
                address: self.interactive,
                socket: Mutex::new(Some(socket)),
                done: AtomicBool::new(false),
                background: Background::new(),
                gate: Gate::default(),
                subscription,
                logger: self.logger,
                encryption: self.encryption,
            }),
        })
    }
}

/// State shared between a client's handles and its listener thread.
struct Inner {
    /// Server request/reply address.
    address: String,
    /// `REQ` socket; `None` once stopped. Serializes request/reply exchanges.
    socket: Mutex<Option<zmq::Socket>>,
    /// Terminal flag polled by the listener.
    done: AtomicBool,
    /// Listener thread lifecycle.
    background: Background,
    /// Pause/resume around each listener cycle.
    gate: Gate,
    /// Broadcast feed.
    subscription: Subscription,
    /// Failure reporting.
    logger: Arc<dyn Logger>,
    /// Payload transform.
    encryption: Arc<dyn EncryptionScheme>,
}

/// Connection to a stave server.
///
/// Cloning is cheap and yields another handle to the same sockets; the
/// listener thread holds one such handle and passes it to the broadcast
/// handler.
#[derive(Clone)]
pub struct Client {
    /// Shared state.
    inner: Arc<Inner>,
}

impl Client {
    /// Starts building a client for a server at the given addresses.
    pub fn builder<'a>(ctx: &'a Context, interactive: &str, broadcast: &str) -> ClientBuilder<'a> {
        ClientBuilder {
            ctx,
            interactive: interactive.to_owned(),
            broadcast: broadcast.to_owned(),
            logger: Arc::new(Discard),
            encryption: Arc::new(Identity),
        }
    }

    /// Sends `message` and blocks until the reply arrives.
    ///
    /// The message is encrypted before it leaves and the reply decrypted
    /// on arrival. There is no timeout: an unresponsive server blocks the
    /// caller indefinitely.
    pub fn send(&self, message: &str) -> Result<String> {
        self.send_with(message, crate::identity)
    }

    /// Like [`send`](Self::send), feeding the decrypted reply through `preprocess`.
    pub fn send_with(
        &self,
        message: &str,
        preprocess: impl FnOnce(String) -> Result<String>,
    ) -> Result<String> {
        let guard = self.lock_socket();
        let socket = guard.as_ref().ok_or(Error::Closed)?;

        let wire = self
            .inner
            .encryption
            .encrypt(message)
            .map_err(|e| self.report(&format!("Failed to encrypt message {message}"), e))?;
        socket
            .send(wire.as_str(), 0)
            .map_err(|e| self.report(&format!("Failed to send message {message}"), e))?;
        let raw = socket
            .recv_bytes(0)
            .map_err(|e| self.report(&format!("No reply to message {message}"), e))?;
        drop(guard);

        let raw = String::from_utf8_lossy(&raw);
        let reply = self
            .inner
            .encryption
            .decrypt(&raw)
            .map_err(|e| self.report(&format!("Failed to decrypt reply {raw}"), e))?;
        preprocess(reply)
            .map_err(|e| self.report(&format!("Failed to preprocess reply to {message}"), e))
    }

    /// Encodes a call to `name`, sends it, and decodes the response.
    pub fn call<A: ToString>(
        &self,
        name: &str,
        args: impl IntoIterator<Item = A>,
    ) -> Result<Response> {
        let reply = self.send(&stave_proto::encode_request(name, args))?;
        Ok(stave_proto::decode_response(&reply))
    }

    /// Performs the version handshake every session starts with.
    ///
    /// A `fail` reply becomes [`Error::VersionMismatch`] carrying the
    /// version the server reported.
    pub fn handshake(&self, version: &str) -> Result<Response> {
        let resp = self.call(HANDSHAKE, [version])?;
        if resp.is_fail() {
            let remote = resp
                .payload
                .get(1)
                .or_else(|| resp.payload.first())
                .cloned()
                .unwrap_or_default();
            self.inner
                .logger
                .error(&format!("Handshake rejected: we run {version}, server runs {remote}"));
            return Err(Error::VersionMismatch { remote });
        }
        Ok(resp)
    }

    /// Starts the broadcast listener thread.
    ///
    /// Does nothing if the listener is already running; fails with
    /// [`Error::Closed`] after [`stop`](Self::stop).
    pub fn start_background(&self, listener: Listener) -> Result<()> {
        let client = self.clone();
        if self
            .inner
            .background
            .start("stave-client-listener", move || client.listen(&listener))?
        {
            self.inner.logger.debug("Broadcast listener started");
        }
        Ok(())
    }

    /// Pauses broadcast handling.
    ///
    /// Waits for a cycle already in progress to finish; afterwards no
    /// handler runs until [`resume_background`](Self::resume_background).
    /// Broadcasts keep queueing in the subscription meanwhile. Calling this
    /// from inside the broadcast handler deadlocks.
    pub fn pause_background(&self) {
        self.inner.gate.pause();
    }

    /// Resumes broadcast handling after [`pause_background`](Self::pause_background).
    pub fn resume_background(&self) {
        self.inner.gate.resume();
    }

    /// Stops all network activity and joins the listener thread.
    ///
    /// Takes up to one poll timeout while the listener notices. Fails with
    /// [`Error::Closed`] if already stopped.
    pub fn stop(&self) -> Result<()> {
        let listener = self.inner.background.stop()?;
        self.inner.logger.info("Stopping client");

        {
            let mut socket = self.lock_socket();
            self.inner.done.store(true, Ordering::Release);
            if let Some(socket) = socket.take() {
                let _ = socket.disconnect(&self.inner.address);
            }
        }
        self.inner.gate.close();

        match listener {
            Some(handle) => lifecycle::join(handle, self.inner.logger.as_ref()),
            None => {
                let _ = self.inner.subscription.stop();
            }
        }

        self.inner.logger.info("Client stopped");
        Ok(())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        self.inner.background.state()
    }

    /// Server request/reply address.
    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// Listener loop: runs until the terminal flag is set.
    fn listen(&self, listener: &Listener) {
        while !self.inner.done.load(Ordering::Acquire) {
            let Some(cycle) = self.inner.gate.enter() else {
                break;
            };
            match self.inner.subscription.receive(listener.poll_timeout) {
                Ok(Some(msg)) => self.dispatch(msg, listener),
                Ok(None) => {}
                Err(Error::Closed | Error::Transport(zmq::Error::ETERM)) => break,
                Err(e) => {
                    self.inner.logger.error(&format!("Broadcast receive failed: {e}"));
                    drop(cycle);
                    thread::sleep(listener.poll_timeout);
                }
            }
        }

        if let Err(e) = self.inner.subscription.stop() {
            self.inner.logger.debug(&format!("Subscription already stopped: {e}"));
        }
        self.inner.logger.debug("Broadcast listener exited");
    }

    /// Runs one broadcast through decrypt → preprocess → handler.
    ///
    /// Failures, panics included, are logged and the message dropped.
    fn dispatch(&self, raw: String, listener: &Listener) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let logger = &self.inner.logger;
            let msg = match self.inner.encryption.decrypt(&raw) {
                Ok(msg) => msg,
                Err(e) => return logger.error(&format!("Failed to decrypt {raw}: {e}")),
            };
            let msg = match (listener.preprocess)(msg) {
                Ok(msg) => msg,
                Err(e) => return logger.error(&format!("Failed to preprocess {raw}: {e}")),
            };
            if let Err(e) = (listener.handler)(self, msg) {
                self.inner.logger.error(&format!("Failure when handling {raw}: {e}"));
            }
        }));
        if let Err(payload) = outcome {
            self.inner.logger.critical(&format!(
                "Broadcast handler panicked on {raw}: {}",
                crate::panic_message(payload.as_ref())
            ));
        }
    }

    /// Logs a failed exchange step and hands the error back.
    fn report(&self, what: &str, err: impl Into<Error>) -> Error {
        let err = err.into();
        self.inner.logger.error(&format!("{what}: {err}"));
        err
    }

    /// Locks the interactive socket.
    fn lock_socket(&self) -> MutexGuard<'_, Option<zmq::Socket>> {
        self.inner.socket.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("address", &self.inner.address)
            .field("broadcast", &self.inner.subscription.address())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
