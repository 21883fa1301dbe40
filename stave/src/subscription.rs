//! Non-selective subscription to a broadcast endpoint.
//!
//! A [`Subscription`] keeps a bounded backlog of messages already pulled
//! off the wire. When a poll reports data, every message the transport
//! has ready is drained into the backlog in one go, so bursts published
//! between two polls are consumed promptly and handed out in order.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::context::{self, Context};
use crate::log::Logger;
use crate::{Error, Result};

/// Maximum number of undelivered broadcasts held per subscription.
///
/// When the backlog is full, draining stops and the remaining messages
/// stay queued inside the transport until the next call.
pub const BACKLOG_CAPACITY: usize = 1024;

/// Socket and backlog, guarded together.
struct Inner {
    /// `SUB` socket; `None` after [`Subscription::stop`].
    socket: Option<zmq::Socket>,
    /// Received but not yet delivered messages, oldest first.
    backlog: VecDeque<String>,
}

/// Subscription to every message published at one address.
pub struct Subscription {
    /// Publisher address we connected to.
    address: String,
    /// Serializes the check/poll/drain/pop sequence.
    inner: Mutex<Inner>,
    /// Failure reporting.
    logger: Arc<dyn Logger>,
}

impl Subscription {
    /// Connects to the publisher at `address` with an empty topic filter.
    pub fn connect(ctx: &Context, address: &str, logger: Arc<dyn Logger>) -> Result<Self> {
        let socket = ctx.socket(zmq::SUB)?;
        socket.set_subscribe(b"")?;
        socket.connect(address)?;
        logger.debug(&format!("Subscribed to {address}"));
        Ok(Self {
            address: address.to_owned(),
            inner: Mutex::new(Inner {
                socket: Some(socket),
                backlog: VecDeque::with_capacity(BACKLOG_CAPACITY),
            }),
            logger,
        })
    }

    /// Returns the next broadcast, waiting at most `timeout` for one.
    ///
    /// A backlogged message is returned immediately without touching the
    /// network. `Ok(None)` means the poll timed out.
    pub fn receive(&self, timeout: Duration) -> Result<Option<String>> {
        let mut guard = self.lock();
        let Inner { socket, backlog } = &mut *guard;
        let socket = socket.as_ref().ok_or(Error::Closed)?;

        if let Some(msg) = backlog.pop_front() {
            return Ok(Some(msg));
        }
        if socket.poll(zmq::POLLIN, context::poll_millis(timeout))? == 0 {
            return Ok(None);
        }
        self.drain(socket, backlog)?;
        Ok(backlog.pop_front())
    }

    /// Disconnects from the publisher and releases the socket.
    ///
    /// Undelivered backlog entries are discarded.
    pub fn stop(&self) -> Result<()> {
        let mut guard = self.lock();
        let socket = guard.socket.take().ok_or(Error::Closed)?;
        // Disconnect fails if the peer never came up; closing covers it.
        let _ = socket.disconnect(&self.address);
        drop(socket);
        guard.backlog.clear();
        self.logger.debug(&format!("Unsubscribed from {}", self.address));
        Ok(())
    }

    /// Number of messages waiting in the backlog.
    pub fn backlog_len(&self) -> usize {
        self.lock().backlog.len()
    }

    /// Publisher address this subscription is connected to.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Pulls every ready message into the backlog without blocking.
    fn drain(&self, socket: &zmq::Socket, backlog: &mut VecDeque<String>) -> Result<()> {
        while backlog.len() < BACKLOG_CAPACITY {
            match socket.recv_bytes(zmq::DONTWAIT) {
                Ok(bytes) => match String::from_utf8(bytes) {
                    Ok(msg) => backlog.push_back(msg),
                    Err(e) => self.logger.warn(&format!(
                        "Dropping non-UTF-8 broadcast from {}: {e}",
                        self.address
                    )),
                },
                Err(zmq::Error::EAGAIN) => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Locks the socket and backlog.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::log::Discard;
    use crate::testing::{endpoint, settle};

    /// Binds a bare publisher for `address`.
    fn publisher(ctx: &Context, address: &str) -> zmq::Socket {
        let socket = ctx.socket(zmq::PUB).unwrap();
        socket.set_sndhwm(0).unwrap();
        socket.bind(address).unwrap();
        socket
    }

    #[test]
    fn times_out_without_messages() {
        let ctx = Context::new();
        let addr = endpoint("sub-timeout");
        let _publisher = publisher(&ctx, &addr);
        let sub = Subscription::connect(&ctx, &addr, Arc::new(Discard)).unwrap();
        assert_eq!(sub.receive(Duration::from_millis(50)).unwrap(), None);
    }

    #[test]
    fn burst_is_drained_and_delivered_in_order() {
        let ctx = Context::new();
        let addr = endpoint("sub-burst");
        let publisher = publisher(&ctx, &addr);
        let sub = Subscription::connect(&ctx, &addr, Arc::new(Discard)).unwrap();
        settle();

        for i in 0..10 {
            publisher.send(format!("m{i}").as_str(), 0).unwrap();
        }
        settle();

        assert_eq!(sub.receive(Duration::from_millis(500)).unwrap().as_deref(), Some("m0"));
        assert_eq!(sub.backlog_len(), 9);
        for i in 1..10 {
            let msg = sub.receive(Duration::ZERO).unwrap();
            assert_eq!(msg, Some(format!("m{i}")));
        }
        assert_eq!(sub.backlog_len(), 0);
    }

    #[test]
    fn backlog_is_bounded() {
        let ctx = Context::new();
        let addr = endpoint("sub-bounded");
        let publisher = publisher(&ctx, &addr);
        let sub = Subscription::connect(&ctx, &addr, Arc::new(Discard)).unwrap();
        settle();

        let total = BACKLOG_CAPACITY + 10;
        for i in 0..total {
            publisher.send(i.to_string().as_str(), 0).unwrap();
        }
        settle();

        assert_eq!(sub.receive(Duration::from_millis(500)).unwrap().as_deref(), Some("0"));
        assert_eq!(sub.backlog_len(), BACKLOG_CAPACITY - 1);
        for i in 1..total {
            let msg = sub.receive(Duration::from_millis(500)).unwrap();
            assert_eq!(msg, Some(i.to_string()), "message {i} lost or reordered");
        }
    }

    #[test]
    fn non_utf8_broadcast_is_skipped() {
        let ctx = Context::new();
        let addr = endpoint("sub-utf8");
        let publisher = publisher(&ctx, &addr);
        let sub = Subscription::connect(&ctx, &addr, Arc::new(Discard)).unwrap();
        settle();

        publisher.send(&[0xff_u8, 0xfe][..], 0).unwrap();
        publisher.send("after", 0).unwrap();
        settle();

        assert_eq!(sub.receive(Duration::from_millis(500)).unwrap().as_deref(), Some("after"));
    }

    #[test]
    fn receive_after_stop_is_closed() {
        let ctx = Context::new();
        let addr = endpoint("sub-stop");
        let _publisher = publisher(&ctx, &addr);
        let sub = Subscription::connect(&ctx, &addr, Arc::new(Discard)).unwrap();
        sub.stop().unwrap();
        assert!(matches!(sub.receive(Duration::ZERO), Err(Error::Closed)));
        assert!(matches!(sub.stop(), Err(Error::Closed)));
    }

    #[test]
    fn concurrent_receivers_share_one_stream() {
        let ctx = Context::new();
        let addr = endpoint("sub-shared");
        let publisher = publisher(&ctx, &addr);
        let sub = Arc::new(Subscription::connect(&ctx, &addr, Arc::new(Discard)).unwrap());
        settle();

        for i in 0..100 {
            publisher.send(i.to_string().as_str(), 0).unwrap();
        }
        settle();

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let sub = sub.clone();
                thread::spawn(move || {
                    let mut got = Vec::new();
                    while let Some(m) = sub.receive(Duration::from_millis(100)).unwrap() {
                        got.push(m.parse::<u32>().unwrap());
                    }
                    got
                })
            })
            .collect();

        let mut all: Vec<u32> = workers
            .into_iter()
            .flat_map(|w| w.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (0..100).collect::<Vec<_>>());
    }
}
