//! Listener thread lifecycle shared by clients and servers.
//!
//! Each instance moves through `Idle → Listening → Stopped` (or straight
//! from `Idle` to `Stopped`). Starting is only possible from `Idle`, and
//! `Stopped` is terminal.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crate::log::Logger;
use crate::{Error, Result};

/// Observable lifecycle state of a [`Client`](crate::Client) or [`Server`](crate::Server).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum State {
    /// Sockets are open; no listener thread yet.
    Idle,
    /// The background listener thread is running.
    Listening,
    /// Stopped for good.
    Stopped,
}

/// Internal state, owning the listener's join handle.
#[derive(Debug)]
enum Phase {
    /// No listener yet.
    Idle,
    /// Listener running.
    Listening(JoinHandle<()>),
    /// Terminal.
    Stopped,
}

/// Owner of at most one background listener thread.
#[derive(Debug)]
pub(crate) struct Background {
    /// Current phase.
    phase: Mutex<Phase>,
}

impl Background {
    /// Creates an idle lifecycle.
    pub(crate) const fn new() -> Self {
        Self {
            phase: Mutex::new(Phase::Idle),
        }
    }

    /// Locks the phase.
    fn lock(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns `body` on a thread called `name` if no listener exists yet.
    ///
    /// Returns `Ok(false)` when a listener is already running.
    pub(crate) fn start(&self, name: &str, body: impl FnOnce() + Send + 'static) -> Result<bool> {
        let mut phase = self.lock();
        match *phase {
            Phase::Listening(_) => return Ok(false),
            Phase::Stopped => return Err(Error::Closed),
            Phase::Idle => {}
        }
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(body)
            .map_err(Error::Spawn)?;
        *phase = Phase::Listening(handle);
        Ok(true)
    }

    /// Moves to `Stopped`, returning the listener to join (if one ran).
    pub(crate) fn stop(&self) -> Result<Option<JoinHandle<()>>> {
        let mut phase = self.lock();
        match std::mem::replace(&mut *phase, Phase::Stopped) {
            Phase::Idle => Ok(None),
            Phase::Listening(handle) => Ok(Some(handle)),
            Phase::Stopped => Err(Error::Closed),
        }
    }

    /// Current state.
    pub(crate) fn state(&self) -> State {
        match *self.lock() {
            Phase::Idle => State::Idle,
            Phase::Listening(_) => State::Listening,
            Phase::Stopped => State::Stopped,
        }
    }
}

/// Returns `true` when called on the thread behind `handle`.
pub(crate) fn is_current(handle: &JoinHandle<()>) -> bool {
    handle.thread().id() == thread::current().id()
}

/// Joins a listener, unless the caller *is* that listener.
pub(crate) fn join(handle: JoinHandle<()>, logger: &dyn Logger) {
    if is_current(&handle) {
        logger.warn("Stop requested from the listener thread; it exits after this cycle");
        return;
    }
    if handle.join().is_err() {
        logger.critical("Listener thread panicked");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::log::Discard;

    #[test]
    fn start_is_idempotent() {
        let bg = Background::new();
        let runs = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let runs = runs.clone();
            bg.start("test", move || {
                runs.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        assert_eq!(bg.state(), State::Listening);
        join(bg.stop().unwrap().unwrap(), &Discard);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_recognizes_itself() {
        let bg = Arc::new(Background::new());
        let (tx, rx) = std::sync::mpsc::channel();
        let inner = bg.clone();
        bg.start("test", move || {
            let handle = inner.stop().unwrap().unwrap();
            tx.send(is_current(&handle)).unwrap();
            join(handle, &Discard);
        })
        .unwrap();
        assert!(rx.recv().unwrap());
        assert_eq!(bg.state(), State::Stopped);
    }

    #[test]
    fn stop_is_terminal() {
        let bg = Background::new();
        assert!(bg.stop().unwrap().is_none());
        assert_eq!(bg.state(), State::Stopped);
        assert!(matches!(bg.stop(), Err(Error::Closed)));
        assert!(matches!(bg.start("test", || {}), Err(Error::Closed)));
    }
}
