//! Pause/resume gate around a background receive-dispatch cycle.
//!
//! The listener thread wraps each cycle in [`Gate::enter`]. [`Gate::pause`]
//! waits for the running cycle (if any) to finish and then keeps new cycles
//! from starting until [`Gate::resume`]. [`Gate::close`] releases every
//! waiter so a paused listener can still observe shutdown.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// Shared state behind the gate's mutex.
#[derive(Debug, Default)]
struct State {
    /// A pauser holds the gate.
    paused: bool,
    /// A cycle is in progress.
    busy: bool,
    /// The owner is shutting down.
    closed: bool,
}

/// Mutex + condition variable gate.
#[derive(Debug, Default)]
pub(crate) struct Gate {
    /// Gate state.
    state: Mutex<State>,
    /// Signalled on every state change.
    cond: Condvar,
}

/// Marks a cycle in progress; the gate reopens for pausers on drop.
#[derive(Debug)]
pub(crate) struct Cycle<'a> {
    /// Gate this cycle belongs to.
    gate: &'a Gate,
}

impl Gate {
    /// Locks the state, ignoring poisoning: the flags stay consistent.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts a cycle, blocking while paused. Returns `None` once closed.
    pub(crate) fn enter(&self) -> Option<Cycle<'_>> {
        let mut state = self
            .cond
            .wait_while(self.lock(), |s| s.paused && !s.closed)
            .unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return None;
        }
        state.busy = true;
        Some(Cycle { gate: self })
    }

    /// Waits for the current cycle and any other pauser, then holds the gate.
    ///
    /// Must not be called from inside a cycle: it would wait on itself.
    pub(crate) fn pause(&self) {
        let mut state = self
            .cond
            .wait_while(self.lock(), |s| (s.busy || s.paused) && !s.closed)
            .unwrap_or_else(PoisonError::into_inner);
        state.paused = true;
    }

    /// Releases a pause. No-op if the gate is not paused.
    pub(crate) fn resume(&self) {
        self.lock().paused = false;
        self.cond.notify_all();
    }

    /// Permanently opens the gate for shutdown.
    pub(crate) fn close(&self) {
        self.lock().closed = true;
        self.cond.notify_all();
    }

    /// Returns `true` while a pauser holds the gate.
    #[cfg(test)]
    pub(crate) fn is_paused(&self) -> bool {
        self.lock().paused
    }
}

impl Drop for Cycle<'_> {
    fn drop(&mut self) {
        self.gate.lock().busy = false;
        self.gate.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;

    #[test]
    fn enter_when_open() {
        let gate = Gate::default();
        assert!(gate.enter().is_some());
        assert!(!gate.is_paused());
    }

    #[test]
    fn pause_waits_for_running_cycle() {
        let gate = Arc::new(Gate::default());
        let finished = Arc::new(AtomicBool::new(false));

        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let worker = {
            let gate = gate.clone();
            let finished = finished.clone();
            thread::spawn(move || {
                let _cycle = gate.enter();
                entered_tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(150));
                finished.store(true, Ordering::SeqCst);
            })
        };

        entered_rx.recv().unwrap();
        gate.pause();
        assert!(finished.load(Ordering::SeqCst), "pause returned mid-cycle");
        worker.join().unwrap();
        gate.resume();
    }

    #[test]
    fn paused_gate_blocks_enter_until_resume() {
        let gate = Arc::new(Gate::default());
        gate.pause();

        let entered = Arc::new(AtomicBool::new(false));
        let worker = {
            let gate = gate.clone();
            let entered = entered.clone();
            thread::spawn(move || {
                let cycle = gate.enter();
                entered.store(true, Ordering::SeqCst);
                cycle.is_some()
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert!(!entered.load(Ordering::SeqCst));
        gate.resume();
        assert!(worker.join().unwrap());
    }

    #[test]
    fn close_releases_paused_waiter() {
        let gate = Arc::new(Gate::default());
        gate.pause();

        let worker = {
            let gate = gate.clone();
            thread::spawn(move || gate.enter().is_none())
        };

        let start = Instant::now();
        thread::sleep(Duration::from_millis(50));
        gate.close();
        assert!(worker.join().unwrap());
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
