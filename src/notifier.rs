//! Lost-wakeup-free parking for idle workers (§4.2).
//!
//! A worker that finds no work anywhere calls [`Notifier::prepare_wait`],
//! re-checks every queue once more (the caller's responsibility — see
//! `Executor::wait_for_task`), then either [`Notifier::commit_wait`]s (parks
//! until woken) or [`Notifier::cancel_wait`]s (work appeared after all, skip
//! parking). `notify`/`notify_n` wake one or `n` parked waiters.
//!
//! This realizes, with real `Condvar`s, what the scheduler's own
//! `thread::park_timeout(Duration::from_millis(1))` polling loop calls out
//! in a comment as its own missing piece: *"a production scheduler would use
//! a condition variable ... but this is adequate for the current phase."*

use std::sync::{Condvar, Mutex};

struct NotifierState {
    /// Bumped on every `notify`/`notify_n`. A waiter that observes this
    /// counter change between `prepare_wait` and `commit_wait` knows a
    /// wakeup happened concurrently and must not block.
    epoch: u64,
    waiters: usize,
}

pub struct Notifier {
    state: Mutex<NotifierState>,
    cvar: Condvar,
}

/// Token returned by [`Notifier::prepare_wait`]; feed it to
/// [`Notifier::commit_wait`] or [`Notifier::cancel_wait`].
pub struct WaitToken {
    epoch: u64,
}

impl Notifier {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(NotifierState {
                epoch: 0,
                waiters: 0,
            }),
            cvar: Condvar::new(),
        }
    }

    /// Registers intent to wait and snapshots the current epoch. The caller
    /// must re-scan for work *after* this call and before `commit_wait`;
    /// any `notify` that lands between `prepare_wait` and `commit_wait`
    /// bumps the epoch and `commit_wait` will observe it and return
    /// immediately instead of sleeping.
    pub fn prepare_wait(&self) -> WaitToken {
        let mut state = self.state.lock().unwrap();
        state.waiters += 1;
        WaitToken { epoch: state.epoch }
    }

    /// Aborts a pending wait after `prepare_wait` found work on the re-scan.
    pub fn cancel_wait(&self, token: WaitToken) {
        let mut state = self.state.lock().unwrap();
        state.waiters -= 1;
        let _ = token;
    }

    /// Blocks until woken, unless a `notify` already landed since the
    /// matching `prepare_wait` (in which case this returns immediately).
    pub fn commit_wait(&self, token: WaitToken) {
        let mut state = self.state.lock().unwrap();
        while state.epoch == token.epoch {
            state = self.cvar.wait(state).unwrap();
        }
        state.waiters -= 1;
    }

    /// Wakes at most one parked waiter.
    pub fn notify(&self) {
        let mut state = self.state.lock().unwrap();
        if state.waiters > 0 {
            state.epoch = state.epoch.wrapping_add(1);
            self.cvar.notify_one();
        }
    }

    /// Wakes at most `n` parked waiters (used on topology set-up, when up to
    /// `n` new sources became runnable at once).
    pub fn notify_n(&self, n: usize) {
        if n == 0 {
            return;
        }
        let mut state = self.state.lock().unwrap();
        if state.waiters > 0 {
            state.epoch = state.epoch.wrapping_add(1);
            if n == 1 {
                self.cvar.notify_one();
            } else {
                self.cvar.notify_all();
            }
        }
    }

    /// Wakes every parked waiter (used on shutdown).
    pub fn notify_all(&self) {
        let mut state = self.state.lock().unwrap();
        state.epoch = state.epoch.wrapping_add(1);
        self.cvar.notify_all();
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}
