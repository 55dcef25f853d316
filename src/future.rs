//! A topology's completion future.
//!
//! `Executor::run` (and friends) return a [`RunFuture`] immediately; it is
//! satisfied exactly once, from whichever worker thread drives the
//! topology's last node to completion, with either `Ok(())` or the
//! [`RunError`] of the first callable that panicked. Built on this crate's
//! own bounded [`crate::channel`] wrapper as a one-shot (capacity 1).

use crate::channel::{self, Receiver, Sender};
use crate::error::RunError;

/// The producing half, held by the executor and fired exactly once per run.
pub(crate) struct RunPromise {
    tx: Sender<Result<(), RunError>>,
}

impl RunPromise {
    pub(crate) fn new() -> (Self, RunFuture) {
        let (tx, rx) = channel::bounded(1);
        (Self { tx }, RunFuture { rx })
    }

    /// Fulfils the promise. Only the first call has any effect; later calls
    /// (which should not happen under correct join accounting) are dropped
    /// silently rather than panicking a worker thread.
    pub(crate) fn fulfil(&self, result: Result<(), RunError>) {
        let _ = self.tx.send(result);
    }
}

/// A handle to a topology's eventual completion.
///
/// Safe to wait on from any thread, including a thread that is itself one of
/// the executor's workers (waiting for a *different* topology than the one
/// it happens to be running on).
pub struct RunFuture {
    rx: Receiver<Result<(), RunError>>,
}

impl RunFuture {
    /// Blocks until the topology completes.
    pub fn wait(self) -> Result<(), RunError> {
        self.rx
            .recv()
            .expect("run promise dropped without being fulfilled")
    }

    /// Polls without blocking.
    pub fn try_wait(&self) -> Option<Result<(), RunError>> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fulfil_then_wait_returns_ok() {
        let (promise, future) = RunPromise::new();
        promise.fulfil(Ok(()));
        assert!(future.wait().is_ok());
    }

    #[test]
    fn try_wait_before_fulfil_is_none() {
        let (promise, future) = RunPromise::new();
        assert!(future.try_wait().is_none());
        promise.fulfil(Ok(()));
        assert!(future.try_wait().is_some());
    }
}
