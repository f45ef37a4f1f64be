//! One-shot completion channels
//!
//! Each command gets a bounded(1) channel. The sending half may be held by
//! several parties (the worker and a cancellation path); whoever completes
//! first wins and every later attempt is a no-op.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded};
use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Sending half of a completion
#[derive(Debug)]
pub struct Completer<T> {
    tx: Arc<Mutex<Option<Sender<Result<T>>>>>,
}

impl<T> Clone for Completer<T> {
    fn clone(&self) -> Self {
        Self {
            tx: Arc::clone(&self.tx),
        }
    }
}

impl<T> Completer<T> {
    /// Deliver the result
    ///
    /// Returns `false` if the command had already been completed.
    pub fn complete(&self, result: Result<T>) -> bool {
        match self.tx.lock().take() {
            Some(tx) => {
                // The receiver may be gone; the command still counts as completed.
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Whether a result has been delivered
    pub fn is_completed(&self) -> bool {
        self.tx.lock().is_none()
    }
}

/// Receiving half of a completion
#[derive(Debug)]
pub struct Pending<T> {
    rx: Receiver<Result<T>>,
}

impl<T> Pending<T> {
    /// Block until the result arrives
    pub fn wait(self) -> Result<T> {
        self.rx.recv().unwrap_or(Err(Error::DeviceGone))
    }

    /// Block for at most `timeout`, `None` if the command is still running
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T>> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(Error::DeviceGone)),
        }
    }

    /// Poll without blocking, `None` if the command is still running
    pub fn try_wait(&self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(Error::DeviceGone)),
        }
    }
}

/// Create a linked completer and pending result
pub fn completion<T>() -> (Completer<T>, Pending<T>) {
    let (tx, rx) = bounded(1);
    (
        Completer {
            tx: Arc::new(Mutex::new(Some(tx))),
        },
        Pending { rx },
    )
}
