//! Exclusive slot ownership
//!
//! One owner at a time; blocking callers queue in FIFO order. Release happens in
//! two steps so the slot can be drained and optionally reset while ownership is
//! still pinned: [`Exclusivity::begin_release`] stops the owner from issuing I/O
//! and pauses handoff, [`Exclusivity::finish_release`] grants the next waiter.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use super::{OwnerId, SlotError};
use crate::error::{Error, Result};

#[derive(Debug)]
struct Waiter {
    owner: OwnerId,
    interrupted: bool,
}

#[derive(Debug, Default)]
struct State {
    holder: Option<OwnerId>,
    releasing: bool,
    waiters: VecDeque<Waiter>,
    closed: bool,
}

impl State {
    const fn is_free(&self) -> bool {
        self.holder.is_none() && !self.releasing
    }
}

/// Single-owner lock with a FIFO of waiters
#[derive(Debug, Default)]
pub struct Exclusivity {
    state: Mutex<State>,
    changed: Condvar,
}

impl Exclusivity {
    /// Create an unowned lock
    pub fn new() -> Self {
        Self::default()
    }

    /// Become the owner
    ///
    /// A non-blocking call fails with [`SlotError::Busy`] when the slot is held
    /// or others are already waiting. A blocking call queues and returns once
    /// granted, or with [`SlotError::Interrupted`] after [`Self::interrupt`].
    pub fn acquire(&self, owner: OwnerId, blocking: bool) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::DeviceGone);
        }
        if state.holder == Some(owner) {
            return Err(SlotError::AlreadyOwner.into());
        }
        if state.waiters.iter().any(|w| w.owner == owner) {
            return Err(SlotError::AlreadyWaiting.into());
        }
        if state.is_free() && state.waiters.is_empty() {
            state.holder = Some(owner);
            trace!(%owner, "Slot granted");
            return Ok(());
        }
        if !blocking {
            return Err(SlotError::Busy.into());
        }

        state.waiters.push_back(Waiter {
            owner,
            interrupted: false,
        });
        trace!(%owner, waiters = state.waiters.len(), "Waiting for slot");
        loop {
            self.changed.wait(&mut state);

            if state.closed {
                state.waiters.retain(|w| w.owner != owner);
                return Err(Error::DeviceGone);
            }
            let position = state.waiters.iter().position(|w| w.owner == owner);
            match position {
                Some(index) if state.waiters[index].interrupted => {
                    state.waiters.remove(index);
                    // The next waiter may now be at the head.
                    self.changed.notify_all();
                    return Err(SlotError::Interrupted.into());
                }
                Some(0) if state.is_free() => {
                    state.waiters.pop_front();
                    state.holder = Some(owner);
                    trace!(%owner, "Slot handed over");
                    return Ok(());
                }
                Some(_) => {}
                None => return Err(SlotError::Interrupted.into()),
            }
        }
    }

    /// Cancel a blocking acquire of `owner`
    ///
    /// Returns `false` if `owner` was not waiting.
    pub fn interrupt(&self, owner: OwnerId) -> bool {
        let mut state = self.state.lock();
        match state.waiters.iter_mut().find(|w| w.owner == owner) {
            Some(waiter) => {
                waiter.interrupted = true;
                self.changed.notify_all();
                true
            }
            None => false,
        }
    }

    /// Whether `owner` holds the slot and may issue I/O
    pub fn holds(&self, owner: OwnerId) -> bool {
        let state = self.state.lock();
        state.holder == Some(owner) && !state.releasing
    }

    /// Current owner, if any
    pub fn holder(&self) -> Option<OwnerId> {
        self.state.lock().holder
    }

    /// Number of queued waiters
    pub fn waiters(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// First step of a release: revoke I/O rights and pause handoff
    ///
    /// A second release by the same owner is rejected with
    /// [`SlotError::NotOwner`].
    pub fn begin_release(&self, owner: OwnerId) -> Result<()> {
        let mut state = self.state.lock();
        if state.holder != Some(owner) || state.releasing {
            return Err(SlotError::NotOwner.into());
        }
        state.releasing = true;
        Ok(())
    }

    /// Second step of a release: hand the slot to the next waiter
    pub fn finish_release(&self) {
        let mut state = self.state.lock();
        if let Some(owner) = state.holder.take() {
            trace!(%owner, "Slot released");
        }
        state.releasing = false;
        self.changed.notify_all();
    }

    /// Refuse every current and future acquire
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.holder = None;
        state.releasing = false;
        self.changed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn wait_for_waiters(lock: &Exclusivity, count: usize) {
        for _ in 0..200 {
            if lock.waiters() == count {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("waiters never reached {count}");
    }

    #[test]
    fn test_non_blocking_busy() {
        let lock = Exclusivity::new();
        lock.acquire(OwnerId::new(1), false).unwrap();
        assert_eq!(
            lock.acquire(OwnerId::new(2), false),
            Err(Error::Slot(SlotError::Busy))
        );
        assert_eq!(
            lock.acquire(OwnerId::new(1), false),
            Err(Error::Slot(SlotError::AlreadyOwner))
        );
    }

    #[test]
    fn test_fifo_handoff() {
        let lock = Arc::new(Exclusivity::new());
        lock.acquire(OwnerId::new(1), false).unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for id in [2, 3] {
            let thread_lock = Arc::clone(&lock);
            let order = Arc::clone(&order);
            handles.push(thread::spawn(move || {
                thread_lock.acquire(OwnerId::new(id), true).unwrap();
                order.lock().push(id);
                thread_lock.begin_release(OwnerId::new(id)).unwrap();
                thread_lock.finish_release();
            }));
            wait_for_waiters(&lock, id as usize - 1);
        }

        lock.begin_release(OwnerId::new(1)).unwrap();
        lock.finish_release();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*order.lock(), vec![2, 3]);
    }

    #[test]
    fn test_double_release_rejected() {
        let lock = Exclusivity::new();
        let owner = OwnerId::new(1);
        lock.acquire(owner, false).unwrap();
        lock.begin_release(owner).unwrap();
        assert_eq!(
            lock.begin_release(owner),
            Err(Error::Slot(SlotError::NotOwner))
        );
        lock.finish_release();
        assert_eq!(
            lock.begin_release(owner),
            Err(Error::Slot(SlotError::NotOwner))
        );
        assert_eq!(lock.holder(), None);
    }

    #[test]
    fn test_release_pauses_handoff() {
        let lock = Arc::new(Exclusivity::new());
        let first = OwnerId::new(1);
        lock.acquire(first, false).unwrap();
        lock.begin_release(first).unwrap();
        assert!(!lock.holds(first));

        let waiter = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || lock.acquire(OwnerId::new(2), true))
        };
        wait_for_waiters(&lock, 1);
        assert_eq!(lock.holder(), Some(first));

        lock.finish_release();
        waiter.join().unwrap().unwrap();
        assert_eq!(lock.holder(), Some(OwnerId::new(2)));
    }

    #[test]
    fn test_interrupt_wakes_next() {
        let lock = Arc::new(Exclusivity::new());
        lock.acquire(OwnerId::new(1), false).unwrap();

        let second = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || lock.acquire(OwnerId::new(2), true))
        };
        wait_for_waiters(&lock, 1);
        let third = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || lock.acquire(OwnerId::new(3), true))
        };
        wait_for_waiters(&lock, 2);

        assert!(lock.interrupt(OwnerId::new(2)));
        assert_eq!(
            second.join().unwrap(),
            Err(Error::Slot(SlotError::Interrupted))
        );

        lock.begin_release(OwnerId::new(1)).unwrap();
        lock.finish_release();
        third.join().unwrap().unwrap();
        assert_eq!(lock.holder(), Some(OwnerId::new(3)));
    }

    #[test]
    fn test_close_releases_waiters() {
        let lock = Arc::new(Exclusivity::new());
        lock.acquire(OwnerId::new(1), false).unwrap();
        let waiter = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || lock.acquire(OwnerId::new(2), true))
        };
        wait_for_waiters(&lock, 1);
        lock.close();
        assert_eq!(waiter.join().unwrap(), Err(Error::DeviceGone));
        assert_eq!(lock.acquire(OwnerId::new(3), false), Err(Error::DeviceGone));
    }
}
