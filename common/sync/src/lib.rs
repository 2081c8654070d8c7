// Copyright 2018 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Sync primitive types whose methods panic rather than returning error in case of poison.
//!
//! A panic while a lock is held takes down the whole driver, so callers never need to consider
//! poison. Use these anywhere `std::sync::Mutex` or `std::sync::Condvar` would otherwise be used.

mod condvar;
mod mutex;

use std::fmt;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

pub use crate::condvar::Condvar;
pub use crate::mutex::Mutex;
pub use crate::mutex::WouldBlock;

enum SlotState<T> {
    Pending,
    Ready(T),
    Abandoned,
    Taken,
}

struct Slot<T> {
    state: Mutex<SlotState<T>>,
    condvar: Condvar,
}

/// Why `Waitable::wait` returned without a value.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WaitError {
    /// The timeout elapsed first. The promise may still be fulfilled later; the value is then
    /// dropped by whoever holds the last reference.
    TimedOut,
    /// The promise was dropped without being fulfilled, or the value was already taken.
    Abandoned,
}

impl Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WaitError::TimedOut => write!(f, "timed out waiting for promise"),
            WaitError::Abandoned => write!(f, "promise was abandoned"),
        }
    }
}

impl std::error::Error for WaitError {}

/// Waitable allows one thread to wait for a value produced by another thread.
///
/// A Waitable is created together with a [`Promise`] by `create_promise_and_waitable`. The
/// Promise is handed off to whatever produces the value, typically a completion path, and the
/// Waitable stays with the thread that needs it.
pub struct Waitable<T>(Arc<Slot<T>>);

impl<T> Waitable<T> {
    /// Blocks until the paired promise is fulfilled or dropped, or `timeout` elapses.
    ///
    /// `None` waits forever.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<T, WaitError> {
        let slot = &*self.0;
        let pending = |state: &mut SlotState<T>| matches!(state, SlotState::Pending);
        let mut state = match timeout {
            Some(timeout) => {
                let (state, result) =
                    slot.condvar
                        .wait_timeout_while(slot.state.lock(), timeout, pending);
                if result.timed_out() {
                    return Err(WaitError::TimedOut);
                }
                state
            }
            None => slot.condvar.wait_while(slot.state.lock(), pending),
        };
        match std::mem::replace(&mut *state, SlotState::Taken) {
            SlotState::Ready(value) => Ok(value),
            _ => Err(WaitError::Abandoned),
        }
    }

    /// Returns true once the paired promise has been fulfilled.
    pub fn is_ready(&self) -> bool {
        matches!(*self.0.state.lock(), SlotState::Ready(_))
    }
}

/// Promise delivers exactly one value to its paired [`Waitable`].
pub struct Promise<T>(Arc<Slot<T>>);

impl<T> Promise<T> {
    /// Stores `value` and wakes the waiter.
    pub fn fulfill(self, value: T) {
        self.settle(SlotState::Ready(value));
    }

    fn settle(&self, new_state: SlotState<T>) {
        let mut state = self.0.state.lock();
        if matches!(*state, SlotState::Pending) {
            *state = new_state;
            self.0.condvar.notify_all();
        }
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        self.settle(SlotState::Abandoned);
    }
}

/// Create a paired Promise and Waitable.
pub fn create_promise_and_waitable<T>() -> (Promise<T>, Waitable<T>) {
    let inner = Arc::new(Slot {
        state: Mutex::new(SlotState::Pending),
        condvar: Condvar::new(),
    });
    (Promise(Arc::clone(&inner)), Waitable(inner))
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn fulfilled_before_wait() {
        let (promise, waitable) = create_promise_and_waitable();
        promise.fulfill(7u32);
        assert!(waitable.is_ready());
        assert_eq!(waitable.wait(None), Ok(7));
        assert_eq!(waitable.wait(None), Err(WaitError::Abandoned));
    }

    #[test]
    fn fulfilled_from_other_thread() {
        let (promise, waitable) = create_promise_and_waitable();
        let worker = thread::spawn(move || promise.fulfill(vec![1u8, 2, 3]));
        assert_eq!(waitable.wait(Some(Duration::from_secs(10))), Ok(vec![1, 2, 3]));
        worker.join().unwrap();
    }

    #[test]
    fn timeout() {
        let (_promise, waitable) = create_promise_and_waitable::<()>();
        assert_eq!(
            waitable.wait(Some(Duration::from_millis(10))),
            Err(WaitError::TimedOut)
        );
    }

    #[test]
    fn dropped_promise_wakes_waiter() {
        let (promise, waitable) = create_promise_and_waitable::<u32>();
        drop(promise);
        assert_eq!(waitable.wait(None), Err(WaitError::Abandoned));
    }

    #[test]
    fn mutex_try_lock() {
        let mutex = Mutex::new(0);
        let guard = mutex.lock();
        assert!(mutex.try_lock().is_err());
        drop(guard);
        *mutex.try_lock().unwrap() += 1;
        assert_eq!(mutex.into_inner(), 1);
    }
}
