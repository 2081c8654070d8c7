// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Fence-ordered busy/idle tracking.
//!
//! Every resource carries a [`ResourceSignal`]: an idle/busy state plus the fence of the most
//! recent operation that has to finish before the resource may be reused. Completions can be
//! reported out of submission order, so a completion only idles a resource when its fence is at
//! least the stored watermark.

use std::time::Duration;

use sync::Condvar;
use sync::Mutex;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResourceState {
    Idle,
    Busy,
}

/// State of a resource together with the fence that must complete before it is idle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Watermark {
    pub state: ResourceState,
    pub fence: u64,
}

/// How a caller waits for a resource to become idle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WaitMode {
    /// Report the current state without blocking.
    NoWait,
    Timeout(Duration),
    Forever,
}

pub struct ResourceSignal {
    watermark: Mutex<Watermark>,
    condvar: Condvar,
}

impl ResourceSignal {
    pub fn new(state: ResourceState) -> Self {
        ResourceSignal {
            watermark: Mutex::new(Watermark { state, fence: 0 }),
            condvar: Condvar::new(),
        }
    }

    pub fn watermark(&self) -> Watermark {
        *self.watermark.lock()
    }

    pub fn state(&self) -> ResourceState {
        self.watermark.lock().state
    }

    /// Marks the resource busy until `fence` completes.
    ///
    /// Fence 0 carries no ordering and always marks busy without moving the watermark. Otherwise
    /// only a fence newer than the watermark applies. Returns the previous watermark if anything
    /// changed.
    pub fn mark_busy(&self, fence: u64) -> Option<Watermark> {
        let mut watermark = self.watermark.lock();
        let previous = *watermark;
        if fence == 0 {
            watermark.state = ResourceState::Busy;
        } else if fence > watermark.fence {
            watermark.state = ResourceState::Busy;
            watermark.fence = fence;
        } else {
            return None;
        }
        Some(previous)
    }

    /// Marks the resource idle if `fence` is at or past the watermark. Returns whether it did.
    pub fn mark_idle(&self, fence: u64) -> bool {
        let mut watermark = self.watermark.lock();
        if fence < watermark.fence {
            return false;
        }
        watermark.state = ResourceState::Idle;
        self.condvar.notify_all();
        true
    }

    /// Undoes a `mark_busy(fence)` whose command never reached the host.
    ///
    /// Nothing happens if a newer fence has been applied since.
    pub fn revert_busy(&self, fence: u64, previous: Watermark) -> bool {
        let mut watermark = self.watermark.lock();
        if watermark.fence != fence || watermark.state != ResourceState::Busy {
            return false;
        }
        *watermark = previous;
        if previous.state == ResourceState::Idle {
            self.condvar.notify_all();
        }
        true
    }

    /// Waits according to `mode` and returns the state observed last.
    pub fn wait(&self, mode: WaitMode) -> ResourceState {
        let busy = |watermark: &mut Watermark| watermark.state == ResourceState::Busy;
        match mode {
            WaitMode::NoWait => self.state(),
            WaitMode::Timeout(timeout) => {
                let (watermark, _) =
                    self.condvar
                        .wait_timeout_while(self.watermark.lock(), timeout, busy);
                watermark.state
            }
            WaitMode::Forever => self.condvar.wait_while(self.watermark.lock(), busy).state,
        }
    }
}

/// A fence object shared with a caller: an in-fence to wait on before submitting, or an
/// out-fence signaled when a submission completes.
#[derive(Debug)]
pub struct FenceEvent {
    fence_id: u64,
    signaled: Mutex<bool>,
    condvar: Condvar,
}

impl FenceEvent {
    pub fn new(fence_id: u64) -> Self {
        FenceEvent {
            fence_id,
            signaled: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    pub fn fence_id(&self) -> u64 {
        self.fence_id
    }

    pub fn signal(&self) {
        *self.signaled.lock() = true;
        self.condvar.notify_all();
    }

    pub fn is_signaled(&self) -> bool {
        *self.signaled.lock()
    }

    /// Returns true if the fence signaled before `timeout` elapsed.
    pub fn wait(&self, timeout: Duration) -> bool {
        let (signaled, _) =
            self.condvar
                .wait_timeout_while(self.signaled.lock(), timeout, |signaled| !*signaled);
        *signaled
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn older_completion_does_not_idle() {
        let signal = ResourceSignal::new(ResourceState::Idle);
        signal.mark_busy(5);
        assert!(!signal.mark_idle(4));
        assert_eq!(signal.state(), ResourceState::Busy);
        assert!(signal.mark_idle(5));
        assert_eq!(signal.state(), ResourceState::Idle);
    }

    #[test]
    fn newer_completion_idles() {
        let signal = ResourceSignal::new(ResourceState::Idle);
        signal.mark_busy(5);
        assert!(signal.mark_idle(9));
        assert_eq!(
            signal.watermark(),
            Watermark {
                state: ResourceState::Idle,
                fence: 5
            }
        );
    }

    #[test]
    fn stale_busy_is_ignored() {
        let signal = ResourceSignal::new(ResourceState::Idle);
        signal.mark_busy(7);
        signal.mark_idle(7);
        assert_eq!(signal.mark_busy(6), None);
        assert_eq!(signal.state(), ResourceState::Idle);
    }

    #[test]
    fn unfenced_busy_keeps_watermark() {
        let signal = ResourceSignal::new(ResourceState::Idle);
        signal.mark_busy(3);
        signal.mark_idle(3);
        assert!(signal.mark_busy(0).is_some());
        assert_eq!(
            signal.watermark(),
            Watermark {
                state: ResourceState::Busy,
                fence: 3
            }
        );
        assert!(signal.mark_idle(3));
    }

    #[test]
    fn revert_restores_previous() {
        let signal = ResourceSignal::new(ResourceState::Idle);
        let previous = signal.mark_busy(2).unwrap();
        assert!(signal.revert_busy(2, previous));
        assert_eq!(
            signal.watermark(),
            Watermark {
                state: ResourceState::Idle,
                fence: 0
            }
        );

        let previous = signal.mark_busy(3).unwrap();
        signal.mark_busy(4);
        assert!(!signal.revert_busy(3, previous));
        assert_eq!(signal.watermark().fence, 4);
    }

    #[test]
    fn nowait_reports_state() {
        let signal = ResourceSignal::new(ResourceState::Busy);
        assert_eq!(signal.wait(WaitMode::NoWait), ResourceState::Busy);
        signal.mark_idle(0);
        assert_eq!(signal.wait(WaitMode::NoWait), ResourceState::Idle);
    }

    #[test]
    fn wait_times_out_while_busy() {
        let signal = ResourceSignal::new(ResourceState::Idle);
        signal.mark_busy(1);
        assert_eq!(
            signal.wait(WaitMode::Timeout(Duration::from_millis(10))),
            ResourceState::Busy
        );
    }

    #[test]
    fn wait_wakes_on_completion() {
        let signal = Arc::new(ResourceSignal::new(ResourceState::Idle));
        signal.mark_busy(1);
        let completer = {
            let signal = Arc::clone(&signal);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                signal.mark_idle(1);
            })
        };
        assert_eq!(signal.wait(WaitMode::Forever), ResourceState::Idle);
        completer.join().unwrap();
    }

    #[test]
    fn fence_event() {
        let event = Arc::new(FenceEvent::new(11));
        assert!(!event.wait(Duration::from_millis(5)));
        let signaler = {
            let event = Arc::clone(&event);
            thread::spawn(move || event.signal())
        };
        assert!(event.wait(Duration::from_secs(10)));
        assert!(event.is_signaled());
        assert_eq!(event.fence_id(), 11);
        signaler.join().unwrap();
    }
}
