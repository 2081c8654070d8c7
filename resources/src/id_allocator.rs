// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::VecDeque;

/// Whether released ids may be handed out again.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IdPolicy {
    /// Ids only ever come from the counter.
    Monotonic,
    /// Released ids are queued and preferred over fresh ones.
    Recycle,
}

/// Generates ids for one namespace. Ids start at 1; 0 is reserved as "none".
///
/// Like [`crate::Arena`], the generator is not internally locked. Each namespace is owned behind
/// its own mutex so that minting fences never contends with creating resources.
#[derive(Debug)]
pub struct IdAllocator {
    policy: IdPolicy,
    next: u64,
    free: VecDeque<u64>,
}

impl IdAllocator {
    pub fn new(policy: IdPolicy) -> Self {
        IdAllocator {
            policy,
            next: 1,
            free: VecDeque::new(),
        }
    }

    /// Returns the next id, drawing from released ids first when the namespace recycles.
    pub fn next_id(&mut self) -> u64 {
        match self.free.pop_front() {
            Some(id) => id,
            None => self.next_fresh(),
        }
    }

    /// Returns an id that has never been issued before, ignoring any released ids.
    ///
    /// Fence ids are always minted this way so that fence order never regresses.
    pub fn next_fresh(&mut self) -> u64 {
        let id = self.next;
        self.next += 1;
        id
    }

    /// The most recently minted fresh id, or 0 if none has been issued.
    pub fn last_issued(&self) -> u64 {
        self.next - 1
    }

    /// Returns `id` to the free list.
    ///
    /// Returns false, and does nothing, when the namespace does not recycle or `id` was never
    /// issued or is already free.
    pub fn release(&mut self, id: u64) -> bool {
        if self.policy != IdPolicy::Recycle
            || id == 0
            || id >= self.next
            || self.free.contains(&id)
        {
            return false;
        }
        self.free.push_back(id);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_one() {
        let mut ids = IdAllocator::new(IdPolicy::Monotonic);
        assert_eq!(ids.last_issued(), 0);
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 2);
        assert_eq!(ids.last_issued(), 2);
    }

    #[test]
    fn monotonic_ignores_release() {
        let mut ids = IdAllocator::new(IdPolicy::Monotonic);
        let first = ids.next_id();
        assert!(!ids.release(first));
        assert_eq!(ids.next_id(), 2);
    }

    #[test]
    fn recycle_prefers_released() {
        let mut ids = IdAllocator::new(IdPolicy::Recycle);
        let a = ids.next_id();
        let b = ids.next_id();
        assert!(ids.release(a));
        assert!(!ids.release(a));
        assert_eq!(ids.next_id(), a);
        assert_eq!(ids.next_id(), b + 1);
    }

    #[test]
    fn fresh_ids_skip_free_list() {
        let mut ids = IdAllocator::new(IdPolicy::Recycle);
        let a = ids.next_fresh();
        assert!(ids.release(a));
        assert_eq!(ids.next_fresh(), a + 1);
        assert_eq!(ids.next_id(), a);
    }

    #[test]
    fn release_rejects_unissued() {
        let mut ids = IdAllocator::new(IdPolicy::Recycle);
        assert!(!ids.release(0));
        assert!(!ids.release(1));
        ids.next_id();
        assert!(ids.release(1));
    }
}
