// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Graphics resources and the per-context registry that owns them.

use std::collections::BTreeMap as Map;
use std::sync::Arc;

use anyhow::anyhow;
use sync::Mutex;

use crate::fence::ResourceSignal;
use crate::fence::ResourceState;
use crate::fence::WaitMode;
use crate::fence::Watermark;
use crate::memory::MemoryBlock;
use crate::share::ShareSource;
use crate::share::UserMapping;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResourceKind {
    /// Backed by arena memory the driver allocated.
    Buffer,
    /// Pure synchronization object, no memory.
    Placeholder,
    /// Memory is chosen by the host and reported after a map request.
    Blob { mappable: bool },
}

/// Where a resource's memory lives.
#[derive(Debug)]
pub enum Backing {
    None,
    Arena(MemoryBlock),
    Host { physical_address: u64, size: u64 },
}

struct ResourceMemory {
    // Unmapped before the backing below is released.
    share: Option<Box<dyn UserMapping>>,
    backing: Backing,
}

pub struct Resource {
    id: u32,
    kind: ResourceKind,
    signal: ResourceSignal,
    memory: Mutex<ResourceMemory>,
}

impl Resource {
    pub fn new(id: u32, kind: ResourceKind, backing: Backing, state: ResourceState) -> Self {
        Resource {
            id,
            kind,
            signal: ResourceSignal::new(state),
            memory: Mutex::new(ResourceMemory {
                share: None,
                backing,
            }),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn signal(&self) -> &ResourceSignal {
        &self.signal
    }

    /// True for memory reported by the host rather than allocated from the arena.
    pub fn is_host_mapped(&self) -> bool {
        matches!(self.kind, ResourceKind::Blob { .. })
    }

    /// True when the arena backing has been attached on the host side.
    pub fn has_arena_backing(&self) -> bool {
        matches!(self.memory.lock().backing, Backing::Arena(_))
    }

    /// True once the host has reported where a blob is mapped.
    pub fn has_host_range(&self) -> bool {
        matches!(self.memory.lock().backing, Backing::Host { .. })
    }

    /// The memory to expose when the resource is mapped, if it has any yet.
    pub fn share_source(&self) -> Option<ShareSource> {
        match &self.memory.lock().backing {
            Backing::None => None,
            Backing::Arena(block) => Some(ShareSource {
                virtual_address: Some(block.virtual_address()),
                physical_address: block.physical_address(),
                size: block.size(),
            }),
            Backing::Host {
                physical_address,
                size,
            } => Some(ShareSource {
                virtual_address: None,
                physical_address: *physical_address,
                size: *size,
            }),
        }
    }

    /// Records the range the host mapped a blob at.
    pub fn set_host_range(&self, physical_address: u64, size: u64) {
        self.memory.lock().backing = Backing::Host {
            physical_address,
            size,
        };
    }

    /// Returns the user address of the existing share, or creates one with `create`.
    ///
    /// `create` runs unlocked. If another caller installed a share first, the new one is dropped
    /// and the installed one wins.
    pub fn share_with<F>(&self, create: F) -> anyhow::Result<u64>
    where
        F: FnOnce() -> anyhow::Result<Box<dyn UserMapping>>,
    {
        if let Some(address) = self.user_address() {
            return Ok(address);
        }
        let share = create()?;
        let mut memory = self.memory.lock();
        let installed = if let Some(existing) = &memory.share {
            Ok(existing.user_address())
        } else if matches!(memory.backing, Backing::None) {
            Err(anyhow!("resource {} was released", self.id))
        } else {
            let address = share.user_address();
            memory.share = Some(share);
            return Ok(address);
        };
        drop(memory);
        // Unmapped outside the lock.
        drop(share);
        installed
    }

    pub fn user_address(&self) -> Option<u64> {
        self.memory
            .lock()
            .share
            .as_ref()
            .map(|share| share.user_address())
    }

    /// Drops the user share and then the backing, returning the arena memory.
    pub fn release_memory(&self) {
        let mut memory = self.memory.lock();
        memory.share = None;
        memory.backing = Backing::None;
    }

    pub fn wait(&self, mode: WaitMode) -> ResourceState {
        self.signal.wait(mode)
    }
}

/// The resources of one context, keyed by id.
///
/// Ids are handed out in increasing order, so key order is creation order.
#[derive(Default)]
pub struct ResourceRegistry {
    resources: Mutex<Map<u32, Arc<Resource>>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    /// Adds `resource`. Returns false, leaving the registry untouched, if its id is taken.
    pub fn insert(&self, resource: Arc<Resource>) -> bool {
        let mut resources = self.resources.lock();
        if resources.contains_key(&resource.id()) {
            return false;
        }
        resources.insert(resource.id(), resource);
        true
    }

    pub fn remove(&self, id: u32) -> Option<Arc<Resource>> {
        self.resources.lock().remove(&id)
    }

    pub fn find(&self, id: u32) -> Option<Arc<Resource>> {
        self.resources.lock().get(&id).cloned()
    }

    /// Calls `f` for every resource in `ids` that is present. Returns how many were found.
    pub fn for_each_matching<F>(&self, ids: &[u32], mut f: F) -> usize
    where
        F: FnMut(&Resource),
    {
        let resources = self.resources.lock();
        let mut found = 0;
        for id in ids {
            if let Some(resource) = resources.get(id) {
                f(resource);
                found += 1;
            }
        }
        found
    }

    /// Marks `ids` busy until `fence`. Returns the prior watermarks of the resources that changed,
    /// for `revert_busy`.
    pub fn mark_busy(&self, ids: &[u32], fence: u64) -> Vec<(u32, Watermark)> {
        let mut changed = Vec::new();
        self.for_each_matching(ids, |resource| {
            if let Some(previous) = resource.signal().mark_busy(fence) {
                changed.push((resource.id(), previous));
            }
        });
        changed
    }

    /// Marks `ids` idle where `fence` is at or past their watermark.
    pub fn mark_idle(&self, ids: &[u32], fence: u64) -> usize {
        let mut idled = 0;
        self.for_each_matching(ids, |resource| {
            if resource.signal().mark_idle(fence) {
                idled += 1;
            }
        });
        idled
    }

    /// Undoes a `mark_busy(_, fence)` whose command was never submitted.
    pub fn revert_busy(&self, fence: u64, changed: &[(u32, Watermark)]) {
        let resources = self.resources.lock();
        for (id, previous) in changed {
            if let Some(resource) = resources.get(id) {
                resource.signal().revert_busy(fence, *previous);
            }
        }
    }

    /// Removes every resource, newest first.
    pub fn drain(&self) -> Vec<Arc<Resource>> {
        let resources = std::mem::take(&mut *self.resources.lock());
        resources.into_values().rev().collect()
    }

    pub fn ids(&self) -> Vec<u32> {
        self.resources.lock().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.resources.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(ids: &[u32]) -> ResourceRegistry {
        let registry = ResourceRegistry::new();
        for id in ids {
            assert!(registry.insert(Arc::new(Resource::new(
                *id,
                ResourceKind::Placeholder,
                Backing::None,
                ResourceState::Idle,
            ))));
        }
        registry
    }

    #[test]
    fn insert_rejects_duplicate_id() {
        let registry = registry(&[1]);
        assert!(!registry.insert(Arc::new(Resource::new(
            1,
            ResourceKind::Buffer,
            Backing::None,
            ResourceState::Busy,
        ))));
        assert_eq!(registry.find(1).unwrap().kind(), ResourceKind::Placeholder);
    }

    #[test]
    fn find_and_remove() {
        let registry = registry(&[1, 2]);
        assert!(registry.find(3).is_none());
        assert_eq!(registry.remove(1).map(|r| r.id()), Some(1));
        assert!(registry.find(1).is_none());
        assert_eq!(registry.ids(), vec![2]);
    }

    #[test]
    fn for_each_matching_skips_missing() {
        let registry = registry(&[1, 2, 3]);
        let mut seen = Vec::new();
        let found = registry.for_each_matching(&[3, 7, 1], |r| seen.push(r.id()));
        assert_eq!(found, 2);
        assert_eq!(seen, vec![3, 1]);
    }

    #[test]
    fn busy_then_idle() {
        let registry = registry(&[1, 2]);
        assert_eq!(registry.mark_busy(&[1, 2], 5).len(), 2);
        assert_eq!(registry.find(1).unwrap().wait(WaitMode::NoWait), ResourceState::Busy);
        assert_eq!(registry.mark_idle(&[1, 2], 4), 0);
        assert_eq!(registry.mark_idle(&[1, 2], 5), 2);
        assert_eq!(registry.find(2).unwrap().wait(WaitMode::NoWait), ResourceState::Idle);
    }

    #[test]
    fn revert_restores_idle() {
        let registry = registry(&[1]);
        let changed = registry.mark_busy(&[1], 8);
        registry.revert_busy(8, &changed);
        assert_eq!(registry.find(1).unwrap().signal().state(), ResourceState::Idle);
    }

    #[test]
    fn drain_newest_first() {
        let registry = registry(&[4, 1, 9]);
        let drained: Vec<u32> = registry.drain().iter().map(|r| r.id()).collect();
        assert_eq!(drained, vec![9, 4, 1]);
        assert!(registry.is_empty());
    }

    #[test]
    fn blob_range_becomes_shareable() {
        let blob = Resource::new(
            7,
            ResourceKind::Blob { mappable: true },
            Backing::None,
            ResourceState::Busy,
        );
        assert!(blob.is_host_mapped());
        assert!(blob.share_source().is_none());
        blob.set_host_range(0x1_0000_0000, 0x2000);
        assert_eq!(
            blob.share_source(),
            Some(ShareSource {
                virtual_address: None,
                physical_address: 0x1_0000_0000,
                size: 0x2000,
            })
        );
        assert!(!blob.has_arena_backing());
        assert!(blob.has_host_range());
    }

    struct Mapping(u64);

    impl UserMapping for Mapping {
        fn user_address(&self) -> u64 {
            self.0
        }
    }

    fn host_blob() -> Resource {
        let blob = Resource::new(
            3,
            ResourceKind::Blob { mappable: true },
            Backing::None,
            ResourceState::Idle,
        );
        blob.set_host_range(0x1_0000_0000, 0x1000);
        blob
    }

    #[test]
    fn share_is_created_once() {
        let blob = host_blob();
        assert_eq!(blob.share_with(|| Ok(Box::new(Mapping(0x10)))).unwrap(), 0x10);
        assert_eq!(
            blob.share_with(|| panic!("share created twice")).unwrap(),
            0x10
        );
        assert_eq!(blob.user_address(), Some(0x10));
    }

    #[test]
    fn racing_share_keeps_the_first() {
        let blob = host_blob();
        // The inner call stands in for another thread that wins while `create` runs unlocked.
        let address = blob
            .share_with(|| {
                assert_eq!(blob.share_with(|| Ok(Box::new(Mapping(0x20)))).unwrap(), 0x20);
                Ok(Box::new(Mapping(0x30)))
            })
            .unwrap();
        assert_eq!(address, 0x20);
        assert_eq!(blob.user_address(), Some(0x20));
    }

    #[test]
    fn share_of_released_resource_fails() {
        let blob = host_blob();
        let result = blob.share_with(|| {
            blob.release_memory();
            Ok(Box::new(Mapping(0x40)))
        });
        assert!(result.is_err());
        assert_eq!(blob.user_address(), None);
    }
}
