// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-process graphics contexts and the global registry of them.

use std::collections::BTreeMap as Map;
use std::sync::Arc;

use sync::Mutex;

use crate::error::VgpuError;
use crate::error::VgpuResult;
use crate::memory::MemoryBlock;
use crate::resource::ResourceRegistry;
use crate::share::UserMapping;

/// Identifies a context: the id of the owning process. Also used as the wire context id.
pub type ContextKey = u32;

/// Options a client passes when initializing its context.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ContextParams {
    /// Capset the context renders with. 0 lets the host pick.
    pub capset_id: u32,
    /// Number of fence timelines. 0 means only the default one.
    pub num_rings: u32,
}

/// Memory allocated for a client outside of any resource.
pub struct SharedAllocation {
    // Unmapped before `block` goes back to the arena.
    mapping: Box<dyn UserMapping>,
    block: MemoryBlock,
}

impl SharedAllocation {
    pub fn new(mapping: Box<dyn UserMapping>, block: MemoryBlock) -> Self {
        SharedAllocation { mapping, block }
    }

    pub fn user_address(&self) -> u64 {
        self.mapping.user_address()
    }

    pub fn size(&self) -> u64 {
        self.block.size()
    }

    pub(crate) fn into_parts(self) -> (Box<dyn UserMapping>, MemoryBlock) {
        (self.mapping, self.block)
    }
}

/// One client's graphics session.
pub struct Context {
    key: ContextKey,
    params: ContextParams,
    resources: ResourceRegistry,
    allocations: Mutex<Map<u64, SharedAllocation>>,
}

impl Context {
    fn new(key: ContextKey, params: ContextParams) -> Self {
        Context {
            key,
            params,
            resources: ResourceRegistry::new(),
            allocations: Mutex::new(Map::new()),
        }
    }

    pub fn key(&self) -> ContextKey {
        self.key
    }

    pub fn params(&self) -> ContextParams {
        self.params
    }

    pub fn resources(&self) -> &ResourceRegistry {
        &self.resources
    }

    /// Tracks `allocation` under its user address.
    pub fn insert_allocation(&self, allocation: SharedAllocation) {
        self.allocations
            .lock()
            .insert(allocation.user_address(), allocation);
    }

    pub fn take_allocation(&self, user_address: u64) -> Option<SharedAllocation> {
        self.allocations.lock().remove(&user_address)
    }

    pub fn drain_allocations(&self) -> Vec<SharedAllocation> {
        std::mem::take(&mut *self.allocations.lock())
            .into_values()
            .collect()
    }
}

/// All live contexts, at most one per process.
#[derive(Default)]
pub struct ContextRegistry {
    contexts: Mutex<Map<ContextKey, Arc<Context>>>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    /// Creates and registers a context for `key`. Fails if the process already has one.
    pub fn create(&self, key: ContextKey, params: ContextParams) -> VgpuResult<Arc<Context>> {
        let mut contexts = self.contexts.lock();
        if contexts.contains_key(&key) {
            return Err(VgpuError::ContextExists(key));
        }
        let context = Arc::new(Context::new(key, params));
        contexts.insert(key, Arc::clone(&context));
        Ok(context)
    }

    pub fn find(&self, key: ContextKey) -> Option<Arc<Context>> {
        self.contexts.lock().get(&key).cloned()
    }

    /// Unregisters the context so no new operation can find it.
    pub fn remove(&self, key: ContextKey) -> Option<Arc<Context>> {
        self.contexts.lock().remove(&key)
    }

    pub fn drain(&self) -> Vec<Arc<Context>> {
        std::mem::take(&mut *self.contexts.lock())
            .into_values()
            .collect()
    }

    pub fn keys(&self) -> Vec<ContextKey> {
        self.contexts.lock().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.contexts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_context_per_process() {
        let registry = ContextRegistry::new();
        let context = registry.create(42, ContextParams::default()).unwrap();
        assert_eq!(context.key(), 42);
        assert!(matches!(
            registry.create(42, ContextParams::default()),
            Err(VgpuError::ContextExists(42))
        ));
        registry.create(43, ContextParams::default()).unwrap();
        assert_eq!(registry.keys(), vec![42, 43]);
    }

    #[test]
    fn remove_then_recreate() {
        let registry = ContextRegistry::new();
        registry.create(7, ContextParams::default()).unwrap();
        assert!(registry.remove(7).is_some());
        assert!(registry.find(7).is_none());
        assert!(registry.remove(7).is_none());
        registry
            .create(
                7,
                ContextParams {
                    capset_id: 4,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(registry.find(7).unwrap().params().capset_id, 4);
    }

    #[test]
    fn drain_empties_registry() {
        let registry = ContextRegistry::new();
        registry.create(1, ContextParams::default()).unwrap();
        registry.create(2, ContextParams::default()).unwrap();
        assert_eq!(registry.drain().len(), 2);
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
    }
}
