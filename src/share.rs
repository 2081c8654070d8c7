// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Seam to the mechanism that exposes driver memory to a client process.

use crate::context::ContextKey;

/// Memory to expose to a client.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ShareSource {
    /// Driver virtual address, when the memory is already mapped in the driver. Host reported
    /// blob ranges only have a physical address.
    pub virtual_address: Option<u64>,
    pub physical_address: u64,
    pub size: u64,
}

/// A live alias of driver memory in a client address space. Unmapped on drop.
pub trait UserMapping: Send + Sync {
    fn user_address(&self) -> u64;
}

/// Creates user-space aliases of driver memory.
pub trait ShareMapper: Send + Sync {
    fn share(&self, owner: ContextKey, source: ShareSource)
        -> anyhow::Result<Box<dyn UserMapping>>;
}
