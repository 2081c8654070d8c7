// Copyright 2018 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Manages the memory arena and identifier namespaces shared by vgpu contexts.

use remain::sorted;
use thiserror::Error;

pub use crate::address_range::AddressRange;
pub use crate::arena::Arena;
pub use crate::arena::ArenaAllocation;
pub use crate::id_allocator::IdAllocator;
pub use crate::id_allocator::IdPolicy;

mod address_range;
mod arena;
mod id_allocator;

#[sorted]
#[derive(Error, Debug, Eq, PartialEq)]
pub enum Error {
    #[error("Allocation cannot have size of 0")]
    AllocSizeZero,
    #[error("Allocation at offset {offset:#x} is not {size:#x} bytes")]
    BadFree { offset: u64, size: u64 },
    #[error("Cannot shrink from {old:#x} to {new:#x} bytes")]
    BadShrink { old: u64, new: u64 },
    #[error("Growing from {old:#x} to {new:#x} bytes in place is not supported")]
    GrowUnsupported { old: u64, new: u64 },
    #[error("Arena bookkeeping is inconsistent: {0}")]
    InternalInvariant(String),
    #[error("No allocation starts at {0:#x}")]
    NotAllocated(u64),
    #[error("Out of space")]
    OutOfSpace,
    #[error("base={base} + size={size} overflows")]
    PoolOverflow { base: u64, size: u64 },
}

pub type Result<T> = std::result::Result<T, Error>;
