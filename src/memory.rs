// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host-visible memory: the contiguous region obtained at device start and the arena layered on
//! top of it.

use std::fmt;
use std::sync::Arc;

use anyhow::bail;
use anyhow::Context as _;
use log::error;
use resources::Arena;
use resources::ArenaAllocation;
use sync::Mutex;

use crate::error::VgpuError;
use crate::error::VgpuResult;

/// A physically contiguous region that is also mapped into the driver's address space.
///
/// The region is released when the last reference is dropped.
pub trait MemoryRegion: Send + Sync {
    fn virtual_base(&self) -> u64;
    fn physical_base(&self) -> u64;
    fn size(&self) -> u64;
    /// Copies `data` to `offset` bytes from the start of the region.
    fn write_at(&self, offset: u64, data: &[u8]) -> anyhow::Result<()>;
    /// Copies bytes starting `offset` bytes from the start of the region into `data`.
    fn read_at(&self, offset: u64, data: &mut [u8]) -> anyhow::Result<()>;
    /// Sets `len` bytes starting at `offset` to `value`.
    fn fill(&self, offset: u64, len: u64, value: u8) -> anyhow::Result<()>;
}

/// Supplies the contiguous region the arena manages.
pub trait MemoryProvider {
    fn allocate_contiguous(&self, size: u64) -> anyhow::Result<Arc<dyn MemoryRegion>>;
}

/// A `MemoryRegion` backed by process heap memory, reporting a caller chosen physical base.
pub struct HeapMemory {
    physical_base: u64,
    bytes: Mutex<Box<[u8]>>,
    virtual_base: u64,
    size: u64,
}

impl HeapMemory {
    pub fn new(physical_base: u64, size: u64) -> anyhow::Result<Self> {
        let len = usize::try_from(size).context("region does not fit in the address space")?;
        let bytes = vec![0u8; len].into_boxed_slice();
        let virtual_base = bytes.as_ptr() as u64;
        Ok(HeapMemory {
            physical_base,
            bytes: Mutex::new(bytes),
            virtual_base,
            size,
        })
    }

    fn span(&self, offset: u64, len: u64) -> anyhow::Result<std::ops::Range<usize>> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(offset as usize..end as usize),
            _ => bail!(
                "access of {:#x} bytes at {:#x} exceeds region of {:#x} bytes",
                len,
                offset,
                self.size
            ),
        }
    }
}

impl MemoryRegion for HeapMemory {
    fn virtual_base(&self) -> u64 {
        self.virtual_base
    }

    fn physical_base(&self) -> u64 {
        self.physical_base
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> anyhow::Result<()> {
        let span = self.span(offset, data.len() as u64)?;
        self.bytes.lock()[span].copy_from_slice(data);
        Ok(())
    }

    fn read_at(&self, offset: u64, data: &mut [u8]) -> anyhow::Result<()> {
        let span = self.span(offset, data.len() as u64)?;
        data.copy_from_slice(&self.bytes.lock()[span]);
        Ok(())
    }

    fn fill(&self, offset: u64, len: u64, value: u8) -> anyhow::Result<()> {
        let span = self.span(offset, len)?;
        self.bytes.lock()[span].fill(value);
        Ok(())
    }
}

/// Allocates `HeapMemory` regions starting at a fixed physical base.
pub struct HeapMemoryProvider {
    pub physical_base: u64,
}

impl MemoryProvider for HeapMemoryProvider {
    fn allocate_contiguous(&self, size: u64) -> anyhow::Result<Arc<dyn MemoryRegion>> {
        Ok(Arc::new(HeapMemory::new(self.physical_base, size)?))
    }
}

/// The arena together with the region it carves up. Cloning shares both.
#[derive(Clone)]
pub struct VgpuMemory {
    arena: Arc<Mutex<Arena>>,
    region: Arc<dyn MemoryRegion>,
}

impl VgpuMemory {
    pub fn new(region: Arc<dyn MemoryRegion>) -> VgpuResult<Self> {
        let arena = Arena::new(region.virtual_base(), region.physical_base(), region.size())?;
        Ok(VgpuMemory {
            arena: Arc::new(Mutex::new(arena)),
            region,
        })
    }

    /// Allocates `size` zeroed bytes.
    pub fn allocate(&self, size: u64) -> VgpuResult<MemoryBlock> {
        let allocation = self.arena.lock().allocate(size)?;
        let block = MemoryBlock {
            memory: self.clone(),
            allocation,
        };
        self.region
            .fill(allocation.offset, allocation.size, 0)
            .map_err(VgpuError::Memory)?;
        Ok(block)
    }

    pub fn size(&self) -> u64 {
        self.region.size()
    }

    pub fn available(&self) -> u64 {
        self.arena.lock().available()
    }

    /// Reads memory by guest physical address. Used by hosts that share the region in-process.
    pub fn read_physical(&self, physical_address: u64, data: &mut [u8]) -> VgpuResult<()> {
        let offset = physical_address
            .checked_sub(self.region.physical_base())
            .ok_or(VgpuError::InvalidParameter("address below the arena"))?;
        self.region
            .read_at(offset, data)
            .map_err(VgpuError::Memory)
    }
}

/// An arena allocation that is returned to the arena when dropped.
pub struct MemoryBlock {
    memory: VgpuMemory,
    allocation: ArenaAllocation,
}

impl MemoryBlock {
    pub fn virtual_address(&self) -> u64 {
        self.allocation.virtual_address
    }

    pub fn physical_address(&self) -> u64 {
        self.allocation.physical_address
    }

    pub fn size(&self) -> u64 {
        self.allocation.size
    }

    /// Copies `data` into the block at `offset`.
    pub fn write(&self, offset: u64, data: &[u8]) -> VgpuResult<()> {
        match offset.checked_add(data.len() as u64) {
            Some(end) if end <= self.size() => {}
            _ => return Err(VgpuError::InvalidParameter("write exceeds block")),
        }
        self.memory
            .region
            .write_at(self.allocation.offset + offset, data)
            .map_err(VgpuError::Memory)
    }

    pub fn read(&self, offset: u64, data: &mut [u8]) -> VgpuResult<()> {
        match offset.checked_add(data.len() as u64) {
            Some(end) if end <= self.size() => {}
            _ => return Err(VgpuError::InvalidParameter("read exceeds block")),
        }
        self.memory
            .region
            .read_at(self.allocation.offset + offset, data)
            .map_err(VgpuError::Memory)
    }

    /// Fails unless `new_size` is a valid in-place shrink of this block.
    pub fn check_shrink(&self, new_size: u64) -> VgpuResult<()> {
        Ok(Arena::check_shrink(self.size(), new_size)?)
    }

    /// Shrinks the block in place to `new_size` bytes.
    pub fn shrink(&mut self, new_size: u64) -> VgpuResult<()> {
        self.allocation = self.memory.arena.lock().shrink(
            self.allocation.virtual_address,
            self.allocation.size,
            new_size,
        )?;
        Ok(())
    }
}

impl fmt::Debug for MemoryBlock {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MemoryBlock")
            .field("allocation", &self.allocation)
            .finish()
    }
}

impl Drop for MemoryBlock {
    fn drop(&mut self) {
        if let Err(e) = self
            .memory
            .arena
            .lock()
            .free(self.allocation.virtual_address, self.allocation.size)
        {
            error!("failed to return {:?} to the arena: {}", self.allocation, e);
        }
    }
}
