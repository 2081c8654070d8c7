// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Sub-allocator for the single contiguous region of memory shared with the host.
//!
//! The arena hands out sub-ranges of a region that has both a virtual and a physical base. Used
//! sub-ranges are kept as disjoint half-open intervals sorted by offset. The offsets of the lowest
//! used byte and one past the highest used byte are cached so that the common case of growing at
//! either edge does not need to walk the interval list.

use crate::AddressRange;
use crate::Error;
use crate::Result;

/// A sub-range handed out by [`Arena::allocate`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ArenaAllocation {
    /// Offset of the allocation from the start of the arena.
    pub offset: u64,
    pub virtual_address: u64,
    pub physical_address: u64,
    pub size: u64,
}

/// Manages the used intervals of one contiguous region.
///
/// `Arena` does no locking of its own; owners share it behind a mutex.
#[derive(Debug)]
pub struct Arena {
    virtual_base: u64,
    physical_base: u64,
    size: u64,
    used: Vec<AddressRange>,
    low_edge: u64,
    high_edge: u64,
    available: u64,
}

impl Arena {
    /// Creates an empty arena of `size` bytes starting at `virtual_base` / `physical_base`.
    pub fn new(virtual_base: u64, physical_base: u64, size: u64) -> Result<Self> {
        if size == 0 {
            return Err(Error::AllocSizeZero);
        }
        for base in [virtual_base, physical_base] {
            if base.checked_add(size).is_none() {
                return Err(Error::PoolOverflow { base, size });
            }
        }
        Ok(Arena {
            virtual_base,
            physical_base,
            size,
            used: Vec::new(),
            low_edge: 0,
            high_edge: 0,
            available: size,
        })
    }

    /// Total size of the arena in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Bytes not covered by any used interval.
    pub fn available(&self) -> u64 {
        self.available
    }

    pub fn virtual_base(&self) -> u64 {
        self.virtual_base
    }

    pub fn physical_base(&self) -> u64 {
        self.physical_base
    }

    /// Offset of the lowest used byte, or 0 when the arena is empty.
    pub fn low_edge(&self) -> u64 {
        self.low_edge
    }

    /// Offset one past the highest used byte, or 0 when the arena is empty.
    pub fn high_edge(&self) -> u64 {
        self.high_edge
    }

    /// Allocates `size` bytes.
    ///
    /// The space below the low edge is tried first, then the space above the high edge, then the
    /// gaps between used intervals in address order.
    pub fn allocate(&mut self, size: u64) -> Result<ArenaAllocation> {
        if size == 0 {
            return Err(Error::AllocSizeZero);
        }
        if size > self.available {
            return Err(Error::OutOfSpace);
        }

        let range = if self.low_edge >= size {
            AddressRange::from_begin_and_end(self.low_edge - size, self.low_edge)
        } else if self.size - self.high_edge >= size {
            AddressRange::from_begin_and_end(self.high_edge, self.high_edge + size)
        } else {
            self.find_gap(size)?
        };

        self.insert(range);
        self.available -= size;
        Ok(self.allocation(range))
    }

    /// Releases the interval that starts at `virtual_address`. `size` must match the size the
    /// interval currently has.
    pub fn free(&mut self, virtual_address: u64, size: u64) -> Result<()> {
        let index = self.index_of(virtual_address)?;
        let range = self.used[index];
        if range.len() != size {
            return Err(Error::BadFree {
                offset: range.begin,
                size,
            });
        }

        self.used.remove(index);
        self.available += size;
        self.refresh_edges();
        Ok(())
    }

    /// Fails unless going from `old_size` to `new_size` bytes is a shrink `shrink` would accept.
    pub fn check_shrink(old_size: u64, new_size: u64) -> Result<()> {
        if new_size > old_size {
            return Err(Error::GrowUnsupported {
                old: old_size,
                new: new_size,
            });
        }
        if new_size == old_size || new_size == 0 {
            return Err(Error::BadShrink {
                old: old_size,
                new: new_size,
            });
        }
        Ok(())
    }

    /// Shrinks the interval at `virtual_address` from `old_size` to `new_size` bytes in place.
    ///
    /// Growing is not supported. The released tail becomes free space discoverable by later scans.
    pub fn shrink(
        &mut self,
        virtual_address: u64,
        old_size: u64,
        new_size: u64,
    ) -> Result<ArenaAllocation> {
        Arena::check_shrink(old_size, new_size)?;

        let index = self.index_of(virtual_address)?;
        let range = &mut self.used[index];
        if range.len() != old_size {
            return Err(Error::BadFree {
                offset: range.begin,
                size: old_size,
            });
        }
        range.end = range.begin + new_size;
        let range = *range;

        self.available += old_size - new_size;
        if index == self.used.len() - 1 {
            self.high_edge = range.end;
        }
        Ok(self.allocation(range))
    }

    fn find_gap(&self, size: u64) -> Result<AddressRange> {
        // Space outside the edges was already ruled out by the caller.
        let mut free = self.low_edge + (self.size - self.high_edge);
        for pair in self.used.windows(2) {
            let gap = pair[0].gap_to(pair[1]);
            if gap.len() >= size {
                return Ok(AddressRange::from_begin_and_end(gap.begin, gap.begin + size));
            }
            free += gap.len();
        }

        if free != self.available {
            let message = format!(
                "counted {:#x} free bytes but {:#x} are accounted as available",
                free, self.available
            );
            if cfg!(debug_assertions) {
                panic!("arena bookkeeping is corrupt: {}", message);
            }
            return Err(Error::InternalInvariant(message));
        }

        // Enough bytes are free in aggregate, just not contiguously.
        Err(Error::OutOfSpace)
    }

    fn index_of(&self, virtual_address: u64) -> Result<usize> {
        let offset = virtual_address
            .checked_sub(self.virtual_base)
            .filter(|offset| *offset < self.size)
            .ok_or(Error::NotAllocated(virtual_address))?;
        self.used
            .binary_search_by_key(&offset, |range| range.begin)
            .map_err(|_| Error::NotAllocated(virtual_address))
    }

    fn insert(&mut self, range: AddressRange) {
        let index = self.used.partition_point(|used| used.begin < range.begin);
        self.used.insert(index, range);
        self.refresh_edges();
    }

    fn refresh_edges(&mut self) {
        match (self.used.first(), self.used.last()) {
            (Some(first), Some(last)) => {
                self.low_edge = first.begin;
                self.high_edge = last.end;
            }
            _ => {
                self.low_edge = 0;
                self.high_edge = 0;
            }
        }
    }

    fn allocation(&self, range: AddressRange) -> ArenaAllocation {
        ArenaAllocation {
            offset: range.begin,
            virtual_address: self.virtual_base + range.begin,
            physical_address: self.physical_base + range.begin,
            size: range.len(),
        }
    }
}
