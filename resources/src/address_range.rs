// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::cmp;
use std::fmt;
use std::ops::Range;

use serde::Deserialize;
use serde::Serialize;

/// Represents the half-open range of offsets `[begin, end)`.
///
/// Unlike `Range<u64>`, this type is `Copy` and carries the small set of helpers the arena needs
/// to reason about gaps between used intervals.
#[derive(Copy, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AddressRange {
    pub begin: u64,
    pub end: u64,
}

impl AddressRange {
    /// Creates a new `AddressRange` from `begin` (inclusive) and `end` (exclusive) offsets.
    pub const fn from_begin_and_end(begin: u64, end: u64) -> Self {
        AddressRange { begin, end }
    }

    /// Creates a new `AddressRange` from `begin` extending `size` bytes.
    ///
    /// Returns `None` if the end of the range does not fit in a `u64`.
    pub const fn from_begin_and_size(begin: u64, size: u64) -> Option<Self> {
        match begin.checked_add(size) {
            Some(end) => Some(AddressRange { begin, end }),
            None => None,
        }
    }

    /// Returns `true` if this range contains no offsets.
    pub fn is_empty(&self) -> bool {
        self.end <= self.begin
    }

    /// Returns the number of offsets in the range.
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.begin)
    }

    /// Returns `true` if this range contains `offset`.
    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.begin && offset < self.end
    }

    /// Returns `true` if the two ranges have any offsets in common.
    pub fn overlaps(&self, other: AddressRange) -> bool {
        !self.intersect(other).is_empty()
    }

    /// Find the intersection of two ranges. The result is empty if they do not overlap.
    pub fn intersect(&self, other: AddressRange) -> AddressRange {
        AddressRange {
            begin: cmp::max(self.begin, other.begin),
            end: cmp::min(self.end, other.end),
        }
    }

    /// Returns the range between the end of `self` and the beginning of `next`.
    ///
    /// The result is empty if the ranges touch or overlap.
    pub fn gap_to(&self, next: AddressRange) -> AddressRange {
        AddressRange {
            begin: self.end,
            end: cmp::max(self.end, next.begin),
        }
    }
}

impl From<AddressRange> for Range<u64> {
    fn from(range: AddressRange) -> Self {
        range.begin..range.end
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.begin, self.end)
    }
}

impl fmt::Debug for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_begin_and_size() {
        assert_eq!(
            AddressRange::from_begin_and_size(0x1000, 0x1000),
            Some(AddressRange::from_begin_and_end(0x1000, 0x2000))
        );
        assert_eq!(AddressRange::from_begin_and_size(u64::MAX, 1), None);
        assert!(AddressRange::from_begin_and_size(0x10, 0)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn contains_is_half_open() {
        let range = AddressRange::from_begin_and_end(0x10, 0x20);
        assert!(range.contains(0x10));
        assert!(range.contains(0x1f));
        assert!(!range.contains(0x20));
        assert_eq!(range.len(), 0x10);
    }

    #[test]
    fn adjacent_ranges_do_not_overlap() {
        let a = AddressRange::from_begin_and_end(0x0, 0x1000);
        let b = AddressRange::from_begin_and_end(0x1000, 0x2000);
        assert!(!a.overlaps(b));
        assert!(a.overlaps(AddressRange::from_begin_and_end(0xfff, 0x1001)));
    }

    #[test]
    fn gap_between_ranges() {
        let a = AddressRange::from_begin_and_end(0x0, 0x1000);
        let b = AddressRange::from_begin_and_end(0x3000, 0x4000);
        assert_eq!(a.gap_to(b), AddressRange::from_begin_and_end(0x1000, 0x3000));
        assert!(b.gap_to(a).is_empty());
    }

    #[test]
    fn display() {
        let range = AddressRange::from_begin_and_end(0x1000, 0x2000);
        assert_eq!(range.to_string(), "[0x1000, 0x2000)");
    }
}
