// Copyright (c) 2023 Huawei Technologies Co.,Ltd. All rights reserved.
//
// StratoVirt is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan
// PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//         http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY
// KIND, EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO
// NON-INFRINGEMENT, MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

/// Represent the address in given address space.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct GuestAddress(pub u64);

impl GuestAddress {
    /// Get the raw value of `GuestAddress`.
    pub fn raw_value(self) -> u64 {
        self.0
    }

    /// Get the offset of this address from the given one,
    /// panics on underflow in debug builds.
    pub fn offset_from(self, other: Self) -> u64 {
        self.raw_value() - other.raw_value()
    }

    /// Add `offset` without bounds checking.
    pub fn unchecked_add(self, offset: u64) -> Self {
        GuestAddress(self.0.wrapping_add(offset))
    }

    /// Add `offset`, return None on overflow.
    pub fn checked_add(self, offset: u64) -> Option<Self> {
        self.0.checked_add(offset).map(GuestAddress)
    }
}

/// An address range of the address space.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct AddressRange {
    /// Base address.
    pub base: GuestAddress,
    /// Size of the range.
    pub size: u64,
}

impl From<(u64, u64)> for AddressRange {
    fn from(range: (u64, u64)) -> AddressRange {
        AddressRange {
            base: GuestAddress(range.0),
            size: range.1,
        }
    }
}

impl AddressRange {
    pub fn new(base: GuestAddress, size: u64) -> AddressRange {
        AddressRange { base, size }
    }

    /// The first address past the end of the range, saturating at the top
    /// of the address space.
    pub fn end_addr(&self) -> GuestAddress {
        GuestAddress(self.base.0.saturating_add(self.size))
    }

    /// Whether `addr` falls inside the range.
    pub fn contains(&self, addr: GuestAddress) -> bool {
        addr >= self.base && addr < self.end_addr()
    }

    /// Find the intersection with `other`, return None if they do not
    /// overlap.
    pub fn find_intersection(&self, other: AddressRange) -> Option<AddressRange> {
        let start = std::cmp::max(self.base, other.base);
        let end = std::cmp::min(self.end_addr(), other.end_addr());
        if start >= end {
            return None;
        }
        Some(AddressRange {
            base: start,
            size: end.offset_from(start),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_address_ops() {
        let addr = GuestAddress(0x8000_0000);
        assert_eq!(addr.raw_value(), 0x8000_0000);
        assert_eq!(addr.unchecked_add(0x10).raw_value(), 0x8000_0010);
        assert_eq!(addr.offset_from(GuestAddress(0x8000_0000)), 0);
        assert!(GuestAddress(u64::max_value()).checked_add(1).is_none());
    }

    #[test]
    fn test_range_intersection() {
        let range = AddressRange::from((0x1000, 0x1000));
        assert!(range.contains(GuestAddress(0x1fff)));
        assert!(!range.contains(GuestAddress(0x2000)));

        let other = AddressRange::from((0x1800, 0x1000));
        let isect = range.find_intersection(other).unwrap();
        assert_eq!(isect, AddressRange::from((0x1800, 0x800)));

        assert!(range
            .find_intersection(AddressRange::from((0x2000, 0x1000)))
            .is_none());
        assert!(range
            .find_intersection(AddressRange::from((0x3000, 0)))
            .is_none());
    }
}
