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

//! Manages the guest physical address space: the DRAM region and the set of
//! attached MMIO device slots, with the access-width protocol and the DMA
//! contract on top.
//!
//! # Examples
//!
//! ```rust
//! use std::sync::Arc;
//! use address_space::{AddressSpace, DeviceClass, GuestAddress, MmioDesc, RegionOps};
//!
//! // 1. create an address space with 1 MiB of DRAM at 0x8000_0000
//! let space = AddressSpace::new(0x8000_0000, 0x10_0000).unwrap();
//!
//! // 2. attach an always-zero device slot below DRAM
//! let desc = MmioDesc {
//!     addr: 0x1000_0000,
//!     size: 0x1000,
//!     min_op_size: 1,
//!     max_op_size: 8,
//!     ops: RegionOps::default(),
//!     class: DeviceClass::named("dummy"),
//!     ..Default::default()
//! };
//! space.attach_region(desc).unwrap();
//!
//! // 3. guest accesses dispatch into DRAM or the device slot
//! space.access_write(0x8000_0000, &0x11_u64.to_le_bytes()).unwrap();
//! let mut val = [0_u8; 8];
//! space.access_read(0x1000_0000, &mut val).unwrap();
//! assert_eq!(val, [0_u8; 8]);
//! ```

#[macro_use]
extern crate error_chain;
#[macro_use]
extern crate log;

mod address;
mod address_space;
mod host_mmap;
mod region;

pub use crate::address_space::AddressSpace;
pub use address::{AddressRange, GuestAddress};
pub use host_mmap::HostMemMapping;
pub use region::{DeviceClass, MmioDesc, MmioRegion, RegionOps};

pub mod errors {
    error_chain! {
        links {
            Util(util::errors::Error, util::errors::ErrorKind);
        }
        foreign_links {
            Io(std::io::Error);
        }
        errors {
            RegionNotFound(addr: u64) {
                display("Failed to find matched region, addr 0x{:X}", addr)
            }
            RegionOpSize(addr: u64, size: u64) {
                display("Unsupported access width at 0x{:X}, size 0x{:X}", addr, size)
            }
            RegionUnaligned(addr: u64, size: u64) {
                display("Unaligned access at 0x{:X}, size 0x{:X}", addr, size)
            }
            IoAccess(base: u64, offset: u64, size: u64) {
                display("Failed to access IO-type region, region base 0x{:X}, offset 0x{:X}, size 0x{:X}", base, offset, size)
            }
            RegionOverlap(addr: u64, size: u64) {
                display("Region (0x{:X}, 0x{:X}) overlaps an attached region or DRAM", addr, size)
            }
            RegionAlign(addr: u64, align: u64) {
                display("Region address 0x{:X} not aligned to its max op size 0x{:X}", addr, align)
            }
            RegionOpRange(min: u8, max: u8) {
                display("Invalid op size range, min {} max {}", min, max)
            }
            MappingSize(mapping: u64, region: u64) {
                display("Mapping length 0x{:X} differs from region size 0x{:X}", mapping, region)
            }
            InvalidRamRange(addr: u64, size: u64) {
                display("Range (0x{:X}, 0x{:X}) lies outside guest DRAM", addr, size)
            }
            Mmap {
                display("Failed to mmap")
            }
            Overflow(addr: u64) {
                display("Address overflows, addr is 0x{:X}", addr)
            }
        }
    }
}
