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

use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;

use util::num_ops::round_up;

use crate::errors::{ErrorKind, Result};
use crate::{AddressRange, HostMemMapping, MmioDesc, MmioRegion};

// MMIO zones handed out by `zone_auto` are page-granular.
const ZONE_ALIGN: u64 = 0x1000;

/// The guest physical address space of one machine: a single DRAM region
/// plus pairwise-disjoint MMIO slots.
///
/// The attach-ordered region list is the authoritative state; every change
/// re-publishes a by-address sorted snapshot through an `ArcSwap` so the hot
/// dispatch path never takes a lock.
pub struct AddressSpace {
    ram_base: u64,
    ram: Arc<HostMemMapping>,
    // Regions in attachment order, guarded for attach/remove.
    regions: Mutex<Vec<Arc<MmioRegion>>>,
    // Lookup snapshot sorted by base address.
    flat_view: ArcSwap<Vec<Arc<MmioRegion>>>,
}

impl AddressSpace {
    /// Create an address space whose DRAM spans `[ram_base, ram_base +
    /// ram_size)`.
    ///
    /// # Arguments
    ///
    /// * `ram_base` - Guest physical base address of DRAM.
    /// * `ram_size` - DRAM size in bytes, non-zero.
    pub fn new(ram_base: u64, ram_size: u64) -> Result<Arc<AddressSpace>> {
        if ram_base.checked_add(ram_size).is_none() {
            return Err(ErrorKind::Overflow(ram_base).into());
        }
        let ram = Arc::new(HostMemMapping::new(ram_size)?);
        Ok(Arc::new(AddressSpace {
            ram_base,
            ram,
            regions: Mutex::new(Vec::new()),
            flat_view: ArcSwap::new(Arc::new(Vec::new())),
        }))
    }

    pub fn ram_base(&self) -> u64 {
        self.ram_base
    }

    pub fn ram_size(&self) -> u64 {
        self.ram.size()
    }

    /// First address past the end of DRAM.
    pub fn ram_end(&self) -> u64 {
        self.ram_base + self.ram.size()
    }

    fn in_ram_range(&self, addr: u64, size: u64) -> bool {
        addr >= self.ram_base
            && addr
                .checked_add(size)
                .map_or(false, |end| end <= self.ram_end())
    }

    // Re-publish the sorted lookup snapshot after a topology change.
    fn update_topology(&self, regions: &[Arc<MmioRegion>]) {
        let mut view = regions.to_vec();
        view.sort_by_key(|r| r.addr());
        self.flat_view.store(Arc::new(view));
    }

    fn check_desc(&self, desc: &MmioDesc, regions: &[Arc<MmioRegion>]) -> Result<()> {
        if desc.size == 0 {
            // Placeholder reservation, carries no address range.
            return Ok(());
        }
        let min = desc.min_op_size;
        let max = desc.max_op_size;
        if min == 0 || max > 8 || min > max || !min.is_power_of_two() || !max.is_power_of_two() {
            return Err(ErrorKind::RegionOpRange(min, max).into());
        }
        if desc.addr % u64::from(max) != 0 {
            return Err(ErrorKind::RegionAlign(desc.addr, u64::from(max)).into());
        }
        if desc.addr.checked_add(desc.size).is_none() {
            return Err(ErrorKind::Overflow(desc.addr).into());
        }
        if let Some(mapping) = &desc.mapping {
            if mapping.size() != desc.size {
                return Err(ErrorKind::MappingSize(mapping.size(), desc.size).into());
            }
        }

        let range = AddressRange::from((desc.addr, desc.size));
        let ram_range = AddressRange::from((self.ram_base, self.ram.size()));
        if range.find_intersection(ram_range).is_some() {
            return Err(ErrorKind::RegionOverlap(desc.addr, desc.size).into());
        }
        for region in regions {
            if range.find_intersection(region.range()).is_some() {
                return Err(ErrorKind::RegionOverlap(desc.addr, desc.size).into());
            }
        }
        Ok(())
    }

    /// Attach an MMIO slot described by `desc`.
    ///
    /// On success the descriptor is copied into a machine-owned slot and a
    /// stable handle is returned. On failure the descriptor is finalized
    /// (its `remove` hook runs exactly once) and no region is observable at
    /// `desc.addr`.
    pub fn attach_region(&self, desc: MmioDesc) -> Result<Arc<MmioRegion>> {
        let mut regions = self.regions.lock().unwrap();
        if let Err(e) = self.check_desc(&desc, &regions) {
            warn!(
                "Failed to attach region \"{}\" at 0x{:X}: {}",
                desc.class.name, desc.addr, e
            );
            desc.finalize();
            return Err(e);
        }
        let region = Arc::new(MmioRegion::new(desc));
        regions.push(region.clone());
        self.update_topology(&regions);
        Ok(region)
    }

    /// Detach an MMIO slot and invoke its `remove` hook.
    pub fn remove_region(&self, region: &Arc<MmioRegion>) -> Result<()> {
        let mut regions = self.regions.lock().unwrap();
        let old_len = regions.len();
        regions.retain(|r| !Arc::ptr_eq(r, region));
        if regions.len() == old_len {
            return Err(ErrorKind::RegionNotFound(region.addr()).into());
        }
        self.update_topology(&regions);
        drop(regions);
        region.invoke_remove();
        Ok(())
    }

    /// Detach every region in reverse attachment order, running the
    /// `remove` hooks. Used on machine teardown.
    pub fn remove_all_regions(&self) {
        let drained: Vec<Arc<MmioRegion>> = {
            let mut regions = self.regions.lock().unwrap();
            let drained = regions.split_off(0);
            self.update_topology(&regions);
            drained
        };
        for region in drained.iter().rev() {
            region.invoke_remove();
        }
    }

    /// Snapshot of the attached regions in attachment order.
    pub fn regions(&self) -> Vec<Arc<MmioRegion>> {
        self.regions.lock().unwrap().clone()
    }

    /// Find the unique region with nonzero size containing `addr`.
    pub fn find_region(&self, addr: u64) -> Option<Arc<MmioRegion>> {
        let view = self.flat_view.load();
        let idx = view.partition_point(|r| r.addr() <= addr);
        // Walk left over placeholders; the first sized region at or before
        // `addr` decides, regions are pairwise disjoint.
        for region in view[..idx].iter().rev() {
            if region.size() > 0 {
                if addr < region.addr() + region.size() {
                    return Some(region.clone());
                }
                return None;
            }
        }
        None
    }

    /// Get a usable zone for an MMIO region: `hint` if that range is free,
    /// else the lowest free page-aligned slot at or above it that fits.
    pub fn zone_auto(&self, hint: u64, size: u64) -> u64 {
        let mut candidate = round_up(hint, ZONE_ALIGN).unwrap_or(hint);
        let mut occupied: Vec<AddressRange> = self
            .flat_view
            .load()
            .iter()
            .filter(|r| r.size() > 0)
            .map(|r| r.range())
            .collect();
        occupied.push(AddressRange::from((self.ram_base, self.ram.size())));
        occupied.sort_by_key(|r| r.base);

        for range in &occupied {
            let wanted = AddressRange::from((candidate, size));
            if wanted.find_intersection(*range).is_some() {
                candidate = round_up(range.end_addr().raw_value(), ZONE_ALIGN)
                    .unwrap_or_else(|| range.end_addr().raw_value());
            }
        }
        candidate
    }

    fn locate(&self, addr: u64, size: u64) -> Result<(Arc<MmioRegion>, u64)> {
        let region = self
            .find_region(addr)
            .ok_or_else(|| ErrorKind::RegionNotFound(addr))?;
        if !size.is_power_of_two() || !region.op_size_valid(size) {
            return Err(ErrorKind::RegionOpSize(addr, size).into());
        }
        if addr % size != 0 {
            return Err(ErrorKind::RegionUnaligned(addr, size).into());
        }
        if addr + size > region.addr() + region.size() {
            return Err(ErrorKind::RegionNotFound(addr).into());
        }
        Ok((region.clone(), addr - region.addr()))
    }

    /// Dispatch a guest load of width `data.len()` at `addr`.
    ///
    /// # Errors
    ///
    /// Any error translates to a load access fault on the issuing hart.
    pub fn access_read(&self, addr: u64, data: &mut [u8]) -> Result<()> {
        let size = data.len() as u64;
        if self.in_ram_range(addr, size) {
            self.ram.read_slice(data, addr - self.ram_base);
            return Ok(());
        }
        let (region, offset) = self.locate(addr, size)?;
        if !region.read_access(data, offset) {
            return Err(ErrorKind::IoAccess(region.addr(), offset, size).into());
        }
        Ok(())
    }

    /// Dispatch a guest store of width `data.len()` at `addr`.
    ///
    /// # Errors
    ///
    /// Any error translates to a store access fault on the issuing hart.
    pub fn access_write(&self, addr: u64, data: &[u8]) -> Result<()> {
        let size = data.len() as u64;
        if self.in_ram_range(addr, size) {
            self.ram.write_slice(data, addr - self.ram_base);
            return Ok(());
        }
        let (region, offset) = self.locate(addr, size)?;
        if !region.write_access(data, offset) {
            return Err(ErrorKind::IoAccess(region.addr(), offset, size).into());
        }
        Ok(())
    }

    /// Bulk copy into guest DRAM with bounds checking.
    pub fn write_ram(&self, addr: u64, data: &[u8]) -> Result<()> {
        if !self.in_ram_range(addr, data.len() as u64) {
            return Err(ErrorKind::InvalidRamRange(addr, data.len() as u64).into());
        }
        self.ram.write_slice(data, addr - self.ram_base);
        Ok(())
    }

    /// Bulk copy out of guest DRAM with bounds checking.
    pub fn read_ram(&self, addr: u64, data: &mut [u8]) -> Result<()> {
        if !self.in_ram_range(addr, data.len() as u64) {
            return Err(ErrorKind::InvalidRamRange(addr, data.len() as u64).into());
        }
        self.ram.read_slice(data, addr - self.ram_base);
        Ok(())
    }

    /// Zero a DRAM range, used when images are (re)loaded on reset.
    pub fn fill_ram(&self, addr: u64, size: u64, val: u8) -> Result<()> {
        if !self.in_ram_range(addr, size) {
            return Err(ErrorKind::InvalidRamRange(addr, size).into());
        }
        let chunk = [val; 0x1000];
        let mut done = 0;
        while done < size {
            let step = std::cmp::min(size - done, chunk.len() as u64);
            self.ram
                .write_slice(&chunk[..step as usize], addr - self.ram_base + done);
            done += step;
        }
        Ok(())
    }

    /// Direct host pointer into guest DRAM for device DMA.
    /// Returns the host address iff `[addr, addr + size)` lies entirely
    /// inside DRAM; the caller must keep the machine alive while using it.
    pub fn dma_host_addr(&self, addr: u64, size: u64) -> Option<u64> {
        if self.in_ram_range(addr, size) {
            Some(self.ram.host_address() + (addr - self.ram_base))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::{DeviceClass, GuestAddress, RegionOps};

    const RAM_BASE: u64 = 0x8000_0000;
    const RAM_SIZE: u64 = 0x10_0000;

    fn new_space() -> Arc<AddressSpace> {
        AddressSpace::new(RAM_BASE, RAM_SIZE).unwrap()
    }

    fn counting_desc(addr: u64, size: u64, removals: &Arc<AtomicU32>) -> MmioDesc {
        let removals = removals.clone();
        MmioDesc {
            addr,
            size,
            min_op_size: 4,
            max_op_size: 4,
            class: DeviceClass {
                name: "counted".to_string(),
                remove: Some(Arc::new(move || {
                    removals.fetch_add(1, Ordering::SeqCst);
                })),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_attach_disjoint_regions() {
        let space = new_space();
        let removals = Arc::new(AtomicU32::new(0));

        space
            .attach_region(counting_desc(0x1000_0000, 0x1000, &removals))
            .unwrap();
        space
            .attach_region(counting_desc(0x1000_1000, 0x1000, &removals))
            .unwrap();

        // Overlapping attach fails, finalizes the descriptor exactly once
        // and leaves no region observable at the address.
        assert!(space
            .attach_region(counting_desc(0x1000_0800, 0x1000, &removals))
            .is_err());
        assert_eq!(removals.load(Ordering::SeqCst), 1);
        assert_eq!(
            space.find_region(0x1000_0800).unwrap().addr(),
            0x1000_0000
        );
        assert_eq!(space.regions().len(), 2);

        // Overlap with DRAM is rejected as well.
        assert!(space
            .attach_region(counting_desc(RAM_BASE + 0x1000, 0x1000, &removals))
            .is_err());
    }

    #[test]
    fn test_attach_rejects_bad_descriptors() {
        let space = new_space();
        let removals = Arc::new(AtomicU32::new(0));

        // Unaligned base address.
        let mut desc = counting_desc(0x1000_0002, 0x1000, &removals);
        assert!(space.attach_region(desc).is_err());

        // min above max.
        desc = counting_desc(0x1000_0000, 0x1000, &removals);
        desc.min_op_size = 8;
        desc.max_op_size = 4;
        assert!(space.attach_region(desc).is_err());

        // Non-power-of-two width.
        desc = counting_desc(0x1000_0000, 0x1000, &removals);
        desc.min_op_size = 3;
        assert!(space.attach_region(desc).is_err());

        // Mapping length must equal the region size.
        desc = counting_desc(0x1000_0000, 0x1000, &removals);
        desc.mapping = Some(Arc::new(HostMemMapping::new(0x2000).unwrap()));
        assert!(space.attach_region(desc).is_err());

        assert_eq!(removals.load(Ordering::SeqCst), 4);
        assert_eq!(space.regions().len(), 0);
    }

    #[test]
    fn test_remove_region() {
        let space = new_space();
        let removals = Arc::new(AtomicU32::new(0));
        let region = space
            .attach_region(counting_desc(0x1000_0000, 0x1000, &removals))
            .unwrap();

        space.remove_region(&region).unwrap();
        assert_eq!(removals.load(Ordering::SeqCst), 1);
        assert!(space.find_region(0x1000_0000).is_none());
        assert!(space.remove_region(&region).is_err());
    }

    #[test]
    fn test_remove_all_reverse_order() {
        let space = new_space();
        let order = Arc::new(Mutex::new(Vec::new()));
        for addr in &[0x1000_0000_u64, 0x2000_0000, 0x3000_0000] {
            let order = order.clone();
            let addr = *addr;
            space
                .attach_region(MmioDesc {
                    addr,
                    size: 0x1000,
                    min_op_size: 4,
                    max_op_size: 4,
                    class: DeviceClass {
                        name: format!("dev@{:x}", addr),
                        remove: Some(Arc::new(move || order.lock().unwrap().push(addr))),
                        ..Default::default()
                    },
                    ..Default::default()
                })
                .unwrap();
        }

        space.remove_all_regions();
        assert_eq!(
            *order.lock().unwrap(),
            vec![0x3000_0000, 0x2000_0000, 0x1000_0000]
        );
    }

    #[test]
    fn test_placeholder_region() {
        let space = new_space();
        let removals = Arc::new(AtomicU32::new(0));
        let region = space
            .attach_region(counting_desc(0x1000_0000, 0, &removals))
            .unwrap();

        // Never hit by accesses, does not block allocation.
        assert!(space.find_region(0x1000_0000).is_none());
        assert_eq!(space.zone_auto(0x1000_0000, 0x1000), 0x1000_0000);

        space.remove_region(&region).unwrap();
        assert_eq!(removals.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_zone_auto() {
        let space = new_space();
        assert_eq!(space.zone_auto(0xC00_0000, 0x40_0000), 0xC00_0000);

        space
            .attach_region(MmioDesc {
                addr: 0xC00_0000,
                size: 0x40_0000,
                min_op_size: 4,
                max_op_size: 4,
                class: DeviceClass::named("plic"),
                ..Default::default()
            })
            .unwrap();
        // The hint is taken, the next request lands right above it.
        assert_eq!(space.zone_auto(0xC00_0000, 0x1000), 0xC40_0000);
        // A request colliding with DRAM lands past the DRAM end.
        assert_eq!(
            space.zone_auto(RAM_BASE, 0x1000),
            RAM_BASE + RAM_SIZE
        );
    }

    #[test]
    fn test_ram_round_trip() {
        let space = new_space();
        let data = [0x5a_u8; 64];
        let mut res = [0_u8; 64];
        space.write_ram(RAM_BASE + RAM_SIZE - 64, &data).unwrap();
        space.read_ram(RAM_BASE + RAM_SIZE - 64, &mut res).unwrap();
        assert_eq!(data, res);

        // One byte past the end is rejected.
        assert!(space.write_ram(RAM_BASE + RAM_SIZE - 63, &data).is_err());
        assert!(space.read_ram(RAM_BASE - 1, &mut res).is_err());

        // Guest accesses reach the same bytes.
        let mut word = [0_u8; 8];
        space.access_read(RAM_BASE + RAM_SIZE - 64, &mut word).unwrap();
        assert_eq!(word, [0x5a_u8; 8]);
    }

    #[test]
    fn test_dma_host_addr() {
        let space = new_space();
        assert!(space.dma_host_addr(RAM_BASE, RAM_SIZE).is_some());
        assert!(space.dma_host_addr(RAM_BASE + RAM_SIZE - 1, 1).is_some());
        assert!(space.dma_host_addr(RAM_BASE - 1, 2).is_none());
        assert!(space.dma_host_addr(RAM_BASE + RAM_SIZE - 1, 2).is_none());
        assert!(space.dma_host_addr(0, 4).is_none());

        // DMA stores are visible through read_ram.
        let host = space.dma_host_addr(RAM_BASE + 0x100, 4).unwrap();
        // SAFETY: the range was just validated against DRAM.
        unsafe { std::ptr::write(host as *mut u32, 0xdead_beef) };
        let mut res = [0_u8; 4];
        space.read_ram(RAM_BASE + 0x100, &mut res).unwrap();
        assert_eq!(u32::from_le_bytes(res), 0xdead_beef);
    }

    #[test]
    fn test_access_faults() {
        let space = new_space();
        let hits = Arc::new(AtomicU32::new(0));
        let hits_clone = hits.clone();
        space
            .attach_region(MmioDesc {
                addr: 0x5000_0000,
                size: 0x1000,
                min_op_size: 4,
                max_op_size: 4,
                ops: RegionOps {
                    read: Some(Arc::new(
                        move |data: &mut [u8], _: GuestAddress, _: u64| {
                            hits_clone.fetch_add(1, Ordering::SeqCst);
                            for byte in data.iter_mut() {
                                *byte = 0;
                            }
                            true
                        },
                    )),
                    write: None,
                },
                class: DeviceClass::named("word-only"),
                ..Default::default()
            })
            .unwrap();

        let mut dword = [0_u8; 8];
        let mut word = [0_u8; 4];
        let mut half = [0_u8; 2];

        // Unmapped address.
        assert!(space.access_read(0x6000_0000, &mut word).is_err());
        // Width outside [min_op_size, max_op_size], callback not invoked.
        assert!(space.access_read(0x5000_0000, &mut dword).is_err());
        assert!(space.access_read(0x5000_0000, &mut half).is_err());
        // Unaligned offset, callback not invoked.
        assert!(space.access_read(0x5000_0002, &mut word).is_err());
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        // A valid access goes through.
        assert!(space.access_read(0x5000_0ffc, &mut word).is_ok());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
