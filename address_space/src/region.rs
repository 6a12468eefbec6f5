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

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::{AddressRange, GuestAddress, HostMemMapping};

/// MMIO read/write handlers of a device slot; a missing handler means
/// reads-as-zero / writes-ignored (unless a direct mapping backs the slot).
#[derive(Clone, Default)]
pub struct RegionOps {
    /// Read data from the device into `data`; the access width is
    /// `data.len()`, return false to refuse (the guest takes an access
    /// fault).
    ///
    /// # Arguments
    ///
    /// * `data` - A u8-type array.
    /// * `base` - Base address of the region.
    /// * `offset` - Offset from base address, always aligned to the width.
    pub read: Option<Arc<dyn Fn(&mut [u8], GuestAddress, u64) -> bool + Send + Sync>>,
    /// Write `data` to the device; same protocol as `read`.
    pub write: Option<Arc<dyn Fn(&[u8], GuestAddress, u64) -> bool + Send + Sync>>,
}

/// Device-class descriptor attached to an MMIO slot: a human-readable name
/// plus optional lifecycle hooks. Stored immutably alongside the region.
#[derive(Clone, Default)]
pub struct DeviceClass {
    /// Human-readable device name, used in logs and errors.
    pub name: String,
    /// Called once when the slot is released (or when attaching failed).
    pub remove: Option<Arc<dyn Fn() + Send + Sync>>,
    /// Called periodically from the event thread.
    pub update: Option<Arc<dyn Fn() + Send + Sync>>,
    /// Called on machine reset.
    pub reset: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl DeviceClass {
    pub fn named(name: &str) -> DeviceClass {
        DeviceClass {
            name: name.to_string(),
            ..Default::default()
        }
    }
}

/// Description of an MMIO slot handed to `attach_region`. The descriptor is
/// copied into a machine-owned slot on success and finalized on failure.
#[derive(Clone, Default)]
pub struct MmioDesc {
    /// Guest physical base address, aligned to `max_op_size`.
    pub addr: u64,
    /// Region size; zero marks a placeholder reservation that is never hit
    /// by guest accesses.
    pub size: u64,
    /// Minimum access width in bytes, a power of two in 1..=8.
    pub min_op_size: u8,
    /// Maximum access width in bytes, a power of two in 1..=8.
    pub max_op_size: u8,
    /// Access handlers.
    pub ops: RegionOps,
    /// Directly-mapped host buffer; its length must equal `size`.
    pub mapping: Option<Arc<HostMemMapping>>,
    /// Device class info and lifecycle hooks.
    pub class: DeviceClass,
}

impl MmioDesc {
    /// Release whatever the descriptor owns after a failed attach, invoking
    /// the `remove` hook exactly once.
    pub fn finalize(&self) {
        if let Some(remove) = &self.class.remove {
            remove();
        }
    }
}

/// An attached MMIO slot, owned by the address space of its machine.
pub struct MmioRegion {
    addr: u64,
    size: u64,
    min_op_size: u8,
    max_op_size: u8,
    ops: RegionOps,
    mapping: Option<Arc<HostMemMapping>>,
    class: DeviceClass,
    // Set by guest stores into the direct mapping.
    dirty: AtomicBool,
    removed: AtomicBool,
}

impl MmioRegion {
    pub(crate) fn new(desc: MmioDesc) -> MmioRegion {
        MmioRegion {
            addr: desc.addr,
            size: desc.size,
            min_op_size: desc.min_op_size,
            max_op_size: desc.max_op_size,
            ops: desc.ops,
            mapping: desc.mapping,
            class: desc.class,
            dirty: AtomicBool::new(false),
            removed: AtomicBool::new(false),
        }
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn range(&self) -> AddressRange {
        AddressRange::from((self.addr, self.size))
    }

    pub fn name(&self) -> &str {
        &self.class.name
    }

    /// Whether the access width is allowed for this region.
    pub fn op_size_valid(&self, size: u64) -> bool {
        size >= u64::from(self.min_op_size) && size <= u64::from(self.max_op_size)
    }

    /// Whether a guest store dirtied the direct mapping since the last
    /// `clear_dirty` call.
    pub fn dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    pub fn mapping(&self) -> Option<&Arc<HostMemMapping>> {
        self.mapping.as_ref()
    }

    /// Dispatch a guest load. Offset and width have been validated by the
    /// address space.
    pub(crate) fn read_access(&self, data: &mut [u8], offset: u64) -> bool {
        if let Some(read) = &self.ops.read {
            read(data, GuestAddress(self.addr), offset)
        } else if let Some(mapping) = &self.mapping {
            mapping.read_slice(data, offset);
            true
        } else {
            // No handler and no mapping: reads-as-zero.
            for byte in data.iter_mut() {
                *byte = 0;
            }
            true
        }
    }

    /// Dispatch a guest store. Offset and width have been validated by the
    /// address space.
    pub(crate) fn write_access(&self, data: &[u8], offset: u64) -> bool {
        if let Some(write) = &self.ops.write {
            write(data, GuestAddress(self.addr), offset)
        } else if let Some(mapping) = &self.mapping {
            mapping.write_slice(data, offset);
            self.dirty.store(true, Ordering::Release);
            true
        } else {
            // No handler and no mapping: writes-ignored.
            true
        }
    }

    /// Invoke the `remove` hook, at most once over the region lifetime.
    pub(crate) fn invoke_remove(&self) {
        if self.removed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(remove) = &self.class.remove {
            remove();
        }
    }

    /// Invoke the periodic `update` hook if the device registered one.
    pub fn invoke_update(&self) {
        if let Some(update) = &self.class.update {
            update();
        }
    }

    /// Invoke the `reset` hook if the device registered one.
    pub fn invoke_reset(&self) {
        if let Some(reset) = &self.class.reset {
            reset();
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct TestDevice {
        reg: u64,
    }

    impl TestDevice {
        fn read(&mut self, data: &mut [u8], _base: GuestAddress, _offset: u64) -> bool {
            if data.len() != std::mem::size_of::<u64>() {
                return false;
            }
            data.copy_from_slice(&self.reg.to_le_bytes());
            true
        }

        fn write(&mut self, data: &[u8], _base: GuestAddress, _offset: u64) -> bool {
            if data.len() != std::mem::size_of::<u64>() {
                return false;
            }
            let mut bytes = [0_u8; 8];
            bytes.copy_from_slice(data);
            self.reg = u64::from_le_bytes(bytes);
            true
        }
    }

    fn test_device_ops() -> RegionOps {
        let dev = Arc::new(Mutex::new(TestDevice::default()));
        let dev_clone = dev.clone();
        let read_ops = move |data: &mut [u8], base: GuestAddress, offset: u64| -> bool {
            dev_clone.lock().unwrap().read(data, base, offset)
        };
        let write_ops = move |data: &[u8], base: GuestAddress, offset: u64| -> bool {
            dev.lock().unwrap().write(data, base, offset)
        };
        RegionOps {
            read: Some(Arc::new(read_ops)),
            write: Some(Arc::new(write_ops)),
        }
    }

    #[test]
    fn test_handler_region() {
        let region = MmioRegion::new(MmioDesc {
            addr: 0x5000_0000,
            size: 0x1000,
            min_op_size: 8,
            max_op_size: 8,
            ops: test_device_ops(),
            class: DeviceClass::named("test"),
            ..Default::default()
        });

        let data = 0x1122_3344_5566_7788_u64.to_le_bytes();
        let mut res = [0_u8; 8];
        assert!(region.write_access(&data, 0));
        assert!(region.read_access(&mut res, 0));
        assert_eq!(data, res);
        // The device refuses a four-byte access.
        assert!(!region.read_access(&mut res[0..4], 0));
    }

    #[test]
    fn test_mapping_only_region() {
        let mapping = Arc::new(HostMemMapping::new(0x1000).unwrap());
        let region = MmioRegion::new(MmioDesc {
            addr: 0x4000_0000,
            size: 0x1000,
            min_op_size: 1,
            max_op_size: 8,
            mapping: Some(mapping),
            class: DeviceClass::named("physmap"),
            ..Default::default()
        });

        let data = [0xa5_u8; 4];
        let mut res = [0_u8; 4];
        assert!(!region.dirty());
        assert!(region.write_access(&data, 0x100));
        assert!(region.dirty());
        assert!(region.read_access(&mut res, 0x100));
        assert_eq!(data, res);

        region.clear_dirty();
        assert!(!region.dirty());
    }

    #[test]
    fn test_empty_region_reads_zero() {
        let region = MmioRegion::new(MmioDesc {
            addr: 0x6000_0000,
            size: 0x1000,
            min_op_size: 1,
            max_op_size: 8,
            class: DeviceClass::named("dummy"),
            ..Default::default()
        });

        let mut res = [0xff_u8; 4];
        assert!(region.read_access(&mut res, 0));
        assert_eq!(res, [0_u8; 4]);
        assert!(region.write_access(&[1, 2, 3, 4], 0));
    }

    #[test]
    fn test_remove_hook_runs_once() {
        let count = Arc::new(AtomicU32::new(0));
        let count_clone = count.clone();
        let region = MmioRegion::new(MmioDesc {
            addr: 0x7000_0000,
            size: 0x1000,
            min_op_size: 4,
            max_op_size: 4,
            class: DeviceClass {
                name: "once".to_string(),
                remove: Some(Arc::new(move || {
                    count_clone.fetch_add(1, Ordering::SeqCst);
                })),
                ..Default::default()
            },
            ..Default::default()
        });

        region.invoke_remove();
        region.invoke_remove();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
