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

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use address_space::{DeviceClass, GuestAddress, MmioDesc, RegionOps};
use cpu::{Hart, MachineTimer, INTERRUPT_MSOFTWARE, INTERRUPT_MTIMER};
use sysbus::SysBus;

use super::errors::Result;

/// Default MMIO base of the CLINT region.
pub const CLINT_BASE_DEFAULT: u64 = 0x200_0000;

/// Total footprint described in the Device Tree.
pub const CLINT_MMIO_SIZE: u64 = 0x10000;

const MSWI_SIZE: u64 = 0x4000;
const MTIMER_SIZE: u64 = 0x8000;
// Offset of the shared mtime counter inside the MTIMER region.
const MTIME_OFFSET: u64 = 0x7FF8;

/// Core-local interrupter.
///
/// `[base, base + 0x4000)` holds one 32-bit software-interrupt word per
/// hart; `[base + 0x4000, base + 0xC000)` holds the per-hart 64-bit
/// `mtimecmp` slots and the shared `mtime` counter at offset `0x7FF8`.
/// Accesses to slots of non-existent harts fault.
pub struct Clint;

impl Clint {
    /// Attach the CLINT at `base` and describe it in the Device Tree.
    pub fn realize(sysbus: &Arc<SysBus>, base: u64) -> Result<()> {
        let harts: Vec<Arc<Hart>> = sysbus.harts().to_vec();
        let timer = sysbus.timer().clone();

        Self::attach_mswi(sysbus, base, harts.clone())?;
        Self::attach_mtimer(sysbus, base + MSWI_SIZE, harts, timer)?;
        Self::generate_fdt_node(sysbus, base)?;
        Ok(())
    }

    /// Attach the CLINT at the default base or the nearest free zone.
    pub fn realize_auto(sysbus: &Arc<SysBus>) -> Result<()> {
        let base = sysbus
            .sys_mem()
            .zone_auto(CLINT_BASE_DEFAULT, CLINT_MMIO_SIZE);
        Self::realize(sysbus, base)
    }

    fn attach_mswi(sysbus: &Arc<SysBus>, base: u64, harts: Vec<Arc<Hart>>) -> Result<()> {
        let read_harts = harts.clone();
        let read_ops = move |data: &mut [u8], _base: GuestAddress, offset: u64| -> bool {
            let hartid = (offset >> 2) as usize;
            match read_harts.get(hartid) {
                Some(hart) => {
                    let raised = (hart.interrupts_raised() >> INTERRUPT_MSOFTWARE) & 1;
                    LittleEndian::write_u32(data, raised as u32);
                    true
                }
                None => false,
            }
        };
        let write_ops = move |data: &[u8], _base: GuestAddress, offset: u64| -> bool {
            let hartid = (offset >> 2) as usize;
            match harts.get(hartid) {
                Some(hart) => {
                    if LittleEndian::read_u32(data) & 1 != 0 {
                        hart.interrupt(INTERRUPT_MSOFTWARE);
                    } else {
                        hart.interrupt_clear(INTERRUPT_MSOFTWARE);
                    }
                    true
                }
                None => false,
            }
        };

        sysbus.sys_mem().attach_region(MmioDesc {
            addr: base,
            size: MSWI_SIZE,
            min_op_size: 4,
            max_op_size: 4,
            ops: RegionOps {
                read: Some(Arc::new(read_ops)),
                write: Some(Arc::new(write_ops)),
            },
            class: DeviceClass::named("aclint_mswi"),
            ..Default::default()
        })?;
        Ok(())
    }

    fn attach_mtimer(
        sysbus: &Arc<SysBus>,
        base: u64,
        harts: Vec<Arc<Hart>>,
        timer: Arc<MachineTimer>,
    ) -> Result<()> {
        let read_harts = harts.clone();
        let read_timer = timer.clone();
        let read_ops = move |data: &mut [u8], _base: GuestAddress, offset: u64| -> bool {
            if offset == MTIME_OFFSET {
                LittleEndian::write_u64(data, read_timer.get());
                return true;
            }
            match read_harts.get((offset >> 3) as usize) {
                Some(hart) => {
                    LittleEndian::write_u64(data, hart.timecmp().get());
                    true
                }
                None => false,
            }
        };
        let write_ops = move |data: &[u8], _base: GuestAddress, offset: u64| -> bool {
            if offset == MTIME_OFFSET {
                timer.rebase(LittleEndian::read_u64(data));
                return true;
            }
            match harts.get((offset >> 3) as usize) {
                Some(hart) => {
                    hart.timecmp().set(LittleEndian::read_u64(data));
                    // The same write asserts or clears MTIMER right away.
                    if hart.timecmp().pending(timer.get()) {
                        hart.interrupt(INTERRUPT_MTIMER);
                    } else {
                        hart.interrupt_clear(INTERRUPT_MTIMER);
                    }
                    true
                }
                None => false,
            }
        };

        sysbus.sys_mem().attach_region(MmioDesc {
            addr: base,
            size: MTIMER_SIZE,
            min_op_size: 8,
            max_op_size: 8,
            ops: RegionOps {
                read: Some(Arc::new(read_ops)),
                write: Some(Arc::new(write_ops)),
            },
            class: DeviceClass::named("aclint_mtimer"),
            ..Default::default()
        })?;
        Ok(())
    }

    fn generate_fdt_node(sysbus: &Arc<SysBus>, base: u64) -> Result<()> {
        let mut fdt = sysbus.fdt().lock().unwrap();
        let root = fdt.root();
        let cpus = match fdt.find_node(root, "cpus") {
            Some(cpus) => cpus,
            None => bail!("Missing /cpus node in FDT"),
        };
        let soc = match fdt.find_node(root, "soc") {
            Some(soc) => soc,
            None => bail!("Missing /soc node in FDT"),
        };

        let mut irq_ext: Vec<u32> = Vec::new();
        for hart in sysbus.harts() {
            let cpu_irq = fdt
                .find_reg(cpus, "cpu", u64::from(hart.hart_id()))
                .and_then(|cpu| fdt.find_node(cpu, "interrupt-controller"));
            match cpu_irq {
                Some(cpu_irq) => {
                    let phandle = fdt.get_phandle(cpu_irq);
                    irq_ext.push(phandle);
                    irq_ext.push(INTERRUPT_MSOFTWARE);
                    irq_ext.push(phandle);
                    irq_ext.push(INTERRUPT_MTIMER);
                }
                None => warn!("Missing /cpus/cpu/interrupt-controller node in FDT"),
            }
        }

        let clint = fdt.add_node(soc, &format!("clint@{:x}", base))?;
        fdt.set_prop_reg(clint, "reg", base, CLINT_MMIO_SIZE)?;
        fdt.set_prop_string_list(clint, "compatible", &["sifive,clint0", "riscv,clint0"])?;
        fdt.set_prop_cells(clint, "interrupts-extended", &irq_ext)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::sysbus_with_harts;

    const MSWI_BASE: u64 = CLINT_BASE_DEFAULT;
    const MTIMER_BASE: u64 = CLINT_BASE_DEFAULT + MSWI_SIZE;

    fn read_u64(sysbus: &Arc<SysBus>, addr: u64) -> u64 {
        let mut val = [0_u8; 8];
        sysbus.sys_mem().access_read(addr, &mut val).unwrap();
        u64::from_le_bytes(val)
    }

    #[test]
    fn test_mswi_sets_and_clears() {
        let sysbus = sysbus_with_harts(2);
        Clint::realize_auto(&sysbus).unwrap();
        let hart1 = sysbus.hart(1).unwrap().clone();

        // Hart 0 pokes hart 1's software-interrupt word.
        sysbus
            .sys_mem()
            .access_write(MSWI_BASE + 4, &1_u32.to_le_bytes())
            .unwrap();
        assert_ne!(hart1.interrupts_raised() & (1 << INTERRUPT_MSOFTWARE), 0);
        assert_eq!(
            sysbus.hart(0).unwrap().interrupts_raised() & (1 << INTERRUPT_MSOFTWARE),
            0
        );

        // Reading the word reflects the raised bit.
        let mut val = [0_u8; 4];
        sysbus
            .sys_mem()
            .access_read(MSWI_BASE + 4, &mut val)
            .unwrap();
        assert_eq!(u32::from_le_bytes(val), 1);

        // Writing zero clears.
        sysbus
            .sys_mem()
            .access_write(MSWI_BASE + 4, &0_u32.to_le_bytes())
            .unwrap();
        assert_eq!(hart1.interrupts_raised() & (1 << INTERRUPT_MSOFTWARE), 0);
    }

    #[test]
    fn test_mswi_invalid_hart_faults() {
        let sysbus = sysbus_with_harts(1);
        Clint::realize_auto(&sysbus).unwrap();

        let mut val = [0_u8; 4];
        assert!(sysbus
            .sys_mem()
            .access_read(MSWI_BASE + 4, &mut val)
            .is_err());
        assert!(sysbus
            .sys_mem()
            .access_write(MSWI_BASE + 4, &1_u32.to_le_bytes())
            .is_err());
    }

    #[test]
    fn test_mtimecmp_write_updates_pending() {
        let sysbus = sysbus_with_harts(1);
        Clint::realize_auto(&sysbus).unwrap();
        let hart = sysbus.hart(0).unwrap().clone();
        let timer = sysbus.timer();

        // A compare far in the future clears MTIMER.
        let future = timer.get() + (10 << 30);
        sysbus
            .sys_mem()
            .access_write(MTIMER_BASE, &future.to_le_bytes())
            .unwrap();
        assert_eq!(hart.interrupts_raised() & (1 << INTERRUPT_MTIMER), 0);
        assert_eq!(hart.timecmp().pending(timer.get()), false);
        assert_eq!(read_u64(&sysbus, MTIMER_BASE), future);

        // An already-expired compare asserts MTIMER on the same write.
        sysbus
            .sys_mem()
            .access_write(MTIMER_BASE, &0_u64.to_le_bytes())
            .unwrap();
        assert_ne!(hart.interrupts_raised() & (1 << INTERRUPT_MTIMER), 0);
        assert!(hart.timecmp().pending(timer.get()));

        // Re-arming in the future clears it again.
        sysbus
            .sys_mem()
            .access_write(MTIMER_BASE, &future.to_le_bytes())
            .unwrap();
        assert_eq!(hart.interrupts_raised() & (1 << INTERRUPT_MTIMER), 0);
    }

    #[test]
    fn test_mtime_read_and_rebase() {
        let sysbus = sysbus_with_harts(1);
        Clint::realize_auto(&sysbus).unwrap();

        let before = sysbus.timer().get();
        assert!(read_u64(&sysbus, MTIMER_BASE + MTIME_OFFSET) >= before);

        // Writing the mtime slot rebases the shared counter.
        sysbus
            .sys_mem()
            .access_write(MTIMER_BASE + MTIME_OFFSET, &(1_u64 << 40).to_le_bytes())
            .unwrap();
        assert!(sysbus.timer().get() >= 1 << 40);
    }

    #[test]
    fn test_mtimer_width_and_bounds() {
        let sysbus = sysbus_with_harts(1);
        Clint::realize_auto(&sysbus).unwrap();

        // Four-byte access to an eight-byte-only region faults.
        let mut word = [0_u8; 4];
        assert!(sysbus
            .sys_mem()
            .access_read(MTIMER_BASE, &mut word)
            .is_err());

        // A slot of a non-existent hart faults.
        let mut dword = [0_u8; 8];
        assert!(sysbus
            .sys_mem()
            .access_read(MTIMER_BASE + 8, &mut dword)
            .is_err());
    }

    #[test]
    fn test_clint_fdt_node() {
        let sysbus = sysbus_with_harts(2);
        Clint::realize_auto(&sysbus).unwrap();

        let fdt = sysbus.fdt().lock().unwrap();
        let soc = fdt.find_node(fdt.root(), "soc").unwrap();
        let clint = fdt.find_reg(soc, "clint", CLINT_BASE_DEFAULT).unwrap();
        // Two phandle/cause pairs per hart.
        let cells = fdt.prop(clint, "interrupts-extended").unwrap();
        assert_eq!(cells.len(), 2 * 2 * 2 * 4);
        assert!(fdt.prop(clint, "compatible").unwrap().starts_with(b"sifive,clint0\0"));
    }
}
