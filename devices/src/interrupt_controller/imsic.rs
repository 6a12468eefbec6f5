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

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use address_space::{DeviceClass, GuestAddress, MmioDesc, RegionOps};
use cpu::{Hart, AIA_IRQ_LIMIT, INTERRUPT_MEXTERNAL, INTERRUPT_SEXTERNAL};
use sysbus::SysBus;

use super::errors::Result;

/// Default MMIO base of the machine-mode IMSIC pages.
pub const IMSIC_M_BASE_DEFAULT: u64 = 0x2400_0000;
/// Default MMIO base of the supervisor-mode IMSIC pages.
pub const IMSIC_S_BASE_DEFAULT: u64 = 0x2800_0000;

// One interrupt-file page per hart.
const IMSIC_PAGE_SIZE: u64 = 0x1000;
const REG_SETEIPNUM_LE: u64 = 0x0;
const REG_SETEIPNUM_BE: u64 = 0x4;

const AIA_ISA_SUFFIX: &str = "_smaia_ssaia";

/// Incoming MSI controller: one 4 KiB page per hart per privilege mode.
/// A 32-bit write to `SETEIPNUM_LE/BE` at `base + hartid * 0x1000`
/// delivers the written identity into that hart's interrupt file.
pub struct Imsic;

impl Imsic {
    /// Attach one IMSIC instance (S- or M-mode files) at `base`, enabling
    /// the per-hart AIA state and advertising the AIA ISA extensions.
    pub fn realize(sysbus: &Arc<SysBus>, base: u64, smode: bool) -> Result<()> {
        let harts: Vec<Arc<Hart>> = sysbus.harts().to_vec();
        for hart in &harts {
            hart.aia_init();
        }

        let size = harts.len() as u64 * IMSIC_PAGE_SIZE;
        let write_ops = move |data: &[u8], _base: GuestAddress, offset: u64| -> bool {
            let hartid = (offset >> 12) as usize;
            if let Some(hart) = harts.get(hartid) {
                match offset & 0xFFC {
                    REG_SETEIPNUM_LE => {
                        hart.send_aia_irq(smode, LittleEndian::read_u32(data));
                    }
                    REG_SETEIPNUM_BE => {
                        hart.send_aia_irq(smode, BigEndian::read_u32(data));
                    }
                    _ => {}
                }
            }
            true
        };

        sysbus.sys_mem().attach_region(MmioDesc {
            addr: base,
            size,
            min_op_size: 4,
            max_op_size: 4,
            ops: RegionOps {
                read: None,
                write: Some(Arc::new(write_ops)),
            },
            class: DeviceClass::named(if smode { "imsic_s" } else { "imsic_m" }),
            ..Default::default()
        })?;

        Self::append_isa_string(sysbus)?;
        Self::generate_fdt_node(sysbus, base, size, smode)?;
        Ok(())
    }

    /// Attach the M-mode and S-mode instances at their default bases.
    pub fn realize_auto(sysbus: &Arc<SysBus>) -> Result<()> {
        let size = sysbus.hart_count() as u64 * IMSIC_PAGE_SIZE;
        let m_base = sysbus.sys_mem().zone_auto(IMSIC_M_BASE_DEFAULT, size);
        let s_base = sysbus.sys_mem().zone_auto(IMSIC_S_BASE_DEFAULT, size);
        Self::realize(sysbus, m_base, false)?;
        Self::realize(sysbus, s_base, true)?;
        Ok(())
    }

    // Advertise Smaia/Ssaia in every hart's riscv,isa property, once.
    fn append_isa_string(sysbus: &Arc<SysBus>) -> Result<()> {
        let mut fdt = sysbus.fdt().lock().unwrap();
        let root = fdt.root();
        let cpus = match fdt.find_node(root, "cpus") {
            Some(cpus) => cpus,
            None => bail!("Missing /cpus node in FDT"),
        };
        for hart in sysbus.harts() {
            let cpu = match fdt.find_reg(cpus, "cpu", u64::from(hart.hart_id())) {
                Some(cpu) => cpu,
                None => continue,
            };
            let isa = match fdt.prop(cpu, "riscv,isa") {
                Some(bytes) => String::from_utf8_lossy(bytes)
                    .trim_end_matches('\0')
                    .to_string(),
                None => continue,
            };
            if !isa.contains("smaia") {
                fdt.set_prop_str(cpu, "riscv,isa", &format!("{}{}", isa, AIA_ISA_SUFFIX))?;
            }
        }
        Ok(())
    }

    fn generate_fdt_node(sysbus: &Arc<SysBus>, base: u64, size: u64, smode: bool) -> Result<()> {
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
                    irq_ext.push(fdt.get_phandle(cpu_irq));
                    irq_ext.push(if smode {
                        INTERRUPT_SEXTERNAL
                    } else {
                        INTERRUPT_MEXTERNAL
                    });
                }
                None => warn!("Missing /cpus/cpu/interrupt-controller node in FDT"),
            }
        }

        let name = if smode { "imsics_s" } else { "imsics_m" };
        let imsic = fdt.add_node(soc, &format!("{}@{:x}", name, base))?;
        fdt.set_prop_reg(imsic, "reg", base, size)?;
        fdt.set_prop_str(imsic, "compatible", "riscv,imsics")?;
        fdt.set_prop_empty(imsic, "interrupt-controller")?;
        fdt.set_prop_u32(imsic, "#interrupt-cells", 0)?;
        fdt.set_prop_empty(imsic, "msi-controller")?;
        fdt.set_prop_u32(imsic, "#msi-cells", 0)?;
        fdt.set_prop_u32(imsic, "riscv,num-ids", AIA_IRQ_LIMIT - 1)?;
        fdt.set_prop_cells(imsic, "interrupts-extended", &irq_ext)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::sysbus_with_harts;

    #[test]
    fn test_msi_delivery() {
        let sysbus = sysbus_with_harts(2);
        Imsic::realize_auto(&sysbus).unwrap();
        let hart1 = sysbus.hart(1).unwrap().clone();

        // Little-endian doorbell of hart 1, S-mode file.
        sysbus
            .sys_mem()
            .access_write(
                IMSIC_S_BASE_DEFAULT + IMSIC_PAGE_SIZE,
                &33_u32.to_le_bytes(),
            )
            .unwrap();
        assert!(hart1.aia_irq_pending(true, 33));
        assert!(!hart1.aia_irq_pending(false, 33));
        assert_ne!(hart1.interrupts_raised() & (1 << INTERRUPT_SEXTERNAL), 0);

        // Big-endian doorbell of hart 0, M-mode file.
        let hart0 = sysbus.hart(0).unwrap().clone();
        sysbus
            .sys_mem()
            .access_write(IMSIC_M_BASE_DEFAULT + REG_SETEIPNUM_BE, &7_u32.to_be_bytes())
            .unwrap();
        assert!(hart0.aia_irq_pending(false, 7));
        assert_ne!(hart0.interrupts_raised() & (1 << INTERRUPT_MEXTERNAL), 0);
    }

    #[test]
    fn test_msi_via_posted_write() {
        let sysbus = sysbus_with_harts(1);
        Imsic::realize_auto(&sysbus).unwrap();

        assert!(sysbus.send_msi(IMSIC_S_BASE_DEFAULT, 12));
        assert!(sysbus.hart(0).unwrap().aia_irq_pending(true, 12));
    }

    #[test]
    fn test_invalid_identity_ignored() {
        let sysbus = sysbus_with_harts(1);
        Imsic::realize_auto(&sysbus).unwrap();
        let hart = sysbus.hart(0).unwrap().clone();

        // Identity 0 and identities past the limit are dropped.
        sysbus
            .sys_mem()
            .access_write(IMSIC_S_BASE_DEFAULT, &0_u32.to_le_bytes())
            .unwrap();
        sysbus
            .sys_mem()
            .access_write(IMSIC_S_BASE_DEFAULT, &AIA_IRQ_LIMIT.to_le_bytes())
            .unwrap();
        assert_eq!(hart.interrupts_raised(), 0);

        // A write off the doorbell registers is accepted and dropped.
        sysbus
            .sys_mem()
            .access_write(IMSIC_S_BASE_DEFAULT + 0xffc, &5_u32.to_le_bytes())
            .unwrap();
        assert_eq!(hart.interrupts_raised(), 0);
    }

    #[test]
    fn test_reads_as_zero() {
        let sysbus = sysbus_with_harts(1);
        Imsic::realize_auto(&sysbus).unwrap();

        let mut val = [0xff_u8; 4];
        sysbus
            .sys_mem()
            .access_read(IMSIC_S_BASE_DEFAULT, &mut val)
            .unwrap();
        assert_eq!(val, [0_u8; 4]);
    }

    #[test]
    fn test_isa_string_and_fdt() {
        let sysbus = sysbus_with_harts(1);
        Imsic::realize_auto(&sysbus).unwrap();

        let fdt = sysbus.fdt().lock().unwrap();
        let root = fdt.root();
        let cpus = fdt.find_node(root, "cpus").unwrap();
        let cpu = fdt.find_reg(cpus, "cpu", 0).unwrap();
        let isa = fdt.prop(cpu, "riscv,isa").unwrap();
        let isa = String::from_utf8_lossy(isa);
        // Appended once even though both instances attach.
        assert_eq!(isa.matches("smaia").count(), 1);

        let soc = fdt.find_node(root, "soc").unwrap();
        let imsic_s = fdt.find_node_any(soc, "imsics_s").unwrap();
        assert!(fdt.prop(imsic_s, "msi-controller").is_some());
        assert!(fdt.find_node_any(soc, "imsics_m").is_some());
    }
}
