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

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use byteorder::{ByteOrder, LittleEndian};

use address_space::{DeviceClass, GuestAddress, MmioDesc, RegionOps};
use cpu::Hart;
use sysbus::{InterruptController, SysBus};

use super::errors::Result;

/// Default MMIO base of the machine-level APLIC domain.
pub const APLIC_M_BASE_DEFAULT: u64 = 0xC00_0000;
/// Default MMIO base of the supervisor-level APLIC domain.
pub const APLIC_S_BASE_DEFAULT: u64 = 0xD00_0000;

const APLIC_REGION_SIZE: u64 = 0x4000;

// Register map of one APLIC domain.
const REG_DOMAINCFG: u64 = 0x0000;
const REG_SOURCECFG_FIRST: u64 = 0x0004;
const REG_SOURCECFG_LAST: u64 = 0x0FFC;
const REG_TARGET_FIRST: u64 = 0x3004;
const REG_TARGET_LAST: u64 = 0x3FFC;

// domaincfg bits: IE is guest-writable, the rest is hardwired to MSI
// delivery mode.
const DOMAINCFG_DM: u32 = 0x4;
const DOMAINCFG_IE: u32 = 0x100;
const DOMAINCFG_RO: u32 = 0x8000_0004;

// target[n]: hart index in the top bits, MSI identity in the low ten.
const TARGET_HART_SHIFT: u32 = 18;
const TARGET_IDENTITY_MASK: u32 = 0x3FF;

// Limit on APLIC interrupt identities, maximum 1024.
const APLIC_SRC_LIMIT: u32 = 64;

struct AplicState {
    source: [u32; APLIC_SRC_LIMIT as usize],
    target: [u32; APLIC_SRC_LIMIT as usize],
}

/// One domain of the advanced platform-level interrupt controller,
/// forwarding active sources to the per-hart IMSIC files as MSIs.
///
/// Only MSI delivery mode is implemented; writes trying to select direct
/// delivery are acknowledged but the mode stays hardwired to MSI.
pub struct Aplic {
    harts: Vec<Arc<Hart>>,
    smode: bool,
    domaincfg: AtomicU32,
    state: Mutex<AplicState>,
    next_irq: AtomicU32,
    phandle: AtomicU32,
}

impl Aplic {
    fn new(harts: Vec<Arc<Hart>>, smode: bool) -> Aplic {
        Aplic {
            harts,
            smode,
            domaincfg: AtomicU32::new(0),
            state: Mutex::new(AplicState {
                source: [0; APLIC_SRC_LIMIT as usize],
                target: [0; APLIC_SRC_LIMIT as usize],
            }),
            next_irq: AtomicU32::new(1),
            phandle: AtomicU32::new(0),
        }
    }

    /// Attach one APLIC domain at `base`. The supervisor domain becomes
    /// the machine's wired interrupt controller; the machine domain
    /// delegates every source to it in the Device Tree.
    ///
    /// The matching IMSIC instance must have been attached before, its
    /// node is referenced as `msi-parent`.
    pub fn realize(sysbus: &Arc<SysBus>, base: u64, smode: bool) -> Result<Arc<Aplic>> {
        let aplic = Arc::new(Aplic::new(sysbus.harts().to_vec(), smode));

        let read_aplic = aplic.clone();
        let read_ops = move |data: &mut [u8], _base: GuestAddress, offset: u64| -> bool {
            LittleEndian::write_u32(data, read_aplic.mmio_read(offset));
            true
        };
        let write_aplic = aplic.clone();
        let write_ops = move |data: &[u8], _base: GuestAddress, offset: u64| -> bool {
            write_aplic.mmio_write(offset, LittleEndian::read_u32(data));
            true
        };

        sysbus.sys_mem().attach_region(MmioDesc {
            addr: base,
            size: APLIC_REGION_SIZE,
            min_op_size: 4,
            max_op_size: 4,
            ops: RegionOps {
                read: Some(Arc::new(read_ops)),
                write: Some(Arc::new(write_ops)),
            },
            class: DeviceClass::named(if smode { "aplic_s" } else { "aplic_m" }),
            ..Default::default()
        })?;

        aplic.generate_fdt_node(sysbus, base, smode)?;
        if smode {
            sysbus.set_intc(aplic.clone());
        }
        Ok(aplic)
    }

    /// Attach the supervisor and machine domains at their default bases.
    /// Returns the supervisor domain, which is the wired controller.
    pub fn realize_auto(sysbus: &Arc<SysBus>) -> Result<Arc<Aplic>> {
        let s_base = sysbus
            .sys_mem()
            .zone_auto(APLIC_S_BASE_DEFAULT, APLIC_REGION_SIZE);
        let m_base = sysbus
            .sys_mem()
            .zone_auto(APLIC_M_BASE_DEFAULT, APLIC_REGION_SIZE);
        let aplic_s = Self::realize(sysbus, s_base, true)?;
        Self::realize(sysbus, m_base, false)?;
        Ok(aplic_s)
    }

    fn mmio_read(&self, offset: u64) -> u32 {
        match offset {
            REG_DOMAINCFG => self.domaincfg.load(Ordering::Acquire) | DOMAINCFG_RO,
            o if (REG_SOURCECFG_FIRST..=REG_SOURCECFG_LAST).contains(&o) => {
                let reg = ((o - REG_SOURCECFG_FIRST) >> 2) + 1;
                if reg < u64::from(APLIC_SRC_LIMIT) {
                    self.state.lock().unwrap().source[reg as usize]
                } else {
                    0
                }
            }
            o if (REG_TARGET_FIRST..=REG_TARGET_LAST).contains(&o) => {
                let reg = ((o - REG_TARGET_FIRST) >> 2) + 1;
                if reg < u64::from(APLIC_SRC_LIMIT) {
                    self.state.lock().unwrap().target[reg as usize]
                } else {
                    0
                }
            }
            _ => u32::max_value(),
        }
    }

    fn mmio_write(&self, offset: u64, val: u32) {
        match offset {
            REG_DOMAINCFG => {
                if val & DOMAINCFG_DM == 0 {
                    warn!("aplic: direct delivery mode is not supported, staying in MSI mode");
                }
                self.domaincfg.store(val & DOMAINCFG_IE, Ordering::Release);
            }
            o if (REG_SOURCECFG_FIRST..=REG_SOURCECFG_LAST).contains(&o) => {
                let reg = ((o - REG_SOURCECFG_FIRST) >> 2) + 1;
                if reg < u64::from(APLIC_SRC_LIMIT) {
                    self.state.lock().unwrap().source[reg as usize] = val;
                }
            }
            o if (REG_TARGET_FIRST..=REG_TARGET_LAST).contains(&o) => {
                let reg = ((o - REG_TARGET_FIRST) >> 2) + 1;
                if reg < u64::from(APLIC_SRC_LIMIT) {
                    self.state.lock().unwrap().target[reg as usize] = val;
                }
            }
            _ => {}
        }
    }

    fn generate_fdt_node(&self, sysbus: &Arc<SysBus>, base: u64, smode: bool) -> Result<()> {
        let mut fdt = sysbus.fdt().lock().unwrap();
        let root = fdt.root();
        let soc = match fdt.find_node(root, "soc") {
            Some(soc) => soc,
            None => bail!("Missing /soc node in FDT"),
        };
        let imsic = match fdt.find_node_any(soc, if smode { "imsics_s" } else { "imsics_m" }) {
            Some(imsic) => imsic,
            None => bail!("Missing /soc/imsics node in FDT, attach the IMSIC first"),
        };
        let msi_parent = fdt.get_phandle(imsic);

        let name = if smode { "aplic_s" } else { "aplic_m" };
        let children = if smode {
            None
        } else {
            match fdt.find_node_any(soc, "aplic_s") {
                Some(aplic_s) => Some(fdt.get_phandle(aplic_s)),
                None => bail!("Missing /soc/aplic_s node in FDT, attach the S-domain first"),
            }
        };

        let node = fdt.add_node(soc, &format!("{}@{:x}", name, base))?;
        fdt.set_prop_reg(node, "reg", base, APLIC_REGION_SIZE)?;
        fdt.set_prop_str(node, "compatible", "riscv,aplic")?;
        fdt.set_prop_u32(node, "msi-parent", msi_parent)?;
        fdt.set_prop_empty(node, "interrupt-controller")?;
        fdt.set_prop_u32(node, "#interrupt-cells", 2)?;
        fdt.set_prop_u32(node, "#address-cells", 0)?;
        fdt.set_prop_u32(node, "riscv,num-sources", APLIC_SRC_LIMIT - 1)?;

        if let Some(children) = children {
            let delegate = [children, 1, APLIC_SRC_LIMIT - 1];
            fdt.set_prop_u32(node, "riscv,children", children)?;
            fdt.set_prop_cells(node, "riscv,delegate", &delegate)?;
            fdt.set_prop_cells(node, "riscv,delegation", &delegate)?;
        }

        self.phandle.store(fdt.get_phandle(node), Ordering::Release);
        Ok(())
    }
}

impl InterruptController for Aplic {
    fn alloc_irq(&self) -> Option<u32> {
        let irq = self.next_irq.fetch_add(1, Ordering::AcqRel);
        if irq < APLIC_SRC_LIMIT {
            Some(irq)
        } else {
            None
        }
    }

    fn send_irq(&self, irq: u32) -> bool {
        if irq == 0 || irq >= APLIC_SRC_LIMIT {
            return false;
        }
        let (source, target) = {
            let state = self.state.lock().unwrap();
            (state.source[irq as usize], state.target[irq as usize])
        };
        if source == 0 {
            // Inactive source.
            return false;
        }
        let hartid = (target >> TARGET_HART_SHIFT) as usize;
        if let Some(hart) = self.harts.get(hartid) {
            hart.send_aia_irq(self.smode, target & TARGET_IDENTITY_MASK);
        }
        true
    }

    // Level semantics degrade to a message per assertion; deassertion is
    // consumed by the IMSIC claim path.
    fn raise_irq(&self, irq: u32) -> bool {
        self.send_irq(irq)
    }

    fn lower_irq(&self, irq: u32) -> bool {
        irq > 0 && irq < APLIC_SRC_LIMIT
    }

    fn fdt_phandle(&self) -> u32 {
        self.phandle.load(Ordering::Acquire)
    }

    fn fdt_irq_cells(&self, irq: u32) -> Vec<u32> {
        // Level-triggered, active high.
        vec![irq, 0x4]
    }
}

#[cfg(test)]
mod test {
    use super::super::Imsic;
    use super::*;
    use crate::test_utils::sysbus_with_harts;

    const SOURCECFG_EDGE_RISE: u32 = 0x4;

    fn setup() -> (Arc<SysBus>, Arc<Aplic>) {
        let sysbus = sysbus_with_harts(2);
        Imsic::realize_auto(&sysbus).unwrap();
        let aplic = Aplic::realize_auto(&sysbus).unwrap();
        (sysbus, aplic)
    }

    #[test]
    fn test_msi_routing() {
        let (sysbus, aplic) = setup();
        let irq = aplic.alloc_irq().unwrap();

        // Configure the source active and target hart 1, identity 21.
        aplic.mmio_write(REG_SOURCECFG_FIRST + u64::from(irq - 1) * 4, SOURCECFG_EDGE_RISE);
        aplic.mmio_write(
            REG_TARGET_FIRST + u64::from(irq - 1) * 4,
            (1 << TARGET_HART_SHIFT) | 21,
        );

        assert!(aplic.send_irq(irq));
        let hart1 = sysbus.hart(1).unwrap();
        assert!(hart1.aia_irq_pending(true, 21));
        assert!(!sysbus.hart(0).unwrap().aia_irq_pending(true, 21));
    }

    #[test]
    fn test_inactive_source_dropped() {
        let (sysbus, aplic) = setup();
        let irq = aplic.alloc_irq().unwrap();

        aplic.mmio_write(REG_TARGET_FIRST + u64::from(irq - 1) * 4, 5);
        assert!(!aplic.send_irq(irq));
        assert!(!sysbus.hart(0).unwrap().aia_irq_pending(true, 5));
        assert!(!aplic.send_irq(0));
        assert!(!aplic.send_irq(APLIC_SRC_LIMIT));
    }

    #[test]
    fn test_domaincfg_hardwired_msi() {
        let (sysbus, aplic) = setup();

        assert_eq!(aplic.mmio_read(REG_DOMAINCFG), DOMAINCFG_RO);

        // Enabling interrupts sticks, clearing DM does not.
        let mut val = [0_u8; 4];
        sysbus
            .sys_mem()
            .access_write(
                APLIC_S_BASE_DEFAULT + REG_DOMAINCFG,
                &DOMAINCFG_IE.to_le_bytes(),
            )
            .unwrap();
        sysbus
            .sys_mem()
            .access_read(APLIC_S_BASE_DEFAULT + REG_DOMAINCFG, &mut val)
            .unwrap();
        let domaincfg = u32::from_le_bytes(val);
        assert_ne!(domaincfg & DOMAINCFG_IE, 0);
        assert_ne!(domaincfg & DOMAINCFG_DM, 0);
    }

    #[test]
    fn test_sourcecfg_and_target_read_back() {
        let (sysbus, _aplic) = setup();
        let base = APLIC_S_BASE_DEFAULT;

        sysbus
            .sys_mem()
            .access_write(base + REG_SOURCECFG_FIRST, &SOURCECFG_EDGE_RISE.to_le_bytes())
            .unwrap();
        let mut val = [0_u8; 4];
        sysbus
            .sys_mem()
            .access_read(base + REG_SOURCECFG_FIRST, &mut val)
            .unwrap();
        assert_eq!(u32::from_le_bytes(val), SOURCECFG_EDGE_RISE);

        // Reserved registers read all-ones.
        sysbus
            .sys_mem()
            .access_read(base + 0x2000, &mut val)
            .unwrap();
        assert_eq!(u32::from_le_bytes(val), u32::max_value());
    }

    #[test]
    fn test_fdt_domains() {
        let (sysbus, aplic) = setup();
        assert_ne!(aplic.fdt_phandle(), 0);
        assert_eq!(aplic.fdt_irq_cells(9), vec![9, 4]);

        let fdt = sysbus.fdt().lock().unwrap();
        let soc = fdt.find_node(fdt.root(), "soc").unwrap();
        let aplic_s = fdt.find_node_any(soc, "aplic_s").unwrap();
        let aplic_m = fdt.find_node_any(soc, "aplic_m").unwrap();
        assert!(fdt.prop(aplic_s, "msi-parent").is_some());
        assert!(fdt.prop(aplic_s, "riscv,delegate").is_none());
        assert!(fdt.prop(aplic_m, "riscv,delegate").is_some());
        assert!(fdt.prop(aplic_m, "riscv,children").is_some());
    }

    #[test]
    fn test_wired_intc_is_s_domain() {
        let (sysbus, aplic) = setup();
        let intc = sysbus.intc().unwrap();
        assert_eq!(intc.fdt_phandle(), aplic.fdt_phandle());
    }
}
