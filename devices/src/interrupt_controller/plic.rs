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
use cpu::{Hart, INTERRUPT_MEXTERNAL, INTERRUPT_SEXTERNAL};
use sysbus::{InterruptController, SysBus};

use super::errors::Result;

/// Default MMIO base of the PLIC region.
pub const PLIC_BASE_DEFAULT: u64 = 0xC00_0000;

const PLIC_REGION_SIZE: u64 = 0x40_0000;

// Interrupt source ids are 1..SOURCE_MAX, id 0 means "no interrupt".
const SOURCE_MAX: u32 = 64;

const PENDING_BASE: u64 = 0x1000;
const ENABLE_BASE: u64 = 0x2000;
const ENABLE_STRIDE: u64 = 0x80;
const CONTEXT_BASE: u64 = 0x20_0000;
const CONTEXT_STRIDE: u64 = 0x1000;
const CONTEXT_CLAIM: u64 = 4;

// Each hart owns two target contexts: machine-mode then supervisor-mode.
const CONTEXTS_PER_HART: usize = 2;

struct PlicState {
    priority: [u32; SOURCE_MAX as usize],
    // Source bitmaps, one bit per interrupt id.
    pending: u64,
    level: u64,
    claimed: u64,
    enable: Vec<u64>,
    threshold: Vec<u32>,
    next_irq: u32,
}

/// Platform-level interrupt controller.
///
/// Per-source priority, per-context enable bitmap and threshold, and a
/// claim/complete register per context. Context `2*hart` targets the
/// hart's machine external interrupt, context `2*hart + 1` the supervisor
/// one.
pub struct Plic {
    harts: Vec<Arc<Hart>>,
    state: Mutex<PlicState>,
    phandle: AtomicU32,
}

impl Plic {
    fn new(harts: Vec<Arc<Hart>>) -> Plic {
        let contexts = harts.len() * CONTEXTS_PER_HART;
        Plic {
            harts,
            state: Mutex::new(PlicState {
                priority: [0; SOURCE_MAX as usize],
                pending: 0,
                level: 0,
                claimed: 0,
                enable: vec![0; contexts],
                threshold: vec![0; contexts],
                next_irq: 1,
            }),
            phandle: AtomicU32::new(0),
        }
    }

    /// Attach the PLIC at `base`, wire it as the machine interrupt
    /// controller and describe it in the Device Tree.
    pub fn realize(sysbus: &Arc<SysBus>, base: u64) -> Result<Arc<Plic>> {
        let plic = Arc::new(Plic::new(sysbus.harts().to_vec()));

        let read_plic = plic.clone();
        let read_ops = move |data: &mut [u8], _base: GuestAddress, offset: u64| -> bool {
            LittleEndian::write_u32(data, read_plic.mmio_read(offset));
            true
        };
        let write_plic = plic.clone();
        let write_ops = move |data: &[u8], _base: GuestAddress, offset: u64| -> bool {
            write_plic.mmio_write(offset, LittleEndian::read_u32(data));
            true
        };

        sysbus.sys_mem().attach_region(MmioDesc {
            addr: base,
            size: PLIC_REGION_SIZE,
            min_op_size: 4,
            max_op_size: 4,
            ops: RegionOps {
                read: Some(Arc::new(read_ops)),
                write: Some(Arc::new(write_ops)),
            },
            class: DeviceClass::named("plic"),
            ..Default::default()
        })?;

        plic.generate_fdt_node(sysbus, base)?;
        sysbus.set_intc(plic.clone());
        Ok(plic)
    }

    /// Attach the PLIC at the default base or the nearest free zone.
    pub fn realize_auto(sysbus: &Arc<SysBus>) -> Result<Arc<Plic>> {
        let base = sysbus.sys_mem().zone_auto(PLIC_BASE_DEFAULT, PLIC_REGION_SIZE);
        Self::realize(sysbus, base)
    }

    fn generate_fdt_node(&self, sysbus: &Arc<SysBus>, base: u64) -> Result<()> {
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
        for hart in &self.harts {
            let cpu_irq = fdt
                .find_reg(cpus, "cpu", u64::from(hart.hart_id()))
                .and_then(|cpu| fdt.find_node(cpu, "interrupt-controller"));
            match cpu_irq {
                Some(cpu_irq) => {
                    let phandle = fdt.get_phandle(cpu_irq);
                    irq_ext.push(phandle);
                    irq_ext.push(INTERRUPT_MEXTERNAL);
                    irq_ext.push(phandle);
                    irq_ext.push(INTERRUPT_SEXTERNAL);
                }
                None => warn!("Missing /cpus/cpu/interrupt-controller node in FDT"),
            }
        }

        let plic = fdt.add_node(soc, &format!("plic@{:x}", base))?;
        fdt.set_prop_reg(plic, "reg", base, PLIC_REGION_SIZE)?;
        fdt.set_prop_string_list(plic, "compatible", &["sifive,plic-1.0.0", "riscv,plic0"])?;
        fdt.set_prop_empty(plic, "interrupt-controller")?;
        fdt.set_prop_u32(plic, "#interrupt-cells", 1)?;
        fdt.set_prop_u32(plic, "#address-cells", 0)?;
        fdt.set_prop_u32(plic, "riscv,ndev", SOURCE_MAX - 1)?;
        fdt.set_prop_cells(plic, "interrupts-extended", &irq_ext)?;
        self.phandle.store(fdt.get_phandle(plic), Ordering::Release);
        Ok(())
    }

    // The highest-priority pending, enabled, unclaimed source above the
    // context threshold; ties resolve to the lowest id.
    fn best_candidate(state: &PlicState, ctx: usize) -> Option<u32> {
        let ready = state.pending & !state.claimed & state.enable[ctx];
        let mut best = None;
        let mut best_prio = state.threshold[ctx];
        for src in 1..SOURCE_MAX {
            if ready & (1 << src) != 0 && state.priority[src as usize] > best_prio {
                best = Some(src);
                best_prio = state.priority[src as usize];
            }
        }
        best
    }

    // Recompute the external interrupt line of every context.
    fn update_eip(&self, state: &PlicState) {
        for (hartid, hart) in self.harts.iter().enumerate() {
            let pairs = [
                (hartid * CONTEXTS_PER_HART, INTERRUPT_MEXTERNAL),
                (hartid * CONTEXTS_PER_HART + 1, INTERRUPT_SEXTERNAL),
            ];
            for (ctx, cause) in &pairs {
                if Self::best_candidate(state, *ctx).is_some() {
                    hart.interrupt(*cause);
                } else {
                    hart.interrupt_clear(*cause);
                }
            }
        }
    }

    fn claim(&self, ctx: usize) -> u32 {
        let mut state = self.state.lock().unwrap();
        match Self::best_candidate(&state, ctx) {
            Some(src) => {
                state.pending &= !(1 << src);
                state.claimed |= 1 << src;
                self.update_eip(&state);
                src
            }
            None => 0,
        }
    }

    fn complete(&self, _ctx: usize, irq: u32) {
        if irq == 0 || irq >= SOURCE_MAX {
            return;
        }
        let mut state = self.state.lock().unwrap();
        state.claimed &= !(1 << irq);
        // A still-asserted level-triggered line re-pends on completion.
        if state.level & (1 << irq) != 0 {
            state.pending |= 1 << irq;
        }
        self.update_eip(&state);
    }

    fn mmio_read(&self, offset: u64) -> u32 {
        let state = self.state.lock().unwrap();
        match offset {
            o if o < PENDING_BASE => {
                let src = (o >> 2) as u32;
                if src > 0 && src < SOURCE_MAX {
                    state.priority[src as usize]
                } else {
                    0
                }
            }
            o if o < ENABLE_BASE => match (o - PENDING_BASE) >> 2 {
                0 => state.pending as u32,
                1 => (state.pending >> 32) as u32,
                _ => 0,
            },
            o if o < CONTEXT_BASE => {
                let ctx = ((o - ENABLE_BASE) / ENABLE_STRIDE) as usize;
                let word = ((o - ENABLE_BASE) % ENABLE_STRIDE) >> 2;
                match (state.enable.get(ctx), word) {
                    (Some(bits), 0) => *bits as u32,
                    (Some(bits), 1) => (*bits >> 32) as u32,
                    _ => 0,
                }
            }
            o => {
                let ctx = ((o - CONTEXT_BASE) / CONTEXT_STRIDE) as usize;
                match (o - CONTEXT_BASE) % CONTEXT_STRIDE {
                    0 => state.threshold.get(ctx).copied().unwrap_or(0),
                    CONTEXT_CLAIM if ctx < state.threshold.len() => {
                        drop(state);
                        self.claim(ctx)
                    }
                    _ => 0,
                }
            }
        }
    }

    fn mmio_write(&self, offset: u64, val: u32) {
        let mut state = self.state.lock().unwrap();
        match offset {
            o if o < PENDING_BASE => {
                let src = (o >> 2) as u32;
                if src > 0 && src < SOURCE_MAX {
                    state.priority[src as usize] = val;
                    self.update_eip(&state);
                }
            }
            // The pending bitmap is read-only.
            o if o < ENABLE_BASE => {}
            o if o < CONTEXT_BASE => {
                let ctx = ((o - ENABLE_BASE) / ENABLE_STRIDE) as usize;
                let word = ((o - ENABLE_BASE) % ENABLE_STRIDE) >> 2;
                if let Some(bits) = state.enable.get(ctx).copied() {
                    let merged = match word {
                        0 => (bits & !0xFFFF_FFFF) | u64::from(val),
                        1 => (bits & 0xFFFF_FFFF) | (u64::from(val) << 32),
                        _ => return,
                    };
                    // Source 0 does not exist.
                    state.enable[ctx] = merged & !1;
                    self.update_eip(&state);
                }
            }
            o => {
                let ctx = ((o - CONTEXT_BASE) / CONTEXT_STRIDE) as usize;
                match (o - CONTEXT_BASE) % CONTEXT_STRIDE {
                    0 => {
                        if ctx < state.threshold.len() {
                            state.threshold[ctx] = val;
                            self.update_eip(&state);
                        }
                    }
                    CONTEXT_CLAIM => {
                        drop(state);
                        self.complete(ctx, val);
                    }
                    _ => {}
                }
            }
        }
    }
}

impl InterruptController for Plic {
    fn alloc_irq(&self) -> Option<u32> {
        let mut state = self.state.lock().unwrap();
        if state.next_irq >= SOURCE_MAX {
            return None;
        }
        let irq = state.next_irq;
        state.next_irq += 1;
        Some(irq)
    }

    fn send_irq(&self, irq: u32) -> bool {
        if irq == 0 || irq >= SOURCE_MAX {
            return false;
        }
        let mut state = self.state.lock().unwrap();
        state.pending |= 1 << irq;
        self.update_eip(&state);
        true
    }

    fn raise_irq(&self, irq: u32) -> bool {
        if irq == 0 || irq >= SOURCE_MAX {
            return false;
        }
        let mut state = self.state.lock().unwrap();
        state.level |= 1 << irq;
        state.pending |= 1 << irq;
        self.update_eip(&state);
        true
    }

    fn lower_irq(&self, irq: u32) -> bool {
        if irq == 0 || irq >= SOURCE_MAX {
            return false;
        }
        let mut state = self.state.lock().unwrap();
        state.level &= !(1 << irq);
        if state.claimed & (1 << irq) == 0 {
            state.pending &= !(1 << irq);
        }
        self.update_eip(&state);
        true
    }

    fn fdt_phandle(&self) -> u32 {
        self.phandle.load(Ordering::Acquire)
    }

    fn fdt_irq_cells(&self, irq: u32) -> Vec<u32> {
        vec![irq]
    }
}
