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

//! The system bus is the slice of a machine handed to device models while
//! they attach: the guest address space, the harts, the shared machine
//! timer, the mutable Device Tree and the wired interrupt-controller slot.
//! Devices hold an `Arc<SysBus>`, never the machine itself, so the
//! machine → region → device chain stays free of ownership cycles.

#[macro_use]
extern crate error_chain;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use address_space::AddressSpace;
use cpu::{Hart, MachineTimer};
use util::device_tree::FdtTree;

pub mod errors {
    error_chain! {
        links {
            AddressSpace(address_space::errors::Error, address_space::errors::ErrorKind);
            Cpu(cpu::errors::Error, cpu::errors::ErrorKind);
            Util(util::errors::Error, util::errors::ErrorKind);
        }
        foreign_links {
            Io(std::io::Error);
        }
        errors {
            NoIrqAvailable {
                display("The interrupt controller ran out of IRQ lines")
            }
        }
    }
}

/// A posted power-management request, consumed by the event loop after the
/// device callback that raised it has returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerRequest {
    Reset,
    Poweroff,
}

const POWER_IDLE: u32 = 0;
const POWER_RESET: u32 = 1;
const POWER_OFF: u32 = 2;

/// The machine power-request line. Devices hold it as a plain shared
/// handle, so posting from an MMIO callback never reaches back into the
/// machine that is servicing the access.
#[derive(Default)]
pub struct PowerSignal {
    request: AtomicU32,
}

impl PowerSignal {
    /// Post a power request; the stronger request wins when two race.
    pub fn post_request(&self, req: PowerRequest) {
        let raw = match req {
            PowerRequest::Reset => POWER_RESET,
            PowerRequest::Poweroff => POWER_OFF,
        };
        self.request.fetch_max(raw, Ordering::AcqRel);
    }

    /// Consume the pending power request, if any.
    pub fn take_request(&self) -> Option<PowerRequest> {
        match self.request.swap(POWER_IDLE, Ordering::AcqRel) {
            POWER_RESET => Some(PowerRequest::Reset),
            POWER_OFF => Some(PowerRequest::Poweroff),
            _ => None,
        }
    }
}

/// The abstract interrupt controller: the only cross-device extension point
/// the machine substrate keeps open. Wired controllers (PLIC, APLIC) and
/// message-signalled ones implement the same surface; callers never see the
/// concrete variant.
pub trait InterruptController: Send + Sync {
    /// Hand out a fresh interrupt line, None once the lines are exhausted.
    fn alloc_irq(&self) -> Option<u32>;

    /// Edge-triggered pulse on `irq`.
    fn send_irq(&self, irq: u32) -> bool;

    /// Assert `irq` level-triggered.
    fn raise_irq(&self, irq: u32) -> bool;

    /// Deassert `irq`.
    fn lower_irq(&self, irq: u32) -> bool;

    /// FDT phandle of the controller node, for `interrupt-parent` wiring.
    fn fdt_phandle(&self) -> u32;

    /// The `interrupts` specifier cells describing `irq` in a device node.
    fn fdt_irq_cells(&self, irq: u32) -> Vec<u32>;
}

/// System bus of one machine.
pub struct SysBus {
    sys_mem: Arc<AddressSpace>,
    harts: Vec<Arc<Hart>>,
    timer: Arc<MachineTimer>,
    fdt: Mutex<FdtTree>,
    intc: RwLock<Option<Arc<dyn InterruptController>>>,
    power: Arc<PowerSignal>,
}

impl SysBus {
    pub fn new(
        sys_mem: Arc<AddressSpace>,
        harts: Vec<Arc<Hart>>,
        timer: Arc<MachineTimer>,
        fdt: FdtTree,
    ) -> SysBus {
        SysBus {
            sys_mem,
            harts,
            timer,
            fdt: Mutex::new(fdt),
            intc: RwLock::new(None),
            power: Arc::new(PowerSignal::default()),
        }
    }

    pub fn sys_mem(&self) -> &Arc<AddressSpace> {
        &self.sys_mem
    }

    pub fn harts(&self) -> &[Arc<Hart>] {
        &self.harts
    }

    pub fn hart(&self, hart_id: usize) -> Option<&Arc<Hart>> {
        self.harts.get(hart_id)
    }

    pub fn hart_count(&self) -> usize {
        self.harts.len()
    }

    pub fn timer(&self) -> &Arc<MachineTimer> {
        &self.timer
    }

    /// The machine Device Tree, mutated by devices as they attach.
    pub fn fdt(&self) -> &Mutex<FdtTree> {
        &self.fdt
    }

    /// The wired interrupt controller of the machine, if one is attached.
    pub fn intc(&self) -> Option<Arc<dyn InterruptController>> {
        self.intc.read().unwrap().clone()
    }

    pub fn set_intc(&self, intc: Arc<dyn InterruptController>) {
        *self.intc.write().unwrap() = Some(intc);
    }

    /// Deliver an MSI by issuing a posted 32-bit little-endian write.
    pub fn send_msi(&self, addr: u64, val: u32) -> bool {
        self.sys_mem.access_write(addr, &val.to_le_bytes()).is_ok()
    }

    /// The power-request line shared with power-management devices.
    pub fn power_signal(&self) -> &Arc<PowerSignal> {
        &self.power
    }
}
