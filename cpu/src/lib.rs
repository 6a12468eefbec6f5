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

//! # Hart
//!
//! A hart is one independently scheduled RISC-V execution context. This
//! crate owns everything the machine substrate needs to know about a hart:
//! the architectural register state visible across resets, the atomic
//! pending-interrupt word, the machine-timer compare, the run-state machine
//! and the per-hart executor thread.
//!
//! Instruction decoding is external: the hart thread drives a
//! [`HartExecutor`] that advances guest code until it traps, idles in WFI,
//! faults fatally, or is asked to pause.

#[macro_use]
extern crate error_chain;
#[macro_use]
extern crate log;

mod hart;
mod timer;

pub use hart::{ArchState, ExecEvent, Hart, HartExecutor, HartLifecycle};
pub use timer::{MachineTimer, Timecmp, NANOSECONDS_PER_SECOND};

pub mod errors {
    error_chain! {
        foreign_links {
            Io(std::io::Error);
        }
        errors {
            StartVcpuErr(id: u32) {
                display("Failed to spawn the thread of vcpu{}", id)
            }
            VcpuState(id: u32) {
                display("Invalid lifecycle transition requested for vcpu{}", id)
            }
        }
    }
}

/// Supervisor software interrupt cause.
pub const INTERRUPT_SSOFTWARE: u32 = 1;
/// Machine software interrupt cause.
pub const INTERRUPT_MSOFTWARE: u32 = 3;
/// Supervisor timer interrupt cause.
pub const INTERRUPT_STIMER: u32 = 5;
/// Machine timer interrupt cause.
pub const INTERRUPT_MTIMER: u32 = 7;
/// Supervisor external interrupt cause.
pub const INTERRUPT_SEXTERNAL: u32 = 9;
/// Machine external interrupt cause.
pub const INTERRUPT_MEXTERNAL: u32 = 11;

/// Exception cause of a failed load (used when an MMIO access faults).
pub const EXCEPTION_LOAD_ACCESS: u64 = 5;
/// Exception cause of a failed store or AMO.
pub const EXCEPTION_STORE_ACCESS: u64 = 7;

/// One more than the largest MSI identity an interrupt file accepts.
pub const AIA_IRQ_LIMIT: u32 = 256;

/// Register width of a hart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Xlen {
    X32,
    X64,
}
