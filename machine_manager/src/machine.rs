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

/// Lifecycle state of a machine.
///
/// `Created` and `Shutdown` machines are not powered; options may only be
/// mutated while unpowered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Created,
    Running,
    Paused,
    Shutdown,
}

impl VmState {
    pub fn powered(self) -> bool {
        matches!(self, VmState::Running | VmState::Paused)
    }
}

/// Operations a machine exposes to lifecycle drivers (syscon requests, the
/// event loop, library callers).
pub trait MachineLifecycle {
    /// Power up or resume, return false if it was already running.
    fn start(&self) -> bool;

    /// Stop the vCPUs, return false if the machine was not running.
    fn pause(&self) -> bool;

    /// Re-run the reset protocol; `keep_powered = false` also powers off.
    fn reset(&self, keep_powered: bool);

    /// Tear the machine down for good.
    fn destroy(&self) -> bool;

    /// Powered on, even when paused.
    fn powered(&self) -> bool;

    /// Powered on and not paused.
    fn running(&self) -> bool;
}

/// Identifiers of the machine options reachable through `get_opt` and
/// `set_opt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineOption {
    /// Physical jump address at reset.
    ResetPc,
    /// Guest DTB address; zero keeps the auto-generated placement.
    DtbAddr,
    /// Machine timer frequency in Hz.
    TimeFreq,
    /// Imitate traits of physical hardware.
    HwImitate,
    /// Maximum CPU load percent per guest/host CPU.
    MaxCpuCent,
    /// Decoder hint: enable the JIT.
    Jit,
    /// Decoder hint: per-hart JIT cache bytes.
    JitCache,
    /// Decoder hint: no dirty-code tracking, explicit ifence.
    JitHarvard,
    /// Read-only: DRAM base address.
    MemBase,
    /// Read-only: DRAM size.
    MemSize,
    /// Read-only: amount of harts.
    HartCount,
}

impl MachineOption {
    /// Whether the option may never be written.
    pub fn read_only(self) -> bool {
        matches!(
            self,
            MachineOption::MemBase | MachineOption::MemSize | MachineOption::HartCount
        )
    }

    /// Whether the option may be written while the machine is powered.
    pub fn writable_powered(self) -> bool {
        self == MachineOption::MaxCpuCent
    }
}
