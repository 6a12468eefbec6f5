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

//! # Machine
//!
//! The machine container: it owns the guest DRAM, the harts, the attached
//! MMIO devices, the interrupt fabric and the Device Tree, and exposes the
//! public lifecycle and configuration surface. Guest instruction decoding
//! stays external behind the `cpu::HartExecutor` contract.

#[macro_use]
extern crate error_chain;
#[macro_use]
extern crate log;

mod boot;
mod executor;
mod fdt;
mod std_machine;

pub use executor::WfiExecutor;
pub use std_machine::StdMachine;

pub mod errors {
    error_chain! {
        links {
            AddressSpace(address_space::errors::Error, address_space::errors::ErrorKind);
            Cpu(cpu::errors::Error, cpu::errors::ErrorKind);
            Devices(devices::errors::Error, devices::errors::ErrorKind);
            Manager(machine_manager::errors::Error, machine_manager::errors::ErrorKind);
            SysBus(sysbus::errors::Error, sysbus::errors::ErrorKind);
            Util(util::errors::Error, util::errors::ErrorKind);
        }
        foreign_links {
            Io(std::io::Error);
        }
        errors {
            LoadImage(path: String) {
                display("Failed to load boot image \"{}\"", path)
            }
            ImageTooLarge(path: String, size: u64, limit: u64) {
                display("Boot image \"{}\" is 0x{:X} bytes, limit 0x{:X}", path, size, limit)
            }
            MachinePowered {
                display("Operation refused while the machine is powered on")
            }
            OptReadOnly(opt: String) {
                display("Machine option {} is read-only", opt)
            }
            WrtDtbErr(addr: u64) {
                display("Failed to place the DTB at guest address 0x{:X}", addr)
            }
        }
    }
}
