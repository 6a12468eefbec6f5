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

//! Device models of the machine substrate: the interrupt fabric (CLINT,
//! PLIC, APLIC, IMSIC) and the syscon power controller. Every model talks
//! to the machine exclusively through the MMIO-region and
//! interrupt-controller contracts.

#[macro_use]
extern crate error_chain;
#[macro_use]
extern crate log;

pub mod interrupt_controller;
pub mod legacy;

pub use interrupt_controller::{Aplic, Clint, Imsic, Plic};
pub use legacy::Syscon;

pub mod errors {
    error_chain! {
        links {
            AddressSpace(address_space::errors::Error, address_space::errors::ErrorKind);
            Cpu(cpu::errors::Error, cpu::errors::ErrorKind);
            SysBus(sysbus::errors::Error, sysbus::errors::ErrorKind);
            Util(util::errors::Error, util::errors::ErrorKind);
        }
        foreign_links {
            Io(std::io::Error);
        }
    }
}
