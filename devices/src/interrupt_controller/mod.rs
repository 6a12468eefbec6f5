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

//! # Interrupt controllers
//!
//! The interrupt fabric of the machine. The core-local interrupter (CLINT)
//! drives per-hart software and timer interrupts; the platform-level
//! controllers (legacy PLIC, or APLIC paired with per-hart IMSIC files)
//! route wired and message-signalled device interrupts to hart external
//! interrupt lines.
//!
//! Concrete controllers stay private to this module; the rest of the
//! system only sees the `sysbus::InterruptController` trait.

mod aplic;
mod clint;
mod imsic;
mod plic;

pub use aplic::Aplic;
pub use clint::Clint;
pub use imsic::Imsic;
pub use plic::Plic;

pub mod errors {
    error_chain! {
        links {
            AddressSpace(address_space::errors::Error, address_space::errors::ErrorKind);
            Util(util::errors::Error, util::errors::ErrorKind);
        }
    }
}
