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

//! Common helpers shared by every crate in the workspace: error definitions,
//! the stderr logger, numeric helpers, the Device Tree builder and the
//! event-loop plumbing.

#[macro_use]
extern crate error_chain;
#[macro_use]
extern crate log;

pub mod device_tree;
pub mod logger;
pub mod loop_context;
pub mod num_ops;

pub mod errors {
    error_chain! {
        foreign_links {
            Io(std::io::Error);
        }
        errors {
            NodeNotFound(name: String) {
                display("Failed to find FDT node \"{}\"", name)
            }
            NodeNameInvalid(name: String) {
                display("Invalid FDT node name \"{}\"", name)
            }
            PropDataTooLong(name: String, len: usize) {
                display("Property \"{}\" data length {} exceeds the FDT limit", name, len)
            }
            SetLoggerErr {
                display("Failed to install the global logger")
            }
        }
    }
}
