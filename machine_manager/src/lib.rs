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

//! Machine-independent management: configuration structs with validation,
//! the machine lifecycle interfaces, and the process-global event loop.

#[macro_use]
extern crate error_chain;
#[macro_use]
extern crate log;

pub mod config;
pub mod event_loop;
pub mod machine;

pub mod errors {
    error_chain! {
        links {
            Util(util::errors::Error, util::errors::ErrorKind);
        }
        foreign_links {
            Io(std::io::Error);
            Json(serde_json::Error);
        }
        errors {
            ConfigCheck(msg: String) {
                display("Invalid machine configuration: {}", msg)
            }
            StartEventLoopErr {
                display("Failed to spawn the event-loop thread")
            }
        }
    }
}
