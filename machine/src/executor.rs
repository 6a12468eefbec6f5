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

use std::sync::Arc;
use std::time::Duration;

use cpu::{ExecEvent, Hart, HartExecutor};

/// The built-in stand-in for the external decoder: the hart idles in WFI
/// and never retires an instruction. Embedders replace it through
/// `StdMachine::set_hart_executor` with their interpreter or JIT.
pub struct WfiExecutor;

impl HartExecutor for WfiExecutor {
    fn step_until_event(&self, hart: &Arc<Hart>) -> ExecEvent {
        if hart.pause_requested() {
            return ExecEvent::Paused;
        }
        if hart.interrupts_raised() != 0 {
            // A real decoder would vector into the guest trap handler,
            // which eventually acknowledges the source. Idle here instead
            // of spinning on the pending bit.
            std::thread::sleep(Duration::from_millis(1));
        }
        ExecEvent::Wfi
    }
}
