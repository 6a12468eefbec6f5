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

//! The process-global event loop.
//!
//! One lazily-started thread services every live machine: roughly every
//! 10 ms it consumes posted power requests, invokes the `update` hook of
//! each attached MMIO region and re-raises expired machine-timer
//! interrupts. The thread exits once the last machine unregisters and is
//! respawned on the next registration.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use once_cell::sync::Lazy;

use util::loop_context::{EventLoopContext, EventLoopManager, EVENT_LOOP_TICK_MS};

use crate::errors::{ErrorKind, Result, ResultExt};

static GLOBAL_EVENT_LOOP: Lazy<EventLoop> = Lazy::new(|| EventLoop {
    ctx: Arc::new(EventLoopContext::new()),
    tick_thread: Mutex::new(None),
});

/// This struct used to manage all machines alive during the process
/// lifetime.
pub struct EventLoop {
    ctx: Arc<EventLoopContext>,
    tick_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl EventLoop {
    /// Register a machine with the event loop, starting the service thread
    /// if none is alive.
    ///
    /// # Arguments
    ///
    /// * `manager` - The machine to be serviced every tick.
    pub fn register(manager: Arc<dyn EventLoopManager>) -> Result<()> {
        let event_loop = &*GLOBAL_EVENT_LOOP;
        event_loop.ctx.register_manager(manager);

        let mut tick_thread = event_loop.tick_thread.lock().unwrap();
        let alive = tick_thread
            .as_ref()
            .map_or(false, |handle| !handle.is_finished());
        if !alive {
            if let Some(handle) = tick_thread.take() {
                // Collect the previous thread which exited on an empty list.
                let _unused = handle.join();
            }
            let ctx = event_loop.ctx.clone();
            let handle = thread::Builder::new()
                .name("eventloop".to_string())
                .spawn(move || {
                    while ctx.run_once() {
                        thread::sleep(Duration::from_millis(EVENT_LOOP_TICK_MS));
                    }
                    info!("Event loop exits: the last machine was freed");
                })
                .chain_err(|| ErrorKind::StartEventLoopErr)?;
            *tick_thread = Some(handle);
        }
        Ok(())
    }

    /// Unregister a machine. Called when the machine is freed; the service
    /// thread winds down once the list drains.
    pub fn unregister(manager: &Arc<dyn EventLoopManager>) {
        GLOBAL_EVENT_LOOP.ctx.unregister_manager(manager);
    }

    /// Block the calling thread until every registered machine reports
    /// not-running (paused or powered off).
    pub fn loop_run() {
        GLOBAL_EVENT_LOOP.ctx.wait_all_stopped();
    }
}
