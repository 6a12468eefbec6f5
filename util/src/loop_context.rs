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

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Period of the event-loop service tick.
pub const EVENT_LOOP_TICK_MS: u64 = 10;

/// The main part to manage the event loop, usually a machine.
pub trait EventLoopManager: Send + Sync {
    /// Service the manager once: consume posted power requests, call device
    /// `update` hooks, re-arm timer interrupts. Invoked roughly every
    /// `EVENT_LOOP_TICK_MS` from the event thread.
    fn tick(&self);

    /// Whether the managed machine is powered on and not paused.
    fn running(&self) -> bool;
}

/// Holds the managers serviced by the event thread and lets user threads
/// block until all of them stop.
pub struct EventLoopContext {
    managers: Mutex<Vec<Arc<dyn EventLoopManager>>>,
    state_changed: Condvar,
}

impl Default for EventLoopContext {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoopContext {
    pub fn new() -> EventLoopContext {
        EventLoopContext {
            managers: Mutex::new(Vec::new()),
            state_changed: Condvar::new(),
        }
    }

    /// Add a manager to the service list.
    pub fn register_manager(&self, manager: Arc<dyn EventLoopManager>) {
        self.managers.lock().unwrap().push(manager);
        self.state_changed.notify_all();
    }

    /// Remove a manager from the service list. Unknown managers are ignored.
    pub fn unregister_manager(&self, manager: &Arc<dyn EventLoopManager>) {
        let mut managers = self.managers.lock().unwrap();
        let old_len = managers.len();
        managers.retain(|m| !Arc::ptr_eq(m, manager));
        if managers.len() == old_len {
            warn!("Failed to unregister manager from event loop: not found");
        }
        self.state_changed.notify_all();
    }

    pub fn is_empty(&self) -> bool {
        self.managers.lock().unwrap().is_empty()
    }

    /// Run one service pass over all managers.
    /// Returns false once the manager list has drained, signalling the
    /// event thread that it may exit.
    pub fn run_once(&self) -> bool {
        let managers = self.managers.lock().unwrap().clone();
        if managers.is_empty() {
            return false;
        }
        for manager in &managers {
            manager.tick();
        }
        self.state_changed.notify_all();
        true
    }

    /// Block the calling thread until every registered manager reports
    /// not-running. Returns immediately if the list is empty.
    pub fn wait_all_stopped(&self) {
        let mut managers = self.managers.lock().unwrap();
        while managers.iter().any(|m| m.running()) {
            let (guard, _) = self
                .state_changed
                .wait_timeout(managers, Duration::from_millis(EVENT_LOOP_TICK_MS))
                .unwrap();
            managers = guard;
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use super::*;

    struct TestManager {
        ticks: AtomicU32,
        running: AtomicBool,
    }

    impl EventLoopManager for TestManager {
        fn tick(&self) {
            if self.ticks.fetch_add(1, Ordering::SeqCst) >= 2 {
                self.running.store(false, Ordering::SeqCst);
            }
        }

        fn running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_register_tick_drain() {
        let ctx = EventLoopContext::new();
        assert!(!ctx.run_once());

        let mgr = Arc::new(TestManager {
            ticks: AtomicU32::new(0),
            running: AtomicBool::new(true),
        });
        let dyn_mgr: Arc<dyn EventLoopManager> = mgr.clone();
        ctx.register_manager(dyn_mgr.clone());

        while ctx.run_once() && mgr.running() {}
        assert!(mgr.ticks.load(Ordering::SeqCst) >= 3);

        // Managers that stopped running still get serviced until removed.
        assert!(ctx.run_once());
        ctx.unregister_manager(&dyn_mgr);
        assert!(ctx.is_empty());
        assert!(!ctx.run_once());
    }

    #[test]
    fn test_wait_all_stopped() {
        let ctx = Arc::new(EventLoopContext::new());
        let mgr = Arc::new(TestManager {
            ticks: AtomicU32::new(0),
            running: AtomicBool::new(true),
        });
        ctx.register_manager(mgr.clone());

        let ticker = ctx.clone();
        let handle = std::thread::spawn(move || {
            while ticker.run_once() {
                std::thread::sleep(Duration::from_millis(1));
            }
        });

        ctx.wait_all_stopped();
        assert!(!mgr.running());

        ctx.unregister_manager(&(mgr as Arc<dyn EventLoopManager>));
        handle.join().unwrap();
    }
}
