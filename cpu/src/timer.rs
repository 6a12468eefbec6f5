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

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

pub const NANOSECONDS_PER_SECOND: u128 = 1_000_000_000;

// All machine timers tick against one process-wide monotonic epoch.
static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

fn now_ns() -> i128 {
    EPOCH.elapsed().as_nanos() as i128
}

/// The shared monotonic `mtime` counter of a machine.
///
/// `mtime = (host_monotonic_ns - base_ns) * freq / 1e9`; rebasing moves
/// `base_ns` so that `mtime` equals the requested value right now. The base
/// is kept behind a mutex so a store to `mtime` is visible to every hart
/// before the rebasing write returns.
pub struct MachineTimer {
    freq: AtomicU64,
    base_ns: Mutex<i128>,
}

impl MachineTimer {
    /// Create a timer ticking at `freq` Hz, starting from zero.
    pub fn new(freq: u64) -> MachineTimer {
        MachineTimer {
            freq: AtomicU64::new(freq),
            base_ns: Mutex::new(now_ns()),
        }
    }

    pub fn freq(&self) -> u64 {
        self.freq.load(Ordering::Acquire)
    }

    /// Change the tick frequency, preserving the current counter value.
    pub fn set_freq(&self, freq: u64) {
        let current = self.get();
        self.freq.store(freq, Ordering::Release);
        self.rebase(current);
    }

    /// Current `mtime` value.
    pub fn get(&self) -> u64 {
        let base = *self.base_ns.lock().unwrap();
        let freq = self.freq.load(Ordering::Acquire) as i128;
        let ticks = (now_ns() - base) * freq / NANOSECONDS_PER_SECOND as i128;
        ticks.max(0) as u64
    }

    /// Rebase the counter so that `mtime == val` now.
    pub fn rebase(&self, val: u64) {
        let freq = self.freq.load(Ordering::Acquire) as i128;
        let mut base = self.base_ns.lock().unwrap();
        *base = now_ns() - val as i128 * NANOSECONDS_PER_SECOND as i128 / freq.max(1);
    }

    /// Host-time distance until the counter reaches `cmp`.
    /// Returns a zero duration for an already-expired compare and `None`
    /// when no deadline is armed.
    pub fn ns_until(&self, cmp: u64) -> Option<Duration> {
        if cmp == u64::max_value() {
            return None;
        }
        let now = self.get();
        if cmp <= now {
            return Some(Duration::from_nanos(0));
        }
        let freq = self.freq.load(Ordering::Acquire).max(1) as u128;
        let ns = (cmp - now) as u128 * NANOSECONDS_PER_SECOND / freq;
        Some(Duration::from_nanos(ns.min(u64::max_value() as u128) as u64))
    }
}

/// Per-hart 64-bit machine-timer compare.
///
/// The reset value keeps the timer interrupt unarmed until the guest
/// programs a deadline.
pub struct Timecmp {
    cmp: AtomicU64,
}

impl Default for Timecmp {
    fn default() -> Self {
        Timecmp {
            cmp: AtomicU64::new(u64::max_value()),
        }
    }
}

impl Timecmp {
    pub fn get(&self) -> u64 {
        self.cmp.load(Ordering::Acquire)
    }

    pub fn set(&self, val: u64) {
        self.cmp.store(val, Ordering::Release);
    }

    /// Whether a machine-timer interrupt holds for counter value `now`.
    pub fn pending(&self, now: u64) -> bool {
        now >= self.get()
    }
}
