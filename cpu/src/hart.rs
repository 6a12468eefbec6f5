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
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use crate::errors::{ErrorKind, Result, ResultExt};
use crate::timer::{MachineTimer, Timecmp};
use crate::{Xlen, AIA_IRQ_LIMIT, INTERRUPT_MEXTERNAL, INTERRUPT_MTIMER, INTERRUPT_SEXTERNAL};

// Upper bound of one WFI park, the hart re-checks its wake conditions
// after it expires.
const WFI_SLICE_MS: u64 = 100;

/// Run-state of a hart.
///
/// `Created → Running` on machine start, `Running → Stopping → Paused` on
/// pause, `Paused → Running` on resume, any state `→ Stopped` on a fatal
/// trap, guest shutdown or teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HartLifecycle {
    Created,
    Running,
    Stopping,
    Paused,
    Stopped,
}

/// What made the executor yield back to the hart thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecEvent {
    /// A pending and enabled interrupt was observed and taken.
    Interrupted,
    /// WFI executed with no pending interrupt, the hart should park.
    Wfi,
    /// The hart was asked to pause and reached an instruction boundary.
    Paused,
    /// The guest requested shutdown from inside the execution stream.
    Shutdown,
    /// An unrecoverable fault, the hart stops.
    Fault { cause: u64, tval: u64 },
}

/// Contract between a hart thread and the external instruction decoder.
///
/// `step_until_event` advances guest execution and only returns at the
/// events above. Implementations observe pause requests through
/// [`Hart::pause_requested`] at instruction boundaries.
pub trait HartExecutor: Send + Sync {
    fn step_until_event(&self, hart: &Arc<Hart>) -> ExecEvent;
}

/// Architectural state the machine substrate touches across resets.
/// The full CSR file lives in the decoder; cause and tval are kept here so
/// a fatal fault can be inspected after the hart stopped.
pub struct ArchState {
    pub regs: [u64; 32],
    pub pc: u64,
    pub cause: u64,
    pub tval: u64,
}

impl Default for ArchState {
    fn default() -> Self {
        ArchState {
            regs: [0; 32],
            pc: 0,
            cause: 0,
            tval: 0,
        }
    }
}

#[derive(Default)]
struct AiaFiles {
    m_eip: [u64; (AIA_IRQ_LIMIT / 64) as usize],
    s_eip: [u64; (AIA_IRQ_LIMIT / 64) as usize],
}

/// One hart of a machine.
///
/// Architectural state is only mutated by the hart's own executor thread
/// (or by the machine while the hart is parked); the pending-interrupt word
/// is set and cleared from any thread with release/acquire atomics.
pub struct Hart {
    hart_id: u32,
    xlen: Xlen,
    timer: Arc<MachineTimer>,
    arch: Mutex<ArchState>,
    // One bit per architectural interrupt cause.
    pending: AtomicU64,
    mtimecmp: Timecmp,
    aia: Mutex<Option<AiaFiles>>,
    state: Mutex<HartLifecycle>,
    state_cond: Condvar,
    wfi_lock: Mutex<()>,
    wfi_cond: Condvar,
    task: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Hart {
    pub fn new(hart_id: u32, xlen: Xlen, timer: Arc<MachineTimer>) -> Hart {
        Hart {
            hart_id,
            xlen,
            timer,
            arch: Mutex::new(ArchState::default()),
            pending: AtomicU64::new(0),
            mtimecmp: Timecmp::default(),
            aia: Mutex::new(None),
            state: Mutex::new(HartLifecycle::Created),
            state_cond: Condvar::new(),
            wfi_lock: Mutex::new(()),
            wfi_cond: Condvar::new(),
            task: Mutex::new(None),
        }
    }

    pub fn hart_id(&self) -> u32 {
        self.hart_id
    }

    pub fn xlen(&self) -> Xlen {
        self.xlen
    }

    pub fn timer(&self) -> &Arc<MachineTimer> {
        &self.timer
    }

    /// Architectural register state, locked by the caller.
    pub fn arch(&self) -> &Mutex<ArchState> {
        &self.arch
    }

    pub fn timecmp(&self) -> &Timecmp {
        &self.mtimecmp
    }

    /// Raise an architectural interrupt and wake the hart if it is parked
    /// in WFI.
    pub fn interrupt(&self, cause: u32) {
        self.pending.fetch_or(1 << cause, Ordering::Release);
        self.notify_wfi();
    }

    /// Clear a pending architectural interrupt.
    pub fn interrupt_clear(&self, cause: u32) {
        self.pending.fetch_and(!(1 << cause), Ordering::Release);
    }

    /// Snapshot of the pending-interrupt word.
    pub fn interrupts_raised(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }

    /// Raise MTIMER if the compare has come due. Clearing is only ever done
    /// by an mtimecmp write, matching CLINT semantics.
    pub fn update_timer_interrupt(&self) {
        if self.mtimecmp.pending(self.timer.get()) {
            self.interrupt(INTERRUPT_MTIMER);
        }
    }

    /// Enable the per-hart AIA interrupt files (done once when an IMSIC is
    /// attached, before the machine starts).
    pub fn aia_init(&self) {
        let mut aia = self.aia.lock().unwrap();
        if aia.is_none() {
            *aia = Some(AiaFiles::default());
        }
    }

    pub fn aia_enabled(&self) -> bool {
        self.aia.lock().unwrap().is_some()
    }

    /// Deliver MSI identity `identity` into the S- or M-mode interrupt file
    /// and raise the matching external interrupt.
    /// Returns false for out-of-range identities or when AIA is disabled.
    pub fn send_aia_irq(&self, smode: bool, identity: u32) -> bool {
        if identity == 0 || identity >= AIA_IRQ_LIMIT {
            return false;
        }
        {
            let mut aia = self.aia.lock().unwrap();
            let files = match aia.as_mut() {
                Some(files) => files,
                None => return false,
            };
            let eip = if smode {
                &mut files.s_eip
            } else {
                &mut files.m_eip
            };
            eip[(identity / 64) as usize] |= 1 << (identity % 64);
        }
        self.interrupt(if smode {
            INTERRUPT_SEXTERNAL
        } else {
            INTERRUPT_MEXTERNAL
        });
        true
    }

    /// Whether an MSI identity is pending in the given interrupt file.
    pub fn aia_irq_pending(&self, smode: bool, identity: u32) -> bool {
        if identity >= AIA_IRQ_LIMIT {
            return false;
        }
        let aia = self.aia.lock().unwrap();
        aia.as_ref().map_or(false, |files| {
            let eip = if smode { &files.s_eip } else { &files.m_eip };
            eip[(identity / 64) as usize] & (1 << (identity % 64)) != 0
        })
    }

    /// Put the hart back into its power-on state: registers zeroed, `a0`
    /// holding the hart id, `a1` the DTB address, the pc at the reset
    /// vector, pending interrupts and timer compare disarmed.
    pub fn reset_state(&self, reset_pc: u64, dtb_addr: u64) {
        let mut arch = self.arch.lock().unwrap();
        *arch = ArchState::default();
        arch.regs[10] = u64::from(self.hart_id);
        arch.regs[11] = dtb_addr;
        arch.pc = reset_pc;
        drop(arch);

        self.pending.store(0, Ordering::Release);
        self.mtimecmp.set(u64::max_value());
        let mut aia = self.aia.lock().unwrap();
        if aia.is_some() {
            *aia = Some(AiaFiles::default());
        }
    }

    pub fn lifecycle(&self) -> HartLifecycle {
        *self.state.lock().unwrap()
    }

    /// Checked by executors at instruction boundaries.
    pub fn pause_requested(&self) -> bool {
        matches!(
            *self.state.lock().unwrap(),
            HartLifecycle::Stopping | HartLifecycle::Stopped
        )
    }

    /// Park until an interrupt arrives, a pause is requested, or the next
    /// `mtimecmp` deadline expires, whichever comes first.
    pub fn wait_for_interrupt(&self) {
        let guard = self.wfi_lock.lock().unwrap();
        if self.interrupts_raised() != 0 || self.pause_requested() {
            return;
        }
        let slice = Duration::from_millis(WFI_SLICE_MS);
        let timeout = self
            .timer
            .ns_until(self.mtimecmp.get())
            .map_or(slice, |d| d.min(slice));
        let (guard, _timed_out) = self.wfi_cond.wait_timeout(guard, timeout).unwrap();
        // Release the park lock before raising MTIMER, the wakeup path
        // takes it again.
        drop(guard);
        self.update_timer_interrupt();
    }

    fn notify_wfi(&self) {
        let _guard = self.wfi_lock.lock().unwrap();
        self.wfi_cond.notify_all();
    }

    /// Spawn the executor thread of this hart. Valid once, from `Created`.
    pub fn start(hart: Arc<Hart>, executor: Arc<dyn HartExecutor>) -> Result<()> {
        {
            let mut state = hart.state.lock().unwrap();
            if *state != HartLifecycle::Created {
                return Err(ErrorKind::VcpuState(hart.hart_id).into());
            }
            *state = HartLifecycle::Running;
        }

        let hart_id = hart.hart_id;
        let inner = hart.clone();
        let handle = thread::Builder::new()
            .name(format!("vcpu{}", hart_id))
            .spawn(move || vcpu_loop(&inner, executor.as_ref()))
            .chain_err(|| ErrorKind::StartVcpuErr(hart_id))?;
        *hart.task.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Ask the hart to leave its run loop at the next instruction boundary
    /// and wait for it to park. A hart that is not running parks trivially.
    pub fn pause(&self) {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                HartLifecycle::Running => *state = HartLifecycle::Stopping,
                HartLifecycle::Stopping => {}
                // Created, Paused and Stopped harts are already off the bus.
                _ => return,
            }
            self.state_cond.notify_all();
        }
        // Break a WFI park without holding the state lock.
        self.notify_wfi();

        let mut state = self.state.lock().unwrap();
        while !matches!(*state, HartLifecycle::Paused | HartLifecycle::Stopped) {
            state = self.state_cond.wait(state).unwrap();
        }
    }

    /// Resume a paused hart.
    pub fn resume(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match *state {
            HartLifecycle::Paused | HartLifecycle::Stopping => {
                *state = HartLifecycle::Running;
                self.state_cond.notify_all();
                Ok(())
            }
            HartLifecycle::Running => Ok(()),
            _ => Err(ErrorKind::VcpuState(self.hart_id).into()),
        }
    }

    /// Stop the hart for good and join its thread.
    pub fn destroy(&self) {
        {
            let mut state = self.state.lock().unwrap();
            *state = HartLifecycle::Stopped;
            self.state_cond.notify_all();
        }
        self.notify_wfi();
        if let Some(handle) = self.task.lock().unwrap().take() {
            if handle.join().is_err() {
                error!("vcpu{}: executor thread panicked", self.hart_id);
            }
        }
    }
}

fn vcpu_loop(hart: &Arc<Hart>, executor: &dyn HartExecutor) {
    loop {
        {
            let mut state = hart.state.lock().unwrap();
            loop {
                match *state {
                    HartLifecycle::Running => break,
                    HartLifecycle::Stopping => {
                        *state = HartLifecycle::Paused;
                        hart.state_cond.notify_all();
                    }
                    HartLifecycle::Paused | HartLifecycle::Created => {
                        state = hart.state_cond.wait(state).unwrap();
                    }
                    HartLifecycle::Stopped => return,
                }
            }
        }

        match executor.step_until_event(hart) {
            ExecEvent::Interrupted | ExecEvent::Paused => {}
            ExecEvent::Wfi => hart.wait_for_interrupt(),
            ExecEvent::Shutdown => {
                info!("vcpu{}: guest requested shutdown", hart.hart_id);
                let mut state = hart.state.lock().unwrap();
                *state = HartLifecycle::Stopped;
                hart.state_cond.notify_all();
                return;
            }
            ExecEvent::Fault { cause, tval } => {
                error!(
                    "vcpu{}: fatal fault, cause {} tval 0x{:X}",
                    hart.hart_id, cause, tval
                );
                let mut arch = hart.arch.lock().unwrap();
                arch.cause = cause;
                arch.tval = tval;
                drop(arch);
                let mut state = hart.state.lock().unwrap();
                *state = HartLifecycle::Stopped;
                hart.state_cond.notify_all();
                return;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::INTERRUPT_MSOFTWARE;

    fn new_hart() -> Arc<Hart> {
        Arc::new(Hart::new(
            0,
            Xlen::X64,
            Arc::new(MachineTimer::new(10_000_000)),
        ))
    }

    struct IdleExecutor;

    impl HartExecutor for IdleExecutor {
        fn step_until_event(&self, hart: &Arc<Hart>) -> ExecEvent {
            if hart.pause_requested() {
                return ExecEvent::Paused;
            }
            if hart.interrupts_raised() != 0 {
                return ExecEvent::Interrupted;
            }
            ExecEvent::Wfi
        }
    }

    #[test]
    fn test_interrupt_word() {
        let hart = new_hart();
        hart.interrupt(INTERRUPT_MSOFTWARE);
        hart.interrupt(INTERRUPT_MTIMER);
        assert_eq!(
            hart.interrupts_raised(),
            (1 << INTERRUPT_MSOFTWARE) | (1 << INTERRUPT_MTIMER)
        );
        hart.interrupt_clear(INTERRUPT_MSOFTWARE);
        assert_eq!(hart.interrupts_raised(), 1 << INTERRUPT_MTIMER);
    }

    #[test]
    fn test_reset_state() {
        let hart = new_hart();
        {
            let mut arch = hart.arch().lock().unwrap();
            arch.regs[5] = 0xdead;
            arch.pc = 0x1000;
        }
        hart.interrupt(INTERRUPT_MSOFTWARE);
        hart.timecmp().set(42);

        hart.reset_state(0x8000_0000, 0x8780_0000);
        let arch = hart.arch().lock().unwrap();
        assert_eq!(arch.pc, 0x8000_0000);
        assert_eq!(arch.regs[5], 0);
        assert_eq!(arch.regs[10], 0);
        assert_eq!(arch.regs[11], 0x8780_0000);
        drop(arch);
        assert_eq!(hart.interrupts_raised(), 0);
        assert_eq!(hart.timecmp().get(), u64::max_value());
    }

    #[test]
    fn test_aia_files() {
        let hart = new_hart();
        assert!(!hart.send_aia_irq(true, 5));
        hart.aia_init();
        assert!(hart.send_aia_irq(true, 5));
        assert!(hart.aia_irq_pending(true, 5));
        assert!(!hart.aia_irq_pending(false, 5));
        assert_ne!(hart.interrupts_raised() & (1 << INTERRUPT_SEXTERNAL), 0);

        // Identity 0 and out-of-range identities are rejected.
        assert!(!hart.send_aia_irq(false, 0));
        assert!(!hart.send_aia_irq(false, AIA_IRQ_LIMIT));
    }

    #[test]
    fn test_lifecycle() {
        let hart = new_hart();
        assert_eq!(hart.lifecycle(), HartLifecycle::Created);

        Hart::start(hart.clone(), Arc::new(IdleExecutor)).unwrap();
        assert!(Hart::start(hart.clone(), Arc::new(IdleExecutor)).is_err());
        assert_eq!(hart.lifecycle(), HartLifecycle::Running);

        hart.pause();
        assert_eq!(hart.lifecycle(), HartLifecycle::Paused);
        // Pausing twice parks trivially.
        hart.pause();

        hart.resume().unwrap();
        assert_eq!(hart.lifecycle(), HartLifecycle::Running);

        // An interrupt wakes the WFI park without stopping the hart.
        hart.interrupt(INTERRUPT_MSOFTWARE);

        hart.destroy();
        assert_eq!(hart.lifecycle(), HartLifecycle::Stopped);
        assert!(hart.resume().is_err());
    }

    #[test]
    fn test_wfi_wakes_on_timer() {
        let hart = new_hart();
        let now = hart.timer().get();
        // 1 ms ahead at 10 MHz.
        hart.timecmp().set(now + 10_000);
        hart.wait_for_interrupt();
        while hart.interrupts_raised() & (1 << INTERRUPT_MTIMER) == 0 {
            hart.wait_for_interrupt();
        }
        assert!(hart.timecmp().pending(hart.timer().get()));
    }
}
