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

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};

use error_chain::ChainedError;

use address_space::{AddressSpace, MmioDesc, MmioRegion};
use cpu::{Hart, HartExecutor, HartLifecycle, MachineTimer, Xlen};
use machine_manager::config::{
    ConfigCheck, MachineConfig, DEFAULT_MEM_BASE, DEFAULT_RESET_PC, DEFAULT_TIME_FREQ,
    KERNEL_OFFSET,
};
use machine_manager::event_loop::EventLoop;
use machine_manager::machine::{MachineLifecycle, MachineOption, VmState};
use sysbus::{PowerRequest, SysBus};
use util::loop_context::EventLoopManager;
use util::num_ops::round_down;

use crate::boot::{load_image, BootSource};
use crate::errors::{ErrorKind, Result, ResultExt};
use crate::executor::WfiExecutor;
use crate::fdt::{create_base_tree, sync_boot_props};

// Machine options with a plain stored value.
struct MachineOpts {
    reset_pc: u64,
    dtb_addr: u64,
    hw_imitate: u64,
    max_cpu_cent: u64,
    jit: u64,
    jit_cache: u64,
    jit_harvard: u64,
}

impl Default for MachineOpts {
    fn default() -> Self {
        MachineOpts {
            reset_pc: DEFAULT_RESET_PC,
            dtb_addr: 0,
            hw_imitate: 0,
            max_cpu_cent: 100,
            jit: 1,
            jit_cache: 16 << 20,
            jit_harvard: 0,
        }
    }
}

/// A full RISC-V machine: DRAM, harts, MMIO devices, interrupt fabric and
/// the generated Device Tree.
///
/// The machine is configured while unpowered (boot images, options,
/// attached devices), finalized on the first `start` and torn down by
/// `destroy`, which releases devices in reverse attachment order before
/// joining the hart threads.
pub struct StdMachine {
    config: MachineConfig,
    mem_base: u64,
    xlen: Xlen,
    sys_mem: Arc<AddressSpace>,
    sysbus: Arc<SysBus>,
    harts: Vec<Arc<Hart>>,
    timer: Arc<MachineTimer>,
    boot: Mutex<BootSource>,
    opts: Mutex<MachineOpts>,
    // VM running state.
    vm_state: Arc<(Mutex<VmState>, Condvar)>,
    // The external decoder driving the harts.
    executor: Mutex<Arc<dyn HartExecutor>>,
    registered: AtomicBool,
    weak_self: Mutex<Weak<StdMachine>>,
}

impl StdMachine {
    /// Constructs a new `StdMachine`.
    ///
    /// # Arguments
    ///
    /// * `config` - Represents the configuration for the machine.
    pub fn new(config: &MachineConfig) -> Result<Arc<StdMachine>> {
        config
            .check()
            .chain_err(|| "Precheck of machine configuration failed")?;

        let xlen = if config.isa.starts_with("rv32") {
            Xlen::X32
        } else {
            Xlen::X64
        };
        let timer = Arc::new(MachineTimer::new(DEFAULT_TIME_FREQ));
        let sys_mem = AddressSpace::new(DEFAULT_MEM_BASE, config.mem_size)
            .chain_err(|| "Failed to create the guest address space")?;
        let harts: Vec<Arc<Hart>> = (0..config.nr_harts)
            .map(|id| Arc::new(Hart::new(u32::from(id), xlen, timer.clone())))
            .collect();
        let fdt = create_base_tree(config, xlen, DEFAULT_MEM_BASE, DEFAULT_TIME_FREQ)
            .chain_err(|| "Failed to build the base Device Tree")?;
        let sysbus = Arc::new(SysBus::new(
            sys_mem.clone(),
            harts.clone(),
            timer.clone(),
            fdt,
        ));

        let machine = Arc::new(StdMachine {
            config: config.clone(),
            mem_base: DEFAULT_MEM_BASE,
            xlen,
            sys_mem,
            sysbus,
            harts,
            timer,
            boot: Mutex::new(BootSource::default()),
            opts: Mutex::new(MachineOpts::default()),
            vm_state: Arc::new((Mutex::new(VmState::Created), Condvar::new())),
            executor: Mutex::new(Arc::new(WfiExecutor)),
            registered: AtomicBool::new(false),
            weak_self: Mutex::new(Weak::new()),
        });
        *machine.weak_self.lock().unwrap() = Arc::downgrade(&machine);
        Ok(machine)
    }

    /// The system bus handed to device models.
    pub fn sysbus(&self) -> &Arc<SysBus> {
        &self.sysbus
    }

    pub fn sys_mem(&self) -> &Arc<AddressSpace> {
        &self.sys_mem
    }

    pub fn harts(&self) -> &[Arc<Hart>] {
        &self.harts
    }

    pub fn timer(&self) -> &Arc<MachineTimer> {
        &self.timer
    }

    pub fn xlen(&self) -> Xlen {
        self.xlen
    }

    /// Replace the decoder driving the harts; only valid while unpowered.
    pub fn set_hart_executor(&self, executor: Arc<dyn HartExecutor>) -> Result<()> {
        if self.powered() {
            return Err(ErrorKind::MachinePowered.into());
        }
        *self.executor.lock().unwrap() = executor;
        Ok(())
    }

    /// Stage the M-mode firmware, copied to the DRAM base on every reset.
    pub fn load_bootrom<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if self.powered() {
            return Err(ErrorKind::MachinePowered.into());
        }
        let image = load_image(path, self.config.mem_size)?;
        self.boot.lock().unwrap().bootrom = Some(image);
        Ok(())
    }

    /// Stage the S-mode payload, copied to the platform kernel offset on
    /// every reset.
    pub fn load_kernel<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if self.powered() {
            return Err(ErrorKind::MachinePowered.into());
        }
        let limit = self.config.mem_size.saturating_sub(KERNEL_OFFSET);
        let image = load_image(path, limit)?;
        self.boot.lock().unwrap().kernel = Some(image);
        Ok(())
    }

    /// Stage a custom Device Tree blob displacing the generated one.
    pub fn load_dtb<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if self.powered() {
            return Err(ErrorKind::MachinePowered.into());
        }
        let image = load_image(path, self.config.mem_size)?;
        self.boot.lock().unwrap().dtb = Some(image);
        Ok(())
    }

    /// Replace the kernel command line surfaced through /chosen.
    pub fn set_cmdline(&self, cmdline: &str) {
        self.boot.lock().unwrap().cmdline = cmdline.to_string();
    }

    /// Append one argument group to the kernel command line.
    pub fn append_cmdline(&self, args: &str) {
        let mut boot = self.boot.lock().unwrap();
        if !boot.cmdline.is_empty() {
            boot.cmdline.push(' ');
        }
        boot.cmdline.push_str(args);
    }

    /// Serialize the current Device Tree and write it to `path`,
    /// independent of the run state.
    pub fn dump_dtb<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let blob = {
            let boot = self.boot.lock().unwrap();
            let kernel_window = Self::kernel_window(self.mem_base, &boot);
            let mut fdt = self.sysbus.fdt().lock().unwrap();
            sync_boot_props(&mut fdt, &boot.cmdline, kernel_window, self.timer.freq())?;
            fdt.serialize()?
        };
        fs::write(path.as_ref(), &blob)
            .chain_err(|| format!("Failed to write DTB to {:?}", path.as_ref()))?;
        Ok(())
    }

    /// Read one machine option.
    pub fn get_opt(&self, opt: MachineOption) -> u64 {
        let opts = self.opts.lock().unwrap();
        match opt {
            MachineOption::ResetPc => opts.reset_pc,
            MachineOption::DtbAddr => opts.dtb_addr,
            MachineOption::TimeFreq => self.timer.freq(),
            MachineOption::HwImitate => opts.hw_imitate,
            MachineOption::MaxCpuCent => opts.max_cpu_cent,
            MachineOption::Jit => opts.jit,
            MachineOption::JitCache => opts.jit_cache,
            MachineOption::JitHarvard => opts.jit_harvard,
            MachineOption::MemBase => self.mem_base,
            MachineOption::MemSize => self.config.mem_size,
            MachineOption::HartCount => self.harts.len() as u64,
        }
    }

    /// Write one machine option. Read-only options always refuse; the
    /// others refuse while the machine is powered, except the CPU
    /// throttle.
    pub fn set_opt(&self, opt: MachineOption, val: u64) -> Result<()> {
        if opt.read_only() {
            return Err(ErrorKind::OptReadOnly(format!("{:?}", opt)).into());
        }
        if self.powered() && !opt.writable_powered() {
            return Err(ErrorKind::MachinePowered.into());
        }
        let mut opts = self.opts.lock().unwrap();
        match opt {
            MachineOption::ResetPc => opts.reset_pc = val,
            MachineOption::DtbAddr => opts.dtb_addr = val,
            MachineOption::TimeFreq => self.timer.set_freq(val.max(1)),
            MachineOption::HwImitate => opts.hw_imitate = val,
            MachineOption::MaxCpuCent => opts.max_cpu_cent = val.max(1).min(100),
            MachineOption::Jit => opts.jit = val,
            MachineOption::JitCache => opts.jit_cache = val,
            MachineOption::JitHarvard => opts.jit_harvard = val,
            _ => {}
        }
        Ok(())
    }

    /// Attach an MMIO device slot; refused while powered. On failure the
    /// descriptor is finalized and no region is attached.
    pub fn attach_mmio(&self, desc: MmioDesc) -> Result<Arc<MmioRegion>> {
        if self.powered() {
            desc.finalize();
            return Err(ErrorKind::MachinePowered.into());
        }
        Ok(self.sys_mem.attach_region(desc)?)
    }

    /// Get a usable address for an MMIO region of `size` bytes near
    /// `hint`.
    pub fn mmio_zone_auto(&self, hint: u64, size: u64) -> u64 {
        self.sys_mem.zone_auto(hint, size)
    }

    /// Detach an MMIO device slot, invoking its `remove` hook. Removal
    /// while running is allowed; the device must have quiesced itself.
    pub fn remove_mmio(&self, region: &Arc<MmioRegion>) -> Result<()> {
        Ok(self.sys_mem.remove_region(region)?)
    }

    /// Direct host pointer into guest DRAM, for device DMA. The caller
    /// must keep the machine alive while using it.
    pub fn get_dma_ptr(&self, addr: u64, size: u64) -> Option<u64> {
        self.sys_mem.dma_host_addr(addr, size)
    }

    /// Bulk copy into guest DRAM with bounds checking.
    pub fn write_ram(&self, addr: u64, data: &[u8]) -> Result<()> {
        Ok(self.sys_mem.write_ram(addr, data)?)
    }

    /// Bulk copy out of guest DRAM with bounds checking.
    pub fn read_ram(&self, addr: u64, data: &mut [u8]) -> Result<()> {
        Ok(self.sys_mem.read_ram(addr, data)?)
    }

    /// Guest load of width `data.len()`; false means the issuing hart
    /// takes a load access fault.
    pub fn mmio_read(&self, addr: u64, data: &mut [u8]) -> bool {
        if let Err(e) = self.sys_mem.access_read(addr, data) {
            debug!("Guest load at 0x{:X} faults: {}", addr, e);
            return false;
        }
        true
    }

    /// Guest store of width `data.len()`; false means the issuing hart
    /// takes a store access fault.
    pub fn mmio_write(&self, addr: u64, data: &[u8]) -> bool {
        if let Err(e) = self.sys_mem.access_write(addr, data) {
            debug!("Guest store at 0x{:X} faults: {}", addr, e);
            return false;
        }
        true
    }

    fn kernel_window(mem_base: u64, boot: &BootSource) -> Option<(u64, u64)> {
        boot.kernel.as_ref().map(|kernel| {
            let start = mem_base + KERNEL_OFFSET;
            (start, start + kernel.len() as u64)
        })
    }

    // Pick the DTB bytes and guest address for this boot.
    fn prepare_dtb(&self, boot: &BootSource) -> Result<(u64, Vec<u8>)> {
        let blob = match &boot.dtb {
            Some(blob) => blob.clone(),
            None => {
                let kernel_window = Self::kernel_window(self.mem_base, boot);
                let mut fdt = self.sysbus.fdt().lock().unwrap();
                sync_boot_props(&mut fdt, &boot.cmdline, kernel_window, self.timer.freq())?;
                fdt.serialize()?
            }
        };

        let configured = self.opts.lock().unwrap().dtb_addr;
        let addr = if configured != 0 {
            configured
        } else {
            // Auto placement: page-aligned slot just below the top of DRAM.
            round_down(
                self.mem_base + self.config.mem_size - blob.len() as u64,
                0x1000,
            )
            .unwrap_or(self.mem_base)
        };
        Ok((addr, blob))
    }

    // The reset protocol. All harts must be parked when this runs.
    fn boot_reset(&self) -> Result<()> {
        for region in self.sys_mem.regions() {
            region.invoke_reset();
        }

        let boot = self.boot.lock().unwrap();
        if let Some(bootrom) = &boot.bootrom {
            self.sys_mem
                .write_ram(self.mem_base, bootrom)
                .chain_err(|| "Failed to copy the bootrom to the DRAM base")?;
        }
        if let Some(kernel) = &boot.kernel {
            self.sys_mem
                .write_ram(self.mem_base + KERNEL_OFFSET, kernel)
                .chain_err(|| "Failed to copy the kernel payload")?;
        }
        let (dtb_addr, blob) = self.prepare_dtb(&boot)?;
        self.sys_mem
            .write_ram(dtb_addr, &blob)
            .chain_err(|| ErrorKind::WrtDtbErr(dtb_addr))?;
        drop(boot);

        let reset_pc = self.opts.lock().unwrap().reset_pc;
        for hart in &self.harts {
            hart.reset_state(reset_pc, dtb_addr);
        }
        Ok(())
    }

    /// Powered on, even when paused.
    pub fn powered(&self) -> bool {
        self.vm_state.0.lock().unwrap().powered()
    }

    /// Powered on and not paused.
    pub fn running(&self) -> bool {
        *self.vm_state.0.lock().unwrap() == VmState::Running
    }

    fn register_once(&self) {
        if self.registered.swap(true, Ordering::AcqRel) {
            return;
        }
        match self.weak_self.lock().unwrap().upgrade() {
            Some(machine) => {
                if let Err(e) = EventLoop::register(machine) {
                    error!("{}", e.display_chain());
                }
            }
            None => error!("Machine self-reference lost before registration"),
        }
    }

    // Spawn the executor threads on the first power-on, resume the parked
    // ones afterwards.
    fn run_harts(&self) -> Result<()> {
        let executor = self.executor.lock().unwrap().clone();
        for hart in &self.harts {
            match hart.lifecycle() {
                HartLifecycle::Created => {
                    Hart::start(hart.clone(), executor.clone())?;
                }
                _ => hart.resume()?,
            }
        }
        Ok(())
    }
}

impl MachineLifecycle for StdMachine {
    fn start(&self) -> bool {
        let (state_lock, cond) = self.vm_state.as_ref();
        let mut state = state_lock.lock().unwrap();
        match *state {
            VmState::Running => false,
            VmState::Paused => {
                for hart in &self.harts {
                    if let Err(e) = hart.resume() {
                        error!("{}", e.display_chain());
                        return false;
                    }
                }
                *state = VmState::Running;
                cond.notify_all();
                true
            }
            VmState::Created | VmState::Shutdown => {
                // Power on: run the reset protocol, then release the harts.
                if let Err(e) = self.boot_reset() {
                    error!("{}", e.display_chain());
                    return false;
                }
                if let Err(e) = self.run_harts() {
                    error!("{}", e.display_chain());
                    *state = VmState::Shutdown;
                    cond.notify_all();
                    return false;
                }
                self.register_once();
                *state = VmState::Running;
                cond.notify_all();
                true
            }
        }
    }

    fn pause(&self) -> bool {
        let (state_lock, cond) = self.vm_state.as_ref();
        let mut state = state_lock.lock().unwrap();
        if *state != VmState::Running {
            return false;
        }
        for hart in &self.harts {
            hart.pause();
        }
        *state = VmState::Paused;
        cond.notify_all();
        true
    }

    fn reset(&self, keep_powered: bool) {
        let (state_lock, cond) = self.vm_state.as_ref();
        let mut state = state_lock.lock().unwrap();
        let was_powered = state.powered();

        for hart in &self.harts {
            hart.pause();
        }
        if !keep_powered {
            *state = VmState::Shutdown;
            cond.notify_all();
            return;
        }

        if let Err(e) = self.boot_reset() {
            error!("{}", e.display_chain());
            *state = VmState::Shutdown;
            cond.notify_all();
            return;
        }
        if was_powered {
            for hart in &self.harts {
                if let Err(e) = hart.resume() {
                    error!("{}", e.display_chain());
                }
            }
            *state = VmState::Running;
        }
        cond.notify_all();
    }

    fn destroy(&self) -> bool {
        {
            let (state_lock, cond) = self.vm_state.as_ref();
            let mut state = state_lock.lock().unwrap();
            *state = VmState::Shutdown;
            cond.notify_all();
        }
        for hart in &self.harts {
            hart.destroy();
        }
        // Devices go away in reverse attachment order, then the harts are
        // gone and DRAM follows with the machine itself.
        self.sys_mem.remove_all_regions();

        if self.registered.swap(false, Ordering::AcqRel) {
            if let Some(machine) = self.weak_self.lock().unwrap().upgrade() {
                let manager: Arc<dyn EventLoopManager> = machine;
                EventLoop::unregister(&manager);
            }
        }
        true
    }

    fn powered(&self) -> bool {
        StdMachine::powered(self)
    }

    fn running(&self) -> bool {
        StdMachine::running(self)
    }
}

impl EventLoopManager for StdMachine {
    fn tick(&self) {
        // Power requests posted by syscon are applied here, after the MMIO
        // callback that raised them has long returned.
        match self.sysbus.power_signal().take_request() {
            Some(PowerRequest::Reset) => {
                info!("Machine reset requested by the guest");
                MachineLifecycle::reset(self, true);
            }
            Some(PowerRequest::Poweroff) => {
                info!("Machine poweroff requested by the guest");
                MachineLifecycle::reset(self, false);
            }
            None => {}
        }
        if !self.powered() {
            return;
        }

        for region in self.sys_mem.regions() {
            region.invoke_update();
        }
        for hart in &self.harts {
            hart.update_timer_interrupt();
        }

        // A stopped hart under a powered machine means a fatal fault or a
        // guest-initiated shutdown; the whole machine powers off.
        if self
            .harts
            .iter()
            .any(|hart| hart.lifecycle() == HartLifecycle::Stopped)
        {
            warn!("A hart stopped, powering the machine off");
            MachineLifecycle::reset(self, false);
        }
    }

    fn running(&self) -> bool {
        StdMachine::running(self)
    }
}

impl Drop for StdMachine {
    fn drop(&mut self) {
        for hart in &self.harts {
            hart.destroy();
        }
        self.sys_mem.remove_all_regions();
    }
}
