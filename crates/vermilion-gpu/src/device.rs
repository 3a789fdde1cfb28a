//! Device orchestration: lifecycle, interrupt wiring, the page-table-switch
//! protocol, and the submission path.
//!
//! A [`Device`] owns every subsystem — no process-wide state exists outside
//! it. Lifecycle runs `init → start → (work) → stop → close`; `destroy` is
//! the fatal teardown that can be reached from any state.
//!
//! Locking: `submit` (the submission serializer) → `contexts` → `mmu` →
//! `ring`, acquired strictly in that order and never in reverse. The
//! interrupt path ([`Device::isr`]) touches only the dispatcher and atomics.
//! Fatal interrupt callbacks (AXI errors, page faults, engine errors) never
//! tear anything down inline — they latch a pending flag that
//! [`Device::run_pending`] acts on from deferred-work context, because the
//! teardown frees structures the interrupt path is still reading.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, error, warn};
use vermilion_hal::{Hal, MemRegion, PowerState};

use crate::config::DeviceConfig;
use crate::drawctxt::{ContextKind, ContextPool, GmemShadowDesc, Rect, SwitchFlags};
use crate::error::{Error, Result};
use crate::intr::{IrqBlock, IrqDispatcher, IrqSource};
use crate::mmu::{Mmu, MmuStats, ProcessId, PteAccess, Scatterlist};
use crate::pm4;
use crate::regs;
use crate::ring::{
    RingBuffer, RingConfig, RingStats, Timestamp, TimestampKind, TimestampWaiter,
};

/// Device identification and capability summary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub chip_id: u32,
    pub mmu_enabled: bool,
    pub gmem_base: u32,
    pub gmem_size: u32,
}

/// Power-management requests accepted by [`Device::set_power`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PowerProp {
    State(PowerState),
    /// Force every internal clock on, overriding dynamic gating.
    OverrideOn,
    OverrideOff,
}

pub struct Device {
    hal: Hal,
    cfg: DeviceConfig,
    intr: Arc<IrqDispatcher>,
    /// Serializes whole submissions (context switch + page-table switch +
    /// payload) against each other.
    submit: Mutex<()>,
    contexts: Mutex<ContextPool>,
    mmu: Mutex<Mmu>,
    ring: Mutex<RingBuffer>,
    waiter: Arc<TimestampWaiter>,
    mmu_scratch: Mutex<Option<MemRegion>>,
    attached: Mutex<Vec<ProcessId>>,
    initialized: AtomicBool,
    started: AtomicBool,
    destroyed: AtomicBool,
    fatal_pending: Arc<AtomicBool>,
}

impl Device {
    /// Bring the device out of reset and initialize the interrupt dispatcher
    /// and MMU. The device is not executing commands until [`start`].
    ///
    /// [`start`]: Device::start
    pub fn init(hal: Hal, cfg: DeviceConfig) -> Result<Device> {
        hal.power.set_power_state(PowerState::On);

        // Every block must be powered and clocked before a soft reset; the
        // overrides are dropped again in start().
        hal.regs.write(regs::core::PM_OVERRIDE1, 0xffff_fffe);
        hal.regs.write(regs::core::PM_OVERRIDE2, 0xffff_ffff);
        hal.regs.write(regs::core::SOFT_RESET, 0xffff_ffff);
        hal.regs.write(regs::core::SOFT_RESET, 0x0000_0000);

        hal.regs.write(regs::core::CTRL, regs::core::CTRL_DEFAULT);
        hal.regs
            .write(regs::mh::ARBITER_CONFIG, regs::mh::ARBITER_DEFAULT);
        hal.regs.write(regs::sq::VS_PROGRAM, 0);
        hal.regs.write(regs::sq::PS_PROGRAM, 0);

        let intr = Arc::new(IrqDispatcher::new(Arc::clone(&hal.regs)));

        let ring = RingBuffer::new(
            Arc::clone(&hal.regs),
            Arc::clone(&hal.mem),
            hal.alloc.as_ref(),
            RingConfig {
                size_dwords: cfg.ring_size_dwords,
                blk_size_log2_qwords: cfg.rb_blk_size_log2_qwords,
                backend: cfg.wait_backend,
                issue_timeout: cfg.issue_timeout,
                idle_timeout: cfg.idle_timeout,
            },
        )?;
        let waiter = ring.waiter();

        let device = Device {
            intr: Arc::clone(&intr),
            submit: Mutex::new(()),
            contexts: Mutex::new(ContextPool::new(cfg.context_pool_size, cfg.gmem_size)),
            mmu: Mutex::new(Mmu::new(
                cfg.per_process_pagetables,
                cfg.va_base,
                cfg.va_range,
                cfg.max_client_processes,
            )),
            ring: Mutex::new(ring),
            waiter,
            mmu_scratch: Mutex::new(None),
            attached: Mutex::new(Vec::new()),
            initialized: AtomicBool::new(false),
            started: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            fatal_pending: Arc::new(AtomicBool::new(false)),
            hal,
            cfg,
        };

        if let Err(err) = device.mmu_init() {
            device.intr.close();
            device.ring.lock().unwrap().close(device.hal.alloc.as_ref());
            device.hal.power.set_power_state(PowerState::Off);
            return Err(err);
        }

        device.initialized.store(true, Ordering::Release);
        debug!(chip_id = device.cfg.chip_id, "device initialized");
        Ok(device)
    }

    fn attach_fatal(&self, id: IrqSource) -> Result<()> {
        let pending = Arc::clone(&self.fatal_pending);
        self.intr.attach(
            id,
            Box::new(move |_| {
                pending.store(true, Ordering::Release);
            }),
        )
    }

    fn mmu_init(&self) -> Result<()> {
        let enable = self.cfg.mmu_enable;
        self.hal.regs.write(
            regs::mh::MMU_CONFIG,
            if enable {
                regs::mh::CONFIG_DEFAULT | regs::mh::CONFIG_ENABLE
            } else {
                0
            },
        );

        // AXI errors are fatal regardless of translation being on.
        self.attach_fatal(IrqSource::MhAxiReadError)?;
        self.attach_fatal(IrqSource::MhAxiWriteError)?;
        self.intr.enable(IrqSource::MhAxiReadError)?;
        self.intr.enable(IrqSource::MhAxiWriteError)?;

        if !enable {
            return Ok(());
        }

        self.ring.lock().unwrap().idle(self.cfg.idle_timeout)?;

        debug_assert_eq!(self.cfg.mpu_base & (crate::mmu::PAGE_SIZE - 1), 0);
        self.hal.regs.write(regs::mh::MPU_BASE, self.cfg.mpu_base);
        self.hal
            .regs
            .write(regs::mh::MPU_END, self.cfg.mpu_base + self.cfg.mpu_range);

        self.attach_fatal(IrqSource::MhMmuPageFault)?;
        self.intr.enable(IrqSource::MhMmuPageFault)?;

        let table_base = {
            let mut mmu = self.mmu.lock().unwrap();
            let key = mmu.key(self.cfg.init_owner);
            let base = mmu.attach(
                self.cfg.init_owner,
                self.hal.mem.as_ref(),
                self.hal.alloc.as_ref(),
            )?;
            mmu.set_hw_owner(key);
            base
        };

        // Landing zone for translations that fault; keeps errant reads and
        // writes off real memory.
        let scratch = self
            .hal
            .alloc
            .alloc(32, 32)
            .map_err(|_| Error::SystemError)?;
        *self.mmu_scratch.lock().unwrap() = Some(scratch);

        self.hal.regs.write(regs::mh::PT_BASE, table_base);
        self.hal.regs.write(
            regs::mh::VA_RANGE,
            self.cfg.va_base | (self.cfg.va_range >> 16),
        );
        self.hal.regs.write(regs::mh::TRAN_ERROR, scratch.base);
        self.hal.regs.write(
            regs::mh::INVALIDATE,
            regs::mh::INVALIDATE_ALL | regs::mh::INVALIDATE_TC,
        );
        Ok(())
    }

    fn check_alive(&self) -> Result<()> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(Error::Destroyed);
        }
        if !self.initialized.load(Ordering::Acquire) {
            return Err(Error::NotInitialized);
        }
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Program arbitration and GMEM, enable interrupts, start the ring, and
    /// validate the engine init by idling.
    pub fn start(&self) -> Result<()> {
        self.check_alive()?;
        if self.started.load(Ordering::Acquire) {
            return Err(Error::AlreadyInitialized);
        }

        self.hal.power.set_power_state(PowerState::ClockOn);
        self.hal.regs.write(regs::core::PM_OVERRIDE1, 0);
        self.hal.regs.write(regs::core::PM_OVERRIDE2, 0);

        // Core block: read errors are fatal, the rest are wait-event sources.
        self.attach_fatal(IrqSource::CoreReadError)?;
        self.intr.attach(IrqSource::CoreDisplayUpdate, Box::new(|_| {}))?;
        self.intr.attach(IrqSource::CoreGuiIdle, Box::new(|_| {}))?;
        self.intr.enable(IrqSource::CoreReadError)?;
        self.intr.enable(IrqSource::CoreDisplayUpdate)?;

        // Shader watchdogs are attached for visibility but left masked.
        self.intr.attach(IrqSource::SqPsWatchdog, Box::new(|_| {}))?;
        self.intr.attach(IrqSource::SqVsWatchdog, Box::new(|_| {}))?;

        // Command-processor block: retire wakes timestamp waiters, engine
        // errors are fatal, IB completions feed wait events.
        let waiter = Arc::clone(&self.waiter);
        self.intr.attach(
            IrqSource::CpRingBuffer,
            Box::new(move |_| waiter.signal()),
        )?;
        for id in [
            IrqSource::CpT0PacketInIb,
            IrqSource::CpOpcodeError,
            IrqSource::CpProtectedModeError,
            IrqSource::CpReservedBitError,
            IrqSource::CpIbError,
        ] {
            self.attach_fatal(id)?;
        }
        self.intr.attach(IrqSource::CpSw, Box::new(|_| {}))?;
        self.intr.attach(IrqSource::CpIb1, Box::new(|_| {}))?;
        self.intr.attach(IrqSource::CpIb2, Box::new(|_| {}))?;
        for id in [
            IrqSource::CpRingBuffer,
            IrqSource::CpT0PacketInIb,
            IrqSource::CpOpcodeError,
            IrqSource::CpProtectedModeError,
            IrqSource::CpReservedBitError,
            IrqSource::CpIbError,
            IrqSource::CpSw,
            IrqSource::CpIb1,
            IrqSource::CpIb2,
        ] {
            self.intr.enable(id)?;
        }

        self.hal.regs.write(
            regs::gmem::APERTURE_INFO,
            regs::gmem::aperture_info(self.cfg.gmem_base, self.cfg.gmem_size),
        );

        {
            let mut ring = self.ring.lock().unwrap();
            ring.start()?;
            if let Err(err) = ring.idle(self.cfg.idle_timeout) {
                warn!("engine init did not drain");
                ring.stop();
                drop(ring);
                self.detach_runtime_irqs();
                return Err(err);
            }
        }

        self.intr.set_cp_force_pending(true);
        self.started.store(true, Ordering::Release);
        debug!("device started");
        Ok(())
    }

    /// Interrupt sources owned by the start/stop lifecycle (the MH sources
    /// belong to init/close).
    fn detach_runtime_irqs(&self) {
        for id in [
            IrqSource::CoreReadError,
            IrqSource::CoreDisplayUpdate,
            IrqSource::CoreGuiIdle,
            IrqSource::SqPsWatchdog,
            IrqSource::SqVsWatchdog,
            IrqSource::CpRingBuffer,
            IrqSource::CpT0PacketInIb,
            IrqSource::CpOpcodeError,
            IrqSource::CpProtectedModeError,
            IrqSource::CpReservedBitError,
            IrqSource::CpIbError,
            IrqSource::CpSw,
            IrqSource::CpIb1,
            IrqSource::CpIb2,
        ] {
            self.intr.detach(id);
        }
    }

    /// Stop command execution: drain with a dummy wait (the engine hangs on
    /// the next start when halted with nothing ever submitted), quiesce
    /// interrupts, tear down contexts, halt the engine.
    pub fn stop(&self) -> Result<()> {
        self.check_alive()?;
        if !self.started.load(Ordering::Acquire) {
            return Err(Error::NotInitialized);
        }

        {
            let _guard = self.submit.lock().unwrap();
            let words = pm4::wait_for_idle();
            self.issue_cmds_serialized(false, &words, self.cfg.init_owner)?;
        }

        self.started.store(false, Ordering::Release);
        self.intr.set_cp_force_pending(false);
        self.detach_runtime_irqs();

        self.contexts
            .lock()
            .unwrap()
            .release_all(self.hal.alloc.as_ref());
        self.ring.lock().unwrap().stop();
        self.hal.regs.write(regs::gmem::APERTURE_INFO, 0);
        self.hal.power.set_power_state(PowerState::ClockOff);
        debug!("device stopped");
        Ok(())
    }

    /// Orderly teardown of an initialized (and stopped) device.
    pub fn close(&self) {
        if self.destroyed.load(Ordering::Acquire) {
            return;
        }
        if self.started.load(Ordering::Acquire) {
            let _ = self.stop();
        }
        self.teardown();
        debug!("device closed");
    }

    /// Fatal teardown: fail every waiter and pending submission, then tear
    /// the device down. Safe to call from deferred-work context only — never
    /// from the interrupt path, which still reads the structures this frees.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        error!("destroying device after fatal error");
        self.waiter.destroy();
        self.intr.set_cp_force_pending(false);
        self.contexts
            .lock()
            .unwrap()
            .release_all(self.hal.alloc.as_ref());
        self.ring.lock().unwrap().stop();
        self.started.store(false, Ordering::Release);
        self.teardown();
    }

    /// Shared final teardown; idempotent through the initialized flag.
    fn teardown(&self) {
        if !self.initialized.swap(false, Ordering::AcqRel) {
            return;
        }
        self.intr.detach(IrqSource::MhAxiReadError);
        self.intr.detach(IrqSource::MhAxiWriteError);
        self.intr.detach(IrqSource::MhMmuPageFault);
        self.hal.regs.write(regs::mh::MMU_CONFIG, 0);
        if let Some(scratch) = self.mmu_scratch.lock().unwrap().take() {
            self.hal.alloc.free(scratch);
        }
        self.mmu
            .lock()
            .unwrap()
            .release_all(self.hal.alloc.as_ref());

        self.intr.close();
        self.ring.lock().unwrap().close(self.hal.alloc.as_ref());
        self.hal.power.set_power_state(PowerState::Off);
    }

    /// Deferred-work entry point: performs any teardown scheduled from
    /// interrupt context. Also invoked opportunistically on the submission
    /// path so a fatal error fails fast even without an external worker.
    pub fn run_pending(&self) {
        if self.fatal_pending.swap(false, Ordering::AcqRel) {
            self.destroy();
        }
    }

    /// Interrupt-context entry point: decode the master signal register and
    /// service each signaled block. Non-blocking.
    pub fn isr(&self) {
        let signal = self.hal.regs.read(regs::master::INT_SIGNAL);
        if signal & regs::master::SIGNAL_MH != 0 {
            self.intr.dispatch(IrqBlock::Mh);
        }
        if signal & regs::master::SIGNAL_CP != 0 {
            self.intr.dispatch(IrqBlock::Cp);
        }
        if signal & regs::master::SIGNAL_CORE != 0 {
            self.intr.dispatch(IrqBlock::Core);
        }
        if signal & regs::master::SIGNAL_SQ != 0 {
            self.intr.dispatch(IrqBlock::Sq);
        }
    }

    // ---- MMU operations ----------------------------------------------------

    /// Register a client process: refcounts the device attachment and its
    /// page table.
    pub fn attach_process(&self, pid: ProcessId) -> Result<()> {
        self.check_alive()?;
        if self.cfg.mmu_enable {
            self.mmu.lock().unwrap().attach(
                pid,
                self.hal.mem.as_ref(),
                self.hal.alloc.as_ref(),
            )?;
        }
        self.attached.lock().unwrap().push(pid);
        Ok(())
    }

    pub fn detach_process(&self, pid: ProcessId) -> Result<()> {
        self.check_alive()?;
        let mut attached = self.attached.lock().unwrap();
        let pos = attached
            .iter()
            .position(|p| *p == pid)
            .ok_or(Error::BadParameter)?;
        attached.remove(pos);
        drop(attached);
        if self.cfg.mmu_enable {
            self.mmu
                .lock()
                .unwrap()
                .detach(pid, self.hal.alloc.as_ref())?;
        }
        Ok(())
    }

    pub fn map(
        &self,
        gpu_base: u32,
        scatter: &Scatterlist,
        access: PteAccess,
        owner: ProcessId,
    ) -> Result<()> {
        self.check_alive()?;
        if !self.cfg.mmu_enable {
            return Err(Error::NotInitialized);
        }
        self.mmu
            .lock()
            .unwrap()
            .map(self.hal.mem.as_ref(), gpu_base, scatter, access, owner)
    }

    /// Unmap a range and invalidate the TLB. Unmapping always invalidates.
    pub fn unmap(&self, gpu_base: u32, range_bytes: u32, owner: ProcessId) -> Result<()> {
        self.check_alive()?;
        if !self.cfg.mmu_enable {
            return Err(Error::NotInitialized);
        }
        self.mmu
            .lock()
            .unwrap()
            .unmap(self.hal.mem.as_ref(), gpu_base, range_bytes, owner)?;
        self.tlb_invalidate(owner)
    }

    pub fn get_map(
        &self,
        gpu_base: u32,
        range_bytes: u32,
        owner: ProcessId,
    ) -> Result<Scatterlist> {
        self.check_alive()?;
        self.mmu
            .lock()
            .unwrap()
            .get_map(self.hal.mem.as_ref(), gpu_base, range_bytes, owner)
    }

    /// Discard cached translations. Direct register write while the device
    /// is idle; in-stream register write while it is executing.
    pub fn tlb_invalidate(&self, owner: ProcessId) -> Result<()> {
        self.check_alive()?;
        if !self.cfg.mmu_enable {
            return Ok(());
        }
        let _guard = self.submit.lock().unwrap();
        let mut mmu = self.mmu.lock().unwrap();
        mmu.begin_flush();
        self.write_tlb_invalidate(owner)
    }

    /// The register half of an invalidate; callers hold the MMU state lock
    /// and have already consumed the pending-flush flag.
    fn write_tlb_invalidate(&self, _owner: ProcessId) -> Result<()> {
        let value = regs::mh::INVALIDATE_ALL | regs::mh::INVALIDATE_TC;
        if self.started.load(Ordering::Acquire) {
            let words = pm4::reg_write(regs::mh::INVALIDATE, value);
            self.ring.lock().unwrap().issue(true, &words)?;
        } else {
            self.hal.regs.write(regs::mh::INVALIDATE, value);
        }
        Ok(())
    }

    /// The page-table-switch protocol. Loads `owner`'s table into hardware
    /// before its commands execute.
    ///
    /// Idle device: idle, then write the table base register directly.
    /// Running device: enqueue a wait-for-idle, the in-stream base write,
    /// and the prefetch-fence workaround (two dummy indexed-bin draws against
    /// the scratch region bracketed by a second wait-for-idle). The dummy
    /// draws fill the vertex prefetch fifo so no vertex or bin fetch can be
    /// issued against the old table after the base register changes. Skipping
    /// them corrupts memory silently under load; never reorder or shorten
    /// this sequence.
    fn set_page_table(&self, owner: ProcessId) -> Result<()> {
        if !self.cfg.mmu_enable {
            return Ok(());
        }
        let mut mmu = self.mmu.lock().unwrap();

        if self.cfg.per_process_pagetables && mmu.hw_owner() != Some(mmu.key(owner)) {
            let table_base = mmu.table(owner)?.base.base;
            let key = mmu.key(owner);
            mmu.set_hw_owner(key);
            mmu.set_flush_pending();

            if self.started.load(Ordering::Acquire) {
                let scratch = self
                    .mmu_scratch
                    .lock()
                    .unwrap()
                    .as_ref()
                    .copied()
                    .ok_or(Error::NotInitialized)?;
                let words = switch_pagetable_words(table_base, scratch.base);
                self.ring.lock().unwrap().issue(true, &words)?;
            } else {
                self.ring.lock().unwrap().idle(self.cfg.idle_timeout)?;
                self.hal.regs.write(regs::mh::PT_BASE, table_base);
            }
        }

        if mmu.flush_pending() {
            mmu.begin_flush();
            self.write_tlb_invalidate(owner)?;
        }
        Ok(())
    }

    // ---- Submission --------------------------------------------------------

    /// Issue raw command words under the submission lock held by the caller.
    fn issue_cmds_serialized(
        &self,
        pmode_off: bool,
        words: &[u32],
        owner: ProcessId,
    ) -> Result<Timestamp> {
        self.set_page_table(owner)?;
        self.ring.lock().unwrap().issue(pmode_off, words)
    }

    /// Issue command words on behalf of `owner`, switching page tables as
    /// needed.
    pub fn issue_cmds(&self, pmode_off: bool, words: &[u32], owner: ProcessId) -> Result<Timestamp> {
        self.run_pending();
        self.check_alive()?;
        if !self.started.load(Ordering::Acquire) {
            return Err(Error::NotInitialized);
        }
        let _guard = self.submit.lock().unwrap();
        self.issue_cmds_serialized(pmode_off, words, owner)
    }

    /// Execute a command buffer: switch to `ctx_id` (emitting save/restore
    /// streams as needed), switch page tables, then reference the caller's
    /// indirect buffer. Returns the completion timestamp.
    pub fn submit(
        &self,
        ctx_id: usize,
        ib_addr: u32,
        size_dwords: u32,
        flags: SwitchFlags,
    ) -> Result<Timestamp> {
        self.run_pending();
        self.check_alive()?;
        if !self.started.load(Ordering::Acquire) {
            return Err(Error::NotInitialized);
        }
        if ib_addr == 0 || size_dwords == 0 {
            return Err(Error::BadParameter);
        }

        let _guard = self.submit.lock().unwrap();
        let mut contexts = self.contexts.lock().unwrap();
        let owner = contexts.get(ctx_id)?.owner;

        let segments = contexts.plan_switch(Some(ctx_id), flags)?;
        for segment in &segments {
            self.issue_cmds_serialized(segment.pmode_off, &segment.words, segment.owner)?;
        }
        drop(contexts);

        self.set_page_table(owner)?;
        self.ring.lock().unwrap().issue_indirect(ib_addr, size_dwords)
    }

    // ---- Contexts ----------------------------------------------------------

    pub fn context_create(&self, kind: ContextKind, owner: ProcessId) -> Result<usize> {
        self.check_alive()?;
        if !self.started.load(Ordering::Acquire) {
            return Err(Error::NotInitialized);
        }
        self.contexts.lock().unwrap().create(
            self.hal.mem.as_ref(),
            self.hal.alloc.as_ref(),
            kind,
            owner,
        )
    }

    /// Destroy a context. If it is active, switch to none first with its
    /// pending save state discarded, and drain before releasing the buffers
    /// hardware may still be reading.
    pub fn context_destroy(&self, ctx_id: usize) -> Result<()> {
        self.check_alive()?;
        let _guard = self.submit.lock().unwrap();
        let mut contexts = self.contexts.lock().unwrap();
        contexts.get(ctx_id)?;

        if contexts.active() == Some(ctx_id) {
            contexts.discard_pending_saves(ctx_id)?;
            let segments = contexts.plan_switch(None, SwitchFlags::empty())?;
            for segment in &segments {
                self.issue_cmds_serialized(segment.pmode_off, &segment.words, segment.owner)?;
            }
        }
        self.ring.lock().unwrap().idle(self.cfg.idle_timeout)?;
        contexts.release(ctx_id, self.hal.alloc.as_ref())
    }

    /// Switch the active context without submitting work.
    pub fn context_switch(&self, ctx_id: Option<usize>, flags: SwitchFlags) -> Result<()> {
        self.check_alive()?;
        if !self.started.load(Ordering::Acquire) {
            return Err(Error::NotInitialized);
        }
        let _guard = self.submit.lock().unwrap();
        let mut contexts = self.contexts.lock().unwrap();
        let segments = contexts.plan_switch(ctx_id, flags)?;
        for segment in &segments {
            self.issue_cmds_serialized(segment.pmode_off, &segment.words, segment.owner)?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn bind_gmem_shadow(
        &self,
        ctx_id: usize,
        gmem_rect: &Rect,
        shadow_x: u32,
        shadow_y: u32,
        buffer: Option<&GmemShadowDesc>,
        buffer_id: usize,
    ) -> Result<()> {
        self.check_alive()?;
        self.contexts.lock().unwrap().bind_gmem_shadow(
            self.hal.mem.as_ref(),
            self.hal.alloc.as_ref(),
            ctx_id,
            gmem_rect,
            shadow_x,
            shadow_y,
            buffer,
            buffer_id,
        )
    }

    // ---- Waiting -----------------------------------------------------------

    /// Block until hardware retires `ts` or the timeout elapses. A device
    /// destroy wakes all waiters with [`Error::Destroyed`].
    pub fn wait_timestamp(&self, ts: Timestamp, timeout: Duration) -> Result<()> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(Error::Destroyed);
        }
        self.waiter.wait(ts, timeout)
    }

    pub fn read_timestamp(&self, kind: TimestampKind) -> Timestamp {
        self.ring.lock().unwrap().read_timestamp(kind)
    }

    /// Wait until nothing is queued and the core's busy bit clears.
    pub fn idle(&self, timeout: Duration) -> Result<()> {
        self.check_alive()?;
        self.ring.lock().unwrap().idle(timeout)
    }

    /// Block until the next interrupt from one of the waitable sources.
    pub fn wait_for_interrupt(&self, id: IrqSource, timeout: Duration) -> Result<()> {
        self.check_alive()?;
        if !matches!(
            id,
            IrqSource::CpSw | IrqSource::CpIb1 | IrqSource::CpIb2 | IrqSource::CoreDisplayUpdate
        ) {
            return Err(Error::BadParameter);
        }
        self.intr.wait_for(id, timeout)
    }

    /// Periodic hang check; schedules the fatal teardown when the engine has
    /// stopped making progress on a non-empty ring.
    pub fn watchdog_tick(&self) {
        if self.destroyed.load(Ordering::Acquire) {
            return;
        }
        let hung = self.ring.lock().unwrap().watchdog_tick();
        if hung {
            self.fatal_pending.store(true, Ordering::Release);
            self.run_pending();
        }
    }

    // ---- Properties --------------------------------------------------------

    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            chip_id: self.cfg.chip_id,
            mmu_enabled: self.cfg.mmu_enable,
            gmem_base: self.cfg.gmem_base,
            gmem_size: self.cfg.gmem_size,
        }
    }

    pub fn set_power(&self, prop: PowerProp) -> Result<()> {
        self.check_alive()?;
        match prop {
            PowerProp::OverrideOn => {
                self.hal.regs.write(regs::core::PM_OVERRIDE1, 0xffff_fffe);
                self.hal.regs.write(regs::core::PM_OVERRIDE2, 0xffff_ffff);
            }
            PowerProp::OverrideOff => {
                self.hal.regs.write(regs::core::PM_OVERRIDE1, 0);
                self.hal.regs.write(regs::core::PM_OVERRIDE2, 0);
            }
            PowerProp::State(state) => self.hal.power.set_power_state(state),
        }
        Ok(())
    }

    pub fn ring_stats(&self) -> RingStats {
        self.ring.lock().unwrap().stats()
    }

    pub fn mmu_stats(&self) -> MmuStats {
        self.mmu.lock().unwrap().stats
    }

    pub fn last_issued(&self) -> Timestamp {
        self.ring.lock().unwrap().last_issued()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.close();
    }
}

/// The in-stream page-table switch sequence (see [`Device::set_page_table`]).
fn switch_pagetable_words(table_base: u32, scratch: u32) -> Vec<u32> {
    let mut words = Vec::with_capacity(25);
    words.extend_from_slice(&pm4::wait_for_idle());
    words.extend_from_slice(&pm4::reg_write(regs::mh::PT_BASE, table_base));
    // Suppress faceness generation so the dummy draws touch nothing real.
    words.extend_from_slice(&[
        pm4::type3_packet(pm4::Opcode::SetConstant, 2),
        (0x4 << 16) | (regs::gfx::SC_MODE_CNTL - regs::gfx::DECODE_BASE),
        0,
    ]);
    words.extend_from_slice(&[
        pm4::type3_packet(pm4::Opcode::SetBinBaseOffset, 1),
        scratch,
    ]);
    words.extend_from_slice(&pm4::dummy_draw_indexed_bin(scratch));
    words.extend_from_slice(&pm4::dummy_draw_indexed_bin(scratch));
    words.extend_from_slice(&pm4::wait_for_idle());
    debug_assert_eq!(words.len(), 25);
    words
}
