//! Command ring-buffer engine.
//!
//! A power-of-two circular buffer of command words in shared memory. Software
//! owns the write pointer; hardware owns the read pointer and shadows it into
//! the `memstore` region alongside the retire timestamp. Every submission is
//! stamped with the next value of a monotonically increasing 32-bit
//! timestamp and carries a trailer that makes hardware write that value back
//! to memory when the submission drains — the completion fence everything
//! else builds on.
//!
//! Ordering guarantee: timestamps are assigned in [`RingBuffer::issue`] call
//! order and retire in that same order; there is a single hardware queue and
//! no reordering.
//!
//! Ring-full policy: a submission that does not fit polls the shadowed read
//! pointer under a deadline (hardware drains independently) and fails with
//! [`Error::Timeout`] if space never appears. Unconsumed entries are never
//! overwritten and the ring never grows.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use vermilion_hal::{ContiguousAllocator, MemRegion, MemoryBus, RegisterBus};

use crate::error::{Error, Result};
use crate::pm4;
use crate::pm4::Opcode;
use crate::regs;

pub type Timestamp = u32;

/// Which memstore word to read a timestamp from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimestampKind {
    /// Start-of-pipeline: the engine has fetched the submission.
    Consumed,
    /// End-of-pipeline: the submission fully drained.
    Retired,
}

/// How `wait_timestamp` blocks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WaitBackend {
    /// Condition-wait signaled from the ring-buffer retire interrupt.
    #[default]
    Interrupt,
    /// Periodic re-read of the shadowed retire timestamp.
    Polling,
}

/// Layout of the memstore region shared with hardware.
pub mod memstore {
    /// Hardware-maintained read-pointer shadow.
    pub const RPTR: u32 = 0x00;
    /// Write-pointer polling word.
    pub const WPTR_POLL: u32 = 0x04;
    /// Start-of-pipeline timestamp.
    pub const SOP_TIMESTAMP: u32 = 0x08;
    /// End-of-pipeline (retire) timestamp.
    pub const EOP_TIMESTAMP: u32 = 0x0c;

    pub const SIZE_BYTES: u32 = 0x20;
}

/// Headroom reserved so a wrap-filler NOP always fits.
const NOP_RESERVE_DWORDS: u32 = 2;

/// Dwords appended by the timestamp trailer (plus two more when the
/// interrupt backend is active, and eight more for a protected-mode bracket).
const TRAILER_DWORDS: u32 = 6;
const IRQ_TRAILER_DWORDS: u32 = 2;
const PMODE_DWORDS: u32 = 8;

/// Retire-order compare tolerating 32-bit wraparound: `ts` is reached once
/// the signed distance from it to `completed` is non-negative.
#[inline]
pub fn timestamp_reached(completed: Timestamp, ts: Timestamp) -> bool {
    completed.wrapping_sub(ts) as i32 >= 0
}

/// Shared fence state between submitters, waiters, and the retire interrupt.
pub struct TimestampWaiter {
    mem: Arc<dyn MemoryBus>,
    eop_addr: u32,
    backend: WaitBackend,
    destroyed: Mutex<bool>,
    cv: Condvar,
    /// Number of bounded re-reads tolerating a lagging timestamp writeback
    /// while other bus masters hold the bus.
    retry_reads: u32,
}

const RETRY_DELAY: Duration = Duration::from_micros(10);
const POLL_INTERVAL: Duration = Duration::from_millis(1);

impl TimestampWaiter {
    fn new(mem: Arc<dyn MemoryBus>, eop_addr: u32, backend: WaitBackend) -> Arc<Self> {
        Arc::new(Self {
            mem,
            eop_addr,
            backend,
            destroyed: Mutex::new(false),
            cv: Condvar::new(),
            retry_reads: 10,
        })
    }

    pub fn completed(&self) -> Timestamp {
        self.mem.read_u32(self.eop_addr)
    }

    fn check(&self, ts: Timestamp) -> bool {
        timestamp_reached(self.completed(), ts)
    }

    /// Re-read a few times before giving up on this poll round: the stamped
    /// value may lag actual completion by a few microseconds when other bus
    /// masters are active.
    fn check_with_retry(&self, ts: Timestamp) -> bool {
        for _ in 0..self.retry_reads {
            if self.check(ts) {
                return true;
            }
            std::thread::sleep(RETRY_DELAY);
        }
        false
    }

    /// Wake from the retire interrupt.
    pub fn signal(&self) {
        self.cv.notify_all();
    }

    /// Fail every current and future waiter with [`Error::Destroyed`].
    pub fn destroy(&self) {
        *self.destroyed.lock().unwrap() = true;
        self.cv.notify_all();
    }

    fn reset(&self) {
        *self.destroyed.lock().unwrap() = false;
    }

    pub fn is_destroyed(&self) -> bool {
        *self.destroyed.lock().unwrap()
    }

    /// Block until hardware stamps a timestamp at or past `ts`.
    pub fn wait(&self, ts: Timestamp, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_destroyed() {
                return Err(Error::Destroyed);
            }
            if self.check_with_retry(ts) {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }
            let remaining = deadline - now;
            match self.backend {
                WaitBackend::Interrupt => {
                    let guard = self.destroyed.lock().unwrap();
                    if *guard {
                        return Err(Error::Destroyed);
                    }
                    // Re-check under a bounded wait regardless of signals:
                    // the interrupt may have fired between check and wait.
                    let (_guard, _) = self
                        .cv
                        .wait_timeout(guard, remaining.min(POLL_INTERVAL * 10))
                        .unwrap();
                }
                WaitBackend::Polling => {
                    std::thread::sleep(remaining.min(POLL_INTERVAL));
                }
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RingStats {
    pub issues: u64,
    pub wraps: u64,
    pub words_total: u64,
}

#[derive(Clone, Copy, Debug)]
pub struct RingConfig {
    pub size_dwords: u32,
    pub blk_size_log2_qwords: u32,
    pub backend: WaitBackend,
    pub issue_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            size_dwords: 2048,
            blk_size_log2_qwords: 4,
            backend: WaitBackend::Interrupt,
            issue_timeout: Duration::from_millis(400),
            idle_timeout: Duration::from_millis(400),
        }
    }
}

struct Watchdog {
    rptr_sample: Option<u32>,
}

pub struct RingBuffer {
    regs: Arc<dyn RegisterBus>,
    mem: Arc<dyn MemoryBus>,
    buffer: MemRegion,
    memstore: MemRegion,
    size_dwords: u32,
    cfg: RingConfig,
    wptr: u32,
    rptr: u32,
    timestamp: Timestamp,
    started: bool,
    watchdog: Watchdog,
    stats: RingStats,
    waiter: Arc<TimestampWaiter>,
}

impl RingBuffer {
    pub fn new(
        regs: Arc<dyn RegisterBus>,
        mem: Arc<dyn MemoryBus>,
        alloc: &dyn ContiguousAllocator,
        cfg: RingConfig,
    ) -> Result<Self> {
        if !cfg.size_dwords.is_power_of_two() || cfg.size_dwords < 64 {
            return Err(Error::BadParameter);
        }
        let buffer = alloc
            .alloc(cfg.size_dwords * 4, crate::mmu::PAGE_SIZE)
            .map_err(|_| Error::SystemError)?;
        let memstore = alloc
            .alloc(memstore::SIZE_BYTES, 32)
            .map_err(|_| Error::SystemError)?;
        let waiter = TimestampWaiter::new(
            Arc::clone(&mem),
            memstore.base + memstore::EOP_TIMESTAMP,
            cfg.backend,
        );
        Ok(Self {
            regs,
            mem,
            buffer,
            memstore,
            size_dwords: cfg.size_dwords,
            cfg,
            wptr: 0,
            rptr: 0,
            timestamp: 0,
            started: false,
            watchdog: Watchdog { rptr_sample: None },
            stats: RingStats::default(),
            waiter,
        })
    }

    pub fn waiter(&self) -> Arc<TimestampWaiter> {
        Arc::clone(&self.waiter)
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn stats(&self) -> RingStats {
        self.stats
    }

    pub fn memstore_region(&self) -> MemRegion {
        self.memstore
    }

    pub fn buffer_region(&self) -> MemRegion {
        self.buffer
    }

    pub fn last_issued(&self) -> Timestamp {
        self.timestamp
    }

    fn size_log2_qwords(&self) -> u32 {
        let mut log2 = 0;
        let mut qwords = self.size_dwords >> 1;
        while qwords > 1 {
            qwords >>= 1;
            log2 += 1;
        }
        log2
    }

    fn read_rptr(&mut self) -> u32 {
        self.rptr = self.mem.read_u32(self.memstore.base + memstore::RPTR);
        self.rptr
    }

    /// Publish the write pointer: polling shadow first, then the register.
    fn submit(&mut self) {
        self.mem
            .write_u32(self.memstore.base + memstore::WPTR_POLL, self.wptr);
        self.regs.write(regs::cp::RB_WPTR, self.wptr);
    }

    /// Reserve `numcmds` contiguous dwords at the write pointer, wrapping
    /// through a NOP filler when the tail is too short. On success the write
    /// pointer still points at the reserved area.
    fn allocate(&mut self, numcmds: u32) -> Result<u32> {
        debug_assert!(numcmds <= self.size_dwords - NOP_RESERVE_DWORDS - 1);
        let deadline = Instant::now() + self.cfg.issue_timeout;
        loop {
            self.read_rptr();

            if self.wptr >= self.rptr {
                if self.wptr + numcmds <= self.size_dwords - NOP_RESERVE_DWORDS {
                    return Ok(self.wptr);
                }
                // Tail too short: pad it out with one NOP packet spanning to
                // the end, hand that to hardware, and retry from offset 0.
                let filler = self.size_dwords - self.wptr - 1;
                self.mem.write_u32(
                    self.buffer.base + self.wptr * 4,
                    pm4::nop_packet(filler),
                );
                self.wptr += 1;
                self.submit();
                self.wptr = 0;
                self.stats.wraps += 1;
                continue;
            }

            if self.wptr + numcmds < self.rptr {
                return Ok(self.wptr);
            }

            if Instant::now() >= deadline {
                warn!(numcmds, wptr = self.wptr, rptr = self.rptr, "ring full");
                return Err(Error::Timeout);
            }
            std::thread::yield_now();
        }
    }

    fn write_at(&self, index: u32, words: &[u32]) {
        self.mem
            .write_u32_slice(self.buffer.base + index * 4, words);
    }

    /// Copy command words into the ring followed by the timestamp trailer and
    /// publish the new write pointer. Returns the timestamp assigned to this
    /// submission.
    ///
    /// `pmode_off` brackets the payload with engine-config packets that
    /// suspend protected-mode error checking around commands that must touch
    /// protected registers.
    pub fn issue(&mut self, pmode_off: bool, words: &[u32]) -> Result<Timestamp> {
        if !self.started {
            return Err(Error::NotInitialized);
        }
        let irq_trailer = self.cfg.backend == WaitBackend::Interrupt;
        let pmode_words = if pmode_off { PMODE_DWORDS } else { 0 };
        let irq_words = if irq_trailer { IRQ_TRAILER_DWORDS } else { 0 };
        let total = words.len() as u32 + pmode_words + irq_words + TRAILER_DWORDS;

        let start = self.allocate(total)?;

        let mut out = Vec::with_capacity(total as usize);
        if pmode_off {
            out.extend_from_slice(&pm4::engine_config(0));
        }
        out.extend_from_slice(words);
        if pmode_off {
            out.extend_from_slice(&pm4::wait_for_idle());
            out.extend_from_slice(&pm4::engine_config(pm4::PROTECTED_MODE_CONTROL));
        }

        self.timestamp = self.timestamp.wrapping_add(1);
        let ts = self.timestamp;

        // Start-of-pipeline stamp through the scratch register, then the
        // end-of-pipeline stamp into memory once caches flush.
        out.extend_from_slice(&pm4::reg_write(regs::cp::TIMESTAMP, ts));
        out.extend_from_slice(&[
            pm4::type3_packet(Opcode::EventWrite, 3),
            pm4::CACHE_FLUSH_TS,
            self.memstore.base + memstore::EOP_TIMESTAMP,
            ts,
        ]);
        if irq_trailer {
            out.extend_from_slice(&[
                pm4::type3_packet(Opcode::Interrupt, 1),
                crate::intr::IrqSource::CpRingBuffer.bit(),
            ]);
        }
        debug_assert_eq!(out.len() as u32, total);

        self.write_at(start, &out);
        self.wptr = start + total;
        self.submit();

        self.stats.issues += 1;
        self.stats.words_total += words.len() as u64;
        Ok(ts)
    }

    /// Issue an indirect-buffer reference: hardware fetches `size_dwords`
    /// command words from `ib_addr` instead of inline payload.
    pub fn issue_indirect(&mut self, ib_addr: u32, size_dwords: u32) -> Result<Timestamp> {
        if ib_addr == 0 || size_dwords == 0 {
            return Err(Error::BadParameter);
        }
        let words = pm4::indirect_buffer(ib_addr, size_dwords);
        self.issue(false, &words)
    }

    pub fn read_timestamp(&self, kind: TimestampKind) -> Timestamp {
        let offset = match kind {
            TimestampKind::Consumed => memstore::SOP_TIMESTAMP,
            TimestampKind::Retired => memstore::EOP_TIMESTAMP,
        };
        self.mem.read_u32(self.memstore.base + offset)
    }

    /// Wait until software has nothing queued and the busy bit clears.
    pub fn idle(&mut self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        if self.started {
            loop {
                if self.read_rptr() == self.wptr {
                    break;
                }
                if Instant::now() >= deadline {
                    return Err(Error::Timeout);
                }
                std::thread::yield_now();
            }
        }
        loop {
            if self.regs.read(regs::core::STATUS) & regs::core::STATUS_BUSY == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            std::thread::yield_now();
        }
    }

    /// Program the ring registers, release the micro-engine, and queue the
    /// engine-init packet. The caller validates the init by idling afterward.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }

        self.mem
            .fill_u32(self.memstore.base, 0, memstore::SIZE_BYTES / 4);
        self.mem.fill_u32(self.buffer.base, 0, self.size_dwords);

        self.regs.write(
            regs::cp::RB_WPTR_BASE,
            self.memstore.base + memstore::WPTR_POLL,
        );
        self.regs.write(regs::cp::RB_WPTR_DELAY, 0);
        self.regs.write(
            regs::cp::RB_CNTL,
            regs::rb_cntl::encode(self.size_log2_qwords(), self.cfg.blk_size_log2_qwords, true),
        );
        self.regs.write(regs::cp::RB_BASE, self.buffer.base);
        self.regs
            .write(regs::cp::RB_RPTR_ADDR, self.memstore.base + memstore::RPTR);
        self.regs.write(
            regs::cp::SCRATCH_ADDR,
            self.memstore.base + memstore::SOP_TIMESTAMP,
        );
        self.regs.write(regs::cp::SCRATCH_MASK, 0x1);
        self.regs
            .write(regs::cp::QUEUE_THRESHOLDS, regs::cp::QUEUE_THRESHOLDS_DEFAULT);

        self.rptr = 0;
        self.wptr = 0;
        self.timestamp = 0;
        self.waiter.reset();

        // Release the micro-engine, then feed it its init packet.
        self.regs.write(regs::cp::ME_CNTL, 0);
        self.started = true;

        let init = [
            pm4::type3_packet(Opcode::EngineInit, 5),
            0x0000_03ff, // all config fields present
            0,           // real-time stream processing off
            0,           // implicit synchronization off
            1,           // maximum in-flight contexts
            pm4::PROTECTED_MODE_CONTROL,
        ];
        let start = self.allocate(init.len() as u32)?;
        self.write_at(start, &init);
        self.wptr = start + init.len() as u32;
        self.submit();

        debug!(
            size_dwords = self.size_dwords,
            base = self.buffer.base,
            "ring started"
        );
        Ok(())
    }

    /// Halt the micro-engine and fail outstanding waiters.
    pub fn stop(&mut self) {
        if !self.started {
            return;
        }
        self.regs.write(regs::cp::ME_CNTL, regs::cp::ME_HALT);
        self.started = false;
        self.watchdog.rptr_sample = None;
        self.waiter.destroy();
    }

    /// Release backing memory. The ring must be stopped.
    pub fn close(&mut self, alloc: &dyn ContiguousAllocator) {
        self.stop();
        alloc.free(self.buffer);
        alloc.free(self.memstore);
    }

    /// Periodic hang check: returns true when the ring is non-empty and the
    /// read pointer did not advance since the previous tick.
    pub fn watchdog_tick(&mut self) -> bool {
        if !self.started {
            return false;
        }
        self.read_rptr();
        if self.rptr != self.wptr {
            if self.watchdog.rptr_sample == Some(self.rptr) {
                warn!(rptr = self.rptr, wptr = self.wptr, "core hang detected");
                return true;
            }
            self.watchdog.rptr_sample = Some(self.rptr);
        } else {
            self.watchdog.rptr_sample = None;
        }
        false
    }
}
