//! Software model of the device used by the integration suites: a register
//! file, shared memory, a bump allocator, and a command processor that
//! executes the ring the way hardware would — advancing the read-pointer
//! shadow, applying in-stream register writes, stamping timestamps, and
//! latching interrupt status.
#![allow(dead_code)] // each suite uses a different slice of the harness

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use vermilion_gpu::pm4;
use vermilion_gpu::regs;
use vermilion_gpu::{DeviceConfig, ProcessId, WaitBackend};
use vermilion_hal::{
    AllocError, ContiguousAllocator, Hal, MemRegion, MemoryBus, PowerControl, PowerState,
    RegisterBus,
};

pub const TEST_OWNER: ProcessId = ProcessId(100);

struct SimState {
    mem: Vec<u8>,
    regs: HashMap<u32, u32>,
    /// Every CPU-side register write, in order.
    reg_writes: Vec<(u32, u32)>,
    /// Register writes executed from the command stream, in order.
    stream_writes: Vec<(u32, u32)>,
    power: Vec<PowerState>,
    alloc_next: u32,
    freed: Vec<MemRegion>,
    /// When false, ring processing stops until [`SimHw::step`].
    auto_process: bool,
}

pub struct SimHw {
    state: Mutex<SimState>,
}

impl SimHw {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SimState {
                mem: vec![0; 16 << 20],
                regs: HashMap::new(),
                reg_writes: Vec::new(),
                stream_writes: Vec::new(),
                power: Vec::new(),
                alloc_next: 0x1000,
                freed: Vec::new(),
                auto_process: true,
            }),
        })
    }

    pub fn hal(hw: &Arc<Self>) -> Hal {
        Hal {
            regs: Arc::clone(hw) as Arc<dyn RegisterBus>,
            mem: Arc::clone(hw) as Arc<dyn MemoryBus>,
            alloc: Arc::clone(hw) as Arc<dyn ContiguousAllocator>,
            power: Arc::clone(hw) as Arc<dyn PowerControl>,
        }
    }

    pub fn reg(&self, offset: u32) -> u32 {
        *self.state.lock().unwrap().regs.get(&offset).unwrap_or(&0)
    }

    pub fn set_reg(&self, offset: u32, value: u32) {
        self.state.lock().unwrap().regs.insert(offset, value);
    }

    pub fn mem_u32(&self, addr: u32) -> u32 {
        let state = self.state.lock().unwrap();
        let a = addr as usize;
        u32::from_le_bytes(state.mem[a..a + 4].try_into().unwrap())
    }

    pub fn set_mem_u32(&self, addr: u32, value: u32) {
        let mut state = self.state.lock().unwrap();
        let a = addr as usize;
        state.mem[a..a + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Suspend automatic ring processing; commands queue until [`step`].
    ///
    /// [`step`]: SimHw::step
    pub fn set_auto_process(&self, auto: bool) {
        self.state.lock().unwrap().auto_process = auto;
    }

    /// Process everything currently queued in the ring.
    pub fn step(&self) {
        let mut state = self.state.lock().unwrap();
        let wptr = *state.regs.get(&regs::cp::RB_WPTR).unwrap_or(&0);
        Self::process_ring(&mut state, wptr);
    }

    /// CPU-visible register writes made to `offset`, oldest first.
    pub fn writes_to(&self, offset: u32) -> Vec<u32> {
        self.state
            .lock()
            .unwrap()
            .reg_writes
            .iter()
            .filter(|(o, _)| *o == offset)
            .map(|(_, v)| *v)
            .collect()
    }

    /// Register writes executed from inside the command stream, oldest first.
    pub fn stream_writes_to(&self, offset: u32) -> Vec<u32> {
        self.state
            .lock()
            .unwrap()
            .stream_writes
            .iter()
            .filter(|(o, _)| *o == offset)
            .map(|(_, v)| *v)
            .collect()
    }

    pub fn power_transitions(&self) -> Vec<PowerState> {
        self.state.lock().unwrap().power.clone()
    }

    pub fn freed_regions(&self) -> Vec<MemRegion> {
        self.state.lock().unwrap().freed.clone()
    }

    /// Latch an interrupt status bit the way hardware would, raising the
    /// block's master-signal bit.
    pub fn raise_irq(&self, status_reg: u32, bits: u32, signal_bit: u32) {
        let mut state = self.state.lock().unwrap();
        let status = state.regs.get(&status_reg).copied().unwrap_or(0) | bits;
        state.regs.insert(status_reg, status);
        let signal = state
            .regs
            .get(&regs::master::INT_SIGNAL)
            .copied()
            .unwrap_or(0)
            | signal_bit;
        state.regs.insert(regs::master::INT_SIGNAL, signal);
    }

    fn mem_word(state: &SimState, addr: u32) -> u32 {
        let a = addr as usize;
        u32::from_le_bytes(state.mem[a..a + 4].try_into().unwrap())
    }

    fn set_mem_word(state: &mut SimState, addr: u32, value: u32) {
        let a = addr as usize;
        state.mem[a..a + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn latch_irq(state: &mut SimState, status_reg: u32, bits: u32, signal_bit: u32) {
        let status = state.regs.get(&status_reg).copied().unwrap_or(0) | bits;
        state.regs.insert(status_reg, status);
        let signal = state
            .regs
            .get(&regs::master::INT_SIGNAL)
            .copied()
            .unwrap_or(0)
            | signal_bit;
        state.regs.insert(regs::master::INT_SIGNAL, signal);
    }

    /// Execute one register write issued from the command stream.
    fn exec_stream_reg_write(state: &mut SimState, reg: u32, value: u32) {
        state.regs.insert(reg, value);
        state.stream_writes.push((reg, value));
        if reg == regs::cp::TIMESTAMP {
            // The scratch mechanism mirrors the timestamp register to memory.
            let scratch = state
                .regs
                .get(&regs::cp::SCRATCH_ADDR)
                .copied()
                .unwrap_or(0);
            if scratch != 0 {
                Self::set_mem_word(state, scratch, value);
            }
        }
    }

    /// Execute the packets of an indirect buffer.
    fn exec_buffer(state: &mut SimState, base: u32, size_dwords: u32) {
        let mut i = 0;
        while i < size_dwords {
            let header = Self::mem_word(state, base + i * 4);
            i += Self::exec_packet(state, base + i * 4, header);
        }
    }

    /// Execute one packet at `addr`; returns its span in dwords.
    fn exec_packet(state: &mut SimState, addr: u32, header: u32) -> u32 {
        match header & pm4::PKT_MASK {
            pm4::TYPE2 => 1,
            pm4::TYPE0 => {
                let count = pm4::header_count(header);
                let reg = pm4::header_reg(header);
                for j in 0..count {
                    let value = Self::mem_word(state, addr + (1 + j) * 4);
                    Self::exec_stream_reg_write(state, reg + j, value);
                }
                count + 1
            }
            pm4::TYPE3 => {
                let count = pm4::header_count(header);
                let opcode = pm4::header_opcode(header);
                let ordinal = |state: &SimState, j: u32| Self::mem_word(state, addr + j * 4);
                if opcode == pm4::Opcode::EventWrite as u32
                    && ordinal(state, 1) == pm4::CACHE_FLUSH_TS
                {
                    let dest = ordinal(state, 2);
                    let value = ordinal(state, 3);
                    Self::set_mem_word(state, dest, value);
                } else if opcode == pm4::Opcode::Interrupt as u32 {
                    let bits = ordinal(state, 1);
                    Self::latch_irq(
                        state,
                        regs::cp::INT_STATUS,
                        bits,
                        regs::master::SIGNAL_CP,
                    );
                } else if opcode == pm4::Opcode::IndirectBufferPfd as u32 {
                    let ib_addr = ordinal(state, 1);
                    let ib_size = ordinal(state, 2);
                    Self::exec_buffer(state, ib_addr, ib_size);
                }
                count + 1
            }
            _ => 1,
        }
    }

    /// Consume ring packets from the read pointer up to `wptr`.
    fn process_ring(state: &mut SimState, wptr: u32) {
        let base = match state.regs.get(&regs::cp::RB_BASE) {
            Some(b) => *b,
            None => return,
        };
        let rptr_addr = match state.regs.get(&regs::cp::RB_RPTR_ADDR) {
            Some(a) => *a,
            None => return,
        };
        let cntl = state.regs.get(&regs::cp::RB_CNTL).copied().unwrap_or(0);
        let size_dwords = 2u32 << (cntl & 0x3f);

        let mut rptr = Self::mem_word(state, rptr_addr);
        let mut budget = size_dwords * 4;
        while rptr != wptr && budget > 0 {
            let header = Self::mem_word(state, base + rptr * 4);
            let span = Self::exec_packet(state, base + rptr * 4, header);
            rptr = (rptr + span) % size_dwords;
            budget = budget.saturating_sub(span);
        }
        Self::set_mem_word(state, rptr_addr, rptr);
        state.regs.insert(regs::cp::RB_RPTR, rptr);
    }
}

impl RegisterBus for SimHw {
    fn read(&self, offset: u32) -> u32 {
        *self.state.lock().unwrap().regs.get(&offset).unwrap_or(&0)
    }

    fn write(&self, offset: u32, value: u32) {
        let mut state = self.state.lock().unwrap();
        state.reg_writes.push((offset, value));
        state.regs.insert(offset, value);

        // Interrupt clear registers acknowledge latched status and recompute
        // the master signal bit.
        let clear_map = [
            (regs::cp::INT_CLEAR, regs::cp::INT_STATUS, regs::master::SIGNAL_CP),
            (regs::mh::INT_CLEAR, regs::mh::INT_STATUS, regs::master::SIGNAL_MH),
            (
                regs::core::INT_CLEAR,
                regs::core::INT_STATUS,
                regs::master::SIGNAL_CORE,
            ),
            (regs::sq::INT_CLEAR, regs::sq::INT_STATUS, regs::master::SIGNAL_SQ),
        ];
        for (clear, status_reg, signal_bit) in clear_map {
            if offset == clear {
                let status = state.regs.get(&status_reg).copied().unwrap_or(0) & !value;
                state.regs.insert(status_reg, status);
                if status == 0 {
                    let signal = state
                        .regs
                        .get(&regs::master::INT_SIGNAL)
                        .copied()
                        .unwrap_or(0)
                        & !signal_bit;
                    state.regs.insert(regs::master::INT_SIGNAL, signal);
                }
            }
        }

        if offset == regs::cp::RB_WPTR && state.auto_process {
            Self::process_ring(&mut state, value);
        }
    }
}

impl MemoryBus for SimHw {
    fn read_physical(&self, addr: u32, buf: &mut [u8]) {
        let state = self.state.lock().unwrap();
        let a = addr as usize;
        buf.copy_from_slice(&state.mem[a..a + buf.len()]);
    }

    fn write_physical(&self, addr: u32, buf: &[u8]) {
        let mut state = self.state.lock().unwrap();
        let a = addr as usize;
        state.mem[a..a + buf.len()].copy_from_slice(buf);
    }
}

impl ContiguousAllocator for SimHw {
    fn alloc(&self, size: u32, align: u32) -> Result<MemRegion, AllocError> {
        let mut state = self.state.lock().unwrap();
        let base = (state.alloc_next + align - 1) & !(align - 1);
        if (base + size) as usize > state.mem.len() {
            return Err(AllocError::OutOfMemory { size });
        }
        state.alloc_next = base + size;
        Ok(MemRegion { base, size })
    }

    fn free(&self, region: MemRegion) {
        self.state.lock().unwrap().freed.push(region);
    }
}

impl PowerControl for SimHw {
    fn set_power_state(&self, state: PowerState) {
        self.state.lock().unwrap().power.push(state);
    }
}

/// Device configuration shrunk for fast tests.
pub fn test_config() -> DeviceConfig {
    DeviceConfig {
        ring_size_dwords: 1024,
        va_range: 0x0010_0000,
        gmem_size: 0x0001_0000,
        context_pool_size: 4,
        issue_timeout: Duration::from_millis(50),
        idle_timeout: Duration::from_millis(50),
        ..DeviceConfig::default()
    }
}

/// Same, but with the polling wait backend.
pub fn test_config_polling() -> DeviceConfig {
    DeviceConfig {
        wait_backend: WaitBackend::Polling,
        ..test_config()
    }
}
