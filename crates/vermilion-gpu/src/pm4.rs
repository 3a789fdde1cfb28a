//! Command-stream packet encoding.
//!
//! The command processor consumes three packet shapes:
//!
//! - **type 0** — burst register write: header carries a base register and a
//!   count, followed by `count` data words;
//! - **type 2** — single-word filler, ignored by the engine;
//! - **type 3** — opcode packet: header carries an opcode and a count,
//!   followed by `count` operand words.
//!
//! Header layout (bits 31..30 = packet type):
//! `type | (count - 1) << 16 | type0: base register / type3: opcode << 8`.

pub const PKT_MASK: u32 = 0x3 << 30;
pub const TYPE0: u32 = 0x0 << 30;
pub const TYPE2: u32 = 0x2 << 30;
pub const TYPE3: u32 = 0x3 << 30;

const COUNT_MASK: u32 = 0x3fff;
const REG_MASK: u32 = 0x7fff;

/// Type-3 opcodes used by the device core.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Nop = 0x10,
    IndirectBufferPfd = 0x37,
    WaitForIdle = 0x26,
    RegRmw = 0x21,
    RegToMem = 0x3e,
    SetConstant = 0x2d,
    LoadConstantContext = 0x2e,
    DrawIndexedBin = 0x34,
    SetBinBaseOffset = 0x35,
    EventWrite = 0x46,
    Interrupt = 0x54,
    EngineInit = 0x48,
}

/// Event id for [`Opcode::EventWrite`]: flush caches, then stamp a timestamp
/// to memory.
pub const CACHE_FLUSH_TS: u32 = 4;

/// Engine-init word enabling protected-mode error checking for register
/// writes below this address. Zero disables checking entirely.
pub const PROTECTED_MODE_CONTROL: u32 = 0x0000_0200;
const ENGINE_INIT_CONFIG_SELECT: u32 = 0x0000_0080;

#[inline]
pub fn type0_packet(reg: u32, count: u32) -> u32 {
    debug_assert!(count >= 1);
    TYPE0 | ((count - 1) & COUNT_MASK) << 16 | (reg & REG_MASK)
}

#[inline]
pub fn type2_packet() -> u32 {
    TYPE2
}

#[inline]
pub fn type3_packet(opcode: Opcode, count: u32) -> u32 {
    debug_assert!(count >= 1);
    TYPE3 | ((count - 1) & COUNT_MASK) << 16 | (opcode as u32) << 8
}

/// NOP packet covering `1 + count` ring words (header plus `count` payload
/// words the engine skips). Used to pad out to the end of the ring before a
/// wrap.
#[inline]
pub fn nop_packet(count: u32) -> u32 {
    type3_packet(Opcode::Nop, count)
}

#[inline]
pub fn header_count(header: u32) -> u32 {
    ((header >> 16) & COUNT_MASK) + 1
}

#[inline]
pub fn header_opcode(header: u32) -> u32 {
    (header >> 8) & 0xff
}

#[inline]
pub fn header_reg(header: u32) -> u32 {
    header & REG_MASK
}

/// `WAIT_FOR_IDLE` — stall the engine until all prior work drains.
pub fn wait_for_idle() -> [u32; 2] {
    [type3_packet(Opcode::WaitForIdle, 1), 0]
}

/// Single-register write through the command stream.
pub fn reg_write(reg: u32, value: u32) -> [u32; 2] {
    [type0_packet(reg, 1), value]
}

/// Reference to an indirect buffer: the engine fetches `size_dwords` words
/// from `addr` before resuming the ring.
pub fn indirect_buffer(addr: u32, size_dwords: u32) -> [u32; 3] {
    [
        type3_packet(Opcode::IndirectBufferPfd, 2),
        addr,
        size_dwords,
    ]
}

/// Copy `count` registers starting at `reg` into memory at `dest`.
pub fn reg_to_mem(reg: u32, count: u32, dest: u32) -> [u32; 3] {
    debug_assert!(count >= 1);
    [
        type3_packet(Opcode::RegToMem, 2),
        (reg & REG_MASK) | (count - 1) << 16,
        dest,
    ]
}

/// Load `count` register/constant words from memory at `src` back into the
/// register file starting at `reg`. Inverse of [`reg_to_mem`].
pub fn load_constant_context(src: u32, reg: u32, count: u32) -> [u32; 3] {
    debug_assert!(count >= 1);
    [
        type3_packet(Opcode::LoadConstantContext, 2),
        src,
        (reg & REG_MASK) | (count - 1) << 16,
    ]
}

/// Read-modify-write of a register: `reg = (reg & and_mask) | or_mask`.
pub fn reg_rmw(reg: u32, and_mask: u32, or_mask: u32) -> [u32; 4] {
    [
        type3_packet(Opcode::RegRmw, 3),
        reg & REG_MASK,
        and_mask,
        or_mask,
    ]
}

/// Engine-config update packet toggling protected-mode error checking.
pub fn engine_config(protected_mode: u32) -> [u32; 3] {
    [
        type3_packet(Opcode::EngineInit, 2),
        ENGINE_INIT_CONFIG_SELECT,
        protected_mode,
    ]
}

/// Dummy indexed-bin draw against `scratch`: fills the vertex prefetch fifo
/// without touching real state. Part of the page-table switch fence.
pub fn dummy_draw_indexed_bin(scratch: u32) -> [u32; 7] {
    [
        type3_packet(Opcode::DrawIndexedBin, 6),
        0,           // viz query info
        0x0003_c004, // draw indicator
        0,           // bin base
        3,           // bin size
        scratch,     // dma base
        6,           // dma size
    ]
}
