//! Draw-context management.
//!
//! A draw context is a saved snapshot of register, shader, and GMEM state
//! representing one rendering session. Contexts come from a fixed-size pool;
//! each owns a GPU-state shadow allocation laid out as:
//!
//! ```text
//! +------------------+----------------------+------------------------+
//! | register shadow  | command-buffer space | shader instr shadow x3 |
//! +------------------+----------------------+------------------------+
//! ```
//!
//! The command-buffer space holds prebuilt indirect buffers: register
//! save/restore, shader save/fixup/restore, the chicken-register restore
//! that must follow every GMEM copy, and one save/restore stream per GMEM
//! shadow. Switching contexts emits these buffers through the ring engine
//! ([`plan_switch`] produces the ordered segment list; the device core
//! issues it), so a switch inherits the ring's ordering guarantee and the
//! caller may pipeline further submissions immediately.
//!
//! GMEM itself is not part of the per-context shadow by default: its
//! contents survive a switch only through the copy-out/copy-in streams
//! against a shadow buffer — either the context-private one allocated at
//! create time or up to two caller-bound regions ([`bind_gmem_shadow`]).

use bitflags::bitflags;
use tracing::debug;
use vermilion_hal::{ContiguousAllocator, MemRegion, MemoryBus};

use crate::error::{Error, Result};
use crate::mmu::ProcessId;
use crate::pm4;
use crate::regs;

const REG_SHADOW_SIZE: u32 = 0x1000;
const CMD_BUFFER_SIZE: u32 = 0x1000;
const SHADER_SHADOW_SIZE: u32 = 0x1800;

const REG_OFFSET: u32 = 0;
const CMD_OFFSET: u32 = REG_OFFSET + REG_SHADOW_SIZE;
const SHADER_OFFSET: u32 = CMD_OFFSET + CMD_BUFFER_SIZE;

/// Total size of a context's GPU-state shadow allocation.
pub const CONTEXT_SIZE: u32 = SHADER_OFFSET + 3 * SHADER_SHADOW_SIZE;

// Fixed offsets of the prebuilt command streams inside the command-buffer
// space.
const CMD_REG_SAVE: u32 = 0x000;
const CMD_REG_RESTORE: u32 = 0x100;
const CMD_SHADER_SAVE: u32 = 0x200;
const CMD_SHADER_FIXUP: u32 = 0x280;
const CMD_SHADER_RESTORE: u32 = 0x300;
const CMD_CHICKEN_RESTORE: u32 = 0x380;
const CMD_GMEM_SAVE: u32 = 0x400;
const CMD_GMEM_RESTORE: u32 = 0x800;
const CMD_GMEM_STRIDE: u32 = 0x100;

/// Register ranges captured in the state shadow, as `(base, count)`.
const REG_RANGES: &[(u32, u32)] = &[
    (regs::sq::VS_PROGRAM, 4),
    (regs::tp::CHICKEN, 1),
    (regs::gmem::COPY_CONTROL, 5),
];

/// Shader state captured separately from the register shadow, since the
/// instruction store is only reachable while the engine is out of protected
/// mode.
const SHADER_RANGES: &[(u32, u32)] = &[
    (regs::sq::INSTRUCTION_BASE, 1),
    (regs::sq::PROGRAM_CNTL, 1),
];

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ContextFlags: u32 {
        /// The context owns a GPU-state shadow allocation.
        const STATE_SHADOW = 1 << 0;
        /// At least one GMEM shadow buffer is bound.
        const GMEM_SHADOW = 1 << 1;
        /// GMEM must be copied out on the next switch away.
        const GMEM_SAVE = 1 << 2;
        /// GMEM must be copied back in on the next switch in.
        const GMEM_RESTORE = 1 << 3;
        /// Shader state must be captured on the next switch away.
        const SHADER_SAVE = 1 << 4;
        /// Shader state must be reloaded on the next switch in.
        const SHADER_RESTORE = 1 << 5;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SwitchFlags: u32 {
        /// Preserve GMEM contents across the switch.
        const SAVE_GMEM = 1 << 0;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContextKind {
    Render3d,
    Render2d,
}

/// Number of caller-bound GMEM shadow slots per context.
pub const USER_GMEM_SHADOWS: usize = 2;

/// Rectangle within GMEM, in pixels. `x`, `y`, `width`, and `height` must be
/// even; `pitch` a multiple of 32.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
}

/// Caller-provided GMEM shadow buffer description.
#[derive(Clone, Copy, Debug)]
pub struct GmemShadowDesc {
    pub region: MemRegion,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
}

/// A bound GMEM shadow with its prebuilt copy streams.
#[derive(Clone, Copy, Debug)]
pub struct GmemShadow {
    pub region: MemRegion,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    /// Byte offset of the rectangle inside GMEM.
    pub gmem_offset: u32,
    /// Indirect-buffer references for the copy-out / copy-in streams.
    pub save_ib: [u32; 3],
    pub restore_ib: [u32; 3],
    /// Private shadows are released when the context goes away; user-bound
    /// ones belong to the caller.
    owned: bool,
}

pub struct DrawContext {
    pub owner: ProcessId,
    pub kind: ContextKind,
    pub flags: ContextFlags,
    pub gpustate: MemRegion,
    pub reg_save: [u32; 3],
    pub reg_restore: [u32; 3],
    pub shader_save: [u32; 3],
    pub shader_fixup: [u32; 3],
    pub shader_restore: [u32; 3],
    pub chicken_restore: [u32; 3],
    /// Context-private GMEM shadow, used when no user shadow is bound.
    pub gmem_shadow: Option<GmemShadow>,
    pub user_gmem_shadow: [Option<GmemShadow>; USER_GMEM_SHADOWS],
}

impl DrawContext {
    fn active_gmem_shadows(&self) -> Vec<&GmemShadow> {
        let user: Vec<&GmemShadow> = self.user_gmem_shadow.iter().flatten().collect();
        if !user.is_empty() {
            return user;
        }
        self.gmem_shadow.iter().collect()
    }
}

/// One ring submission of a context switch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SwitchSegment {
    pub words: Vec<u32>,
    pub owner: ProcessId,
    /// Whether the segment needs protected-mode error checking suspended.
    pub pmode_off: bool,
}

fn write_ib(mem: &dyn MemoryBus, addr: u32, words: &[u32]) -> [u32; 3] {
    mem.write_u32_slice(addr, words);
    pm4::indirect_buffer(addr, words.len() as u32)
}

fn build_reg_save(shadow_base: u32) -> Vec<u32> {
    let mut words = Vec::new();
    let mut offset = 0;
    for &(reg, count) in REG_RANGES {
        words.extend_from_slice(&pm4::reg_to_mem(reg, count, shadow_base + offset));
        offset += count * 4;
    }
    words
}

fn build_reg_restore(shadow_base: u32) -> Vec<u32> {
    let mut words = Vec::new();
    let mut offset = 0;
    for &(reg, count) in REG_RANGES {
        words.extend_from_slice(&pm4::load_constant_context(shadow_base + offset, reg, count));
        offset += count * 4;
    }
    words
}

fn build_shader_save(shadow_base: u32) -> Vec<u32> {
    let mut words = Vec::new();
    let mut offset = 0;
    for &(reg, count) in SHADER_RANGES {
        words.extend_from_slice(&pm4::reg_to_mem(reg, count, shadow_base + offset));
        offset += count * 4;
    }
    words
}

fn build_shader_fixup() -> Vec<u32> {
    // Re-derive the instruction-store partitioning after a save clobbers it.
    pm4::reg_rmw(regs::sq::PROGRAM_CNTL, 0xffff_0000, 0).to_vec()
}

fn build_shader_restore(shadow_base: u32) -> Vec<u32> {
    let mut words = Vec::new();
    let mut offset = 0;
    for &(reg, count) in SHADER_RANGES {
        words.extend_from_slice(&pm4::load_constant_context(shadow_base + offset, reg, count));
        offset += count * 4;
    }
    words
}

fn build_chicken_restore() -> Vec<u32> {
    let mut words = Vec::new();
    words.extend_from_slice(&pm4::wait_for_idle());
    words.extend_from_slice(&pm4::reg_write(regs::tp::CHICKEN, regs::tp::CHICKEN_DEFAULT));
    words
}

/// Copy stream between a GMEM rectangle and its shadow buffer. Save and
/// restore differ only in the direction bit of the kick; everything else is
/// identical, which is what makes a save/restore pair an exact inverse.
fn build_gmem_copy(
    shadow_region: MemRegion,
    shadow_offset: u32,
    pitch: u32,
    width: u32,
    height: u32,
    gmem_offset: u32,
    to_mem: bool,
) -> Vec<u32> {
    let dir = if to_mem {
        regs::gmem::COPY_GMEM_TO_MEM
    } else {
        regs::gmem::COPY_MEM_TO_GMEM
    };
    let mut words = Vec::new();
    words.extend_from_slice(&pm4::wait_for_idle());
    words.extend_from_slice(&pm4::reg_write(
        regs::gmem::COPY_MEM_BASE,
        shadow_region.base + shadow_offset,
    ));
    words.extend_from_slice(&pm4::reg_write(regs::gmem::COPY_MEM_PITCH, pitch));
    words.extend_from_slice(&pm4::reg_write(regs::gmem::COPY_GMEM_OFFSET, gmem_offset));
    words.extend_from_slice(&pm4::reg_write(
        regs::gmem::COPY_SIZE,
        height << 16 | width,
    ));
    // The kick; the following wait fences the copy before any further state
    // changes.
    words.extend_from_slice(&pm4::reg_write(regs::gmem::COPY_CONTROL, dir));
    words.extend_from_slice(&pm4::wait_for_idle());
    words
}

fn build_gmem_shadow(
    mem: &dyn MemoryBus,
    ctx_cmd_base: u32,
    slot: u32,
    region: MemRegion,
    shadow_offset: u32,
    width: u32,
    height: u32,
    pitch: u32,
    gmem_offset: u32,
    owned: bool,
) -> GmemShadow {
    let save_addr = ctx_cmd_base + CMD_GMEM_SAVE + slot * CMD_GMEM_STRIDE;
    let restore_addr = ctx_cmd_base + CMD_GMEM_RESTORE + slot * CMD_GMEM_STRIDE;
    let save = build_gmem_copy(region, shadow_offset, pitch, width, height, gmem_offset, true);
    let restore = build_gmem_copy(region, shadow_offset, pitch, width, height, gmem_offset, false);
    GmemShadow {
        region,
        width,
        height,
        pitch,
        gmem_offset,
        save_ib: write_ib(mem, save_addr, &save),
        restore_ib: write_ib(mem, restore_addr, &restore),
        owned,
    }
}

pub struct ContextPool {
    slots: Vec<Option<DrawContext>>,
    active: Option<usize>,
    gmem_size: u32,
}

impl ContextPool {
    pub fn new(pool_size: usize, gmem_size: u32) -> Self {
        Self {
            slots: (0..pool_size).map(|_| None).collect(),
            active: None,
            gmem_size,
        }
    }

    pub fn active(&self) -> Option<usize> {
        self.active
    }

    pub fn count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn get(&self, id: usize) -> Result<&DrawContext> {
        self.slots
            .get(id)
            .and_then(|s| s.as_ref())
            .ok_or(Error::BadParameter)
    }

    pub fn get_mut(&mut self, id: usize) -> Result<&mut DrawContext> {
        self.slots
            .get_mut(id)
            .and_then(|s| s.as_mut())
            .ok_or(Error::BadParameter)
    }

    /// Allocate a context from the pool, build its state shadow and command
    /// streams, and attach a context-private GMEM shadow. Failures leave the
    /// pool and every other context untouched.
    pub fn create(
        &mut self,
        mem: &dyn MemoryBus,
        alloc: &dyn ContiguousAllocator,
        kind: ContextKind,
        owner: ProcessId,
    ) -> Result<usize> {
        let index = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(Error::NoMoreAvailable)?;

        let gpustate = alloc
            .alloc(CONTEXT_SIZE, crate::mmu::PAGE_SIZE)
            .map_err(|_| Error::SystemError)?;
        mem.fill_u32(gpustate.base, 0, CONTEXT_SIZE / 4);

        let gmem_region = match alloc.alloc(self.gmem_size, crate::mmu::PAGE_SIZE) {
            Ok(region) => region,
            Err(_) => {
                alloc.free(gpustate);
                return Err(Error::SystemError);
            }
        };

        let cmd_base = gpustate.base + CMD_OFFSET;
        let reg_shadow = gpustate.base + REG_OFFSET;
        let shader_shadow = gpustate.base + SHADER_OFFSET;

        let mut ctx = DrawContext {
            owner,
            kind,
            flags: ContextFlags::STATE_SHADOW | ContextFlags::SHADER_SAVE,
            gpustate,
            reg_save: write_ib(mem, cmd_base + CMD_REG_SAVE, &build_reg_save(reg_shadow)),
            reg_restore: write_ib(
                mem,
                cmd_base + CMD_REG_RESTORE,
                &build_reg_restore(reg_shadow),
            ),
            shader_save: write_ib(
                mem,
                cmd_base + CMD_SHADER_SAVE,
                &build_shader_save(shader_shadow),
            ),
            shader_fixup: write_ib(mem, cmd_base + CMD_SHADER_FIXUP, &build_shader_fixup()),
            shader_restore: write_ib(
                mem,
                cmd_base + CMD_SHADER_RESTORE,
                &build_shader_restore(shader_shadow),
            ),
            chicken_restore: write_ib(
                mem,
                cmd_base + CMD_CHICKEN_RESTORE,
                &build_chicken_restore(),
            ),
            gmem_shadow: None,
            user_gmem_shadow: [None; USER_GMEM_SHADOWS],
        };

        // Context-private shadow covering the whole aperture as a 512-pixel
        // wide surface; slot index past the user slots.
        let width = 512;
        let pitch = width * 4;
        ctx.gmem_shadow = Some(build_gmem_shadow(
            mem,
            cmd_base,
            USER_GMEM_SHADOWS as u32,
            gmem_region,
            0,
            width,
            self.gmem_size / pitch,
            pitch,
            0,
            true,
        ));
        ctx.flags |= ContextFlags::GMEM_SHADOW;

        debug!(index, owner = owner.0, ?kind, "created draw context");
        self.slots[index] = Some(ctx);
        Ok(index)
    }

    /// Bind (or unbind, when `buffer` is `None`) a caller-provided GMEM
    /// shadow region and rebuild its copy streams. Binding a user buffer
    /// releases the context-private shadow.
    pub fn bind_gmem_shadow(
        &mut self,
        mem: &dyn MemoryBus,
        alloc: &dyn ContiguousAllocator,
        id: usize,
        gmem_rect: &Rect,
        shadow_x: u32,
        shadow_y: u32,
        buffer: Option<&GmemShadowDesc>,
        buffer_id: usize,
    ) -> Result<()> {
        if buffer_id >= USER_GMEM_SHADOWS {
            return Err(Error::BadParameter);
        }
        let gmem_size = self.gmem_size;
        let ctx = self.get_mut(id)?;

        match buffer {
            None => {
                ctx.user_gmem_shadow[buffer_id] = None;
            }
            Some(desc) => {
                let even = |v: u32| v & 1 == 0;
                if !even(gmem_rect.x)
                    || !even(gmem_rect.y)
                    || !even(gmem_rect.width)
                    || !even(gmem_rect.height)
                    || gmem_rect.pitch % 32 != 0
                    || !even(shadow_x)
                    || !even(shadow_y)
                    || shadow_x < gmem_rect.x
                    || shadow_y < gmem_rect.y
                    || desc.pitch % 32 != 0
                {
                    return Err(Error::BadParameter);
                }

                let shadow_offset =
                    desc.pitch * (shadow_y - gmem_rect.y) + (shadow_x - gmem_rect.x) * 4;
                let gmem_offset = gmem_rect.pitch * gmem_rect.y + gmem_rect.x * 4;
                if gmem_offset >= gmem_size {
                    return Err(Error::BadParameter);
                }

                let cmd_base = ctx.gpustate.base + CMD_OFFSET;
                ctx.user_gmem_shadow[buffer_id] = Some(build_gmem_shadow(
                    mem,
                    cmd_base,
                    buffer_id as u32,
                    desc.region,
                    shadow_offset,
                    gmem_rect.width,
                    gmem_rect.height,
                    desc.pitch,
                    gmem_offset,
                    false,
                ));

                // A user shadow supersedes the context-private one.
                if let Some(private) = ctx.gmem_shadow.take() {
                    if private.owned {
                        alloc.free(private.region);
                    }
                }
            }
        }

        let any = ctx.user_gmem_shadow.iter().any(|s| s.is_some()) || ctx.gmem_shadow.is_some();
        ctx.flags.set(ContextFlags::GMEM_SHADOW, any);
        Ok(())
    }

    /// Compute the command segments for switching the active context.
    /// Mutates save/restore flags as the plan is formed and updates the
    /// active pointer; the caller must then issue every segment in order.
    pub fn plan_switch(
        &mut self,
        new: Option<usize>,
        flags: SwitchFlags,
    ) -> Result<Vec<SwitchSegment>> {
        if let Some(id) = new {
            let ctx = self.get_mut(id)?;
            ctx.flags
                .set(ContextFlags::GMEM_SAVE, flags.contains(SwitchFlags::SAVE_GMEM));
        }
        if self.active == new {
            return Ok(Vec::new());
        }

        let mut segments = Vec::new();

        if let Some(old_id) = self.active {
            let old = self.get_mut(old_id)?;
            let owner = old.owner;

            segments.push(SwitchSegment {
                words: old.reg_save.to_vec(),
                owner,
                pmode_off: false,
            });

            if old.flags.contains(ContextFlags::SHADER_SAVE) {
                segments.push(SwitchSegment {
                    words: old.shader_save.to_vec(),
                    owner,
                    pmode_off: true,
                });
                segments.push(SwitchSegment {
                    words: old.shader_fixup.to_vec(),
                    owner,
                    pmode_off: false,
                });
                old.flags |= ContextFlags::SHADER_RESTORE;
            }

            if old
                .flags
                .contains(ContextFlags::GMEM_SHADOW | ContextFlags::GMEM_SAVE)
            {
                let chicken = old.chicken_restore;
                let shadows: Vec<[u32; 3]> =
                    old.active_gmem_shadows().iter().map(|s| s.save_ib).collect();
                for save_ib in shadows {
                    segments.push(SwitchSegment {
                        words: save_ib.to_vec(),
                        owner,
                        pmode_off: true,
                    });
                    // The copy clobbers the chicken register.
                    segments.push(SwitchSegment {
                        words: chicken.to_vec(),
                        owner,
                        pmode_off: false,
                    });
                }
                old.flags |= ContextFlags::GMEM_RESTORE;
            }
        }

        self.active = new;

        if let Some(new_id) = new {
            let ctx = self.get_mut(new_id)?;
            let owner = ctx.owner;

            if ctx.flags.contains(ContextFlags::GMEM_RESTORE) {
                let chicken = ctx.chicken_restore;
                let shadows: Vec<[u32; 3]> =
                    ctx.active_gmem_shadows().iter().map(|s| s.restore_ib).collect();
                for restore_ib in shadows {
                    segments.push(SwitchSegment {
                        words: restore_ib.to_vec(),
                        owner,
                        pmode_off: true,
                    });
                    segments.push(SwitchSegment {
                        words: chicken.to_vec(),
                        owner,
                        pmode_off: false,
                    });
                }
                ctx.flags -= ContextFlags::GMEM_RESTORE;
            }

            segments.push(SwitchSegment {
                words: ctx.reg_restore.to_vec(),
                owner,
                pmode_off: false,
            });

            if ctx.flags.contains(ContextFlags::SHADER_RESTORE) {
                segments.push(SwitchSegment {
                    words: ctx.shader_restore.to_vec(),
                    owner,
                    pmode_off: false,
                });
            }
        }

        Ok(segments)
    }

    /// Drop a context's pending save obligations; used when the context is
    /// about to be destroyed and its state no longer matters.
    pub fn discard_pending_saves(&mut self, id: usize) -> Result<()> {
        let ctx = self.get_mut(id)?;
        ctx.flags -= ContextFlags::GMEM_SAVE | ContextFlags::SHADER_SAVE;
        Ok(())
    }

    /// Free a context's allocations and return its slot to the pool. The
    /// caller is responsible for having switched away first.
    pub fn release(&mut self, id: usize, alloc: &dyn ContiguousAllocator) -> Result<()> {
        let ctx = self
            .slots
            .get_mut(id)
            .and_then(|s| s.take())
            .ok_or(Error::BadParameter)?;
        debug_assert_ne!(self.active, Some(id));

        if ctx.flags.contains(ContextFlags::STATE_SHADOW) {
            alloc.free(ctx.gpustate);
        }
        if let Some(shadow) = ctx.gmem_shadow {
            if shadow.owned {
                alloc.free(shadow.region);
            }
        }
        debug!(id, "destroyed draw context");
        Ok(())
    }

    /// Tear down every context. Device-destroy path; no switch-away is
    /// emitted.
    pub fn release_all(&mut self, alloc: &dyn ContiguousAllocator) {
        self.active = None;
        for id in 0..self.slots.len() {
            let _ = self.release(id, alloc);
        }
    }
}
