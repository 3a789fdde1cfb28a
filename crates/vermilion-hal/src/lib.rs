//! Platform boundary for the Vermilion device core.
//!
//! The device core never touches hardware directly; everything it needs from
//! the platform comes through the traits in this crate:
//!
//! - [`RegisterBus`] — the memory-mapped register block of the device,
//! - [`MemoryBus`] — bus-addressable shared memory (command buffers, page
//!   tables, timestamp writeback live here),
//! - [`ContiguousAllocator`] — physically-contiguous allocations carved out
//!   of the shared region,
//! - [`PowerControl`] — clock/power rail switching.
//!
//! Implementations provide their own interior mutability: all trait methods
//! take `&self` so a single implementation can be shared between submission
//! threads and the interrupt path. Register and memory accesses are
//! synchronous and ordered with respect to one caller; serializing *across*
//! callers is the device core's responsibility.
#![forbid(unsafe_code)]

pub mod bus;
pub mod mem;
pub mod power;

pub use bus::RegisterBus;
pub use mem::{AllocError, ContiguousAllocator, MemRegion, MemoryBus};
pub use power::{PowerControl, PowerState};

use std::sync::Arc;

/// Bundle of platform services handed to the device core at init time.
#[derive(Clone)]
pub struct Hal {
    pub regs: Arc<dyn RegisterBus>,
    pub mem: Arc<dyn MemoryBus>,
    pub alloc: Arc<dyn ContiguousAllocator>,
    pub power: Arc<dyn PowerControl>,
}
