//! Vermilion GPU command-processor device core.
//!
//! This crate is the device-independent heart of the driver: everything
//! between the platform boundary (`vermilion-hal`) and the caller-facing
//! submission API.
//!
//! - [`intr`] — interrupt dispatcher: block status/clear/mask servicing and
//!   typed per-source handlers.
//! - [`mmu`] — per-process GPU page tables with refcounted sharing and
//!   super-PTE TLB-flush tracking.
//! - [`ring`] — the command ring: wrap-safe word queue, timestamp fences,
//!   and the wait primitives built on them.
//! - [`drawctxt`] — draw-context pool and the register/shader/GMEM
//!   save-restore streams emitted on context switches.
//! - [`device`] — orchestration: lifecycle, interrupt wiring, the dual-path
//!   page-table-switch protocol, and the submission path.
//!
//! The main entry point is [`Device`]: construct one with [`Device::init`],
//! call [`Device::start`], then submit command buffers with
//! [`Device::submit`] and synchronize with [`Device::wait_timestamp`].
#![forbid(unsafe_code)]

pub mod config;
pub mod device;
pub mod drawctxt;
pub mod error;
pub mod intr;
pub mod mmu;
pub mod pm4;
pub mod regs;
pub mod ring;

pub use config::DeviceConfig;
pub use device::{Device, DeviceInfo, PowerProp};
pub use drawctxt::{ContextKind, GmemShadowDesc, Rect, SwitchFlags};
pub use error::{Error, Result};
pub use intr::{IrqBlock, IrqSource};
pub use mmu::{ProcessId, PteAccess, Scatterlist};
pub use ring::{Timestamp, TimestampKind, WaitBackend};
