use std::time::Duration;

use crate::mmu::ProcessId;
use crate::ring::WaitBackend;

/// Static device configuration, fixed at init time.
#[derive(Clone, Debug)]
pub struct DeviceConfig {
    pub chip_id: u32,
    /// Ring size in dwords; must be a power of two.
    pub ring_size_dwords: u32,
    /// Quadwords the engine reads before refreshing the read-pointer shadow,
    /// as log2.
    pub rb_blk_size_log2_qwords: u32,
    pub wait_backend: WaitBackend,
    /// One page table per client process, or a single global table.
    pub per_process_pagetables: bool,
    pub mmu_enable: bool,
    /// GPU virtual range translated by the MMU. `va_range` must be a
    /// multiple of 64 KiB.
    pub va_base: u32,
    pub va_range: u32,
    /// Physical range the memory protection unit lets the core touch.
    pub mpu_base: u32,
    pub mpu_range: u32,
    /// On-chip memory aperture. `gmem_base` must be aligned to `gmem_size`.
    pub gmem_base: u32,
    pub gmem_size: u32,
    pub context_pool_size: usize,
    pub max_client_processes: usize,
    pub issue_timeout: Duration,
    pub idle_timeout: Duration,
    /// Owner of the page table created at init, before any client attaches.
    pub init_owner: ProcessId,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            chip_id: 0x0201_0043,
            ring_size_dwords: 2048,
            rb_blk_size_log2_qwords: 4,
            wait_backend: WaitBackend::Interrupt,
            per_process_pagetables: true,
            mmu_enable: true,
            va_base: 0x1000_0000,
            va_range: 0x0100_0000,
            mpu_base: 0,
            mpu_range: 0xfff0_0000,
            gmem_base: 0x0010_0000,
            gmem_size: 0x0004_0000,
            context_pool_size: 20,
            max_client_processes: 16,
            issue_timeout: Duration::from_millis(400),
            idle_timeout: Duration::from_millis(800),
            init_owner: ProcessId::GLOBAL,
        }
    }
}
