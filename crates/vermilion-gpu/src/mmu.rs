//! GPU page-table management.
//!
//! One page table per client process (or a single shared table in global
//! mode), held in an arena keyed by owning process id and reference-counted:
//! a second attach by the same process returns the existing table, the last
//! detach frees it.
//!
//! A page table is a flat array of 32-bit entries, one per 4 KiB page:
//! physical page address in the upper bits, read/write permission in the low
//! bits. Translation hardware coalesces [`SUPER_PTE`] consecutive entries
//! into one TLB entry, which is why map/unmap track super-PTE boundaries: a
//! stale coalesced entry must force a TLB invalidate before the range can be
//! re-backed. The flush filter keeps one dirty bit per super-PTE group so
//! invalidates are only requested when a dirty group is actually touched
//! again.
//!
//! This module owns the table state only. Loading a table into hardware and
//! invalidating the TLB go through the device core, which picks the direct
//! register path or the in-stream command path depending on the run state
//! (see `Device::set_page_table`).

use std::collections::HashMap;

use bitflags::bitflags;
use tracing::debug;
use vermilion_hal::{ContiguousAllocator, MemRegion, MemoryBus};

use crate::error::{Error, Result};

pub const PAGE_SIZE: u32 = 4096;
pub const PAGE_SHIFT: u32 = 12;

/// Number of consecutive PTEs the TLB coalesces into one entry.
pub const SUPER_PTE: u32 = 8;

/// Guard entries past the end of the addressable range.
const PT_EXTRA_ENTRIES: u32 = 16;

const PTE_ADDR_MASK: u32 = !(PAGE_SIZE - 1);

bitflags! {
    /// Access permission bits of a page-table entry.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PteAccess: u32 {
        const WRITE = 1 << 0;
        const READ = 1 << 1;
    }
}

/// Owning process of a page table. In global-table mode every caller maps to
/// [`ProcessId::GLOBAL`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ProcessId(pub u32);

impl ProcessId {
    pub const GLOBAL: ProcessId = ProcessId(0);
}

/// Physical pages backing a mapping. Either an explicit page list or a single
/// physically-contiguous run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Scatterlist {
    pub pages: Vec<u32>,
    pub num_pages: u32,
    pub contiguous: bool,
}

impl Scatterlist {
    pub fn contiguous(base: u32, num_pages: u32) -> Self {
        Self {
            pages: vec![base],
            num_pages,
            contiguous: true,
        }
    }

    pub fn from_pages(pages: Vec<u32>) -> Self {
        Self {
            num_pages: pages.len() as u32,
            pages,
            contiguous: false,
        }
    }

    fn page(&self, i: u32) -> u32 {
        if self.contiguous {
            self.pages[0] + i * PAGE_SIZE
        } else {
            self.pages[i as usize]
        }
    }

    fn is_well_formed(&self) -> bool {
        if self.num_pages == 0 {
            return false;
        }
        if self.contiguous {
            self.pages.len() == 1
        } else {
            self.pages.len() as u32 == self.num_pages
        }
    }
}

/// A single process's translation table.
#[derive(Debug)]
pub struct PageTable {
    pub owner: ProcessId,
    pub base: MemRegion,
    pub va_base: u32,
    pub va_range: u32,
    pub max_entries: u32,
    pub last_super_pte: u32,
}

impl PageTable {
    /// PTE index for a page-aligned GPU virtual address inside the
    /// addressable range.
    fn pte_index(&self, va: u32) -> Result<u32> {
        if va & (PAGE_SIZE - 1) != 0 {
            return Err(Error::BadParameter);
        }
        if va < self.va_base || va - self.va_base >= self.va_range {
            return Err(Error::BadParameter);
        }
        Ok((va - self.va_base) >> PAGE_SHIFT)
    }

    fn read_pte(&self, mem: &dyn MemoryBus, pte: u32) -> u32 {
        mem.read_u32(self.base.base + pte * 4)
    }

    fn write_pte(&self, mem: &dyn MemoryBus, pte: u32, value: u32) {
        mem.write_u32(self.base.base + pte * 4, value);
    }

    fn pte_phys(&self, mem: &dyn MemoryBus, pte: u32) -> u32 {
        self.read_pte(mem, pte) & PTE_ADDR_MASK
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MmuStats {
    pub maps: u64,
    pub unmaps: u64,
    pub table_switches: u64,
    pub tlb_flushes: u64,
}

struct ArenaEntry {
    table: PageTable,
    refcount: u32,
}

/// Page-table arena plus the TLB-flush bookkeeping shared by all tables.
pub struct Mmu {
    per_process: bool,
    va_base: u32,
    va_range: u32,
    max_tables: usize,
    tables: HashMap<ProcessId, ArenaEntry>,
    /// Key of the table currently loaded into hardware. Only the device
    /// core's page-table-switch protocol may change which table this is.
    hw_owner: Option<ProcessId>,
    flush_pending: bool,
    flush_filter: Vec<u8>,
    pub stats: MmuStats,
}

impl Mmu {
    pub fn new(per_process: bool, va_base: u32, va_range: u32, max_tables: usize) -> Self {
        debug_assert_eq!(va_range & 0xffff, 0, "va_range must be a multiple of 64K");
        let filter_bytes = (va_range / (PAGE_SIZE * SUPER_PTE * 8)) as usize + 1;
        Self {
            per_process,
            va_base,
            va_range,
            max_tables: if per_process { max_tables } else { 1 },
            tables: HashMap::new(),
            hw_owner: None,
            flush_pending: false,
            flush_filter: vec![0; filter_bytes],
            stats: MmuStats::default(),
        }
    }

    /// Arena key for a caller. Global mode collapses every process onto one
    /// table.
    pub fn key(&self, pid: ProcessId) -> ProcessId {
        if self.per_process {
            pid
        } else {
            ProcessId::GLOBAL
        }
    }

    pub fn hw_owner(&self) -> Option<ProcessId> {
        self.hw_owner
    }

    pub fn set_hw_owner(&mut self, key: ProcessId) {
        self.hw_owner = Some(key);
        self.stats.table_switches += 1;
    }

    pub fn flush_pending(&self) -> bool {
        self.flush_pending
    }

    pub fn set_flush_pending(&mut self) {
        self.flush_pending = true;
    }

    /// Consume the pending-flush flag and reset the filter; the caller must
    /// then actually invalidate the TLB.
    pub fn begin_flush(&mut self) {
        self.flush_pending = false;
        self.flush_filter.fill(0);
        self.stats.tlb_flushes += 1;
    }

    fn filter_is_dirty(&self, group: u32) -> bool {
        let byte = (group / 8) as usize;
        self.flush_filter[byte] & (1 << (group % 8)) != 0
    }

    fn filter_set_dirty(&mut self, group: u32) {
        let byte = (group / 8) as usize;
        self.flush_filter[byte] |= 1 << (group % 8);
    }

    /// Attach a process: refcount an existing table or create a new one.
    /// Returns the bus address of the table, for loading into hardware.
    pub fn attach(
        &mut self,
        pid: ProcessId,
        mem: &dyn MemoryBus,
        alloc: &dyn ContiguousAllocator,
    ) -> Result<u32> {
        let key = self.key(pid);
        if let Some(entry) = self.tables.get_mut(&key) {
            entry.refcount += 1;
            return Ok(entry.table.base.base);
        }
        if self.tables.len() >= self.max_tables {
            return Err(Error::NoMoreAvailable);
        }

        let max_entries = (self.va_range >> PAGE_SHIFT) + PT_EXTRA_ENTRIES;
        let base = alloc
            .alloc(max_entries * 4, PAGE_SIZE)
            .map_err(|_| Error::SystemError)?;
        mem.fill_u32(base.base, 0, max_entries);

        debug!(owner = key.0, table_base = base.base, "created page table");
        let table = PageTable {
            owner: key,
            base,
            va_base: self.va_base,
            va_range: self.va_range,
            max_entries,
            last_super_pte: 0,
        };
        self.tables.insert(key, ArenaEntry { table, refcount: 1 });
        Ok(base.base)
    }

    /// Detach a process; the table is freed when its last user detaches.
    pub fn detach(&mut self, pid: ProcessId, alloc: &dyn ContiguousAllocator) -> Result<()> {
        let key = self.key(pid);
        let entry = self.tables.get_mut(&key).ok_or(Error::BadParameter)?;
        entry.refcount -= 1;
        if entry.refcount == 0 {
            let entry = self.tables.remove(&key).expect("entry just looked up");
            alloc.free(entry.table.base);
            if self.hw_owner == Some(key) {
                self.hw_owner = None;
            }
            debug!(owner = key.0, "destroyed page table");
        }
        Ok(())
    }

    pub fn table(&self, pid: ProcessId) -> Result<&PageTable> {
        let key = self.key(pid);
        self.tables
            .get(&key)
            .map(|e| &e.table)
            .ok_or(Error::NotInitialized)
    }

    pub fn refcount(&self, pid: ProcessId) -> u32 {
        let key = self.key(pid);
        self.tables.get(&key).map(|e| e.refcount).unwrap_or(0)
    }

    /// Free every remaining table. Device-teardown path.
    pub fn release_all(&mut self, alloc: &dyn ContiguousAllocator) {
        for (_, entry) in self.tables.drain() {
            alloc.free(entry.table.base);
        }
        self.hw_owner = None;
    }

    /// Install translations for a GPU-virtual range.
    ///
    /// Fails with [`Error::BadParameter`] if the range is outside the table's
    /// virtual range or any page in it is already mapped; nothing is mutated
    /// on failure. Marks a TLB flush pending when the mapping touches a dirty
    /// super-PTE group or is not super-PTE aligned on either end.
    pub fn map(
        &mut self,
        mem: &dyn MemoryBus,
        gpu_base: u32,
        scatter: &Scatterlist,
        access: PteAccess,
        pid: ProcessId,
    ) -> Result<()> {
        if !scatter.is_well_formed() {
            return Err(Error::BadParameter);
        }
        let key = self.key(pid);
        let entry = self.tables.get(&key).ok_or(Error::NotInitialized)?;
        let table = &entry.table;

        let pte_first = table.pte_index(gpu_base)?;
        let pte_last = pte_first + scatter.num_pages - 1;
        if pte_last >= (table.va_range >> PAGE_SHIFT) {
            return Err(Error::BadParameter);
        }
        for pte in pte_first..=pte_last {
            if table.pte_phys(mem, pte) != 0 {
                return Err(Error::BadParameter);
            }
        }

        // A stale coalesced TLB entry can cover the partial super-PTE groups
        // at either end of the range.
        let mut flush =
            pte_first & (SUPER_PTE - 1) != 0 || (pte_last + 1) & (SUPER_PTE - 1) != 0;

        for pte in pte_first..=pte_last {
            let phys = scatter.page(pte - pte_first);
            table.write_pte(mem, pte, (phys & PTE_ADDR_MASK) | access.bits());
            if pte & (SUPER_PTE - 1) == 0 && self.filter_is_dirty(pte / SUPER_PTE) {
                flush = true;
            }
        }
        if flush {
            self.flush_pending = true;
        }

        let super_last = pte_last - (pte_last & (SUPER_PTE - 1));
        let entry = self.tables.get_mut(&key).expect("table just looked up");
        if super_last > entry.table.last_super_pte {
            entry.table.last_super_pte = super_last;
        }
        self.stats.maps += 1;
        Ok(())
    }

    /// Remove translations for a GPU-virtual range.
    ///
    /// The whole range must be mapped; otherwise [`Error::BadParameter`] and
    /// no state is touched. The caller must follow up with a TLB invalidate.
    pub fn unmap(
        &mut self,
        mem: &dyn MemoryBus,
        gpu_base: u32,
        range_bytes: u32,
        pid: ProcessId,
    ) -> Result<()> {
        if range_bytes == 0 {
            return Err(Error::BadParameter);
        }
        let num_pages = range_bytes.div_ceil(PAGE_SIZE);
        let key = self.key(pid);
        let entry = self.tables.get(&key).ok_or(Error::NotInitialized)?;
        let table = &entry.table;

        let pte_first = table.pte_index(gpu_base)?;
        let pte_last = pte_first + num_pages - 1;
        if pte_last >= (table.va_range >> PAGE_SHIFT) {
            return Err(Error::BadParameter);
        }
        for pte in pte_first..=pte_last {
            if table.pte_phys(mem, pte) == 0 {
                return Err(Error::BadParameter);
            }
        }

        let mut dirty_groups = vec![pte_first / SUPER_PTE];
        for pte in pte_first..=pte_last {
            table.write_pte(mem, pte, 0);
            if pte & (SUPER_PTE - 1) == 0 {
                dirty_groups.push(pte / SUPER_PTE);
            }
        }
        for group in dirty_groups {
            self.filter_set_dirty(group);
        }

        // Walk the last-mapped super-PTE back down over the hole we just
        // created.
        let super_last = pte_last - (pte_last & (SUPER_PTE - 1));
        let entry = self.tables.get_mut(&key).expect("table just looked up");
        let table = &mut entry.table;
        if super_last == table.last_super_pte && table.last_super_pte >= SUPER_PTE {
            loop {
                table.last_super_pte -= SUPER_PTE;
                if table.last_super_pte < SUPER_PTE
                    || table.pte_phys(mem, table.last_super_pte) != 0
                {
                    break;
                }
            }
        }

        self.flush_pending = true;
        self.stats.unmaps += 1;
        Ok(())
    }

    /// Read back the physical pages for a mapped range, coalescing into a
    /// single contiguous entry when possible.
    pub fn get_map(
        &self,
        mem: &dyn MemoryBus,
        gpu_base: u32,
        range_bytes: u32,
        pid: ProcessId,
    ) -> Result<Scatterlist> {
        if range_bytes == 0 {
            return Err(Error::BadParameter);
        }
        let num_pages = range_bytes.div_ceil(PAGE_SIZE);
        let table = self.table(pid)?;
        let pte_first = table.pte_index(gpu_base)?;
        let pte_last = pte_first + num_pages - 1;
        if pte_last >= (table.va_range >> PAGE_SHIFT) {
            return Err(Error::BadParameter);
        }

        let mut contiguous = true;
        for pte in pte_first..pte_last {
            if table.pte_phys(mem, pte) + PAGE_SIZE != table.pte_phys(mem, pte + 1) {
                contiguous = false;
                break;
            }
        }
        if contiguous {
            Ok(Scatterlist::contiguous(
                table.pte_phys(mem, pte_first),
                num_pages,
            ))
        } else {
            let pages = (pte_first..=pte_last)
                .map(|pte| table.pte_phys(mem, pte))
                .collect();
            Ok(Scatterlist::from_pages(pages))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;
    use vermilion_hal::AllocError;

    struct FakeMem {
        data: Mutex<Vec<u8>>,
    }

    impl FakeMem {
        fn new(size: usize) -> Self {
            Self {
                data: Mutex::new(vec![0; size]),
            }
        }
    }

    impl MemoryBus for FakeMem {
        fn read_physical(&self, addr: u32, buf: &mut [u8]) {
            let data = self.data.lock().unwrap();
            let start = addr as usize;
            buf.copy_from_slice(&data[start..start + buf.len()]);
        }

        fn write_physical(&self, addr: u32, buf: &[u8]) {
            let mut data = self.data.lock().unwrap();
            let start = addr as usize;
            data[start..start + buf.len()].copy_from_slice(buf);
        }
    }

    struct BumpAlloc {
        next: Mutex<u32>,
        freed: Mutex<Vec<MemRegion>>,
    }

    impl BumpAlloc {
        fn new(base: u32) -> Self {
            Self {
                next: Mutex::new(base),
                freed: Mutex::new(Vec::new()),
            }
        }
    }

    impl ContiguousAllocator for BumpAlloc {
        fn alloc(&self, size: u32, align: u32) -> std::result::Result<MemRegion, AllocError> {
            let mut next = self.next.lock().unwrap();
            let base = (*next + align - 1) & !(align - 1);
            *next = base + size;
            Ok(MemRegion { base, size })
        }

        fn free(&self, region: MemRegion) {
            self.freed.lock().unwrap().push(region);
        }
    }

    const VA_BASE: u32 = 0x1000_0000;
    const VA_RANGE: u32 = 0x10_0000; // 1 MiB => 256 PTEs

    fn mmu_with_table() -> (FakeMem, BumpAlloc, Mmu, ProcessId) {
        let mem = FakeMem::new(0x10_000);
        let alloc = BumpAlloc::new(0x1000);
        let mut mmu = Mmu::new(true, VA_BASE, VA_RANGE, 8);
        let pid = ProcessId(42);
        mmu.attach(pid, &mem, &alloc).unwrap();
        (mem, alloc, mmu, pid)
    }

    fn snapshot_table(mem: &FakeMem, table: &PageTable) -> Vec<u32> {
        (0..table.max_entries)
            .map(|pte| table.read_pte(mem, pte))
            .collect()
    }

    #[test]
    fn attach_refcounts_and_detach_frees_at_zero() {
        let mem = FakeMem::new(0x10_000);
        let alloc = BumpAlloc::new(0x1000);
        let mut mmu = Mmu::new(true, VA_BASE, VA_RANGE, 8);
        let pid = ProcessId(7);

        let base1 = mmu.attach(pid, &mem, &alloc).unwrap();
        let base2 = mmu.attach(pid, &mem, &alloc).unwrap();
        assert_eq!(base1, base2);
        assert_eq!(mmu.refcount(pid), 2);

        mmu.detach(pid, &alloc).unwrap();
        assert_eq!(mmu.refcount(pid), 1);
        assert!(alloc.freed.lock().unwrap().is_empty());

        mmu.detach(pid, &alloc).unwrap();
        assert_eq!(mmu.refcount(pid), 0);
        assert_eq!(alloc.freed.lock().unwrap().len(), 1);
        assert!(mmu.table(pid).is_err());
    }

    #[test]
    fn global_mode_collapses_all_processes_onto_one_table() {
        let mem = FakeMem::new(0x10_000);
        let alloc = BumpAlloc::new(0x1000);
        let mut mmu = Mmu::new(false, VA_BASE, VA_RANGE, 8);

        let base1 = mmu.attach(ProcessId(1), &mem, &alloc).unwrap();
        let base2 = mmu.attach(ProcessId(2), &mem, &alloc).unwrap();
        assert_eq!(base1, base2);
        assert_eq!(mmu.refcount(ProcessId(99)), 2);
    }

    #[test]
    fn arena_capacity_is_enforced() {
        let mem = FakeMem::new(0x40_000);
        let alloc = BumpAlloc::new(0x1000);
        let mut mmu = Mmu::new(true, VA_BASE, VA_RANGE, 2);
        mmu.attach(ProcessId(1), &mem, &alloc).unwrap();
        mmu.attach(ProcessId(2), &mem, &alloc).unwrap();
        assert_eq!(
            mmu.attach(ProcessId(3), &mem, &alloc),
            Err(Error::NoMoreAvailable)
        );
    }

    #[test]
    fn map_unmap_round_trip_restores_prior_state() {
        let (mem, _alloc, mut mmu, pid) = mmu_with_table();
        let before = snapshot_table(&mem, mmu.table(pid).unwrap());

        let scatter = Scatterlist::from_pages(vec![0x8000, 0xa000, 0x9000]);
        mmu.map(&mem, VA_BASE + 0x4000, &scatter, PteAccess::READ | PteAccess::WRITE, pid)
            .unwrap();
        mmu.unmap(&mem, VA_BASE + 0x4000, 3 * PAGE_SIZE, pid).unwrap();

        let after = snapshot_table(&mem, mmu.table(pid).unwrap());
        assert_eq!(before, after);
        assert_eq!(mmu.stats.maps, 1);
        assert_eq!(mmu.stats.unmaps, 1);
    }

    #[test]
    fn map_rejects_overlap_and_out_of_range() {
        let (mem, _alloc, mut mmu, pid) = mmu_with_table();
        let scatter = Scatterlist::contiguous(0x8000, 4);
        mmu.map(&mem, VA_BASE, &scatter, PteAccess::READ, pid).unwrap();

        // Overlapping the tail of the existing mapping.
        let overlap = Scatterlist::contiguous(0xc000, 2);
        assert_eq!(
            mmu.map(&mem, VA_BASE + 3 * PAGE_SIZE, &overlap, PteAccess::READ, pid),
            Err(Error::BadParameter)
        );

        // Entirely past the virtual range.
        assert_eq!(
            mmu.map(&mem, VA_BASE + VA_RANGE, &overlap, PteAccess::READ, pid),
            Err(Error::BadParameter)
        );

        // Unaligned base address.
        assert_eq!(
            mmu.map(&mem, VA_BASE + 12, &overlap, PteAccess::READ, pid),
            Err(Error::BadParameter)
        );
    }

    #[test]
    fn unmap_of_unmapped_range_fails_without_mutation() {
        let (mem, _alloc, mut mmu, pid) = mmu_with_table();
        let before = snapshot_table(&mem, mmu.table(pid).unwrap());
        assert_eq!(
            mmu.unmap(&mem, VA_BASE + 0x8000, PAGE_SIZE, pid),
            Err(Error::BadParameter)
        );
        assert_eq!(before, snapshot_table(&mem, mmu.table(pid).unwrap()));
        assert!(!mmu.flush_pending());
        assert_eq!(mmu.stats.unmaps, 0);
    }

    #[test]
    fn unaligned_map_requests_tlb_flush() {
        let (mem, _alloc, mut mmu, pid) = mmu_with_table();
        // One page in the middle of a super-PTE group.
        let scatter = Scatterlist::contiguous(0x8000, 1);
        mmu.map(&mem, VA_BASE + PAGE_SIZE, &scatter, PteAccess::READ, pid)
            .unwrap();
        assert!(mmu.flush_pending());
    }

    #[test]
    fn aligned_map_skips_flush_until_a_dirty_group_is_rebacked() {
        let (mem, _alloc, mut mmu, pid) = mmu_with_table();
        // Full super-PTE group, aligned both ends: no flush needed.
        let scatter = Scatterlist::contiguous(0x8000, SUPER_PTE);
        mmu.map(&mem, VA_BASE, &scatter, PteAccess::READ, pid).unwrap();
        assert!(!mmu.flush_pending());

        // Unmap dirties the group and demands an invalidate.
        mmu.unmap(&mem, VA_BASE, SUPER_PTE * PAGE_SIZE, pid).unwrap();
        assert!(mmu.flush_pending());
        mmu.begin_flush();
        assert!(!mmu.flush_pending());

        // Re-backing a clean group after the flush: no new flush request.
        mmu.map(&mem, VA_BASE, &scatter, PteAccess::READ, pid).unwrap();
        assert!(!mmu.flush_pending());

        // Without an intervening flush, re-backing the now-dirty group must
        // request one.
        mmu.unmap(&mem, VA_BASE, SUPER_PTE * PAGE_SIZE, pid).unwrap();
        mmu.flush_pending = false; // simulate a lost invalidate
        mmu.map(&mem, VA_BASE, &scatter, PteAccess::READ, pid).unwrap();
        assert!(mmu.flush_pending());
    }

    #[test]
    fn get_map_round_trips_scatterlists() {
        let (mem, _alloc, mut mmu, pid) = mmu_with_table();

        let contiguous = Scatterlist::contiguous(0x8000, 3);
        mmu.map(&mem, VA_BASE, &contiguous, PteAccess::READ, pid).unwrap();
        let got = mmu.get_map(&mem, VA_BASE, 3 * PAGE_SIZE, pid).unwrap();
        assert_eq!(got, contiguous);

        let sparse = Scatterlist::from_pages(vec![0x2_0000, 0x4_0000]);
        mmu.map(&mem, VA_BASE + 0x10000, &sparse, PteAccess::READ, pid).unwrap();
        let got = mmu.get_map(&mem, VA_BASE + 0x10000, 2 * PAGE_SIZE, pid).unwrap();
        assert_eq!(got, sparse);
    }

    #[test]
    fn last_super_pte_tracks_highest_mapping() {
        let (mem, _alloc, mut mmu, pid) = mmu_with_table();
        let scatter = Scatterlist::contiguous(0x8000, SUPER_PTE);

        mmu.map(&mem, VA_BASE + 0x8000, &scatter, PteAccess::READ, pid).unwrap();
        let high = (0x8000 >> PAGE_SHIFT) & !(SUPER_PTE - 1);
        assert_eq!(mmu.table(pid).unwrap().last_super_pte, high);

        mmu.unmap(&mem, VA_BASE + 0x8000, SUPER_PTE * PAGE_SIZE, pid).unwrap();
        assert!(mmu.table(pid).unwrap().last_super_pte < high);
    }
}
