//! ARM64 Stage-2 Translation
//!
//! Per-VM guest-physical to host-physical page tables.
//!
//! Page Table Levels (4KB granule, 40-bit IPA, walk starts at level 1):
//! - Level 1: 1GB blocks (bits [39:30], two concatenated pages = 1024 entries)
//! - Level 2: 2MB blocks (bits [29:21])
//! - Level 3: 4KB pages (bits [20:12])
//!
//! Inner tables come from a per-VM pool of `MMU_TBL_PAGE_NR_MAX` pages that
//! is reserved up front and never reallocated, so a table's address is
//! stable for as long as the VM exists and maps directly to a pool index.

use alloc::vec::Vec;
use bitflags::bitflags;

use crate::arch::aarch64::defs::*;
use crate::arch::traits::{SysReg, SysRegAccess};
use crate::error::Stage2Error;
use crate::mm::allocator::Bitmap64;
use crate::platform::MMU_TBL_PAGE_NR_MAX;

/// First IPA outside the 40-bit guest address space
pub const IPA_LIMIT: u64 = 1 << IPA_BITS;

bitflags! {
    /// Access permissions and memory type of a stage-2 mapping
    pub struct MapFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        /// Device-nGnRnE instead of normal write-back memory
        const DEVICE = 1 << 3;

        const NORMAL_RWX = Self::READ.bits | Self::WRITE.bits | Self::EXEC.bits;
        const DEVICE_RW = Self::READ.bits | Self::WRITE.bits | Self::DEVICE.bits;
    }
}

impl MapFlags {
    /// Lower and upper attribute bits of a block or page descriptor
    pub fn descriptor_attrs(self) -> u64 {
        let mut attrs = S2_AF;
        if self.contains(MapFlags::DEVICE) {
            attrs |= S2_MEMATTR_DEVICE_NGNRNE << S2_MEMATTR_SHIFT;
        } else {
            attrs |= (S2_MEMATTR_NORMAL_WB << S2_MEMATTR_SHIFT) | S2_SH_INNER;
        }
        if self.contains(MapFlags::READ) {
            attrs |= S2_AP_READ;
        }
        if self.contains(MapFlags::WRITE) {
            attrs |= S2_AP_WRITE;
        }
        if !self.contains(MapFlags::EXEC) || self.contains(MapFlags::DEVICE) {
            attrs |= S2_XN;
        }
        attrs
    }
}

/// Stage-2 page table entry
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct S2PageTableEntry(u64);

impl S2PageTableEntry {
    pub const fn invalid() -> Self {
        Self(0)
    }

    /// Block entry (Level 1 or 2)
    pub const fn block(addr: u64, attrs: u64) -> Self {
        Self((addr & PTE_ADDR_MASK) | (attrs & PTE_ATTR_MASK) | PTE_VALID)
    }

    /// Page entry (Level 3)
    pub const fn page(addr: u64, attrs: u64) -> Self {
        Self((addr & PTE_ADDR_MASK) | (attrs & PTE_ATTR_MASK) | PTE_TABLE | PTE_VALID)
    }

    /// Table entry (points to next level)
    pub const fn table(next_level_addr: u64) -> Self {
        Self((next_level_addr & PTE_ADDR_MASK) | PTE_VALID | PTE_TABLE)
    }

    pub fn is_valid(&self) -> bool {
        (self.0 & PTE_VALID) != 0
    }

    /// Table descriptor at levels 1-2, page descriptor at level 3
    pub fn is_table(&self) -> bool {
        (self.0 & (PTE_VALID | PTE_TABLE)) == (PTE_VALID | PTE_TABLE)
    }

    pub fn is_block(&self) -> bool {
        self.is_valid() && !self.is_table()
    }

    pub fn addr(&self) -> u64 {
        self.0 & PTE_ADDR_MASK
    }

    pub fn attrs(&self) -> u64 {
        self.0 & PTE_ATTR_MASK
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// One 4KB translation table
#[repr(C, align(4096))]
#[derive(Clone)]
pub struct PageTable {
    entries: [S2PageTableEntry; 512],
}

impl PageTable {
    pub const fn new() -> Self {
        Self {
            entries: [S2PageTableEntry::invalid(); 512],
        }
    }

    pub fn entry(&self, index: usize) -> S2PageTableEntry {
        self.entries[index]
    }

    pub fn set_entry(&mut self, index: usize, entry: S2PageTableEntry) {
        self.entries[index] = entry;
    }

    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| !e.is_valid())
    }

    fn clear(&mut self) {
        self.entries = [S2PageTableEntry::invalid(); 512];
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Concatenated level-1 root (two pages, 8KB aligned as VTTBR requires)
#[repr(C, align(8192))]
struct RootTable {
    entries: [S2PageTableEntry; L1_ROOT_ENTRIES],
}

impl RootTable {
    const fn new() -> Self {
        Self {
            entries: [S2PageTableEntry::invalid(); L1_ROOT_ENTRIES],
        }
    }
}

fn l1_index(ipa: u64) -> usize {
    ((ipa >> L1_SHIFT) as usize) & (L1_ROOT_ENTRIES - 1)
}

fn l2_index(ipa: u64) -> usize {
    ((ipa >> L2_SHIFT) & PT_INDEX_MASK) as usize
}

fn l3_index(ipa: u64) -> usize {
    ((ipa >> L3_SHIFT) & PT_INDEX_MASK) as usize
}

/// Stage-2 translation tables of one VM
pub struct Stage2Table {
    root: Vec<RootTable>,
    pool: Vec<PageTable>,
    used: Bitmap64,
    vmid: u16,
}

impl Stage2Table {
    /// Allocate an empty table set for `vmid`.
    ///
    /// Both the root and the inner-table pool are reserved here; nothing
    /// allocates afterwards, so a later `OutOfMemory` means the pool is
    /// exhausted.
    pub fn new(vmid: u16) -> Result<Self, Stage2Error> {
        let mut root = Vec::new();
        root.try_reserve_exact(1)
            .map_err(|_| Stage2Error::OutOfMemory)?;
        root.push(RootTable::new());

        let mut pool = Vec::new();
        pool.try_reserve_exact(MMU_TBL_PAGE_NR_MAX)
            .map_err(|_| Stage2Error::OutOfMemory)?;

        Ok(Self {
            root,
            pool,
            used: Bitmap64::new(MMU_TBL_PAGE_NR_MAX),
            vmid,
        })
    }

    pub fn vmid(&self) -> u16 {
        self.vmid
    }

    /// Physical address of the root table
    pub fn root_addr(&self) -> u64 {
        self.root.as_ptr() as u64
    }

    /// VTTBR_EL2: VMID[63:48] | root table base
    pub fn vttbr(&self) -> u64 {
        (self.root_addr() & PTE_ADDR_MASK) | ((self.vmid as u64) << VTTBR_VMID_SHIFT)
    }

    /// VTCR_EL2 for this table layout
    pub fn vtcr(&self) -> u64 {
        VTCR_VALUE
    }

    /// Number of inner tables currently taken from the pool
    pub fn tables_in_use(&self) -> usize {
        self.used.count()
    }

    // ── Pool management ─────────────────────────────────────────────

    fn table_addr(&self, idx: usize) -> u64 {
        self.pool.as_ptr() as u64 + idx as u64 * PAGE_SIZE_4KB
    }

    fn table_index(&self, addr: u64) -> Option<usize> {
        let off = addr.checked_sub(self.pool.as_ptr() as u64)?;
        let idx = (off / PAGE_SIZE_4KB) as usize;
        if off % PAGE_SIZE_4KB == 0 && idx < self.pool.len() {
            Some(idx)
        } else {
            None
        }
    }

    fn alloc_table(&mut self) -> Result<usize, Stage2Error> {
        let idx = self.used.alloc().ok_or(Stage2Error::OutOfMemory)?;
        if idx == self.pool.len() {
            // Within the reserved capacity: no reallocation, addresses stay put.
            self.pool.push(PageTable::new());
        } else {
            self.pool[idx].clear();
        }
        Ok(idx)
    }

    fn free_table(&mut self, idx: usize) {
        self.used.free(idx);
    }

    fn next_table(&self, entry: S2PageTableEntry) -> Option<usize> {
        if entry.is_table() {
            self.table_index(entry.addr())
        } else {
            None
        }
    }

    fn root_entry(&self, idx: usize) -> S2PageTableEntry {
        self.root[0].entries[idx]
    }

    fn set_root_entry(&mut self, idx: usize, entry: S2PageTableEntry) {
        self.root[0].entries[idx] = entry;
    }

    /// Level-2 table behind root slot `i1`, creating it if the slot is empty.
    fn ensure_l2(&mut self, i1: usize) -> Result<usize, Stage2Error> {
        let l1 = self.root_entry(i1);
        if l1.is_block() {
            return Err(Stage2Error::AlreadyMapped);
        }
        match self.next_table(l1) {
            Some(t) => Ok(t),
            None => {
                let t = self.alloc_table()?;
                let addr = self.table_addr(t);
                self.set_root_entry(i1, S2PageTableEntry::table(addr));
                Ok(t)
            }
        }
    }

    // ── Mapping ─────────────────────────────────────────────────────

    /// Map `size` bytes of guest-physical space at `ipa` onto `pa`.
    ///
    /// `ipa`, `pa` and `size` must be non-zero multiples of 2MB. Spans that
    /// are 1GB aligned on both sides become level-1 blocks, everything else
    /// level-2 blocks. Overlap with an existing mapping is refused before
    /// anything is written; running out of table pages mid-way removes what
    /// this call had installed.
    pub fn map(&mut self, ipa: u64, pa: u64, size: u64, flags: MapFlags) -> Result<(), Stage2Error> {
        if size == 0 || (ipa | pa | size) & BLOCK_MASK_2MB != 0 {
            return Err(Stage2Error::Unaligned);
        }
        let end = ipa.checked_add(size).ok_or(Stage2Error::Unaligned)?;
        if end > IPA_LIMIT || pa.checked_add(size).is_none() {
            return Err(Stage2Error::Unaligned);
        }

        let mut addr = ipa;
        while addr < end {
            if self.block_in_use(addr) {
                return Err(Stage2Error::AlreadyMapped);
            }
            addr += BLOCK_SIZE_2MB;
        }

        let attrs = flags.descriptor_attrs();
        let mut off = 0;
        while off < size {
            match self.install_block(ipa + off, pa + off, size - off, attrs) {
                Ok(step) => off += step,
                Err(e) => {
                    let _ = self.clear_range(ipa, off);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn block_in_use(&self, ipa: u64) -> bool {
        let l1 = self.root_entry(l1_index(ipa));
        if !l1.is_valid() {
            return false;
        }
        match self.next_table(l1) {
            Some(t) => self.pool[t].entry(l2_index(ipa)).is_valid(),
            None => true,
        }
    }

    fn install_block(&mut self, ipa: u64, pa: u64, remaining: u64, attrs: u64) -> Result<u64, Stage2Error> {
        let i1 = l1_index(ipa);
        let gb_aligned = (ipa | pa) & (BLOCK_SIZE_1GB - 1) == 0;
        if gb_aligned && remaining >= BLOCK_SIZE_1GB && !self.root_entry(i1).is_valid() {
            self.set_root_entry(i1, S2PageTableEntry::block(pa, attrs));
            return Ok(BLOCK_SIZE_1GB);
        }

        let t = self.ensure_l2(i1)?;
        self.pool[t].set_entry(l2_index(ipa), S2PageTableEntry::block(pa, attrs));
        Ok(BLOCK_SIZE_2MB)
    }

    /// Map a device window with 4KB level-3 pages.
    pub fn map_passthrough(&mut self, ipa: u64, pa: u64, size: u64, flags: MapFlags) -> Result<(), Stage2Error> {
        if size == 0 || (ipa | pa | size) & PAGE_MASK_4KB != 0 {
            return Err(Stage2Error::Unaligned);
        }
        let end = ipa.checked_add(size).ok_or(Stage2Error::Unaligned)?;
        if end > IPA_LIMIT {
            return Err(Stage2Error::Unaligned);
        }

        let mut addr = ipa;
        while addr < end {
            if self.page_in_use(addr) {
                return Err(Stage2Error::AlreadyMapped);
            }
            addr += PAGE_SIZE_4KB;
        }

        let attrs = flags.descriptor_attrs();
        let mut off = 0;
        while off < size {
            if let Err(e) = self.install_page(ipa + off, pa + off, attrs) {
                self.clear_pages(ipa, off);
                return Err(e);
            }
            off += PAGE_SIZE_4KB;
        }
        Ok(())
    }

    fn page_in_use(&self, ipa: u64) -> bool {
        let l1 = self.root_entry(l1_index(ipa));
        if !l1.is_valid() {
            return false;
        }
        let Some(t2) = self.next_table(l1) else {
            return true;
        };
        let l2 = self.pool[t2].entry(l2_index(ipa));
        if !l2.is_valid() {
            return false;
        }
        match self.next_table(l2) {
            Some(t3) => self.pool[t3].entry(l3_index(ipa)).is_valid(),
            None => true,
        }
    }

    fn install_page(&mut self, ipa: u64, pa: u64, attrs: u64) -> Result<(), Stage2Error> {
        let t2 = self.ensure_l2(l1_index(ipa))?;
        let i2 = l2_index(ipa);
        let l2 = self.pool[t2].entry(i2);
        if l2.is_block() {
            return Err(Stage2Error::AlreadyMapped);
        }
        let t3 = match self.next_table(l2) {
            Some(t) => t,
            None => {
                let t = self.alloc_table()?;
                let addr = self.table_addr(t);
                self.pool[t2].set_entry(i2, S2PageTableEntry::table(addr));
                t
            }
        };
        self.pool[t3].set_entry(l3_index(ipa), S2PageTableEntry::page(pa, attrs));
        Ok(())
    }

    fn clear_pages(&mut self, ipa: u64, size: u64) {
        let mut off = 0;
        while off < size {
            let addr = ipa + off;
            off += PAGE_SIZE_4KB;

            let i1 = l1_index(addr);
            let Some(t2) = self.next_table(self.root_entry(i1)) else {
                continue;
            };
            let i2 = l2_index(addr);
            let Some(t3) = self.next_table(self.pool[t2].entry(i2)) else {
                continue;
            };
            self.pool[t3].set_entry(l3_index(addr), S2PageTableEntry::invalid());
            if self.pool[t3].is_empty() {
                self.pool[t2].set_entry(i2, S2PageTableEntry::invalid());
                self.free_table(t3);
            }
            if self.pool[t2].is_empty() {
                self.set_root_entry(i1, S2PageTableEntry::invalid());
                self.free_table(t2);
            }
        }
    }

    // ── Unmapping ───────────────────────────────────────────────────

    /// Remove every mapping in `ipa..ipa+size` (2MB granular).
    ///
    /// Returns whether any descriptor changed; the caller must then
    /// invalidate this VM's TLB entries before the guest runs again.
    /// Tables needed to split partially covered 1GB blocks are checked for
    /// up front, so `OutOfMemory` leaves every descriptor untouched.
    pub fn unmap(&mut self, ipa: u64, size: u64) -> Result<bool, Stage2Error> {
        if size == 0 || (ipa | size) & BLOCK_MASK_2MB != 0 {
            return Err(Stage2Error::Unaligned);
        }
        let end = match ipa.checked_add(size) {
            Some(end) if end <= IPA_LIMIT => end,
            _ => return Err(Stage2Error::Unaligned),
        };
        let free = self.used.capacity() - self.used.count();
        if self.splits_needed(ipa, end) > free {
            return Err(Stage2Error::OutOfMemory);
        }
        self.clear_range(ipa, size)
    }

    /// 1GB blocks that `ipa..end` covers only in part. Only the first and
    /// last gigabyte of the range can be partial.
    fn splits_needed(&self, ipa: u64, end: u64) -> usize {
        let partial = |gb: u64| {
            self.root_entry(l1_index(gb)).is_block() && (ipa > gb || end < gb + BLOCK_SIZE_1GB)
        };
        let first = ipa & !(BLOCK_SIZE_1GB - 1);
        let last = (end - 1) & !(BLOCK_SIZE_1GB - 1);
        let mut n = partial(first) as usize;
        if last != first && partial(last) {
            n += 1;
        }
        n
    }

    fn clear_range(&mut self, ipa: u64, size: u64) -> Result<bool, Stage2Error> {
        let mut changed = false;
        let mut off = 0;
        while off < size {
            let addr = ipa + off;
            let remaining = size - off;
            let i1 = l1_index(addr);
            let l1 = self.root_entry(i1);

            if !l1.is_valid() {
                off += BLOCK_SIZE_2MB;
                continue;
            }

            if l1.is_block() {
                if addr & (BLOCK_SIZE_1GB - 1) == 0 && remaining >= BLOCK_SIZE_1GB {
                    self.set_root_entry(i1, S2PageTableEntry::invalid());
                    changed = true;
                    off += BLOCK_SIZE_1GB;
                    continue;
                }
                // Partial unmap of a 1GB block: split it first.
                self.split_l1_block(i1)?;
            }

            if let Some(t2) = self.next_table(self.root_entry(i1)) {
                let i2 = l2_index(addr);
                let l2 = self.pool[t2].entry(i2);
                if l2.is_valid() {
                    if let Some(t3) = self.next_table(l2) {
                        self.free_table(t3);
                    }
                    self.pool[t2].set_entry(i2, S2PageTableEntry::invalid());
                    changed = true;
                }
                if self.pool[t2].is_empty() {
                    self.set_root_entry(i1, S2PageTableEntry::invalid());
                    self.free_table(t2);
                }
            }
            off += BLOCK_SIZE_2MB;
        }
        Ok(changed)
    }

    /// Replace a 1GB block with a level-2 table of 512 equivalent 2MB blocks.
    fn split_l1_block(&mut self, i1: usize) -> Result<(), Stage2Error> {
        let block = self.root_entry(i1);
        let t = self.alloc_table()?;
        for i in 0..512u64 {
            let pa = block.addr() + i * BLOCK_SIZE_2MB;
            self.pool[t].set_entry(i as usize, S2PageTableEntry::block(pa, block.attrs()));
        }
        let addr = self.table_addr(t);
        self.set_root_entry(i1, S2PageTableEntry::table(addr));
        Ok(())
    }

    // ── Lookup ──────────────────────────────────────────────────────

    /// Guest-physical to host-physical
    pub fn translate(&self, ipa: u64) -> Result<u64, Stage2Error> {
        if ipa >= IPA_LIMIT {
            return Err(Stage2Error::NotMapped);
        }
        let l1 = self.root_entry(l1_index(ipa));
        if !l1.is_valid() {
            return Err(Stage2Error::NotMapped);
        }
        if l1.is_block() {
            return Ok(l1.addr() + (ipa & (BLOCK_SIZE_1GB - 1)));
        }

        let t2 = self.next_table(l1).ok_or(Stage2Error::NotMapped)?;
        let l2 = self.pool[t2].entry(l2_index(ipa));
        if !l2.is_valid() {
            return Err(Stage2Error::NotMapped);
        }
        if l2.is_block() {
            return Ok(l2.addr() + (ipa & BLOCK_MASK_2MB));
        }

        let t3 = self.next_table(l2).ok_or(Stage2Error::NotMapped)?;
        let l3 = self.pool[t3].entry(l3_index(ipa));
        if !l3.is_table() {
            return Err(Stage2Error::NotMapped);
        }
        Ok(l3.addr() + (ipa & PAGE_MASK_4KB))
    }

    /// Leaf descriptor covering `ipa`, if any
    pub fn leaf_entry(&self, ipa: u64) -> Option<S2PageTableEntry> {
        let l1 = self.root_entry(l1_index(ipa));
        if l1.is_block() {
            return Some(l1);
        }
        let l2 = self.pool[self.next_table(l1)?].entry(l2_index(ipa));
        if l2.is_block() {
            return Some(l2);
        }
        let l3 = self.pool[self.next_table(l2)?].entry(l3_index(ipa));
        if l3.is_table() {
            Some(l3)
        } else {
            None
        }
    }

    /// Invalidate every TLB entry tagged with this table's VMID.
    ///
    /// TLBI VMALLS12E1IS acts on the VMID in VTTBR_EL2, so the VM's VTTBR is
    /// loaded for the duration of the flush and the previous value restored.
    pub fn flush_tlb<R: SysRegAccess + ?Sized>(&self, regs: &mut R) {
        let saved = regs.read(SysReg::Vttbr);
        regs.write(SysReg::Vttbr, self.vttbr());
        regs.isb();
        regs.tlbi_vmalls12e1is();
        regs.write(SysReg::Vttbr, saved);
        regs.isb();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB2: u64 = BLOCK_SIZE_2MB;
    const GB: u64 = BLOCK_SIZE_1GB;

    #[test]
    fn test_map_translate_2mb() {
        let mut s2 = Stage2Table::new(1).unwrap();
        s2.map(0x4000_0000 + 4 * MB2, 0x8020_0000, 2 * MB2, MapFlags::NORMAL_RWX).unwrap();
        assert_eq!(s2.translate(0x4080_0123), Ok(0x8020_0123));
        assert_eq!(s2.translate(0x40A0_0000), Ok(0x8040_0000));
        assert_eq!(s2.translate(0x40C0_0000), Err(Stage2Error::NotMapped));
        assert_eq!(s2.tables_in_use(), 1);
    }

    #[test]
    fn test_gigabyte_block_needs_no_table() {
        let mut s2 = Stage2Table::new(1).unwrap();
        s2.map(GB, 2 * GB, GB + MB2, MapFlags::NORMAL_RWX).unwrap();
        // First gigabyte as an L1 block, trailing 2MB in an L2 table.
        assert!(s2.leaf_entry(GB).unwrap().is_block());
        assert_eq!(s2.tables_in_use(), 1);
        assert_eq!(s2.translate(GB + 0x1234_5678), Ok(2 * GB + 0x1234_5678));
        assert_eq!(s2.translate(2 * GB + 0x10), Ok(3 * GB + 0x10));
    }

    #[test]
    fn test_unaligned_rejected() {
        let mut s2 = Stage2Table::new(0).unwrap();
        assert_eq!(s2.map(0x1000, 0, MB2, MapFlags::NORMAL_RWX), Err(Stage2Error::Unaligned));
        assert_eq!(s2.map(0, 0x1000, MB2, MapFlags::NORMAL_RWX), Err(Stage2Error::Unaligned));
        assert_eq!(s2.map(0, 0, MB2 + 0x1000, MapFlags::NORMAL_RWX), Err(Stage2Error::Unaligned));
        assert_eq!(s2.map(0, 0, 0, MapFlags::NORMAL_RWX), Err(Stage2Error::Unaligned));
        assert_eq!(s2.map(IPA_LIMIT - MB2, 0, 2 * MB2, MapFlags::NORMAL_RWX), Err(Stage2Error::Unaligned));
        assert_eq!(s2.tables_in_use(), 0);
    }

    #[test]
    fn test_overlap_rejected_before_install() {
        let mut s2 = Stage2Table::new(0).unwrap();
        s2.map(4 * MB2, 0, MB2, MapFlags::NORMAL_RWX).unwrap();
        assert_eq!(
            s2.map(0, 0x100_0000, 8 * MB2, MapFlags::NORMAL_RWX),
            Err(Stage2Error::AlreadyMapped)
        );
        assert_eq!(s2.translate(0), Err(Stage2Error::NotMapped));
        assert_eq!(s2.translate(4 * MB2), Ok(0));
    }

    #[test]
    fn test_unmap_frees_tables() {
        let mut s2 = Stage2Table::new(0).unwrap();
        s2.map(0x4000_0000, 0x4000_0000, 4 * MB2, MapFlags::NORMAL_RWX).unwrap();
        assert_eq!(s2.tables_in_use(), 1);
        assert_eq!(s2.unmap(0x4000_0000, 4 * MB2), Ok(true));
        assert_eq!(s2.tables_in_use(), 0);
        assert_eq!(s2.translate(0x4000_0000), Err(Stage2Error::NotMapped));
        assert_eq!(s2.unmap(0x4000_0000, 4 * MB2), Ok(false));
    }

    #[test]
    fn test_partial_unmap_splits_gigabyte() {
        let mut s2 = Stage2Table::new(0).unwrap();
        s2.map(GB, GB, GB, MapFlags::NORMAL_RWX).unwrap();
        assert_eq!(s2.unmap(GB + MB2, MB2), Ok(true));
        assert_eq!(s2.translate(GB), Ok(GB));
        assert_eq!(s2.translate(GB + MB2), Err(Stage2Error::NotMapped));
        assert_eq!(s2.translate(GB + 2 * MB2 + 8), Ok(GB + 2 * MB2 + 8));
        assert_eq!(s2.tables_in_use(), 1);
    }

    #[test]
    fn test_unmap_without_split_table_changes_nothing() {
        let mut s2 = Stage2Table::new(0).unwrap();
        s2.map(GB, GB, GB, MapFlags::NORMAL_RWX).unwrap();
        // Take every pool table with 2MB mappings elsewhere.
        for i in 0..MMU_TBL_PAGE_NR_MAX as u64 {
            s2.map((4 + i) * GB, MB2, MB2, MapFlags::NORMAL_RWX).unwrap();
        }
        assert_eq!(s2.unmap(GB + MB2, MB2), Err(Stage2Error::OutOfMemory));
        assert_eq!(s2.translate(GB + MB2), Ok(GB + MB2));

        // The whole gigabyte needs no split.
        assert_eq!(s2.unmap(GB, GB), Ok(true));
        assert_eq!(s2.translate(GB), Err(Stage2Error::NotMapped));
    }

    #[test]
    fn test_pool_exhaustion_rolls_back() {
        let mut s2 = Stage2Table::new(0).unwrap();
        // pa never 1GB aligned, so each gigabyte needs its own L2 table.
        let size = (MMU_TBL_PAGE_NR_MAX as u64 + 1) * GB;
        assert_eq!(s2.map(0, MB2, size, MapFlags::NORMAL_RWX), Err(Stage2Error::OutOfMemory));
        assert_eq!(s2.tables_in_use(), 0);
        assert_eq!(s2.translate(0), Err(Stage2Error::NotMapped));
        // The pool is usable again afterwards.
        s2.map(0, MB2, MB2, MapFlags::NORMAL_RWX).unwrap();
    }

    #[test]
    fn test_passthrough_pages() {
        let mut s2 = Stage2Table::new(0).unwrap();
        s2.map_passthrough(0x0900_0000, 0x0900_0000, 0x1000, MapFlags::DEVICE_RW).unwrap();
        assert_eq!(s2.translate(0x0900_0018), Ok(0x0900_0018));
        assert_eq!(s2.translate(0x0900_1000), Err(Stage2Error::NotMapped));
        assert_eq!(s2.tables_in_use(), 2);
        let leaf = s2.leaf_entry(0x0900_0000).unwrap();
        assert_ne!(leaf.raw() & S2_XN, 0);
        assert_eq!(
            s2.map_passthrough(0x0900_0000, 0, 0x1000, MapFlags::DEVICE_RW),
            Err(Stage2Error::AlreadyMapped)
        );
        assert_eq!(s2.map(0x0900_0000 & !BLOCK_MASK_2MB, 0, MB2, MapFlags::NORMAL_RWX), Err(Stage2Error::AlreadyMapped));
        assert_eq!(s2.unmap(0x0900_0000 & !BLOCK_MASK_2MB, MB2), Ok(true));
        assert_eq!(s2.tables_in_use(), 0);
    }

    #[test]
    fn test_vttbr_carries_vmid() {
        let s2 = Stage2Table::new(5).unwrap();
        assert_eq!(s2.vttbr() >> 48, 5);
        assert_eq!(s2.vttbr() & 0x1FFF, 0);
        assert_eq!(s2.vtcr() & 0x3F, 24);
        assert_eq!((s2.vtcr() >> 6) & 0x3, 1);
    }

    #[test]
    fn test_descriptor_attrs() {
        let normal = MapFlags::NORMAL_RWX.descriptor_attrs();
        assert_eq!(normal & S2_XN, 0);
        assert_eq!((normal >> 2) & 0xF, 0b1111);
        assert_ne!(normal & S2_AF, 0);
        let ro = MapFlags::READ.descriptor_attrs();
        assert_ne!(ro & S2_AP_READ, 0);
        assert_eq!(ro & S2_AP_WRITE, 0);
        assert_ne!(ro & S2_XN, 0);
    }
}
