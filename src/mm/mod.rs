//! Memory management subsystem
//!
//! `MmContext` is the per-VM memory view: the stage-2 tables plus the list
//! of regions mapped through them. It lives behind the VM-scoped spin lock.

pub mod allocator;
pub mod heap;

use alloc::vec::Vec;

use crate::arch::aarch64::mm::{MapFlags, Stage2Table};
use crate::arch::traits::SysRegAccess;
use crate::error::Stage2Error;

pub use allocator::{Bitmap64, BumpAllocator};

/// What backs a mapped region
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionKind {
    /// Guest RAM (normal memory, 2MB granular)
    Memory,
    /// Pass-through device window (device memory, 4KB granular)
    Device,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemRegion {
    pub ipa: u64,
    pub pa: u64,
    pub size: u64,
    pub kind: RegionKind,
}

impl MemRegion {
    pub fn contains(&self, ipa: u64) -> bool {
        ipa >= self.ipa && ipa - self.ipa < self.size
    }
}

pub struct MmContext {
    stage2: Stage2Table,
    regions: Vec<MemRegion>,
    /// Configured guest RAM size
    mem_size: u64,
    /// Guest RAM currently mapped
    mem_used: u64,
}

impl MmContext {
    pub fn new(vmid: u16, mem_size: u64) -> Result<Self, Stage2Error> {
        Ok(Self {
            stage2: Stage2Table::new(vmid)?,
            regions: Vec::new(),
            mem_size,
            mem_used: 0,
        })
    }

    fn reserve_region(&mut self) -> Result<(), Stage2Error> {
        self.regions
            .try_reserve(1)
            .map_err(|_| Stage2Error::OutOfMemory)
    }

    /// Map guest RAM.
    pub fn map_memory(&mut self, ipa: u64, pa: u64, size: u64) -> Result<(), Stage2Error> {
        self.reserve_region()?;
        self.stage2.map(ipa, pa, size, MapFlags::NORMAL_RWX)?;
        self.regions.push(MemRegion { ipa, pa, size, kind: RegionKind::Memory });
        self.mem_used += size;
        Ok(())
    }

    /// Map a pass-through device window.
    pub fn map_device(&mut self, ipa: u64, pa: u64, size: u64) -> Result<(), Stage2Error> {
        self.reserve_region()?;
        self.stage2.map_passthrough(ipa, pa, size, MapFlags::DEVICE_RW)?;
        self.regions.push(MemRegion { ipa, pa, size, kind: RegionKind::Device });
        Ok(())
    }

    /// Unmap a 2MB-aligned range and invalidate the VM's TLB entries if
    /// anything changed.
    pub fn unmap<R: SysRegAccess + ?Sized>(&mut self, ipa: u64, size: u64, regs: &mut R) -> Result<(), Stage2Error> {
        if self.stage2.unmap(ipa, size)? {
            self.stage2.flush_tlb(regs);
        }
        let end = ipa + size;
        let mut freed = 0;
        self.regions.retain(|r| {
            let inside = r.ipa >= ipa && r.ipa + r.size <= end;
            if inside && r.kind == RegionKind::Memory {
                freed += r.size;
            }
            !inside
        });
        self.mem_used -= freed;
        Ok(())
    }

    pub fn translate(&self, ipa: u64) -> Result<u64, Stage2Error> {
        self.stage2.translate(ipa)
    }

    pub fn region_of(&self, ipa: u64) -> Option<&MemRegion> {
        self.regions.iter().find(|r| r.contains(ipa))
    }

    pub fn regions(&self) -> &[MemRegion] {
        &self.regions
    }

    pub fn mem_size(&self) -> u64 {
        self.mem_size
    }

    pub fn mem_used(&self) -> u64 {
        self.mem_used
    }

    pub fn stage2(&self) -> &Stage2Table {
        &self.stage2
    }
}
