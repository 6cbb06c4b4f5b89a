//! Virtual GICv3
//!
//! `Vgic` is one VM's interrupt controller: the distributor, one
//! redistributor per vCPU and the list-register multiplexing that presents
//! pending virqs to the running vCPU.
//!
//! Every pending or active virq of a vCPU sits in that vCPU's candidate
//! list. The list is kept sorted (active first, then priority, then INTID)
//! and its first `nr_lr` entries are what the hardware list registers hold.
//! While a vCPU is loaded its list registers are authoritative: every
//! operation on it first pulls their state back (`sync_from_hw`) and ends
//! by rewriting them (`flush_to_hw`).

pub mod distributor;
pub mod list_regs;
pub mod redistributor;
pub mod virq;

use alloc::vec::Vec;

use log::{debug, warn};

pub use distributor::{BitBank, Distributor, IrqReg};
pub use list_regs::{GicCpuContext, LrEntry, VgicGeometry};
pub use redistributor::{GicrReg, Redistributor};
pub use virq::{TriggerMode, Virq, VirqState, VirqUpdate};

use crate::arch::aarch64::defs::{ICH_HCR_EN, ICH_HCR_NPIE, ICH_HCR_UIE};
use crate::arch::traits::{PhysicalGic, SysReg, SysRegAccess};
use crate::error::HypError;
use crate::platform::{VGIC_GICD_SIZE, VGIC_GICR_STRIDE, VIRQ_MAX_NUM, VIRQ_PRIV_NUM};

fn lookup<'a>(gicd: &'a Distributor, privates: &'a [Virq], id: u32) -> Option<&'a Virq> {
    if (id as usize) < VIRQ_PRIV_NUM {
        privates.get(id as usize)
    } else {
        gicd.spi(id)
    }
}

fn lookup_mut<'a>(
    gicd: &'a mut Distributor,
    privates: &'a mut [Virq],
    id: u32,
) -> Option<&'a mut Virq> {
    if (id as usize) < VIRQ_PRIV_NUM {
        privates.get_mut(id as usize)
    } else {
        gicd.spi_mut(id)
    }
}

/// Candidate order: active first, then priority, then lowest INTID.
fn sort_key(v: Option<&Virq>, id: u16) -> (u8, u8, u16) {
    match v {
        Some(v) => (if v.state.is_active() { 0 } else { 1 }, v.priority, id),
        None => (2, u8::MAX, id),
    }
}

pub struct Vgic {
    gicd_base: u64,
    gicr_base: u64,
    geo: VgicGeometry,
    gicd: Distributor,
    gicr: Vec<Redistributor>,
    /// vCPU whose list registers are live in hardware
    loaded: Option<usize>,
}

impl Vgic {
    pub fn new(
        nr_vcpus: usize,
        virq_num: usize,
        gicd_base: u64,
        gicr_base: u64,
        geo: VgicGeometry,
    ) -> Result<Self, HypError> {
        if nr_vcpus == 0 {
            return Err(HypError::InvalidState);
        }
        let virq_num = virq_num.clamp(VIRQ_PRIV_NUM, VIRQ_MAX_NUM);
        let gicd = Distributor::new(nr_vcpus, virq_num)?;

        let mut gicr = Vec::new();
        gicr.try_reserve_exact(nr_vcpus)
            .map_err(|_| HypError::AllocFailure)?;
        for vcpu in 0..nr_vcpus {
            gicr.push(Redistributor::new(vcpu, nr_vcpus, geo.nr_lr)?);
        }

        Ok(Self {
            gicd_base,
            gicr_base,
            geo,
            gicd,
            gicr,
            loaded: None,
        })
    }

    pub fn geometry(&self) -> VgicGeometry {
        self.geo
    }

    pub fn nr_vcpus(&self) -> usize {
        self.gicr.len()
    }

    pub fn virq_num(&self) -> usize {
        self.gicd.virq_num()
    }

    pub fn gicd_base(&self) -> u64 {
        self.gicd_base
    }

    pub fn gicr_base(&self) -> u64 {
        self.gicr_base
    }

    pub fn loaded(&self) -> Option<usize> {
        self.loaded
    }

    pub fn in_gicd(&self, ipa: u64) -> bool {
        ipa >= self.gicd_base && ipa < self.gicd_base + VGIC_GICD_SIZE
    }

    pub fn in_gicr(&self, ipa: u64) -> bool {
        let size = self.gicr.len() as u64 * VGIC_GICR_STRIDE;
        ipa >= self.gicr_base && ipa < self.gicr_base + size
    }

    pub fn redistributor(&self, vcpu: usize) -> Option<&Redistributor> {
        self.gicr.get(vcpu)
    }

    pub fn virq(&self, vcpu: usize, id: u32) -> Option<&Virq> {
        let r = self.gicr.get(vcpu)?;
        lookup(&self.gicd, &r.virqs, id)
    }

    fn virq_mut(&mut self, vcpu: usize, id: u32) -> Option<&mut Virq> {
        let r = self.gicr.get_mut(vcpu)?;
        lookup_mut(&mut self.gicd, &mut r.virqs, id)
    }

    /// vCPU a virq is delivered to
    fn target(&self, vcpu: usize, id: u32) -> Option<usize> {
        if (id as usize) < VIRQ_PRIV_NUM {
            (vcpu < self.gicr.len()).then_some(vcpu)
        } else {
            self.gicd.spi(id).map(|v| v.vcpu)
        }
    }

    /// Back virq `id` with physical INTID `pintid`. A private id is bound on
    /// every vCPU.
    pub fn bind_hw(&mut self, id: u32, pintid: u32) -> bool {
        if (id as usize) < VIRQ_PRIV_NUM {
            for r in self.gicr.iter_mut() {
                r.virqs[id as usize].pintid = Some(pintid as u16);
            }
            return true;
        }
        match self.gicd.spi_mut(id) {
            Some(v) => {
                v.pintid = Some(pintid as u16);
                true
            }
            None => false,
        }
    }

    pub fn unbind_hw(&mut self, id: u32) {
        if (id as usize) < VIRQ_PRIV_NUM {
            for r in self.gicr.iter_mut() {
                r.virqs[id as usize].pintid = None;
            }
        } else if let Some(v) = self.gicd.spi_mut(id) {
            v.pintid = None;
        }
    }

    /// SPI bound to physical INTID `pintid`
    pub fn find_hw_spi(&self, pintid: u32) -> Option<u32> {
        self.gicd
            .spis()
            .find(|v| v.pintid == Some(pintid as u16))
            .map(|v| v.id as u32)
    }

    /// `vcpu` has a pending virq waiting to be taken.
    pub fn has_pending(&self, vcpu: usize) -> bool {
        let Some(r) = self.gicr.get(vcpu) else {
            return false;
        };
        r.overflow
            || r.candidates.iter().any(|&id| {
                lookup(&self.gicd, &r.virqs, id as u32).map_or(false, |v| v.state.is_pending())
            })
    }

    /// Queue `id` on its target's candidate list, or flag overflow when the
    /// list is full.
    fn enqueue(&mut self, target: usize, id: u32) {
        let queued = match self.virq(target, id) {
            Some(v) => v.queued_on.is_some(),
            None => return,
        };
        if queued {
            return;
        }
        let r = &mut self.gicr[target];
        if r.candidates_full() {
            if !r.overflow {
                warn!("vgic: vcpu {} candidate list full, virq {} deferred", target, id);
            }
            r.overflow = true;
            return;
        }
        r.candidates.push(id as u16);
        if let Some(v) = self.virq_mut(target, id) {
            v.queued_on = Some(target);
        }
    }

    /// Mark virq `id` pending on `vcpu` (the target is the IROUTER vCPU for
    /// SPIs). Disabled virqs and virqs already in a list register are left
    /// alone.
    ///
    /// Returns the vCPU the virq was pended on, `None` if nothing changed.
    pub fn inject<R: SysRegAccess + ?Sized>(&mut self, regs: &mut R, vcpu: usize, id: u32) -> Option<usize> {
        let Some(target) = self.target(vcpu, id) else {
            debug!("vgic: inject of unknown virq {}", id);
            return None;
        };
        let live = self.loaded == Some(target);
        if live {
            self.sync_from_hw(regs, target);
        }

        let v = self.virq_mut(target, id)?;
        if !v.enabled || v.in_lr {
            return None;
        }
        v.state = v.state.set_pending();
        self.enqueue(target, id);

        self.refill(target);
        if live {
            self.flush_to_hw(regs, target);
        }
        Some(target)
    }

    /// Apply one register-level update for the interrupt `id` as seen from
    /// `vcpu`, forwarding it to the physical GIC when hardware-backed.
    pub fn update<P: SysRegAccess + PhysicalGic + ?Sized>(
        &mut self,
        hw: &mut P,
        vcpu: usize,
        id: u32,
        update: VirqUpdate,
    ) {
        self.sync_loaded(hw);
        self.apply_update(hw, vcpu, id, update);
        self.commit(hw);
    }

    fn apply_update<G: PhysicalGic + ?Sized>(
        &mut self,
        gic: &mut G,
        vcpu: usize,
        id: u32,
        update: VirqUpdate,
    ) {
        let Some(v) = self.virq_mut(vcpu, id) else {
            return;
        };
        v.apply(update, gic);
        let target = v.vcpu;
        if v.deliverable() {
            self.enqueue(target, id);
        }
    }

    fn sync_loaded<R: SysRegAccess + ?Sized>(&mut self, regs: &mut R) {
        if let Some(vcpu) = self.loaded {
            self.sync_from_hw(regs, vcpu);
        }
    }

    /// Rebuild every vCPU's list-register mirror; the loaded one is also
    /// written to hardware.
    fn commit<R: SysRegAccess + ?Sized>(&mut self, regs: &mut R) {
        for vcpu in 0..self.gicr.len() {
            self.refill(vcpu);
        }
        if let Some(vcpu) = self.loaded {
            self.flush_to_hw(regs, vcpu);
        }
    }

    /// Pull list-register state back into the virqs and retire the ones
    /// the guest has finished with.
    pub fn sync_from_hw<R: SysRegAccess + ?Sized>(&mut self, regs: &mut R, vcpu: usize) {
        let nr_lr = self.geo.nr_lr;
        let Some(r) = self.gicr.get_mut(vcpu) else {
            return;
        };
        let elrsr = regs.read(SysReg::IchElrsr);

        for n in 0..nr_lr {
            let Some(id) = r.lr_slots[n] else {
                continue;
            };
            let state = if elrsr & (1 << n) != 0 {
                VirqState::Inactive
            } else {
                LrEntry::decode(regs.read(SysReg::IchLr(n as u8))).state
            };
            let Some(v) = lookup_mut(&mut self.gicd, &mut r.virqs, id as u32) else {
                r.lr_slots[n] = None;
                continue;
            };
            v.state = state;
            if state == VirqState::Inactive {
                v.in_lr = false;
                v.lr = None;
                v.queued_on = None;
                r.lr_slots[n] = None;
                if let Some(pos) = r.candidates.iter().position(|&c| c == id) {
                    r.candidates.swap_remove(pos);
                }
            }
        }
    }

    /// Re-sort the candidate list and assign the first `nr_lr` entries to
    /// list-register slots.
    fn refill(&mut self, vcpu: usize) {
        let nr_lr = self.geo.nr_lr;
        let gicd = &mut self.gicd;
        let Some(r) = self.gicr.get_mut(vcpu) else {
            return;
        };

        for slot in r.lr_slots.iter_mut() {
            if let Some(id) = slot.take() {
                if let Some(v) = lookup_mut(gicd, &mut r.virqs, id as u32) {
                    v.in_lr = false;
                    v.lr = None;
                }
            }
        }

        // Drop whatever stopped being deliverable.
        let mut i = 0;
        while i < r.candidates.len() {
            let id = r.candidates[i];
            let keep = lookup(gicd, &r.virqs, id as u32).map_or(false, |v| v.deliverable());
            if keep {
                i += 1;
            } else {
                r.candidates.swap_remove(i);
                if let Some(v) = lookup_mut(gicd, &mut r.virqs, id as u32) {
                    v.queued_on = None;
                }
            }
        }

        let spis: &Distributor = gicd;
        let privates = &r.virqs;
        r.candidates
            .sort_unstable_by_key(|&id| sort_key(lookup(spis, privates, id as u32), id));

        for (n, &id) in r.candidates.iter().take(nr_lr).enumerate() {
            r.lr_slots[n] = Some(id);
            if let Some(v) = lookup_mut(gicd, &mut r.virqs, id as u32) {
                v.in_lr = true;
                v.lr = Some(n as u8);
            }
        }
    }

    /// Write the list-register mirror and the maintenance enables.
    fn flush_to_hw<R: SysRegAccess + ?Sized>(&mut self, regs: &mut R, vcpu: usize) {
        let nr_lr = self.geo.nr_lr;
        let Some(r) = self.gicr.get_mut(vcpu) else {
            return;
        };

        for n in 0..nr_lr {
            let lr = r.lr_slots[n]
                .and_then(|id| lookup(&self.gicd, &r.virqs, id as u32))
                .map_or(0, |v| LrEntry::from_virq(v).encode());
            regs.write(SysReg::IchLr(n as u8), lr);
        }

        let mut hcr = (r.context.hcr & !(ICH_HCR_UIE | ICH_HCR_NPIE)) | ICH_HCR_EN;
        if r.backlog(nr_lr) > 0 {
            hcr |= ICH_HCR_NPIE;
        }
        if r.overflow {
            hcr |= ICH_HCR_UIE;
        }
        r.context.hcr = hcr;
        regs.write(SysReg::IchHcr, hcr);
    }

    /// Maintenance interrupt: retire finished virqs, pick up the ones that
    /// overflowed and repopulate the list registers.
    pub fn handle_maintenance<R: SysRegAccess + ?Sized>(&mut self, regs: &mut R, vcpu: usize) {
        if vcpu >= self.gicr.len() {
            return;
        }
        let misr = regs.read(SysReg::IchMisr);
        debug!("vgic: maintenance on vcpu {} misr={:#x}", vcpu, misr);

        self.sync_from_hw(regs, vcpu);
        self.gicr[vcpu].overflow = false;

        for id in 0..self.gicd.virq_num() as u32 {
            let stranded = self
                .virq(vcpu, id)
                .map_or(false, |v| v.vcpu == vcpu && v.deliverable() && v.queued_on.is_none());
            if stranded {
                self.enqueue(vcpu, id);
            }
        }

        self.refill(vcpu);
        if self.loaded == Some(vcpu) {
            self.flush_to_hw(regs, vcpu);
        }
    }

    /// Switch-out: capture list-register state and the ICH_* context.
    pub fn save<R: SysRegAccess + ?Sized>(&mut self, regs: &mut R, vcpu: usize) {
        if vcpu >= self.gicr.len() {
            return;
        }
        self.sync_from_hw(regs, vcpu);
        let geo = self.geo;
        let gicd = &mut self.gicd;
        let r = &mut self.gicr[vcpu];
        r.context.save(regs, &geo);
        for slot in r.lr_slots.iter_mut() {
            if let Some(id) = slot.take() {
                if let Some(v) = lookup_mut(gicd, &mut r.virqs, id as u32) {
                    v.in_lr = false;
                    v.lr = None;
                }
            }
        }
        if self.loaded == Some(vcpu) {
            self.loaded = None;
        }
    }

    /// Switch-in: load the ICH_* context and present the best candidates.
    pub fn restore<R: SysRegAccess + ?Sized>(&mut self, regs: &mut R, vcpu: usize) {
        if vcpu >= self.gicr.len() {
            return;
        }
        self.loaded = Some(vcpu);
        self.refill(vcpu);
        let geo = self.geo;
        self.gicr[vcpu].context.restore(regs, &geo);
        self.flush_to_hw(regs, vcpu);
    }

    /// Forget every pending and active virq of `vcpu` (vCPU reset).
    pub fn reset_vcpu(&mut self, vcpu: usize) {
        let gicd = &mut self.gicd;
        let Some(r) = self.gicr.get_mut(vcpu) else {
            return;
        };
        for id in r.candidates.drain(..) {
            if let Some(v) = lookup_mut(gicd, &mut r.virqs, id as u32) {
                v.state = VirqState::Inactive;
                v.in_lr = false;
                v.lr = None;
                v.queued_on = None;
            }
        }
        r.lr_slots = [None; crate::platform::MAX_LR_REGS];
        r.overflow = false;
        r.context = GicCpuContext::new();
        if self.loaded == Some(vcpu) {
            self.loaded = None;
        }
    }

    /// Guest read of a vGIC register. `None` when `ipa` is outside both the
    /// distributor and redistributor windows.
    pub fn mmio_read<R: SysRegAccess + ?Sized>(
        &mut self,
        regs: &mut R,
        ipa: u64,
        size: u8,
    ) -> Option<u64> {
        if self.in_gicd(ipa) {
            self.sync_loaded(regs);
            let off = ipa - self.gicd_base;
            let gicd = &self.gicd;
            let value = match IrqReg::decode(off) {
                // Private interrupts live in the redistributors.
                Some(reg) => reg.read(size, |id| {
                    if (id as usize) < VIRQ_PRIV_NUM {
                        None
                    } else {
                        gicd.spi(id)
                    }
                }),
                None => gicd.read_ctrl(off, size),
            };
            return Some(value);
        }

        if self.in_gicr(ipa) {
            self.sync_loaded(regs);
            let rel = ipa - self.gicr_base;
            let r = &self.gicr[(rel / VGIC_GICR_STRIDE) as usize];
            let value = match GicrReg::decode(rel % VGIC_GICR_STRIDE) {
                GicrReg::Rd(off) => r.read_rd(off, size),
                GicrReg::Sgi(reg) => reg.read(size, |id| r.virqs.get(id as usize)),
                GicrReg::SgiConfig => r.icfgr0(),
                GicrReg::Ignored => 0,
            };
            return Some(value);
        }

        None
    }

    /// Guest write of a vGIC register. Returns `false` when `ipa` is outside
    /// both windows.
    pub fn mmio_write<P: SysRegAccess + PhysicalGic + ?Sized>(
        &mut self,
        hw: &mut P,
        ipa: u64,
        value: u64,
        size: u8,
    ) -> bool {
        if self.in_gicd(ipa) {
            let off = ipa - self.gicd_base;
            match IrqReg::decode(off) {
                Some(reg) => {
                    self.sync_loaded(hw);
                    reg.for_each_update(value, size, |id, update| {
                        if (id as usize) >= VIRQ_PRIV_NUM {
                            self.apply_update(hw, 0, id, update);
                        }
                    });
                    self.commit(hw);
                }
                None => self.gicd.write_ctrl(off, value, size),
            }
            return true;
        }

        if self.in_gicr(ipa) {
            let rel = ipa - self.gicr_base;
            let vcpu = (rel / VGIC_GICR_STRIDE) as usize;
            match GicrReg::decode(rel % VGIC_GICR_STRIDE) {
                GicrReg::Rd(off) => self.gicr[vcpu].write_rd(off, value),
                GicrReg::Sgi(reg) => {
                    self.sync_loaded(hw);
                    reg.for_each_update(value, size, |id, update| {
                        if (id as usize) < VIRQ_PRIV_NUM {
                            self.apply_update(hw, vcpu, id, update);
                        }
                    });
                    self.commit(hw);
                }
                GicrReg::SgiConfig | GicrReg::Ignored => {}
            }
            return true;
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::soft::{GicEvent, SimPlatform};

    const GICD: u64 = 0x0800_0000;
    const GICR: u64 = 0x080A_0000;

    fn setup(nr_lr: u8, nr_vcpus: usize) -> (SimPlatform, Vgic) {
        let p = SimPlatform::new(nr_lr);
        let geo = VgicGeometry::probe(&p);
        let vgic = Vgic::new(nr_vcpus, 128, GICD, GICR, geo).unwrap();
        (p, vgic)
    }

    fn enable(p: &mut SimPlatform, vgic: &mut Vgic, vcpu: usize, id: u32) {
        vgic.update(p, vcpu, id, VirqUpdate::Enable);
    }

    #[test]
    fn test_disabled_virq_is_not_injected() {
        let (mut p, mut vgic) = setup(4, 1);
        vgic.restore(&mut p, 0);
        assert_eq!(vgic.inject(&mut p, 0, 40), None);
        assert_eq!(vgic.virq(0, 40).unwrap().state, VirqState::Inactive);
        assert_eq!(p.read(SysReg::IchLr(0)), 0);
    }

    #[test]
    fn test_inject_into_loaded_vcpu_writes_lr() {
        let (mut p, mut vgic) = setup(4, 1);
        vgic.restore(&mut p, 0);
        enable(&mut p, &mut vgic, 0, 27);
        assert_eq!(vgic.inject(&mut p, 0, 27), Some(0));
        let lr = LrEntry::decode(p.read(SysReg::IchLr(0)));
        assert_eq!(lr.vintid, 27);
        assert_eq!(lr.state, VirqState::Pending);
        assert!(vgic.virq(0, 27).unwrap().in_lr);
    }

    #[test]
    fn test_inject_twice_one_entry() {
        let (mut p, mut vgic) = setup(4, 1);
        vgic.restore(&mut p, 0);
        enable(&mut p, &mut vgic, 0, 33);
        assert_eq!(vgic.inject(&mut p, 0, 33), Some(0));
        // Already in a list register.
        assert_eq!(vgic.inject(&mut p, 0, 33), None);
        let occupied = (0..4)
            .filter(|&n| p.read(SysReg::IchLr(n)) & 0xFFFF_FFFF == 33)
            .count();
        assert_eq!(occupied, 1);
        assert_eq!(vgic.redistributor(0).unwrap().candidates.len(), 1);
    }

    #[test]
    fn test_eoi_retires_virq() {
        let (mut p, mut vgic) = setup(4, 1);
        vgic.restore(&mut p, 0);
        enable(&mut p, &mut vgic, 0, 33);
        vgic.inject(&mut p, 0, 33);
        // Guest acknowledges and completes the interrupt.
        p.regs.set_lr_state(0, 0);
        vgic.handle_maintenance(&mut p, 0);
        let v = vgic.virq(0, 33).unwrap();
        assert_eq!(v.state, VirqState::Inactive);
        assert!(!v.in_lr);
        assert!(vgic.redistributor(0).unwrap().candidates.is_empty());
        // And it can be delivered again.
        vgic.inject(&mut p, 0, 33);
        assert_eq!(vgic.virq(0, 33).unwrap().state, VirqState::Pending);
    }

    #[test]
    fn test_highest_priority_wins_lrs() {
        let (mut p, mut vgic) = setup(4, 1);
        vgic.restore(&mut p, 0);
        let prios = [0x80u8, 0x10, 0x60, 0x20, 0x40, 0x30];
        for (i, &prio) in prios.iter().enumerate() {
            let id = 40 + i as u32;
            enable(&mut p, &mut vgic, 0, id);
            vgic.update(&mut p, 0, id, VirqUpdate::Priority(prio));
        }
        for i in 0..6 {
            vgic.inject(&mut p, 0, 40 + i);
        }
        let mut in_hw: Vec<u32> = (0..4)
            .map(|n| LrEntry::decode(p.read(SysReg::IchLr(n))).vintid)
            .collect();
        in_hw.sort_unstable();
        // Priorities 0x10, 0x20, 0x30, 0x40
        assert_eq!(in_hw, [41, 43, 44, 45]);
        assert_eq!(vgic.redistributor(0).unwrap().backlog(4), 2);
        assert_ne!(p.read(SysReg::IchHcr) & ICH_HCR_NPIE, 0);
    }

    #[test]
    fn test_priority_tie_lowest_id_first() {
        let (mut p, mut vgic) = setup(1, 1);
        vgic.restore(&mut p, 0);
        for id in [50, 45] {
            enable(&mut p, &mut vgic, 0, id);
            vgic.inject(&mut p, 0, id);
        }
        assert_eq!(LrEntry::decode(p.read(SysReg::IchLr(0))).vintid, 45);
    }

    #[test]
    fn test_backlog_survives_switch() {
        let (mut p, mut vgic) = setup(2, 1);
        vgic.restore(&mut p, 0);
        for id in 40..43 {
            enable(&mut p, &mut vgic, 0, id);
            vgic.inject(&mut p, 0, id);
        }
        vgic.save(&mut p, 0);
        assert_eq!(p.read(SysReg::IchLr(0)), 0);
        assert!(!vgic.virq(0, 40).unwrap().in_lr);

        vgic.restore(&mut p, 0);
        assert_eq!(LrEntry::decode(p.read(SysReg::IchLr(0))).vintid, 40);
        assert_eq!(LrEntry::decode(p.read(SysReg::IchLr(1))).vintid, 41);
        assert_eq!(vgic.redistributor(0).unwrap().backlog(2), 1);
    }

    #[test]
    fn test_inject_while_switched_out() {
        let (mut p, mut vgic) = setup(4, 2);
        enable(&mut p, &mut vgic, 1, 30);
        vgic.restore(&mut p, 0);
        vgic.inject(&mut p, 1, 30);
        // vCPU 1 is not loaded: hardware untouched.
        assert_eq!(p.read(SysReg::IchLr(0)), 0);
        vgic.save(&mut p, 0);
        vgic.restore(&mut p, 1);
        assert_eq!(LrEntry::decode(p.read(SysReg::IchLr(0))).vintid, 30);
    }

    #[test]
    fn test_overflow_requests_maintenance() {
        let (mut p, mut vgic) = setup(1, 1);
        vgic.restore(&mut p, 0);
        let limit = 1 + crate::platform::GIC_LR_LIST_NUM as u32;
        for id in 32..32 + limit + 1 {
            enable(&mut p, &mut vgic, 0, id);
            vgic.inject(&mut p, 0, id);
        }
        let r = vgic.redistributor(0).unwrap();
        assert!(r.overflow);
        assert_eq!(r.candidates.len(), limit as usize);
        assert_ne!(p.read(SysReg::IchHcr) & ICH_HCR_UIE, 0);
        // The deferred virq is still pending.
        assert!(vgic.virq(0, 32 + limit).unwrap().state.is_pending());

        // Guest completes the one in the LR; maintenance pulls the straggler in.
        p.regs.set_lr_state(0, 0);
        vgic.handle_maintenance(&mut p, 0);
        let r = vgic.redistributor(0).unwrap();
        assert!(!r.overflow);
        assert!(r.candidates.contains(&((32 + limit) as u16)));
        assert_eq!(p.read(SysReg::IchHcr) & ICH_HCR_UIE, 0);
    }

    #[test]
    fn test_gicd_mmio_enable_and_read_back() {
        let (mut p, mut vgic) = setup(4, 1);
        assert!(vgic.mmio_write(&mut p, GICD + 0x104, 0b11, 4));
        assert!(vgic.virq(0, 32).unwrap().enabled);
        assert!(vgic.virq(0, 33).unwrap().enabled);
        assert_eq!(vgic.mmio_read(&mut p, GICD + 0x104, 4), Some(0b11));
        vgic.mmio_write(&mut p, GICD + 0x184, 0b01, 4);
        assert_eq!(vgic.mmio_read(&mut p, GICD + 0x104, 4), Some(0b10));
        // GICD ignores private INTIDs.
        vgic.mmio_write(&mut p, GICD + 0x100, 0xFFFF_FFFF, 4);
        assert!(!vgic.virq(0, 5).unwrap().enabled);
        assert!(p.gic.events.is_empty());
    }

    #[test]
    fn test_gicd_mmio_forwards_hw_backed() {
        let (mut p, mut vgic) = setup(4, 1);
        assert!(vgic.bind_hw(33, 33));
        vgic.mmio_write(&mut p, GICD + 0x104, 0b11, 4);
        vgic.mmio_write(&mut p, GICD + 0x420, 0x0000_8000, 4);
        assert_eq!(
            p.gic.events,
            [GicEvent::Unmask(33), GicEvent::Priority(33, 0x80)]
        );
        assert_eq!(vgic.virq(0, 32).unwrap().priority, 0);
    }

    #[test]
    fn test_ispendr_write_queues_enabled_virq() {
        let (mut p, mut vgic) = setup(4, 1);
        vgic.restore(&mut p, 0);
        vgic.mmio_write(&mut p, GICD + 0x104, 1 << 8, 4);
        vgic.mmio_write(&mut p, GICD + 0x204, 1 << 8, 4);
        assert_eq!(LrEntry::decode(p.read(SysReg::IchLr(0))).vintid, 40);
        assert_eq!(vgic.mmio_read(&mut p, GICD + 0x204, 4), Some(1 << 8));
        vgic.mmio_write(&mut p, GICD + 0x284, 1 << 8, 4);
        assert_eq!(p.read(SysReg::IchLr(0)), 0);
        assert!(vgic.redistributor(0).unwrap().candidates.is_empty());
    }

    #[test]
    fn test_gicr_sgi_frame() {
        let (mut p, mut vgic) = setup(4, 2);
        let frame1 = GICR + VGIC_GICR_STRIDE;
        vgic.mmio_write(&mut p, frame1 + 0x1_0100, 1 << 27, 4);
        assert!(vgic.virq(1, 27).unwrap().enabled);
        assert!(!vgic.virq(0, 27).unwrap().enabled);
        assert_eq!(vgic.mmio_read(&mut p, frame1 + 0x1_0C00, 4), Some(0xAAAA_AAAA));
        vgic.mmio_write(&mut p, frame1 + 0x1_0C00, 0, 4);
        assert_eq!(vgic.mmio_read(&mut p, frame1 + 0x1_0C00, 4), Some(0xAAAA_AAAA));
        assert_eq!(vgic.mmio_read(&mut p, frame1 + 0x8, 8).map(|t| t >> 32), Some(1));
    }

    #[test]
    fn test_unowned_address() {
        let (mut p, mut vgic) = setup(4, 1);
        assert_eq!(vgic.mmio_read(&mut p, GICR + VGIC_GICR_STRIDE, 4), None);
        assert!(!vgic.mmio_write(&mut p, 0x0900_0000, 1, 4));
        assert_eq!(vgic.mmio_read(&mut p, GICD + 0x9000, 4), Some(0));
    }

    #[test]
    fn test_spi_follows_irouter() {
        let (mut p, mut vgic) = setup(4, 2);
        vgic.mmio_write(&mut p, GICD + 0x6100 + 8 * 8, 1, 8);
        enable(&mut p, &mut vgic, 0, 40);
        vgic.inject(&mut p, 0, 40);
        assert!(vgic.redistributor(0).unwrap().candidates.is_empty());
        assert_eq!(vgic.redistributor(1).unwrap().candidates, [40]);
    }
}
