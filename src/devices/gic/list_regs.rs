//! List registers and the per-vCPU GIC virtualization context
//!
//! ICH_LR<n>_EL2 layout:
//!   [63:62] State, [61] HW, [60] Group, [55:48] Priority,
//!   [44:32] pINTID (HW = 1), [31:0] vINTID

use super::virq::{Virq, VirqState};
use crate::arch::aarch64::defs::*;
use crate::arch::traits::{SysReg, SysRegAccess};
use crate::platform::MAX_LR_REGS;

/// Decoded list register
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LrEntry {
    pub vintid: u32,
    pub pintid: Option<u16>,
    pub priority: u8,
    pub group1: bool,
    pub state: VirqState,
}

impl LrEntry {
    pub fn from_virq(virq: &Virq) -> Self {
        Self {
            vintid: virq.id as u32,
            pintid: virq.pintid,
            priority: virq.priority,
            group1: virq.group1,
            state: virq.state,
        }
    }

    pub fn encode(&self) -> u64 {
        let mut lr = (self.state.lr_bits() << LR_STATE_SHIFT)
            | ((self.priority as u64 & LR_PRIORITY_MASK) << LR_PRIORITY_SHIFT)
            | (self.vintid as u64 & LR_VINTID_MASK);
        if self.group1 {
            lr |= LR_GROUP1_BIT;
        }
        if let Some(p) = self.pintid {
            lr |= LR_HW_BIT | ((p as u64 & LR_PINTID_MASK) << LR_PINTID_SHIFT);
        }
        lr
    }

    pub fn decode(lr: u64) -> Self {
        Self {
            vintid: (lr & LR_VINTID_MASK) as u32,
            pintid: if lr & LR_HW_BIT != 0 {
                Some(((lr >> LR_PINTID_SHIFT) & LR_PINTID_MASK) as u16)
            } else {
                None
            },
            priority: ((lr >> LR_PRIORITY_SHIFT) & LR_PRIORITY_MASK) as u8,
            group1: lr & LR_GROUP1_BIT != 0,
            state: VirqState::from_lr_bits(lr >> LR_STATE_SHIFT),
        }
    }
}

/// List register count and priority bits, from ICH_VTR_EL2
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VgicGeometry {
    pub nr_lr: usize,
    pub nr_pr: u8,
}

impl VgicGeometry {
    pub fn probe<R: SysRegAccess + ?Sized>(regs: &R) -> Self {
        let vtr = regs.read(SysReg::IchVtr);
        Self {
            nr_lr: (((vtr & VTR_LISTREGS_MASK) + 1) as usize).min(MAX_LR_REGS),
            nr_pr: (((vtr >> VTR_PRIBITS_SHIFT) & VTR_PRIBITS_MASK) + 1) as u8,
        }
    }

    /// Active-priority registers implemented for `nr_pr` priority bits
    pub fn nr_apr(&self) -> u8 {
        match self.nr_pr {
            7 => 4,
            6 => 2,
            _ => 1,
        }
    }
}

/// GIC virtualization registers saved across a vCPU switch
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GicCpuContext {
    pub lrs: [u64; MAX_LR_REGS],
    pub ap1r: [u64; 4],
    pub vmcr: u64,
    pub hcr: u64,
    pub sre: u64,
}

impl GicCpuContext {
    pub const fn new() -> Self {
        Self {
            lrs: [0; MAX_LR_REGS],
            ap1r: [0; 4],
            vmcr: ICH_VMCR_RESET,
            hcr: ICH_HCR_EN,
            sre: ICC_SRE_RESET,
        }
    }

    /// Save the control state and the raw LRs, then quiesce the interface.
    pub fn save<R: SysRegAccess + ?Sized>(&mut self, regs: &mut R, geo: &VgicGeometry) {
        for n in 0..geo.nr_lr {
            self.lrs[n] = regs.read(SysReg::IchLr(n as u8));
        }
        for n in 0..geo.nr_apr() {
            self.ap1r[n as usize] = regs.read(SysReg::IchAp1r(n));
        }
        self.vmcr = regs.read(SysReg::IchVmcr);
        self.hcr = regs.read(SysReg::IchHcr);
        self.sre = regs.read(SysReg::IccSreEl1);

        for n in 0..geo.nr_lr {
            regs.write(SysReg::IchLr(n as u8), 0);
        }
        regs.write(SysReg::IchHcr, 0);
    }

    /// Load the control state; LR contents are written by the vGIC.
    pub fn restore<R: SysRegAccess + ?Sized>(&self, regs: &mut R, geo: &VgicGeometry) {
        for n in 0..geo.nr_apr() {
            regs.write(SysReg::IchAp1r(n), self.ap1r[n as usize]);
        }
        regs.write(SysReg::IchVmcr, self.vmcr);
        regs.write(SysReg::IccSreEl1, self.sre);
        regs.write(SysReg::IchHcr, self.hcr);
    }
}

impl Default for GicCpuContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::soft::SoftSysRegs;

    #[test]
    fn test_lr_encode_decode() {
        let e = LrEntry {
            vintid: 27,
            pintid: Some(27),
            priority: 0xA0,
            group1: true,
            state: VirqState::Pending,
        };
        let raw = e.encode();
        assert_eq!(raw >> 62, 0b01);
        assert_ne!(raw & LR_HW_BIT, 0);
        assert_eq!(LrEntry::decode(raw), e);

        let sw = LrEntry { pintid: None, ..e };
        assert_eq!(sw.encode() & LR_HW_BIT, 0);
        assert_eq!(LrEntry::decode(sw.encode()).pintid, None);
    }

    #[test]
    fn test_geometry_from_vtr() {
        let regs = SoftSysRegs::with_pri_bits(4, 7);
        let geo = VgicGeometry::probe(&regs);
        assert_eq!(geo.nr_lr, 4);
        assert_eq!(geo.nr_pr, 7);
        assert_eq!(geo.nr_apr(), 4);
        assert_eq!(VgicGeometry { nr_lr: 4, nr_pr: 5 }.nr_apr(), 1);
        assert_eq!(VgicGeometry { nr_lr: 4, nr_pr: 6 }.nr_apr(), 2);
    }

    #[test]
    fn test_context_save_clears_hardware() {
        let mut regs = SoftSysRegs::with_pri_bits(4, 6);
        let geo = VgicGeometry::probe(&regs);
        regs.write(SysReg::IchLr(2), 0x4000_0000_0000_001B);
        regs.write(SysReg::IchAp1r(1), 0x8);
        regs.write(SysReg::IchVmcr, 0x1234);
        regs.write(SysReg::IchHcr, ICH_HCR_EN | ICH_HCR_NPIE);

        let mut ctx = GicCpuContext::new();
        ctx.save(&mut regs, &geo);
        assert_eq!(ctx.lrs[2], 0x4000_0000_0000_001B);
        assert_eq!(ctx.ap1r[1], 0x8);
        assert_eq!(regs.read(SysReg::IchLr(2)), 0);
        assert_eq!(regs.read(SysReg::IchHcr), 0);

        ctx.restore(&mut regs, &geo);
        assert_eq!(regs.read(SysReg::IchVmcr), 0x1234);
        assert_eq!(regs.read(SysReg::IchAp1r(1)), 0x8);
        assert_eq!(regs.read(SysReg::IchHcr), ICH_HCR_EN | ICH_HCR_NPIE);
    }
}
