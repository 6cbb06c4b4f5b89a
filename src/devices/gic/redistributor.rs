/// Virtual GIC Redistributor (GICR)
///
/// One per vCPU. Each occupies a 128KB window:
///   - RD frame   (0x00000..0x0FFFF): CTLR, IIDR, TYPER, STATUSR, WAKER, PIDR2
///   - SGI frame  (0x10000..0x1FFFF): IGROUPR0, IS/ICENABLER0, IS/ICPENDR0,
///     IS/ICACTIVER0, IPRIORITYR0-7, ICFGR0-1
///
/// Besides the register frame it carries the vCPU's private virqs, the
/// candidate list feeding the list registers and the saved GIC CPU context.
use alloc::vec::Vec;

use super::distributor::{IrqReg, GIC_IIDR_VALUE, GIC_PIDR2_VALUE};
use super::list_regs::GicCpuContext;
use super::virq::Virq;
use crate::error::HypError;
use crate::platform::{GIC_LR_LIST_NUM, MAX_LR_REGS, VIRQ_PRIV_NUM};

// ── RD frame register offsets ────────────────────────────────────────
const GICR_CTLR: u64 = 0x0000;
const GICR_IIDR: u64 = 0x0004;
const GICR_TYPER: u64 = 0x0008;
const GICR_TYPER_HI: u64 = 0x000C;
const GICR_STATUSR: u64 = 0x0010;
const GICR_WAKER: u64 = 0x0014;
const GICR_PIDR2: u64 = 0xFFE8;

// ── SGI frame register offsets (relative to SGI base = RD + 0x10000) ─
pub const GICR_SGI_OFFSET: u64 = 0x1_0000;
const GICR_IGROUPR0: u64 = 0x0080;
const GICR_ICACTIVER0: u64 = 0x0380;
const GICR_IPRIORITYR_END: u64 = 0x041F;
const GICR_ICFGR0: u64 = 0x0C00;
const GICR_ICFGR1: u64 = 0x0C04;

const GICR_WAKER_PROCESSOR_SLEEP: u32 = 1 << 1;
const GICR_WAKER_CHILDREN_ASLEEP: u32 = 1 << 2;
/// SGIs are always edge-triggered
const GICR_ICFGR0_VALUE: u64 = 0xAAAA_AAAA;

/// Which frame and register a GICR offset names
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GicrReg {
    Rd(u64),
    Sgi(IrqReg),
    /// ICFGR0, read-only
    SgiConfig,
    /// Unimplemented offset in either frame
    Ignored,
}

impl GicrReg {
    /// `offset` is relative to this vCPU's RD frame.
    pub fn decode(offset: u64) -> Self {
        if offset < GICR_SGI_OFFSET {
            return GicrReg::Rd(offset);
        }
        let off = offset - GICR_SGI_OFFSET;
        let reg = match off {
            GICR_ICFGR0 => return GicrReg::SgiConfig,
            GICR_ICFGR1 => IrqReg::decode(off),
            0x0400..=GICR_IPRIORITYR_END => IrqReg::decode(off),
            // Only register 0 of each bit bank exists in this frame.
            GICR_IGROUPR0..=GICR_ICACTIVER0 if off & 0x7F == 0 => IrqReg::decode(off),
            _ => None,
        };
        reg.map_or(GicrReg::Ignored, GicrReg::Sgi)
    }
}

/// One vCPU's redistributor and list-register bookkeeping
pub struct Redistributor {
    vcpu: usize,
    last: bool,
    ctlr: u32,
    waker: u32,
    /// SGIs and PPIs, indexed by INTID
    pub virqs: [Virq; VIRQ_PRIV_NUM],
    /// Every virq of this vCPU that is pending or active, sorted so the
    /// first `nr_lr` entries are the ones presented in hardware
    pub candidates: Vec<u16>,
    /// `nr_lr` plus the software backlog
    limit: usize,
    /// Software mirror of the list registers: which virq occupies each
    pub lr_slots: [Option<u16>; MAX_LR_REGS],
    /// A pending virq could not be queued because the list was full
    pub overflow: bool,
    /// Saved ICH_* state while the vCPU is switched out
    pub context: GicCpuContext,
}

impl Redistributor {
    pub fn new(vcpu: usize, nr_vcpus: usize, nr_lr: usize) -> Result<Self, HypError> {
        let mut candidates = Vec::new();
        candidates
            .try_reserve_exact(nr_lr + GIC_LR_LIST_NUM)
            .map_err(|_| HypError::AllocFailure)?;

        let mut virqs = [Virq::new(0, vcpu); VIRQ_PRIV_NUM];
        for (id, v) in virqs.iter_mut().enumerate() {
            *v = Virq::new(id as u16, vcpu);
        }

        Ok(Self {
            vcpu,
            last: vcpu + 1 == nr_vcpus,
            ctlr: 0,
            waker: GICR_WAKER_PROCESSOR_SLEEP | GICR_WAKER_CHILDREN_ASLEEP,
            virqs,
            candidates,
            limit: nr_lr + GIC_LR_LIST_NUM,
            lr_slots: [None; MAX_LR_REGS],
            overflow: false,
            context: GicCpuContext::new(),
        })
    }

    pub fn vcpu(&self) -> usize {
        self.vcpu
    }

    /// The candidate list has no room for another virq.
    pub fn candidates_full(&self) -> bool {
        self.candidates.len() >= self.limit
    }

    /// Virqs waiting in software for a free list register
    pub fn backlog(&self, nr_lr: usize) -> usize {
        self.candidates.len().saturating_sub(nr_lr)
    }

    /// Affinity | Processor_Number | Last
    pub fn typer(&self) -> u64 {
        let aff0 = (self.vcpu as u64) << 32;
        let proc_num = (self.vcpu as u64) << 8;
        let last = if self.last { 1 << 4 } else { 0 };
        aff0 | proc_num | last
    }

    pub fn read_rd(&self, offset: u64, size: u8) -> u64 {
        match offset {
            GICR_CTLR => self.ctlr as u64,
            GICR_IIDR => GIC_IIDR_VALUE as u64,
            GICR_TYPER if size == 8 => self.typer(),
            GICR_TYPER => self.typer() & 0xFFFF_FFFF,
            GICR_TYPER_HI => self.typer() >> 32,
            GICR_STATUSR => 0,
            GICR_WAKER => self.waker as u64,
            GICR_PIDR2 => GIC_PIDR2_VALUE as u64,
            _ => 0,
        }
    }

    pub fn write_rd(&mut self, offset: u64, value: u64) {
        match offset {
            GICR_CTLR => self.ctlr = value as u32 & 0x1,
            GICR_WAKER => {
                // ChildrenAsleep follows ProcessorSleep immediately.
                self.waker = if value as u32 & GICR_WAKER_PROCESSOR_SLEEP != 0 {
                    GICR_WAKER_PROCESSOR_SLEEP | GICR_WAKER_CHILDREN_ASLEEP
                } else {
                    0
                };
            }
            _ => {}
        }
    }

    pub fn icfgr0(&self) -> u64 {
        GICR_ICFGR0_VALUE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::gic::distributor::BitBank;

    #[test]
    fn test_typer_last_and_affinity() {
        let r0 = Redistributor::new(0, 2, 4).unwrap();
        let r1 = Redistributor::new(1, 2, 4).unwrap();
        assert_eq!(r0.typer() & (1 << 4), 0);
        assert_ne!(r1.typer() & (1 << 4), 0);
        assert_eq!(r1.typer() >> 32, 1);
        assert_eq!(r1.read_rd(GICR_TYPER_HI, 4), 1);
        assert_eq!(r1.read_rd(GICR_TYPER, 4), (1 << 8) | (1 << 4));
    }

    #[test]
    fn test_waker_handshake() {
        let mut r = Redistributor::new(0, 1, 4).unwrap();
        assert_eq!(r.read_rd(GICR_WAKER, 4), 0x6);
        r.write_rd(GICR_WAKER, 0);
        assert_eq!(r.read_rd(GICR_WAKER, 4), 0);
    }

    #[test]
    fn test_sgi_frame_decode() {
        assert_eq!(
            GicrReg::decode(GICR_SGI_OFFSET + 0x100),
            GicrReg::Sgi(IrqReg::Bits { bank: BitBank::SetEnable, first: 0 })
        );
        assert_eq!(
            GicrReg::decode(GICR_SGI_OFFSET + 0x41C),
            GicrReg::Sgi(IrqReg::Priority { first: 28 })
        );
        assert_eq!(GicrReg::decode(GICR_SGI_OFFSET + 0xC00), GicrReg::SgiConfig);
        assert_eq!(
            GicrReg::decode(GICR_SGI_OFFSET + 0xC04),
            GicrReg::Sgi(IrqReg::Config { first: 16 })
        );
        assert_eq!(GicrReg::decode(GICR_SGI_OFFSET + 0x104), GicrReg::Ignored);
        assert_eq!(GicrReg::decode(GICR_WAKER), GicrReg::Rd(GICR_WAKER));
    }

    #[test]
    fn test_candidate_capacity() {
        let r = Redistributor::new(0, 1, 4).unwrap();
        assert!(r.candidates.capacity() >= 4 + GIC_LR_LIST_NUM);
        assert_eq!(r.backlog(4), 0);
    }
}
