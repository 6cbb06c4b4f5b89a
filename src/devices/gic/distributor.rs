/// Virtual GIC Distributor (GICD)
///
/// Holds the VM-wide SPI state and the distributor's own control registers.
/// The per-interrupt register banks (IGROUPR..ICFGR) have the same layout in
/// GICD and in the redistributor SGI frame, so their decoding lives here and
/// is shared by both.
use alloc::vec::Vec;

use super::virq::{TriggerMode, Virq, VirqUpdate};
use crate::error::HypError;
use crate::platform::VIRQ_PRIV_NUM;

// ── Register offsets ─────────────────────────────────────────────────
pub const GICD_CTLR: u64 = 0x0000;
pub const GICD_TYPER: u64 = 0x0004;
pub const GICD_IIDR: u64 = 0x0008;
pub const GICD_IGROUPR: u64 = 0x0080;
pub const GICD_ISENABLER: u64 = 0x0100;
pub const GICD_ICENABLER: u64 = 0x0180;
pub const GICD_ISPENDR: u64 = 0x0200;
pub const GICD_ICPENDR: u64 = 0x0280;
pub const GICD_ISACTIVER: u64 = 0x0300;
pub const GICD_ICACTIVER: u64 = 0x0380;
pub const GICD_IPRIORITYR: u64 = 0x0400;
pub const GICD_IPRIORITYR_END: u64 = 0x07FB;
pub const GICD_ICFGR: u64 = 0x0C00;
pub const GICD_ICFGR_END: u64 = 0x0CFC;
pub const GICD_IROUTER: u64 = 0x6100;
pub const GICD_IROUTER_END: u64 = 0x7FD8;
pub const GICD_PIDR2: u64 = 0xFFE8;

/// EnableGrp1NS | EnableGrp1A
const GICD_CTLR_ENABLE_MASK: u32 = 0x3;
/// Affinity routing is always on
const GICD_CTLR_ARE_NS: u32 = 1 << 4;

/// ARM as implementer
pub const GIC_IIDR_VALUE: u32 = 0x0000_043B;
/// ArchRev 3
pub const GIC_PIDR2_VALUE: u32 = 0x30;
/// 10 INTID bits
const GICD_TYPER_IDBITS: u32 = 9 << 19;

/// Per-interrupt bit registers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BitBank {
    Group,
    SetEnable,
    ClearEnable,
    SetPending,
    ClearPending,
    SetActive,
    ClearActive,
}

impl BitBank {
    /// Bit value a read reports for `virq`
    pub fn read_bit(self, virq: &Virq) -> bool {
        match self {
            BitBank::Group => virq.group1,
            BitBank::SetEnable | BitBank::ClearEnable => virq.enabled,
            BitBank::SetPending | BitBank::ClearPending => virq.state.is_pending(),
            BitBank::SetActive | BitBank::ClearActive => virq.state.is_active(),
        }
    }

    /// Update for one bit of a write; writing 0 to a set/clear register
    /// has no effect.
    pub fn update(self, bit: bool) -> Option<VirqUpdate> {
        match (self, bit) {
            (BitBank::Group, g) => Some(VirqUpdate::Group(g)),
            (_, false) => None,
            (BitBank::SetEnable, true) => Some(VirqUpdate::Enable),
            (BitBank::ClearEnable, true) => Some(VirqUpdate::Disable),
            (BitBank::SetPending, true) => Some(VirqUpdate::SetPending),
            (BitBank::ClearPending, true) => Some(VirqUpdate::ClearPending),
            (BitBank::SetActive, true) => Some(VirqUpdate::SetActive),
            (BitBank::ClearActive, true) => Some(VirqUpdate::ClearActive),
        }
    }
}

/// Decoded per-interrupt register access
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IrqReg {
    /// 32 interrupts per register, starting at `first`
    Bits { bank: BitBank, first: u32 },
    /// One byte per interrupt, starting at `first`
    Priority { first: u32 },
    /// Two bits per interrupt, 16 per register
    Config { first: u32 },
}

impl IrqReg {
    pub fn decode(offset: u64) -> Option<Self> {
        let bits = |base: u64, bank: BitBank| IrqReg::Bits {
            bank,
            first: ((offset - base) / 4 * 32) as u32,
        };
        let reg = match offset {
            GICD_IGROUPR..=0x00FC => bits(GICD_IGROUPR, BitBank::Group),
            GICD_ISENABLER..=0x017C => bits(GICD_ISENABLER, BitBank::SetEnable),
            GICD_ICENABLER..=0x01FC => bits(GICD_ICENABLER, BitBank::ClearEnable),
            GICD_ISPENDR..=0x027C => bits(GICD_ISPENDR, BitBank::SetPending),
            GICD_ICPENDR..=0x02FC => bits(GICD_ICPENDR, BitBank::ClearPending),
            GICD_ISACTIVER..=0x037C => bits(GICD_ISACTIVER, BitBank::SetActive),
            GICD_ICACTIVER..=0x03FC => bits(GICD_ICACTIVER, BitBank::ClearActive),
            GICD_IPRIORITYR..=GICD_IPRIORITYR_END => {
                return Some(IrqReg::Priority {
                    first: (offset - GICD_IPRIORITYR) as u32,
                })
            }
            GICD_ICFGR..=GICD_ICFGR_END => IrqReg::Config {
                first: ((offset - GICD_ICFGR) / 4 * 16) as u32,
            },
            _ => return None,
        };
        // Only the priority bank allows sub-word access.
        if offset & 0x3 != 0 {
            return None;
        }
        Some(reg)
    }

    /// Demultiplex a write into one update per affected interrupt.
    pub fn for_each_update(self, value: u64, size: u8, mut f: impl FnMut(u32, VirqUpdate)) {
        match self {
            IrqReg::Bits { bank, first } => {
                for bit in 0..32 {
                    if let Some(update) = bank.update(value & (1 << bit) != 0) {
                        f(first + bit, update);
                    }
                }
            }
            IrqReg::Priority { first } => {
                for byte in 0..size.min(8) as u32 {
                    let prio = (value >> (byte * 8)) as u8;
                    f(first + byte, VirqUpdate::Priority(prio));
                }
            }
            IrqReg::Config { first } => {
                for i in 0..16 {
                    let field = ((value >> (i * 2)) & 0b11) as u8;
                    f(first + i, VirqUpdate::Config(TriggerMode::from_icfgr(field)));
                }
            }
        }
    }

    /// Assemble a read from the interrupts it covers; missing ones read 0.
    pub fn read<'a>(self, size: u8, lookup: impl Fn(u32) -> Option<&'a Virq>) -> u64 {
        match self {
            IrqReg::Bits { bank, first } => (0..32)
                .filter(|&bit| lookup(first + bit).map_or(false, |v| bank.read_bit(v)))
                .fold(0, |acc, bit| acc | (1 << bit)),
            IrqReg::Priority { first } => (0..size.min(8) as u32).fold(0, |acc, byte| {
                let prio = lookup(first + byte).map_or(0, |v| v.priority) as u64;
                acc | (prio << (byte * 8))
            }),
            IrqReg::Config { first } => (0..16).fold(0, |acc, i| {
                let field = lookup(first + i).map_or(0, |v| v.trigger.icfgr()) as u64;
                acc | (field << (i * 2))
            }),
        }
    }
}

/// Distributor state of one VM
pub struct Distributor {
    ctlr: u32,
    nr_vcpus: usize,
    virq_num: usize,
    /// SPIs, index 0 is INTID 32
    spis: Vec<Virq>,
}

impl Distributor {
    /// `virq_num` counts every INTID the guest may use, private ones included.
    pub fn new(nr_vcpus: usize, virq_num: usize) -> Result<Self, HypError> {
        let nr_spis = virq_num.saturating_sub(VIRQ_PRIV_NUM);
        let mut spis = Vec::new();
        spis.try_reserve_exact(nr_spis)
            .map_err(|_| HypError::AllocFailure)?;
        spis.extend((0..nr_spis).map(|i| Virq::new((VIRQ_PRIV_NUM + i) as u16, 0)));
        Ok(Self {
            ctlr: GICD_CTLR_ARE_NS,
            nr_vcpus,
            virq_num,
            spis,
        })
    }

    pub fn virq_num(&self) -> usize {
        self.virq_num
    }

    pub fn enabled(&self) -> bool {
        self.ctlr & GICD_CTLR_ENABLE_MASK != 0
    }

    pub fn spi(&self, id: u32) -> Option<&Virq> {
        self.spis.get((id as usize).checked_sub(VIRQ_PRIV_NUM)?)
    }

    pub fn spi_mut(&mut self, id: u32) -> Option<&mut Virq> {
        self.spis.get_mut((id as usize).checked_sub(VIRQ_PRIV_NUM)?)
    }

    pub fn spis(&self) -> impl Iterator<Item = &Virq> {
        self.spis.iter()
    }

    /// ITLinesNumber | CPUNumber | IDbits
    pub fn typer(&self) -> u32 {
        let it_lines = (self.virq_num.div_ceil(32) as u32).saturating_sub(1) & 0x1F;
        let cpus = ((self.nr_vcpus.saturating_sub(1)) as u32 & 0x7) << 5;
        it_lines | cpus | GICD_TYPER_IDBITS
    }

    /// Control and identification registers; anything else reads 0.
    pub fn read_ctrl(&self, offset: u64, size: u8) -> u64 {
        match offset {
            GICD_IROUTER..=GICD_IROUTER_END if size == 8 || offset & 0x4 == 0 => {
                self.read_irouter(offset)
            }
            GICD_IROUTER..=GICD_IROUTER_END => 0,
            GICD_CTLR => self.ctlr as u64,
            GICD_TYPER => self.typer() as u64,
            GICD_IIDR => GIC_IIDR_VALUE as u64,
            GICD_PIDR2 => GIC_PIDR2_VALUE as u64,
            _ => 0,
        }
    }

    pub fn write_ctrl(&mut self, offset: u64, value: u64, size: u8) {
        match offset {
            GICD_CTLR => {
                self.ctlr = (value as u32 & GICD_CTLR_ENABLE_MASK) | GICD_CTLR_ARE_NS;
            }
            // The upper half of IROUTER only holds Aff3.
            GICD_IROUTER..=GICD_IROUTER_END if size == 8 || offset & 0x4 == 0 => {
                self.write_irouter(offset, value);
            }
            _ => {}
        }
    }

    fn irouter_id(offset: u64) -> u32 {
        ((offset & !0x7) - GICD_IROUTER) as u32 / 8 + VIRQ_PRIV_NUM as u32
    }

    fn read_irouter(&self, offset: u64) -> u64 {
        self.spi(Self::irouter_id(offset))
            .map_or(0, |v| v.vcpu as u64)
    }

    fn write_irouter(&mut self, offset: u64, value: u64) {
        let nr_vcpus = self.nr_vcpus;
        if let Some(spi) = self.spi_mut(Self::irouter_id(offset)) {
            let aff0 = (value & 0xFF) as usize;
            spi.vcpu = if aff0 < nr_vcpus { aff0 } else { 0 };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typer_encodes_lines_and_cpus() {
        let d = Distributor::new(2, 128).unwrap();
        let typer = d.typer();
        assert_eq!(typer & 0x1F, 3);
        assert_eq!((typer >> 5) & 0x7, 1);
        assert_eq!((typer >> 19) & 0x1F, 9);
        assert_eq!(d.read_ctrl(GICD_IIDR, 4), 0x43B);
        assert_eq!(d.read_ctrl(GICD_PIDR2, 4), 0x30);
    }

    #[test]
    fn test_decode_banks() {
        assert_eq!(
            IrqReg::decode(0x104),
            Some(IrqReg::Bits { bank: BitBank::SetEnable, first: 32 })
        );
        assert_eq!(
            IrqReg::decode(0x288),
            Some(IrqReg::Bits { bank: BitBank::ClearPending, first: 64 })
        );
        assert_eq!(IrqReg::decode(0x421), Some(IrqReg::Priority { first: 33 }));
        assert_eq!(IrqReg::decode(0xC08), Some(IrqReg::Config { first: 32 }));
        assert_eq!(IrqReg::decode(0x102), None);
        assert_eq!(IrqReg::decode(0x4000), None);
    }

    #[test]
    fn test_write_demux_only_set_bits() {
        let mut seen = alloc::vec::Vec::new();
        IrqReg::Bits { bank: BitBank::SetEnable, first: 32 }
            .for_each_update(0b1001, 4, |id, u| seen.push((id, u)));
        assert_eq!(seen, [(32, VirqUpdate::Enable), (35, VirqUpdate::Enable)]);
    }

    #[test]
    fn test_irouter_targets_vcpu() {
        let mut d = Distributor::new(2, 64).unwrap();
        d.write_ctrl(GICD_IROUTER + 8, 1, 8);
        assert_eq!(d.spi(33).unwrap().vcpu, 1);
        assert_eq!(d.read_ctrl(GICD_IROUTER + 8, 8), 1);
        // Out-of-range affinity falls back to vCPU 0.
        d.write_ctrl(GICD_IROUTER + 8, 7, 8);
        assert_eq!(d.spi(33).unwrap().vcpu, 0);
        assert_eq!(d.spi(64), None);
    }

    #[test]
    fn test_ctlr_keeps_are() {
        let mut d = Distributor::new(1, 64).unwrap();
        assert!(!d.enabled());
        d.write_ctrl(GICD_CTLR, 0x2, 4);
        assert!(d.enabled());
        assert_eq!(d.read_ctrl(GICD_CTLR, 4), 0x12);
    }
}
