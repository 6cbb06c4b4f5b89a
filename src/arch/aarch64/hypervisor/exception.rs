//! ARM64 Synchronous Exception Classification
//!
//! A trap from the guest is captured into a `TrapFrame` (the EL2 fault
//! registers) and classified into a `TrapClass` by exception class. The
//! routing itself happens in `Hypervisor::handle_trap`; this module only
//! decides what kind of trap it is and how far the PC moves afterwards.

use core::fmt;

use super::decode::{fault_ipa, AbortError, MmioAccess, SysRegAccessInfo};
use crate::arch::aarch64::defs::*;
use crate::arch::traits::{SysReg, SysRegAccess};

/// EL2 fault state captured on a synchronous exception
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrapFrame {
    pub esr: u64,
    pub far: u64,
    pub hpfar: u64,
    pub hcr: u64,
}

impl TrapFrame {
    pub fn capture<R: SysRegAccess + ?Sized>(regs: &R) -> Self {
        Self {
            esr: regs.read(SysReg::EsrEl2),
            far: regs.read(SysReg::FarEl2),
            hpfar: regs.read(SysReg::Hpfar),
            hcr: regs.read(SysReg::Hcr),
        }
    }

    pub fn ec(&self) -> u64 {
        (self.esr >> ESR_EC_SHIFT) & ESR_EC_MASK
    }

    pub fn iss(&self) -> u64 {
        self.esr & ESR_ISS_MASK
    }

    /// Taken while the host owned the CPU (TGE set)
    pub fn from_host(&self) -> bool {
        self.hcr & HCR_TGE != 0
    }

    pub fn classify(&self) -> TrapClass {
        if self.from_host() {
            return TrapClass::Host { ec: self.ec() };
        }
        let iss = self.iss();
        match self.ec() {
            EC_UNKNOWN => TrapClass::Unknown,
            EC_WFI_WFE => TrapClass::WaitForInterrupt,
            EC_HVC64 => TrapClass::Hypercall { imm: (iss & 0xFFFF) as u16 },
            EC_MSR_MRS => TrapClass::SysReg(SysRegAccessInfo::decode(iss)),
            EC_IABT_LOWER => TrapClass::InstructionAbort { ipa: fault_ipa(self.hpfar, self.far) },
            EC_DABT_LOWER => TrapClass::DataAbort {
                ipa: fault_ipa(self.hpfar, self.far),
                access: MmioAccess::decode(iss),
            },
            ec => TrapClass::Unsupported { ec },
        }
    }
}

/// What kind of trap a `TrapFrame` describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapClass {
    /// Synchronous exception from host context
    Host { ec: u64 },
    Unknown,
    WaitForInterrupt,
    Hypercall { imm: u16 },
    SysReg(SysRegAccessInfo),
    InstructionAbort { ipa: u64 },
    DataAbort { ipa: u64, access: Result<MmioAccess, AbortError> },
    /// A class the guest is not expected to trap with
    Unsupported { ec: u64 },
}

impl TrapClass {
    /// Bytes to add to ELR_EL2 after the trap has been emulated.
    ///
    /// HVC already returns past the instruction, and an instruction abort
    /// never completes.
    pub fn pc_advance(&self) -> u64 {
        match self {
            TrapClass::WaitForInterrupt | TrapClass::SysReg(_) | TrapClass::DataAbort { .. } => {
                AARCH64_INSN_SIZE
            }
            _ => 0,
        }
    }
}

impl fmt::Display for TrapClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrapClass::Host { ec } => write!(f, "host exception (EC=0x{:x})", ec),
            TrapClass::Unknown => write!(f, "unknown exception"),
            TrapClass::WaitForInterrupt => write!(f, "WFI/WFE"),
            TrapClass::Hypercall { imm } => write!(f, "HVC #{:#x}", imm),
            TrapClass::SysReg(info) => write!(
                f,
                "{} sysreg 0x{:06x} x{}",
                if info.read { "MRS" } else { "MSR" },
                info.id,
                info.reg
            ),
            TrapClass::InstructionAbort { ipa } => write!(f, "instruction abort at IPA 0x{:x}", ipa),
            TrapClass::DataAbort { ipa, .. } => write!(f, "data abort at IPA 0x{:x}", ipa),
            TrapClass::Unsupported { ec } => write!(f, "unsupported exception (EC=0x{:x})", ec),
        }
    }
}

/// Result of handling one guest trap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapOutcome {
    /// Return to the guest
    Resume,
    /// The vCPU blocked (WFI); the host should schedule something else
    Suspend,
    /// The vCPU was shut down by the fault path
    Fault,
    /// Unrecoverable exception in host context
    HostFatal,
}
