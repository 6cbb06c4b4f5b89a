//! ARM64 Register Definitions
//!
//! This module defines the register context that needs to be saved/restored
//! when a vCPU is switched out, plus the decoded reason for a guest exit.

use core::fmt;
use super::defs::*;
use crate::arch::traits::{SysReg, SysRegAccess};

/// General Purpose Registers (x0-x30)
///
/// In ARM64, we have 31 general purpose registers:
/// - x0-x30: General purpose registers
/// - x29: Frame Pointer (FP)
/// - x30: Link Register (LR)
/// - SP: Stack Pointer (separate from x31)
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct GeneralPurposeRegs {
    pub x0: u64,
    pub x1: u64,
    pub x2: u64,
    pub x3: u64,
    pub x4: u64,
    pub x5: u64,
    pub x6: u64,
    pub x7: u64,
    pub x8: u64,
    pub x9: u64,
    pub x10: u64,
    pub x11: u64,
    pub x12: u64,
    pub x13: u64,
    pub x14: u64,
    pub x15: u64,
    pub x16: u64,
    pub x17: u64,
    pub x18: u64,
    pub x19: u64,
    pub x20: u64,
    pub x21: u64,
    pub x22: u64,
    pub x23: u64,
    pub x24: u64,
    pub x25: u64,
    pub x26: u64,
    pub x27: u64,
    pub x28: u64,
    pub x29: u64, // FP
    pub x30: u64, // LR
}

impl Default for GeneralPurposeRegs {
    fn default() -> Self {
        Self {
            x0: 0, x1: 0, x2: 0, x3: 0, x4: 0, x5: 0, x6: 0, x7: 0,
            x8: 0, x9: 0, x10: 0, x11: 0, x12: 0, x13: 0, x14: 0, x15: 0,
            x16: 0, x17: 0, x18: 0, x19: 0, x20: 0, x21: 0, x22: 0, x23: 0,
            x24: 0, x25: 0, x26: 0, x27: 0, x28: 0, x29: 0, x30: 0,
        }
    }
}

impl GeneralPurposeRegs {
    /// Get value of a general purpose register
    ///
    /// # Arguments
    /// * `reg` - Register number (0-30, x31/SP not accessible)
    pub fn get_reg(&self, reg: u8) -> u64 {
        match reg {
            0 => self.x0,
            1 => self.x1,
            2 => self.x2,
            3 => self.x3,
            4 => self.x4,
            5 => self.x5,
            6 => self.x6,
            7 => self.x7,
            8 => self.x8,
            9 => self.x9,
            10 => self.x10,
            11 => self.x11,
            12 => self.x12,
            13 => self.x13,
            14 => self.x14,
            15 => self.x15,
            16 => self.x16,
            17 => self.x17,
            18 => self.x18,
            19 => self.x19,
            20 => self.x20,
            21 => self.x21,
            22 => self.x22,
            23 => self.x23,
            24 => self.x24,
            25 => self.x25,
            26 => self.x26,
            27 => self.x27,
            28 => self.x28,
            29 => self.x29,
            30 => self.x30,
            _ => 0, // Invalid register
        }
    }

    /// Set value of a general purpose register
    ///
    /// # Arguments
    /// * `reg` - Register number (0-30, x31/SP not accessible)
    /// * `value` - Value to set
    pub fn set_reg(&mut self, reg: u8, value: u64) {
        match reg {
            0 => self.x0 = value,
            1 => self.x1 = value,
            2 => self.x2 = value,
            3 => self.x3 = value,
            4 => self.x4 = value,
            5 => self.x5 = value,
            6 => self.x6 = value,
            7 => self.x7 = value,
            8 => self.x8 = value,
            9 => self.x9 = value,
            10 => self.x10 = value,
            11 => self.x11 = value,
            12 => self.x12 = value,
            13 => self.x13 = value,
            14 => self.x14 = value,
            15 => self.x15 = value,
            16 => self.x16 = value,
            17 => self.x17 = value,
            18 => self.x18 = value,
            19 => self.x19 = value,
            20 => self.x20 = value,
            21 => self.x21 = value,
            22 => self.x22 = value,
            23 => self.x23 = value,
            24 => self.x24 = value,
            25 => self.x25 = value,
            26 => self.x26 = value,
            27 => self.x27 = value,
            28 => self.x28 = value,
            29 => self.x29 = value,
            30 => self.x30 = value,
            _ => {} // Invalid register, ignore
        }
    }
}


/// Guest EL1 System Registers
///
/// Saved when the vCPU is switched out and written back when it is loaded
/// again. Accessed through `SysRegAccess`, so the same code serves the
/// `*_el1` and `*_el12` register schemes.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRegs {
    pub sctlr_el1: u64,
    pub ttbr0_el1: u64,
    pub ttbr1_el1: u64,
    pub tcr_el1: u64,
    pub mair_el1: u64,
    pub amair_el1: u64,
    pub vbar_el1: u64,
    pub contextidr_el1: u64,
    pub cpacr_el1: u64,
    pub afsr0_el1: u64,
    pub afsr1_el1: u64,
    pub esr_el1: u64,
    pub far_el1: u64,
    pub par_el1: u64,
    pub sp_el1: u64,
    pub elr_el1: u64,
    pub spsr_el1: u64,

    /// Thread ID Registers
    pub tpidr_el1: u64,
    pub tpidr_el0: u64,
    pub tpidrro_el0: u64,

    pub cntkctl_el1: u64,

    /// Identity presented through VPIDR_EL2 / VMPIDR_EL2
    pub vpidr_el2: u64,
    pub vmpidr_el2: u64,
}

impl SystemRegs {
    /// Capture the live guest EL1 state.
    pub fn save<R: SysRegAccess + ?Sized>(&mut self, regs: &R) {
        self.sctlr_el1 = regs.read(SysReg::Sctlr);
        self.ttbr0_el1 = regs.read(SysReg::Ttbr0);
        self.ttbr1_el1 = regs.read(SysReg::Ttbr1);
        self.tcr_el1 = regs.read(SysReg::Tcr);
        self.mair_el1 = regs.read(SysReg::Mair);
        self.amair_el1 = regs.read(SysReg::Amair);
        self.vbar_el1 = regs.read(SysReg::Vbar);
        self.contextidr_el1 = regs.read(SysReg::Contextidr);
        self.cpacr_el1 = regs.read(SysReg::Cpacr);
        self.afsr0_el1 = regs.read(SysReg::Afsr0);
        self.afsr1_el1 = regs.read(SysReg::Afsr1);
        self.esr_el1 = regs.read(SysReg::EsrEl1);
        self.far_el1 = regs.read(SysReg::FarEl1);
        self.par_el1 = regs.read(SysReg::Par);
        self.sp_el1 = regs.read(SysReg::SpEl1);
        self.elr_el1 = regs.read(SysReg::ElrEl1);
        self.spsr_el1 = regs.read(SysReg::SpsrEl1);
        self.tpidr_el1 = regs.read(SysReg::TpidrEl1);
        self.tpidr_el0 = regs.read(SysReg::TpidrEl0);
        self.tpidrro_el0 = regs.read(SysReg::TpidrroEl0);
        self.cntkctl_el1 = regs.read(SysReg::Cntkctl);
    }

    /// Load this state into the guest EL1 registers.
    pub fn restore<R: SysRegAccess + ?Sized>(&self, regs: &mut R) {
        regs.write(SysReg::Vpidr, self.vpidr_el2);
        regs.write(SysReg::Vmpidr, self.vmpidr_el2);
        regs.write(SysReg::Sctlr, self.sctlr_el1);
        regs.write(SysReg::Ttbr0, self.ttbr0_el1);
        regs.write(SysReg::Ttbr1, self.ttbr1_el1);
        regs.write(SysReg::Tcr, self.tcr_el1);
        regs.write(SysReg::Mair, self.mair_el1);
        regs.write(SysReg::Amair, self.amair_el1);
        regs.write(SysReg::Vbar, self.vbar_el1);
        regs.write(SysReg::Contextidr, self.contextidr_el1);
        regs.write(SysReg::Cpacr, self.cpacr_el1);
        regs.write(SysReg::Afsr0, self.afsr0_el1);
        regs.write(SysReg::Afsr1, self.afsr1_el1);
        regs.write(SysReg::EsrEl1, self.esr_el1);
        regs.write(SysReg::FarEl1, self.far_el1);
        regs.write(SysReg::Par, self.par_el1);
        regs.write(SysReg::SpEl1, self.sp_el1);
        regs.write(SysReg::ElrEl1, self.elr_el1);
        regs.write(SysReg::SpsrEl1, self.spsr_el1);
        regs.write(SysReg::TpidrEl1, self.tpidr_el1);
        regs.write(SysReg::TpidrEl0, self.tpidr_el0);
        regs.write(SysReg::TpidrroEl0, self.tpidrro_el0);
        regs.write(SysReg::Cntkctl, self.cntkctl_el1);
    }
}

/// Complete vCPU Register Context
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VcpuContext {
    /// General purpose registers
    pub gp_regs: GeneralPurposeRegs,

    /// Guest EL1 system registers
    pub sys_regs: SystemRegs,

    /// Program counter - where to resume execution (ELR_EL2)
    pub pc: u64,

    /// Guest PSTATE on trap (SPSR_EL2)
    pub spsr_el2: u64,
}

impl VcpuContext {
    /// Architectural reset state for vCPU `vcpu_id` entering at `entry`
    pub fn reset(entry: u64, vcpu_id: usize) -> Self {
        let mut ctx = Self::default();
        ctx.pc = entry;
        ctx.spsr_el2 = SPSR_EL1H_DAIF_MASKED;
        ctx.sys_regs.sctlr_el1 = VCPU_SCTLR_RESET;
        ctx.sys_regs.vpidr_el2 = VCPU_MIDR;
        ctx.sys_regs.vmpidr_el2 = MPIDR_RES1 | (vcpu_id as u64 & MPIDR_AFF_MASK);
        ctx
    }

    /// Read a general purpose register; x31 reads as zero (XZR).
    pub fn get_gpr(&self, reg: u8) -> u64 {
        self.gp_regs.get_reg(reg)
    }

    /// Write a general purpose register; writes to x31 (XZR) are dropped.
    pub fn set_gpr(&mut self, reg: u8, value: u64) {
        self.gp_regs.set_reg(reg, value);
    }

    pub fn advance_pc(&mut self, len: u64) {
        self.pc = self.pc.wrapping_add(len);
    }
}

impl fmt::Display for VcpuContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for n in (0..31u8).step_by(2) {
            if n == 30 {
                writeln!(f, "x30: 0x{:016x}", self.get_gpr(30))?;
            } else {
                writeln!(
                    f,
                    "x{:<2}: 0x{:016x}  x{:<2}: 0x{:016x}",
                    n,
                    self.get_gpr(n),
                    n + 1,
                    self.get_gpr(n + 1)
                )?;
            }
        }
        let s = &self.sys_regs;
        writeln!(f, "pc: 0x{:016x}  spsr_el2: 0x{:016x}", self.pc, self.spsr_el2)?;
        writeln!(f, "sp_el1: 0x{:016x}  elr_el1: 0x{:016x}", s.sp_el1, s.elr_el1)?;
        writeln!(f, "spsr_el1: 0x{:016x}  sctlr_el1: 0x{:016x}", s.spsr_el1, s.sctlr_el1)?;
        writeln!(f, "esr_el1: 0x{:016x}  far_el1: 0x{:016x}", s.esr_el1, s.far_el1)?;
        writeln!(f, "ttbr0_el1: 0x{:016x}  ttbr1_el1: 0x{:016x}", s.ttbr0_el1, s.ttbr1_el1)?;
        write!(f, "tcr_el1: 0x{:016x}  vbar_el1: 0x{:016x}", s.tcr_el1, s.vbar_el1)
    }
}

/// VM Exit Reason
///
/// Represents why the VM exited and trapped to the hypervisor, decoded
/// from the exception class in ESR_EL2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Unknown/undefined reason
    Unknown,

    /// WFI (Wait For Interrupt) or WFE (Wait For Event)
    WfiWfe,

    /// HVC (Hypervisor Call) instruction
    HvcCall,

    /// Trapped MSR/MRS (system register access)
    TrapMsrMrs,

    /// Instruction abort from the guest
    InstructionAbort,

    /// Data abort from the guest
    DataAbort,

    /// Other reason with exception class code
    Other(u64),
}

impl ExitReason {
    pub fn from_esr(esr: u64) -> Self {
        match (esr >> ESR_EC_SHIFT) & ESR_EC_MASK {
            EC_UNKNOWN => ExitReason::Unknown,
            EC_WFI_WFE => ExitReason::WfiWfe,
            EC_HVC64 => ExitReason::HvcCall,
            EC_MSR_MRS => ExitReason::TrapMsrMrs,
            EC_IABT_LOWER => ExitReason::InstructionAbort,
            EC_DABT_LOWER => ExitReason::DataAbort,
            ec => ExitReason::Other(ec),
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Unknown => write!(f, "Unknown"),
            ExitReason::WfiWfe => write!(f, "WFI/WFE"),
            ExitReason::HvcCall => write!(f, "HVC Call"),
            ExitReason::TrapMsrMrs => write!(f, "MSR/MRS Trap"),
            ExitReason::InstructionAbort => write!(f, "Instruction Abort"),
            ExitReason::DataAbort => write!(f, "Data Abort"),
            ExitReason::Other(ec) => write!(f, "Other (EC=0x{:x})", ec),
        }
    }
}
