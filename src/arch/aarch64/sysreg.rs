//! System register backends for EL2
//!
//! `El1Direct` reaches the guest's EL1 state through the `*_el1` encodings
//! (non-VHE: the hypervisor owns EL2 alone and EL1 holds guest state while
//! the host is not using it). `El12Alias` goes through the `*_el12` /
//! `*_el02` aliases, which is how a VHE host running at EL2 reaches the
//! guest's EL1 registers without clobbering its own.
//!
//! EL2 control registers and the GICv3 virtualization interface are the
//! same under both schemes. The ICH/ICC registers are accessed by their
//! `S3_<op1>_C<n>_C<m>_<op2>` encodings so no GICv3 assembler support is
//! required.

use core::arch::asm;

use crate::arch::traits::{SysReg, SysRegAccess};

macro_rules! mrs {
    ($name:literal) => {{
        let val: u64;
        unsafe {
            asm!(concat!("mrs {}, ", $name), out(reg) val, options(nomem, nostack));
        }
        val
    }};
}

macro_rules! msr {
    ($name:literal, $val:expr) => {{
        unsafe {
            asm!(concat!("msr ", $name, ", {}"), in(reg) $val, options(nomem, nostack));
        }
    }};
}

fn read_lr(n: u8) -> u64 {
    match n {
        0 => mrs!("S3_4_C12_C12_0"),
        1 => mrs!("S3_4_C12_C12_1"),
        2 => mrs!("S3_4_C12_C12_2"),
        3 => mrs!("S3_4_C12_C12_3"),
        4 => mrs!("S3_4_C12_C12_4"),
        5 => mrs!("S3_4_C12_C12_5"),
        6 => mrs!("S3_4_C12_C12_6"),
        7 => mrs!("S3_4_C12_C12_7"),
        8 => mrs!("S3_4_C12_C13_0"),
        9 => mrs!("S3_4_C12_C13_1"),
        10 => mrs!("S3_4_C12_C13_2"),
        11 => mrs!("S3_4_C12_C13_3"),
        12 => mrs!("S3_4_C12_C13_4"),
        13 => mrs!("S3_4_C12_C13_5"),
        14 => mrs!("S3_4_C12_C13_6"),
        15 => mrs!("S3_4_C12_C13_7"),
        _ => 0,
    }
}

fn write_lr(n: u8, val: u64) {
    match n {
        0 => msr!("S3_4_C12_C12_0", val),
        1 => msr!("S3_4_C12_C12_1", val),
        2 => msr!("S3_4_C12_C12_2", val),
        3 => msr!("S3_4_C12_C12_3", val),
        4 => msr!("S3_4_C12_C12_4", val),
        5 => msr!("S3_4_C12_C12_5", val),
        6 => msr!("S3_4_C12_C12_6", val),
        7 => msr!("S3_4_C12_C12_7", val),
        8 => msr!("S3_4_C12_C13_0", val),
        9 => msr!("S3_4_C12_C13_1", val),
        10 => msr!("S3_4_C12_C13_2", val),
        11 => msr!("S3_4_C12_C13_3", val),
        12 => msr!("S3_4_C12_C13_4", val),
        13 => msr!("S3_4_C12_C13_5", val),
        14 => msr!("S3_4_C12_C13_6", val),
        15 => msr!("S3_4_C12_C13_7", val),
        _ => {}
    }
}

fn read_ap1r(n: u8) -> u64 {
    match n {
        0 => mrs!("S3_4_C12_C9_0"),
        1 => mrs!("S3_4_C12_C9_1"),
        2 => mrs!("S3_4_C12_C9_2"),
        3 => mrs!("S3_4_C12_C9_3"),
        _ => 0,
    }
}

fn write_ap1r(n: u8, val: u64) {
    match n {
        0 => msr!("S3_4_C12_C9_0", val),
        1 => msr!("S3_4_C12_C9_1", val),
        2 => msr!("S3_4_C12_C9_2", val),
        3 => msr!("S3_4_C12_C9_3", val),
        _ => {}
    }
}

/// Registers whose encoding does not depend on VHE.
fn read_shared(reg: SysReg) -> u64 {
    match reg {
        SysReg::TpidrEl0 => mrs!("tpidr_el0"),
        SysReg::TpidrroEl0 => mrs!("tpidrro_el0"),
        SysReg::TpidrEl1 => mrs!("tpidr_el1"),
        SysReg::SpEl1 => mrs!("sp_el1"),
        SysReg::Par => mrs!("par_el1"),
        SysReg::Cntpct => mrs!("cntpct_el0"),
        SysReg::Cntfrq => mrs!("cntfrq_el0"),
        SysReg::Cntvoff => mrs!("cntvoff_el2"),
        SysReg::Hcr => mrs!("hcr_el2"),
        SysReg::Vtcr => mrs!("vtcr_el2"),
        SysReg::Vttbr => mrs!("vttbr_el2"),
        SysReg::Vpidr => mrs!("vpidr_el2"),
        SysReg::Vmpidr => mrs!("vmpidr_el2"),
        SysReg::EsrEl2 => mrs!("esr_el2"),
        SysReg::FarEl2 => mrs!("far_el2"),
        SysReg::Hpfar => mrs!("hpfar_el2"),
        SysReg::ElrEl2 => mrs!("elr_el2"),
        SysReg::SpsrEl2 => mrs!("spsr_el2"),
        SysReg::IchLr(n) => read_lr(n),
        SysReg::IchAp1r(n) => read_ap1r(n),
        SysReg::IchVmcr => mrs!("S3_4_C12_C11_7"),
        SysReg::IchHcr => mrs!("S3_4_C12_C11_0"),
        SysReg::IchVtr => mrs!("S3_4_C12_C11_1"),
        SysReg::IchElrsr => mrs!("S3_4_C12_C11_5"),
        SysReg::IchMisr => mrs!("S3_4_C12_C11_2"),
        SysReg::IccSreEl1 => mrs!("S3_0_C12_C12_5"),
        _ => 0,
    }
}

fn write_shared(reg: SysReg, val: u64) {
    match reg {
        SysReg::TpidrEl0 => msr!("tpidr_el0", val),
        SysReg::TpidrroEl0 => msr!("tpidrro_el0", val),
        SysReg::TpidrEl1 => msr!("tpidr_el1", val),
        SysReg::SpEl1 => msr!("sp_el1", val),
        SysReg::Par => msr!("par_el1", val),
        SysReg::Cntvoff => msr!("cntvoff_el2", val),
        SysReg::Hcr => msr!("hcr_el2", val),
        SysReg::Vtcr => msr!("vtcr_el2", val),
        SysReg::Vttbr => msr!("vttbr_el2", val),
        SysReg::Vpidr => msr!("vpidr_el2", val),
        SysReg::Vmpidr => msr!("vmpidr_el2", val),
        SysReg::ElrEl2 => msr!("elr_el2", val),
        SysReg::SpsrEl2 => msr!("spsr_el2", val),
        SysReg::IchLr(n) => write_lr(n, val),
        SysReg::IchAp1r(n) => write_ap1r(n, val),
        SysReg::IchVmcr => msr!("S3_4_C12_C11_7", val),
        SysReg::IchHcr => msr!("S3_4_C12_C11_0", val),
        SysReg::IccSreEl1 => msr!("S3_0_C12_C12_5", val),
        // Read-only: counters, syndromes, VTR, ELRSR, MISR
        _ => {}
    }
}

fn tlbi_all_current_vmid() {
    unsafe {
        asm!(
            "dsb ishst",
            "tlbi vmalls12e1is",
            "dsb ish",
            "isb",
            options(nostack),
        );
    }
}

fn isb() {
    unsafe {
        asm!("isb", options(nostack, nomem));
    }
}

/// Guest EL1 state through the `*_el1` encodings (non-VHE host)
#[derive(Default)]
pub struct El1Direct;

impl SysRegAccess for El1Direct {
    fn read(&self, reg: SysReg) -> u64 {
        match reg {
            SysReg::Sctlr => mrs!("sctlr_el1"),
            SysReg::Ttbr0 => mrs!("ttbr0_el1"),
            SysReg::Ttbr1 => mrs!("ttbr1_el1"),
            SysReg::Tcr => mrs!("tcr_el1"),
            SysReg::Mair => mrs!("mair_el1"),
            SysReg::Amair => mrs!("amair_el1"),
            SysReg::Vbar => mrs!("vbar_el1"),
            SysReg::Contextidr => mrs!("contextidr_el1"),
            SysReg::Cpacr => mrs!("cpacr_el1"),
            SysReg::Afsr0 => mrs!("afsr0_el1"),
            SysReg::Afsr1 => mrs!("afsr1_el1"),
            SysReg::EsrEl1 => mrs!("esr_el1"),
            SysReg::FarEl1 => mrs!("far_el1"),
            SysReg::ElrEl1 => mrs!("elr_el1"),
            SysReg::SpsrEl1 => mrs!("spsr_el1"),
            SysReg::Cntkctl => mrs!("cntkctl_el1"),
            SysReg::CntvCtl => mrs!("cntv_ctl_el0"),
            SysReg::CntvCval => mrs!("cntv_cval_el0"),
            SysReg::CntpCtl => mrs!("cntp_ctl_el0"),
            SysReg::CntpCval => mrs!("cntp_cval_el0"),
            other => read_shared(other),
        }
    }

    fn write(&mut self, reg: SysReg, val: u64) {
        match reg {
            SysReg::Sctlr => msr!("sctlr_el1", val),
            SysReg::Ttbr0 => msr!("ttbr0_el1", val),
            SysReg::Ttbr1 => msr!("ttbr1_el1", val),
            SysReg::Tcr => msr!("tcr_el1", val),
            SysReg::Mair => msr!("mair_el1", val),
            SysReg::Amair => msr!("amair_el1", val),
            SysReg::Vbar => msr!("vbar_el1", val),
            SysReg::Contextidr => msr!("contextidr_el1", val),
            SysReg::Cpacr => msr!("cpacr_el1", val),
            SysReg::Afsr0 => msr!("afsr0_el1", val),
            SysReg::Afsr1 => msr!("afsr1_el1", val),
            SysReg::EsrEl1 => msr!("esr_el1", val),
            SysReg::FarEl1 => msr!("far_el1", val),
            SysReg::ElrEl1 => msr!("elr_el1", val),
            SysReg::SpsrEl1 => msr!("spsr_el1", val),
            SysReg::Cntkctl => msr!("cntkctl_el1", val),
            SysReg::CntvCtl => msr!("cntv_ctl_el0", val),
            SysReg::CntvCval => msr!("cntv_cval_el0", val),
            SysReg::CntpCtl => msr!("cntp_ctl_el0", val),
            SysReg::CntpCval => msr!("cntp_cval_el0", val),
            other => write_shared(other, val),
        }
    }

    fn isb(&mut self) {
        isb();
    }

    fn tlbi_vmalls12e1is(&mut self) {
        tlbi_all_current_vmid();
    }
}

/// Guest EL1 state through the `*_el12` / `*_el02` aliases (VHE host)
#[derive(Default)]
pub struct El12Alias;

impl SysRegAccess for El12Alias {
    fn read(&self, reg: SysReg) -> u64 {
        match reg {
            SysReg::Sctlr => mrs!("S3_5_C1_C0_0"),
            SysReg::Cpacr => mrs!("S3_5_C1_C0_2"),
            SysReg::Ttbr0 => mrs!("S3_5_C2_C0_0"),
            SysReg::Ttbr1 => mrs!("S3_5_C2_C0_1"),
            SysReg::Tcr => mrs!("S3_5_C2_C0_2"),
            SysReg::SpsrEl1 => mrs!("S3_5_C4_C0_0"),
            SysReg::ElrEl1 => mrs!("S3_5_C4_C0_1"),
            SysReg::Afsr0 => mrs!("S3_5_C5_C1_0"),
            SysReg::Afsr1 => mrs!("S3_5_C5_C1_1"),
            SysReg::EsrEl1 => mrs!("S3_5_C5_C2_0"),
            SysReg::FarEl1 => mrs!("S3_5_C6_C0_0"),
            SysReg::Mair => mrs!("S3_5_C10_C2_0"),
            SysReg::Amair => mrs!("S3_5_C10_C3_0"),
            SysReg::Vbar => mrs!("S3_5_C12_C0_0"),
            SysReg::Contextidr => mrs!("S3_5_C13_C0_1"),
            SysReg::Cntkctl => mrs!("S3_5_C14_C1_0"),
            SysReg::CntpCtl => mrs!("S3_5_C14_C2_1"),
            SysReg::CntpCval => mrs!("S3_5_C14_C2_2"),
            SysReg::CntvCtl => mrs!("S3_5_C14_C3_1"),
            SysReg::CntvCval => mrs!("S3_5_C14_C3_2"),
            other => read_shared(other),
        }
    }

    fn write(&mut self, reg: SysReg, val: u64) {
        match reg {
            SysReg::Sctlr => msr!("S3_5_C1_C0_0", val),
            SysReg::Cpacr => msr!("S3_5_C1_C0_2", val),
            SysReg::Ttbr0 => msr!("S3_5_C2_C0_0", val),
            SysReg::Ttbr1 => msr!("S3_5_C2_C0_1", val),
            SysReg::Tcr => msr!("S3_5_C2_C0_2", val),
            SysReg::SpsrEl1 => msr!("S3_5_C4_C0_0", val),
            SysReg::ElrEl1 => msr!("S3_5_C4_C0_1", val),
            SysReg::Afsr0 => msr!("S3_5_C5_C1_0", val),
            SysReg::Afsr1 => msr!("S3_5_C5_C1_1", val),
            SysReg::EsrEl1 => msr!("S3_5_C5_C2_0", val),
            SysReg::FarEl1 => msr!("S3_5_C6_C0_0", val),
            SysReg::Mair => msr!("S3_5_C10_C2_0", val),
            SysReg::Amair => msr!("S3_5_C10_C3_0", val),
            SysReg::Vbar => msr!("S3_5_C12_C0_0", val),
            SysReg::Contextidr => msr!("S3_5_C13_C0_1", val),
            SysReg::Cntkctl => msr!("S3_5_C14_C1_0", val),
            SysReg::CntpCtl => msr!("S3_5_C14_C2_1", val),
            SysReg::CntpCval => msr!("S3_5_C14_C2_2", val),
            SysReg::CntvCtl => msr!("S3_5_C14_C3_1", val),
            SysReg::CntvCval => msr!("S3_5_C14_C3_2", val),
            other => write_shared(other, val),
        }
    }

    fn isb(&mut self) {
        isb();
    }

    fn tlbi_vmalls12e1is(&mut self) {
        tlbi_all_current_vmid();
    }
}

/// Register backend selected at build time.
#[cfg(feature = "vhe")]
pub type HostSysRegs = El12Alias;
#[cfg(not(feature = "vhe"))]
pub type HostSysRegs = El1Direct;
