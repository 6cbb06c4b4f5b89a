/// ARM Generic Timer, host side
///
/// The host reads the physical counter and multiplexes every emulated guest
/// physical timer onto the EL2 hypervisor timer (`CNTHP_*`, PPI 26).
/// Guests get EL1 physical timer accesses trapped (CNTHCTL_EL2.EL1PCEN = 0)
/// while the physical counter stays readable.
use core::arch::asm;

/// Timer control register bits
const TIMER_ENABLE: u64 = 1 << 0;

/// EL2 physical timer interrupt
pub const HYP_TIMER_INTID: u32 = 26;

const CNTHCTL_EL1PCTEN: u64 = 1 << 0;
const CNTHCTL_EL1PCEN: u64 = 1 << 1;

/// Counter frequency in Hz
pub fn frequency() -> u64 {
    let freq: u64;
    unsafe {
        asm!("mrs {}, cntfrq_el0", out(reg) freq, options(nostack, nomem));
    }
    freq
}

/// Physical counter value
pub fn counter() -> u64 {
    let count: u64;
    unsafe {
        asm!("isb", "mrs {}, cntpct_el0", out(reg) count, options(nostack, nomem));
    }
    count
}

/// Let EL1 read the physical counter, trap its physical timer.
pub fn init_hypervisor_timer() {
    let mut cnthctl: u64;
    unsafe {
        asm!("mrs {}, cnthctl_el2", out(reg) cnthctl, options(nostack, nomem));
    }
    cnthctl |= CNTHCTL_EL1PCTEN;
    cnthctl &= !CNTHCTL_EL1PCEN;
    unsafe {
        asm!("msr cnthctl_el2, {}", in(reg) cnthctl, options(nostack, nomem));
        asm!("msr cnthp_ctl_el2, {}", in(reg) 0u64, options(nostack, nomem));
    }
}

/// Fire PPI 26 once the counter reaches `deadline`.
pub fn arm(deadline: u64) {
    unsafe {
        asm!("msr cnthp_cval_el2, {}", in(reg) deadline, options(nostack, nomem));
        asm!("msr cnthp_ctl_el2, {}", in(reg) TIMER_ENABLE, options(nostack, nomem));
        asm!("isb", options(nostack, nomem));
    }
}

pub fn disarm() {
    unsafe {
        asm!("msr cnthp_ctl_el2, {}", in(reg) 0u64, options(nostack, nomem));
    }
}
