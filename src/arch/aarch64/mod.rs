//! ARM64/AArch64 architecture support
//!
//! This module contains ARM64-specific virtualization support including:
//! - Register bit definitions (`defs`)
//! - Guest register context and exit decoding (`regs`)
//! - Stage-2 translation tables (`mm`)
//! - Trap classification (`hypervisor`)
//! - System register and GIC backends (real hardware only)

pub mod defs;
pub mod hypervisor;
pub mod mm;
pub mod regs;

#[cfg(target_arch = "aarch64")]
pub mod board;
#[cfg(target_arch = "aarch64")]
pub mod peripherals;
#[cfg(target_arch = "aarch64")]
pub mod sysreg;

pub use regs::*;
