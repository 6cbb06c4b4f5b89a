//! Architecture-specific code
//!
//! `traits` is the seam between the virtualization core and the machine.
//! `aarch64` holds the ARMv8-A definitions and the EL2 register backends,
//! `soft` a simulated machine for host builds.

pub mod aarch64;
pub mod soft;
pub mod traits;

pub use traits::{HostKernel, PhysicalGic, Platform, SysReg, SysRegAccess, ThreadId, TimerKey};
