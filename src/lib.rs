//! rthyp: an ARMv8-A EL2 hypervisor core
//!
//! Runs guest VMs as threads of a host kernel. The virtualization logic
//! (stage-2 translation, vGIC, virtual timers, trap dispatch, world switch)
//! is written against the `arch::traits` platform seam and builds on any
//! host; only the register and GIC backends need real aarch64 hardware.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod config;
pub mod devices;
pub mod error;
pub mod hypervisor;
pub mod mm;
pub mod platform;
pub mod scheduler;
pub mod switch;
pub mod sync;
pub mod uart;
pub mod vcpu;
pub mod vm;
pub mod vtimer;

pub use error::{ConfigError, HypError, Stage2Error};
pub use hypervisor::Hypervisor;

// Note: print!/println! are exported at the crate root via #[macro_export]
