//! ARM64 Peripheral Drivers
//!
//! Low-level access to the physical GICv3 and the EL2 timer owned by the
//! host.

pub mod gicv3;
pub mod timer;

pub use gicv3::*;
