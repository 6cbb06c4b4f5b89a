//! EL2 trap decoding
//!
//! - Exception classification and trap outcomes
//! - Syndrome decoding for MMIO and system-register emulation

pub mod decode;
pub mod exception;

pub use decode::*;
pub use exception::*;
