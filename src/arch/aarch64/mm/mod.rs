//! Memory Management for ARM64
//!
//! This module handles:
//! - Stage-2 translation table creation and teardown
//! - Stage-2 address translation (IPA -> PA)
//! - Memory attribute configuration

pub mod mmu;

pub use mmu::*;
