//! Error types
//!
//! `HypError` is what the command surface reports. Lower layers carry their
//! own enums and convert into it at the lifecycle boundary.

use core::fmt;

/// Result codes of every lifecycle command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypError {
    /// VM index out of range, or slot not in use
    IndexOutOfRange,
    /// No free VM slot
    NoFreeSlot,
    /// Allocation failure (heap, page pool, guest memory, thread)
    AllocFailure,
    /// VM/vCPU not in a state permitting this operation
    InvalidState,
}

impl HypError {
    /// Stable numeric code; 0 is reserved for success.
    pub const fn code(self) -> i32 {
        match self {
            HypError::IndexOutOfRange => 1,
            HypError::NoFreeSlot => 2,
            HypError::AllocFailure => 3,
            HypError::InvalidState => 4,
        }
    }
}

/// Numeric code of a command result.
pub fn result_code<T>(res: &Result<T, HypError>) -> i32 {
    match res {
        Ok(_) => 0,
        Err(e) => e.code(),
    }
}

impl fmt::Display for HypError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HypError::IndexOutOfRange => write!(f, "VM index out of range"),
            HypError::NoFreeSlot => write!(f, "no free VM slot"),
            HypError::AllocFailure => write!(f, "allocation failure"),
            HypError::InvalidState => write!(f, "VM not in a state permitting this operation"),
        }
    }
}

/// Stage-2 translator errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage2Error {
    /// Page pool exhausted
    OutOfMemory,
    /// Start, size or output address not aligned, or zero-length range
    Unaligned,
    /// No valid leaf covers the address
    NotMapped,
    /// Part of the range already carries a mapping
    AlreadyMapped,
}

impl From<Stage2Error> for HypError {
    fn from(e: Stage2Error) -> Self {
        match e {
            Stage2Error::OutOfMemory => HypError::AllocFailure,
            Stage2Error::Unaligned | Stage2Error::NotMapped | Stage2Error::AlreadyMapped => {
                HypError::InvalidState
            }
        }
    }
}

impl fmt::Display for Stage2Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage2Error::OutOfMemory => write!(f, "stage-2 page pool exhausted"),
            Stage2Error::Unaligned => write!(f, "unaligned stage-2 range"),
            Stage2Error::NotMapped => write!(f, "address not mapped"),
            Stage2Error::AlreadyMapped => write!(f, "range already mapped"),
        }
    }
}

/// Static configuration errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// Blob is not a flattened device tree
    BadBlob,
    /// No `/vm` node
    NoVmNode,
    /// Required property missing on a VM node
    MissingProperty(&'static str),
    /// Property present but out of range
    InvalidValue(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::BadBlob => write!(f, "invalid device tree blob"),
            ConfigError::NoVmNode => write!(f, "no /vm node"),
            ConfigError::MissingProperty(p) => write!(f, "missing property `{}`", p),
            ConfigError::InvalidValue(p) => write!(f, "invalid value for `{}`", p),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_distinct_and_nonzero() {
        let all = [
            HypError::IndexOutOfRange,
            HypError::NoFreeSlot,
            HypError::AllocFailure,
            HypError::InvalidState,
        ];
        for (i, a) in all.iter().enumerate() {
            assert_ne!(a.code(), 0);
            for b in &all[i + 1..] {
                assert_ne!(a.code(), b.code());
            }
        }
        assert_eq!(result_code::<()>(&Ok(())), 0);
    }

    #[test]
    fn stage2_errors_map_to_command_codes() {
        assert_eq!(HypError::from(Stage2Error::OutOfMemory), HypError::AllocFailure);
        assert_eq!(HypError::from(Stage2Error::Unaligned), HypError::InvalidState);
    }
}
