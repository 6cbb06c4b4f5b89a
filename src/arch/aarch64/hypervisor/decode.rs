/// Syndrome decoding for trapped guest accesses
///
/// Data aborts are only emulated when ESR_EL2 carries a valid instruction
/// syndrome (ISV = 1). Without it the faulting instruction would have to be
/// fetched and decoded from guest memory, which this hypervisor does not do.
use crate::arch::aarch64::defs::*;

/// Decoded load/store from a data-abort syndrome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmioAccess {
    /// Load instruction: LDR, LDRB, LDRH, LDRSB, etc.
    Load {
        reg: u8,  // Destination register (0-30, 31 = XZR)
        size: u8, // Access size in bytes (1, 2, 4, 8)
        sign_extend: bool,
        /// Destination is an X register (otherwise W)
        sixty_four: bool,
    },
    /// Store instruction: STR, STRB, STRH, etc.
    Store {
        reg: u8,  // Source register (0-30, 31 = XZR)
        size: u8, // Access size in bytes (1, 2, 4, 8)
    },
}

/// Why a data abort cannot be emulated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortError {
    /// ISV = 0
    NoSyndrome,
    /// Neither a translation nor a permission fault (raw DFSC)
    FaultKind(u8),
}

impl MmioAccess {
    /// Decode the ISS of a data abort taken from a lower EL.
    pub fn decode(iss: u64) -> Result<Self, AbortError> {
        let fsc = iss & ISS_FSC_MASK;
        match fsc & FSC_TYPE_MASK {
            FSC_TRANSLATION | FSC_PERMISSION => {}
            _ => return Err(AbortError::FaultKind(fsc as u8)),
        }
        if iss & ISS_ISV == 0 {
            return Err(AbortError::NoSyndrome);
        }

        let size = 1u8 << ((iss >> ISS_SAS_SHIFT) & ISS_SAS_MASK);
        let reg = ((iss >> ISS_SRT_SHIFT) & ISS_SRT_MASK) as u8;

        if iss & ISS_WNR != 0 {
            Ok(MmioAccess::Store { reg, size })
        } else {
            Ok(MmioAccess::Load {
                reg,
                size,
                sign_extend: iss & ISS_SSE != 0,
                sixty_four: iss & ISS_SF != 0,
            })
        }
    }

    /// Get the register number
    pub fn reg(&self) -> u8 {
        match self {
            MmioAccess::Load { reg, .. } => *reg,
            MmioAccess::Store { reg, .. } => *reg,
        }
    }

    /// Get the access size in bytes
    pub fn size(&self) -> u8 {
        match self {
            MmioAccess::Load { size, .. } => *size,
            MmioAccess::Store { size, .. } => *size,
        }
    }

    pub fn is_store(&self) -> bool {
        matches!(self, MmioAccess::Store { .. })
    }

    /// Value to place in the destination register for a load that read
    /// `raw` from the device.
    pub fn load_value(&self, raw: u64) -> u64 {
        let MmioAccess::Load { size, sign_extend, sixty_four, .. } = *self else {
            return 0;
        };
        let bits = size as u32 * 8;
        let value = if bits >= 64 { raw } else { raw & ((1u64 << bits) - 1) };
        if !sign_extend || bits >= 64 {
            return value;
        }
        let shift = 64 - bits;
        let extended = ((value << shift) as i64 >> shift) as u64;
        if sixty_four {
            extended
        } else {
            extended & 0xFFFF_FFFF
        }
    }

    /// Bytes of the source register a store writes.
    pub fn store_value(&self, reg_value: u64) -> u64 {
        let bits = self.size() as u32 * 8;
        if bits >= 64 {
            reg_value
        } else {
            reg_value & ((1u64 << bits) - 1)
        }
    }
}

/// IPA of a stage-2 fault: HPFAR_EL2 gives the page, FAR_EL2 the offset.
pub fn fault_ipa(hpfar: u64, far: u64) -> u64 {
    ((hpfar >> 4) << 12) | (far & 0xFFF)
}

/// Decoded MSR/MRS trap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SysRegAccessInfo {
    /// Op0/Op1/CRn/CRm/Op2 in ISS layout (see `sysreg_iss`)
    pub id: u64,
    pub reg: u8,
    pub read: bool,
}

impl SysRegAccessInfo {
    pub fn decode(iss: u64) -> Self {
        Self {
            id: iss & ISS_SYSREG_ID_MASK,
            reg: ((iss >> ISS_SYSREG_RT_SHIFT) & ISS_SYSREG_RT_MASK) as u8,
            read: iss & ISS_SYSREG_DIR_READ != 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dabt_iss(size_log2: u64, srt: u64, write: bool, sse: bool, sf: bool) -> u64 {
        let mut iss = ISS_ISV | (size_log2 << ISS_SAS_SHIFT) | (srt << ISS_SRT_SHIFT) | FSC_TRANSLATION | 1;
        if write {
            iss |= ISS_WNR;
        }
        if sse {
            iss |= ISS_SSE;
        }
        if sf {
            iss |= ISS_SF;
        }
        iss
    }

    #[test]
    fn test_decode_store_and_load() {
        assert_eq!(
            MmioAccess::decode(dabt_iss(2, 3, true, false, false)),
            Ok(MmioAccess::Store { reg: 3, size: 4 })
        );
        assert_eq!(
            MmioAccess::decode(dabt_iss(0, 7, false, true, true)),
            Ok(MmioAccess::Load { reg: 7, size: 1, sign_extend: true, sixty_four: true })
        );
    }

    #[test]
    fn test_decode_rejects_bad_syndromes() {
        let no_isv = dabt_iss(2, 0, false, false, false) & !ISS_ISV;
        assert_eq!(MmioAccess::decode(no_isv), Err(AbortError::NoSyndrome));
        // Access flag fault, level 1
        let af = (dabt_iss(2, 0, false, false, false) & !ISS_FSC_MASK) | 0x09;
        assert_eq!(MmioAccess::decode(af), Err(AbortError::FaultKind(0x09)));
        // Permission fault, level 3
        let perm = (dabt_iss(2, 0, true, false, false) & !ISS_FSC_MASK) | 0x0F;
        assert!(MmioAccess::decode(perm).is_ok());
    }

    #[test]
    fn test_load_sign_extension() {
        let ldrsb_x = MmioAccess::Load { reg: 0, size: 1, sign_extend: true, sixty_four: true };
        assert_eq!(ldrsb_x.load_value(0x80), 0xFFFF_FFFF_FFFF_FF80);
        let ldrsb_w = MmioAccess::Load { reg: 0, size: 1, sign_extend: true, sixty_four: false };
        assert_eq!(ldrsb_w.load_value(0x80), 0xFFFF_FF80);
        let ldrh = MmioAccess::Load { reg: 0, size: 2, sign_extend: false, sixty_four: false };
        assert_eq!(ldrh.load_value(0x1_8001), 0x8001);
        let strb = MmioAccess::Store { reg: 0, size: 1 };
        assert_eq!(strb.store_value(0x1234), 0x34);
    }

    #[test]
    fn test_fault_ipa() {
        assert_eq!(fault_ipa(0x0800_0000 >> 8, 0xFFFF_0000_0000_0123), 0x0800_0123);
    }

    #[test]
    fn test_sysreg_decode() {
        let iss = SYSREG_CNTP_CTL_EL0 | (5 << ISS_SYSREG_RT_SHIFT) | ISS_SYSREG_DIR_READ;
        let info = SysRegAccessInfo::decode(iss);
        assert_eq!(info.id, SYSREG_CNTP_CTL_EL0);
        assert_eq!(info.reg, 5);
        assert!(info.read);
    }
}
