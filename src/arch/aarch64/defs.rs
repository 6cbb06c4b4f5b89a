//! ARM64 Architecture Constants
//!
//! Named constants for system register fields, exception classes, syndrome
//! layouts, GICv3 list register encoding and stage-2 descriptors.

// ── HCR_EL2 (Hypervisor Configuration Register) ─────────────────────
pub const HCR_VM: u64 = 1 << 0;
pub const HCR_SWIO: u64 = 1 << 1;
pub const HCR_FMO: u64 = 1 << 3;
pub const HCR_IMO: u64 = 1 << 4;
pub const HCR_AMO: u64 = 1 << 5;
pub const HCR_TWI: u64 = 1 << 13;
pub const HCR_TWE: u64 = 1 << 14;
pub const HCR_TSC: u64 = 1 << 19;
pub const HCR_TGE: u64 = 1 << 27;
pub const HCR_RW: u64 = 1 << 31;

/// Trap configuration while a guest runs
pub const HCR_GUEST_FLAGS: u64 =
    HCR_VM | HCR_SWIO | HCR_FMO | HCR_IMO | HCR_AMO | HCR_TWI | HCR_TWE | HCR_TSC | HCR_RW;
/// Trap configuration while the host runs
pub const HCR_HOST_FLAGS: u64 = HCR_RW;

// ── ESR_EL2 (Exception Syndrome Register) ────────────────────────────
pub const ESR_EC_SHIFT: u32 = 26;
pub const ESR_EC_MASK: u64 = 0x3F;
pub const ESR_IL_BIT: u64 = 1 << 25;
pub const ESR_ISS_MASK: u64 = 0x1FF_FFFF;

// ── Exception Class (EC) values ──────────────────────────────────────
pub const EC_UNKNOWN: u64 = 0x00;
pub const EC_WFI_WFE: u64 = 0x01;
pub const EC_HVC64: u64 = 0x16;
pub const EC_SMC64: u64 = 0x17;
pub const EC_MSR_MRS: u64 = 0x18;
pub const EC_IABT_LOWER: u64 = 0x20;
pub const EC_DABT_LOWER: u64 = 0x24;

// ── Data abort ISS ───────────────────────────────────────────────────
pub const ISS_ISV: u64 = 1 << 24;
pub const ISS_SAS_SHIFT: u32 = 22;
pub const ISS_SAS_MASK: u64 = 0x3;
pub const ISS_SSE: u64 = 1 << 21;
pub const ISS_SRT_SHIFT: u32 = 16;
pub const ISS_SRT_MASK: u64 = 0x1F;
pub const ISS_SF: u64 = 1 << 15;
pub const ISS_FNV: u64 = 1 << 10;
pub const ISS_WNR: u64 = 1 << 6;
pub const ISS_FSC_MASK: u64 = 0x3F;
pub const FSC_TYPE_MASK: u64 = 0x3C;
pub const FSC_TRANSLATION: u64 = 0x04;
pub const FSC_PERMISSION: u64 = 0x0C;

// ── MSR/MRS ISS ──────────────────────────────────────────────────────
pub const ISS_SYSREG_DIR_READ: u64 = 1 << 0;
pub const ISS_SYSREG_RT_SHIFT: u32 = 5;
pub const ISS_SYSREG_RT_MASK: u64 = 0x1F;
/// Op0, Op2, Op1, CRn, CRm with Rt and direction stripped
pub const ISS_SYSREG_ID_MASK: u64 = 0x3F_FC1E;

/// Build the ISS register identifier of an MSR/MRS trap.
pub const fn sysreg_iss(op0: u64, op1: u64, crn: u64, crm: u64, op2: u64) -> u64 {
    (op0 << 20) | (op2 << 17) | (op1 << 14) | (crn << 10) | (crm << 1)
}

pub const SYSREG_CNTPCT_EL0: u64 = sysreg_iss(3, 3, 14, 0, 1);
pub const SYSREG_CNTP_TVAL_EL0: u64 = sysreg_iss(3, 3, 14, 2, 0);
pub const SYSREG_CNTP_CTL_EL0: u64 = sysreg_iss(3, 3, 14, 2, 1);
pub const SYSREG_CNTP_CVAL_EL0: u64 = sysreg_iss(3, 3, 14, 2, 2);

// ── HVC ──────────────────────────────────────────────────────────────
/// Returned in x0 for every hypercall; the interface is reserved.
pub const HVC_NOT_SUPPORTED: u64 = u64::MAX;

// ── SPSR_EL2 defaults ────────────────────────────────────────────────
pub const SPSR_EL1H_DAIF_MASKED: u64 = 0x3C5;

// ── vCPU reset identity ──────────────────────────────────────────────
pub const VCPU_MIDR: u64 = 0x410F_C050;
pub const VCPU_SCTLR_RESET: u64 = 0x00C5_0078;
pub const MPIDR_RES1: u64 = 1 << 31;
pub const MPIDR_AFF_MASK: u64 = 0xFF_00FF_FFFF;

// ── ICH_HCR_EL2 (Hypervisor Control Register for Virtual GIC) ───────
pub const ICH_HCR_EN: u64 = 1 << 0;
pub const ICH_HCR_UIE: u64 = 1 << 1;
pub const ICH_HCR_NPIE: u64 = 1 << 3;

// ── ICH_VMCR_EL2 ─────────────────────────────────────────────────────
pub const ICH_VMCR_VENG1: u64 = 1 << 1;
pub const ICH_VMCR_VPMR_SHIFT: u32 = 24;
pub const ICH_VMCR_RESET: u64 = ICH_VMCR_VENG1 | (0xFF << ICH_VMCR_VPMR_SHIFT);

// ── ICH_VTR_EL2 ──────────────────────────────────────────────────────
pub const VTR_LISTREGS_MASK: u64 = 0x1F;
pub const VTR_PRIBITS_SHIFT: u32 = 29;
pub const VTR_PRIBITS_MASK: u64 = 0x7;

// ── ICC_SRE_EL1 ──────────────────────────────────────────────────────
pub const ICC_SRE_SRE: u64 = 1 << 0;
pub const ICC_SRE_DFB: u64 = 1 << 1;
pub const ICC_SRE_DIB: u64 = 1 << 2;
pub const ICC_SRE_RESET: u64 = ICC_SRE_SRE | ICC_SRE_DFB | ICC_SRE_DIB;

// ── GICv3 List Register field positions ──────────────────────────────
pub const LR_STATE_SHIFT: u32 = 62;
pub const LR_STATE_MASK: u64 = 0x3;
pub const LR_HW_BIT: u64 = 1 << 61;
pub const LR_GROUP1_BIT: u64 = 1 << 60;
pub const LR_PRIORITY_SHIFT: u32 = 48;
pub const LR_PRIORITY_MASK: u64 = 0xFF;
pub const LR_PINTID_SHIFT: u32 = 32;
pub const LR_PINTID_MASK: u64 = 0x1FFF;
pub const LR_VINTID_MASK: u64 = 0xFFFF_FFFF;

// ── Interrupt priority ───────────────────────────────────────────────
pub const GIC_LOWEST_PRIORITY: u8 = 0xFF;
pub const IRQ_DEFAULT_PRIORITY: u8 = 0xA0;

// ── VTCR_EL2 fields (40-bit IPA, walk starts at level 1) ────────────
pub const VTCR_T0SZ_40BIT: u64 = 64 - 40;
pub const VTCR_SL0_LEVEL1: u64 = 1 << 6;
pub const VTCR_IRGN0_WB: u64 = 0b01 << 8;
pub const VTCR_ORGN0_WB: u64 = 0b01 << 10;
pub const VTCR_SH0_INNER: u64 = 0b11 << 12;
pub const VTCR_TG0_4KB: u64 = 0b00 << 14;
pub const VTCR_PS_40BIT: u64 = 0b010 << 16;
pub const VTCR_RES1: u64 = 1 << 31;
pub const VTCR_VALUE: u64 = VTCR_T0SZ_40BIT
    | VTCR_SL0_LEVEL1
    | VTCR_IRGN0_WB
    | VTCR_ORGN0_WB
    | VTCR_SH0_INNER
    | VTCR_TG0_4KB
    | VTCR_PS_40BIT
    | VTCR_RES1;
pub const VTTBR_VMID_SHIFT: u32 = 48;
pub const IPA_BITS: u32 = 40;

// ── Page table constants ─────────────────────────────────────────────
pub const PTE_VALID: u64 = 1 << 0;
pub const PTE_TABLE: u64 = 1 << 1;
pub const PTE_ADDR_MASK: u64 = 0x0000_FFFF_FFFF_F000;
pub const PTE_ATTR_MASK: u64 = 0xFFF0_0000_0000_0FFC;
pub const PT_INDEX_MASK: u64 = 0x1FF;
pub const L1_ROOT_ENTRIES: usize = 1024;
pub const L1_SHIFT: u32 = 30;
pub const L2_SHIFT: u32 = 21;
pub const L3_SHIFT: u32 = 12;
pub const BLOCK_SIZE_1GB: u64 = 1 << L1_SHIFT;
pub const BLOCK_SIZE_2MB: u64 = 1 << L2_SHIFT;
pub const BLOCK_MASK_2MB: u64 = BLOCK_SIZE_2MB - 1;
pub const PAGE_SIZE_4KB: u64 = 1 << L3_SHIFT;
pub const PAGE_MASK_4KB: u64 = PAGE_SIZE_4KB - 1;

// ── Stage-2 descriptor attributes ────────────────────────────────────
pub const S2_MEMATTR_SHIFT: u32 = 2;
pub const S2_MEMATTR_NORMAL_WB: u64 = 0b1111;
pub const S2_MEMATTR_DEVICE_NGNRNE: u64 = 0b0000;
pub const S2_AP_READ: u64 = 1 << 6;
pub const S2_AP_WRITE: u64 = 1 << 7;
pub const S2_SH_INNER: u64 = 0b11 << 8;
pub const S2_AF: u64 = 1 << 10;
pub const S2_XN: u64 = 1 << 54;

// ── ARM64 instruction width ──────────────────────────────────────────
pub const AARCH64_INSN_SIZE: u64 = 4;
