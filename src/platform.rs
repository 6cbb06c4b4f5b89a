//! Platform/Board Constants
//!
//! All board-specific addresses, pool sizes and limits live here so they
//! can be changed in one place when targeting a different platform.

// ── UART (PL011) ─────────────────────────────────────────────────────
pub const UART_BASE: usize = 0x0900_0000;
pub const UART_SIZE: u64 = 0x1000;
/// SPI 1 on QEMU virt
pub const UART_INTID: u32 = 33;

// ── Physical GIC ─────────────────────────────────────────────────────
pub const GICD_BASE: u64 = 0x0800_0000;
pub const GICR_BASE: u64 = 0x080A_0000;

// ── VM limits ────────────────────────────────────────────────────────
pub const MAX_VM_NUM: usize = 64;
pub const MAX_VCPU_NUM: usize = 4;
pub const VM_NAME_SIZE: usize = 16;
/// Number of supported OS types (Linux, RT-Thread, Zephyr, Other)
pub const MAX_OS_TYPE: usize = 4;

// ── Stage-2 page pool ────────────────────────────────────────────────
/// Inner translation tables available to one VM
pub const MMU_TBL_PAGE_NR_MAX: usize = 32;
/// Granule used when copying a guest image into its memory
pub const MEM_BLOCK_SIZE: u64 = 0x20_0000;

// ── vGIC ─────────────────────────────────────────────────────────────
pub const MAX_LR_REGS: usize = 16;
/// Software backlog slots per vCPU beyond the hardware list registers
pub const GIC_LR_LIST_NUM: usize = 64;
pub const VGIC_GICD_SIZE: u64 = 0x1_0000;
/// One RD frame + one SGI frame per vCPU
pub const VGIC_GICR_STRIDE: u64 = 0x2_0000;
pub const VIRQ_PRIV_NUM: usize = 32;
pub const VIRQ_SGI_NUM: usize = 16;
/// Upper bound on virq_num from configuration
pub const VIRQ_MAX_NUM: usize = 1020;
pub const GIC_MAINTENANCE_INTID: u32 = 25;

// ── Timers ───────────────────────────────────────────────────────────
pub const PTIMER_INTID: u32 = 30;
pub const VTIMER_INTID: u32 = 27;

// ── Guest defaults ───────────────────────────────────────────────────
pub const DEFAULT_IMAGE_SIZE: u64 = 0x2_0000;
pub const DEFAULT_VIRQ_NUM: usize = 128;

// ── Bare-metal memory layout (QEMU virt, RAM at 0x4000_0000) ────────
/// Hypervisor heap
pub const HEAP_BASE: u64 = 0x4800_0000;
pub const HEAP_SIZE: u64 = 0x0800_0000;
/// Pool guest RAM is carved from when an image has no fixed `phymem`
pub const GUEST_RAM_BASE: u64 = 0x5000_0000;
pub const GUEST_RAM_SIZE: u64 = 0x3000_0000;
