//! Architecture-Portable Trait Definitions
//!
//! These traits abstract the hardware and host-kernel operations needed by
//! the hypervisor core. The virtualization logic (stage-2, vGIC, vTimer,
//! world switch, trap dispatch) is written against them, so it runs the same
//! on real EL2 hardware and on the simulated platform used by the host build.

/// System registers touched by the world switch and trap handlers.
///
/// Guest EL1 registers name the guest's view; the backend decides whether
/// that is the `*_el1` encoding (non-VHE) or the `*_el12` alias (VHE).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SysReg {
    // Guest EL1 context
    Sctlr,
    Ttbr0,
    Ttbr1,
    Tcr,
    Mair,
    Amair,
    Vbar,
    Contextidr,
    Cpacr,
    Afsr0,
    Afsr1,
    EsrEl1,
    FarEl1,
    Par,
    SpEl1,
    ElrEl1,
    SpsrEl1,
    TpidrEl1,
    TpidrEl0,
    TpidrroEl0,
    Cntkctl,

    // Generic timer
    CntvCtl,
    CntvCval,
    CntpCtl,
    CntpCval,
    Cntpct,
    Cntfrq,
    Cntvoff,

    // EL2 control and fault state
    Hcr,
    Vtcr,
    Vttbr,
    Vpidr,
    Vmpidr,
    EsrEl2,
    FarEl2,
    Hpfar,
    ElrEl2,
    SpsrEl2,

    // GICv3 virtualization interface
    IchLr(u8),
    IchAp1r(u8),
    IchVmcr,
    IchHcr,
    IchVtr,
    IchElrsr,
    IchMisr,
    IccSreEl1,
}

/// Guest EL1 registers saved and restored on every vCPU switch.
pub const EL1_CONTEXT_REGS: [SysReg; 21] = [
    SysReg::Sctlr,
    SysReg::Ttbr0,
    SysReg::Ttbr1,
    SysReg::Tcr,
    SysReg::Mair,
    SysReg::Amair,
    SysReg::Vbar,
    SysReg::Contextidr,
    SysReg::Cpacr,
    SysReg::Afsr0,
    SysReg::Afsr1,
    SysReg::EsrEl1,
    SysReg::FarEl1,
    SysReg::Par,
    SysReg::SpEl1,
    SysReg::ElrEl1,
    SysReg::SpsrEl1,
    SysReg::TpidrEl1,
    SysReg::TpidrEl0,
    SysReg::TpidrroEl0,
    SysReg::Cntkctl,
];

/// CPU register access (one implementation per exception-level pairing)
pub trait SysRegAccess {
    fn read(&self, reg: SysReg) -> u64;
    fn write(&mut self, reg: SysReg, val: u64);

    /// Instruction synchronization barrier after a batch of writes.
    fn isb(&mut self) {}

    /// Invalidate all stage-1 and stage-2 TLB entries of the VMID that is
    /// currently loaded in VTTBR_EL2.
    fn tlbi_vmalls12e1is(&mut self);
}

/// Physical interrupt controller primitives forwarded for hardware-backed virqs
pub trait PhysicalGic {
    fn mask(&mut self, intid: u32);
    fn unmask(&mut self, intid: u32);
    fn set_pending(&mut self, intid: u32);
    fn clear_pending(&mut self, intid: u32);
    fn set_priority(&mut self, intid: u32, priority: u8);
    /// `config` is the two-bit ICFGR field (0b10 = edge).
    fn set_config(&mut self, intid: u32, config: u8);
}

/// Host execution context backing one vCPU
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadId(pub usize);

/// Identifies the emulated physical timer of one vCPU
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimerKey {
    pub vm: usize,
    pub vcpu: usize,
}

/// Services consumed from the host kernel.
///
/// Threads are created suspended; `thread_start` makes them runnable.
pub trait HostKernel {
    fn thread_create(&mut self, vm: usize, vcpu: usize, entry: u64, affinity: u32) -> Option<ThreadId>;
    fn thread_start(&mut self, thread: ThreadId);
    fn thread_suspend(&mut self, thread: ThreadId);
    fn thread_resume(&mut self, thread: ThreadId);
    fn thread_delete(&mut self, thread: ThreadId);

    /// Physical counter value
    fn now(&self) -> u64;
    fn counter_frequency(&self) -> u64;

    /// Arm (or re-arm) a one-shot timer that fires at counter value `deadline`.
    fn timer_start(&mut self, key: TimerKey, deadline: u64);
    fn timer_stop(&mut self, key: TimerKey);

    fn alloc_guest_memory(&mut self, size: u64, align: u64) -> Option<u64>;
    fn free_guest_memory(&mut self, base: u64, size: u64);
    /// Copy between host physical addresses.
    fn copy_phys(&mut self, dst: u64, src: u64, len: u64);

    /// 32-bit access to the physical UART register at `offset`.
    fn console_read(&mut self, offset: u64) -> u32;
    fn console_write(&mut self, offset: u64, value: u32);
}

/// Everything the hypervisor core needs from the machine it runs on
pub trait Platform: SysRegAccess + PhysicalGic + HostKernel {}

impl<T: SysRegAccess + PhysicalGic + HostKernel> Platform for T {}
