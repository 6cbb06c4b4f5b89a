//! Simulated platform
//!
//! An in-memory register file, a recording interrupt controller and a host
//! kernel model. Host builds run the hypervisor on `SimPlatform`, and the
//! tests use it to observe every hardware side effect the core performs.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::arch::aarch64::defs::*;
use crate::arch::traits::{HostKernel, PhysicalGic, SysReg, SysRegAccess, ThreadId, TimerKey};
use crate::mm::BumpAllocator;
use crate::scheduler::{RunState, Scheduler};

/// Register file backed by a map; unset registers read as zero.
pub struct SoftSysRegs {
    regs: BTreeMap<SysReg, u64>,
    nr_lr: u8,
    pri_bits: u8,
    tlb_flushes: Vec<u64>,
}

impl SoftSysRegs {
    /// `nr_lr` list registers (1..=16) and 5 priority bits.
    pub fn new(nr_lr: u8) -> Self {
        Self::with_pri_bits(nr_lr, 5)
    }

    pub fn with_pri_bits(nr_lr: u8, pri_bits: u8) -> Self {
        Self {
            regs: BTreeMap::new(),
            nr_lr: nr_lr.clamp(1, 16),
            pri_bits: pri_bits.clamp(5, 7),
            tlb_flushes: Vec::new(),
        }
    }

    /// VTTBR value in effect at each stage-2 TLB invalidation
    pub fn tlb_flushes(&self) -> &[u64] {
        &self.tlb_flushes
    }

    /// Raw list register contents, as the guest would leave them
    pub fn set_lr_state(&mut self, n: u8, state: u64) {
        let lr = self.read(SysReg::IchLr(n));
        let lr = (lr & !(LR_STATE_MASK << LR_STATE_SHIFT)) | ((state & LR_STATE_MASK) << LR_STATE_SHIFT);
        self.regs.insert(SysReg::IchLr(n), lr);
    }

    fn elrsr(&self) -> u64 {
        (0..self.nr_lr)
            .filter(|&n| (self.read(SysReg::IchLr(n)) >> LR_STATE_SHIFT) & LR_STATE_MASK == 0)
            .fold(0, |acc, n| acc | (1 << n))
    }
}

impl SysRegAccess for SoftSysRegs {
    fn read(&self, reg: SysReg) -> u64 {
        match reg {
            SysReg::IchVtr => (self.nr_lr as u64 - 1) | ((self.pri_bits as u64 - 1) << VTR_PRIBITS_SHIFT),
            SysReg::IchElrsr => self.elrsr(),
            SysReg::IchLr(n) if n >= self.nr_lr => 0,
            other => self.regs.get(&other).copied().unwrap_or(0),
        }
    }

    fn write(&mut self, reg: SysReg, val: u64) {
        match reg {
            SysReg::IchVtr | SysReg::IchElrsr | SysReg::IchMisr => {}
            SysReg::IchLr(n) if n >= self.nr_lr => {}
            other => {
                self.regs.insert(other, val);
            }
        }
    }

    fn tlbi_vmalls12e1is(&mut self) {
        let vttbr = self.read(SysReg::Vttbr);
        self.tlb_flushes.push(vttbr);
    }
}

/// One call into the physical interrupt controller
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GicEvent {
    Mask(u32),
    Unmask(u32),
    SetPending(u32),
    ClearPending(u32),
    Priority(u32, u8),
    Config(u32, u8),
}

/// Interrupt controller that only records what it was asked to do
#[derive(Default)]
pub struct SoftGic {
    pub events: Vec<GicEvent>,
}

impl PhysicalGic for SoftGic {
    fn mask(&mut self, intid: u32) {
        self.events.push(GicEvent::Mask(intid));
    }

    fn unmask(&mut self, intid: u32) {
        self.events.push(GicEvent::Unmask(intid));
    }

    fn set_pending(&mut self, intid: u32) {
        self.events.push(GicEvent::SetPending(intid));
    }

    fn clear_pending(&mut self, intid: u32) {
        self.events.push(GicEvent::ClearPending(intid));
    }

    fn set_priority(&mut self, intid: u32, priority: u8) {
        self.events.push(GicEvent::Priority(intid, priority));
    }

    fn set_config(&mut self, intid: u32, config: u8) {
        self.events.push(GicEvent::Config(intid, config));
    }
}

/// Simulated physical RAM window handed out for guest memory
pub const SIM_RAM_BASE: u64 = 0x1_0000_0000;
pub const SIM_RAM_SIZE: u64 = 0x1_0000_0000;
/// 62.5 MHz, the QEMU virt counter frequency
pub const SIM_COUNTER_FREQ: u64 = 62_500_000;

/// Host kernel model: threads, a manual clock, one-shot timers, guest
/// memory accounting and a UART register file.
pub struct SimKernel {
    pub sched: Scheduler,
    now: u64,
    timers: BTreeMap<TimerKey, u64>,
    ram: BumpAllocator,
    /// Physical copies requested as (dst, src, len)
    pub copies: Vec<(u64, u64, u64)>,
    /// UART register writes as (offset, value)
    pub console_writes: Vec<(u64, u32)>,
    console_regs: BTreeMap<u64, u32>,
    /// Refuse the next N guest-memory allocations
    pub fail_alloc: usize,
    /// Refuse thread creation once this many threads exist
    pub thread_limit: usize,
}

impl SimKernel {
    pub fn new() -> Self {
        Self {
            sched: Scheduler::new(),
            now: 0,
            timers: BTreeMap::new(),
            ram: BumpAllocator::new(SIM_RAM_BASE, SIM_RAM_SIZE),
            copies: Vec::new(),
            console_writes: Vec::new(),
            console_regs: BTreeMap::new(),
            fail_alloc: 0,
            thread_limit: usize::MAX,
        }
    }

    pub fn advance(&mut self, ticks: u64) {
        self.now += ticks;
    }

    /// Deadline of an armed timer
    pub fn timer_deadline(&self, key: TimerKey) -> Option<u64> {
        self.timers.get(&key).copied()
    }

    /// Disarm and return every timer whose deadline has passed.
    pub fn take_expired(&mut self) -> Vec<TimerKey> {
        let now = self.now;
        let expired: Vec<TimerKey> = self
            .timers
            .iter()
            .filter(|&(_, &deadline)| deadline <= now)
            .map(|(&key, _)| key)
            .collect();
        for key in &expired {
            self.timers.remove(key);
        }
        expired
    }

    /// Value the UART returns for reads of `offset`
    pub fn set_console_reg(&mut self, offset: u64, value: u32) {
        self.console_regs.insert(offset, value);
    }

    pub fn thread_state(&self, thread: ThreadId) -> RunState {
        self.sched.state(thread)
    }
}

impl Default for SimKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl HostKernel for SimKernel {
    fn thread_create(&mut self, vm: usize, vcpu: usize, entry: u64, affinity: u32) -> Option<ThreadId> {
        if self.sched.len() >= self.thread_limit {
            return None;
        }
        self.sched.create(vm, vcpu, entry, affinity)
    }

    fn thread_start(&mut self, thread: ThreadId) {
        self.sched.unblock(thread);
    }

    fn thread_suspend(&mut self, thread: ThreadId) {
        self.sched.block(thread);
    }

    fn thread_resume(&mut self, thread: ThreadId) {
        self.sched.unblock(thread);
    }

    fn thread_delete(&mut self, thread: ThreadId) {
        self.sched.delete(thread);
    }

    fn now(&self) -> u64 {
        self.now
    }

    fn counter_frequency(&self) -> u64 {
        SIM_COUNTER_FREQ
    }

    fn timer_start(&mut self, key: TimerKey, deadline: u64) {
        self.timers.insert(key, deadline);
    }

    fn timer_stop(&mut self, key: TimerKey) {
        self.timers.remove(&key);
    }

    fn alloc_guest_memory(&mut self, size: u64, align: u64) -> Option<u64> {
        if self.fail_alloc > 0 {
            self.fail_alloc -= 1;
            return None;
        }
        self.ram.alloc_aligned(size, align)
    }

    fn free_guest_memory(&mut self, base: u64, size: u64) {
        self.ram.free(base, size);
    }

    fn copy_phys(&mut self, dst: u64, src: u64, len: u64) {
        self.copies.push((dst, src, len));
    }

    fn console_read(&mut self, offset: u64) -> u32 {
        self.console_regs.get(&offset).copied().unwrap_or(0)
    }

    fn console_write(&mut self, offset: u64, value: u32) {
        self.console_writes.push((offset, value));
    }
}

/// Complete simulated machine
pub struct SimPlatform {
    pub regs: SoftSysRegs,
    pub gic: SoftGic,
    pub kernel: SimKernel,
}

impl SimPlatform {
    pub fn new(nr_lr: u8) -> Self {
        Self {
            regs: SoftSysRegs::new(nr_lr),
            gic: SoftGic::default(),
            kernel: SimKernel::new(),
        }
    }
}

impl Default for SimPlatform {
    fn default() -> Self {
        Self::new(4)
    }
}

impl SysRegAccess for SimPlatform {
    fn read(&self, reg: SysReg) -> u64 {
        match reg {
            SysReg::Cntpct => self.kernel.now(),
            SysReg::Cntfrq => SIM_COUNTER_FREQ,
            other => self.regs.read(other),
        }
    }

    fn write(&mut self, reg: SysReg, val: u64) {
        self.regs.write(reg, val);
    }

    fn isb(&mut self) {
        self.regs.isb();
    }

    fn tlbi_vmalls12e1is(&mut self) {
        self.regs.tlbi_vmalls12e1is();
    }
}

impl PhysicalGic for SimPlatform {
    fn mask(&mut self, intid: u32) {
        self.gic.mask(intid);
    }

    fn unmask(&mut self, intid: u32) {
        self.gic.unmask(intid);
    }

    fn set_pending(&mut self, intid: u32) {
        self.gic.set_pending(intid);
    }

    fn clear_pending(&mut self, intid: u32) {
        self.gic.clear_pending(intid);
    }

    fn set_priority(&mut self, intid: u32, priority: u8) {
        self.gic.set_priority(intid, priority);
    }

    fn set_config(&mut self, intid: u32, config: u8) {
        self.gic.set_config(intid, config);
    }
}

impl HostKernel for SimPlatform {
    fn thread_create(&mut self, vm: usize, vcpu: usize, entry: u64, affinity: u32) -> Option<ThreadId> {
        self.kernel.thread_create(vm, vcpu, entry, affinity)
    }

    fn thread_start(&mut self, thread: ThreadId) {
        self.kernel.thread_start(thread);
    }

    fn thread_suspend(&mut self, thread: ThreadId) {
        self.kernel.thread_suspend(thread);
    }

    fn thread_resume(&mut self, thread: ThreadId) {
        self.kernel.thread_resume(thread);
    }

    fn thread_delete(&mut self, thread: ThreadId) {
        self.kernel.thread_delete(thread);
    }

    fn now(&self) -> u64 {
        self.kernel.now()
    }

    fn counter_frequency(&self) -> u64 {
        self.kernel.counter_frequency()
    }

    fn timer_start(&mut self, key: TimerKey, deadline: u64) {
        self.kernel.timer_start(key, deadline);
    }

    fn timer_stop(&mut self, key: TimerKey) {
        self.kernel.timer_stop(key);
    }

    fn alloc_guest_memory(&mut self, size: u64, align: u64) -> Option<u64> {
        self.kernel.alloc_guest_memory(size, align)
    }

    fn free_guest_memory(&mut self, base: u64, size: u64) {
        self.kernel.free_guest_memory(base, size);
    }

    fn copy_phys(&mut self, dst: u64, src: u64, len: u64) {
        self.kernel.copy_phys(dst, src, len);
    }

    fn console_read(&mut self, offset: u64) -> u32 {
        self.kernel.console_read(offset)
    }

    fn console_write(&mut self, offset: u64, value: u32) {
        self.kernel.console_write(offset, value);
    }
}
