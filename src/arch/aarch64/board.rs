//! QEMU virt board platform
//!
//! The `Platform` the hypervisor runs on in bare-metal builds: EL2 system
//! registers, the physical GICv3, and a minimal host kernel (thread table,
//! EL2 one-shot timer multiplexing, guest RAM pool, PL011 access).

use core::ptr::{copy_nonoverlapping, read_volatile, write_volatile};

use super::peripherals::{timer, GicV3};
use super::sysreg::HostSysRegs;
use crate::arch::traits::{HostKernel, PhysicalGic, SysReg, SysRegAccess, ThreadId, TimerKey};
use crate::mm::BumpAllocator;
use crate::platform::{
    GICD_BASE, GICR_BASE, GUEST_RAM_BASE, GUEST_RAM_SIZE, MAX_VCPU_NUM, UART_BASE,
};
use crate::scheduler::{Scheduler, MAX_THREADS};

fn timer_slot(key: TimerKey) -> usize {
    key.vm * MAX_VCPU_NUM + key.vcpu
}

pub struct BoardKernel {
    pub sched: Scheduler,
    /// Absolute deadline of every armed guest timer
    deadlines: [Option<u64>; MAX_THREADS],
    ram: BumpAllocator,
}

impl BoardKernel {
    pub const fn new() -> Self {
        Self {
            sched: Scheduler::new(),
            deadlines: [None; MAX_THREADS],
            ram: BumpAllocator::new(GUEST_RAM_BASE, GUEST_RAM_SIZE),
        }
    }

    /// Program CNTHP for the earliest armed deadline.
    fn reprogram(&self) {
        match self.deadlines.iter().flatten().min() {
            Some(&deadline) => timer::arm(deadline),
            None => timer::disarm(),
        }
    }

    /// Disarm and return one guest timer whose deadline has passed. Called
    /// from the PPI 26 handler until it returns `None`.
    pub fn next_expired(&mut self) -> Option<TimerKey> {
        let now = timer::counter();
        let slot = self
            .deadlines
            .iter()
            .position(|d| d.map_or(false, |d| d <= now));
        let Some(slot) = slot else {
            self.reprogram();
            return None;
        };
        self.deadlines[slot] = None;
        Some(TimerKey {
            vm: slot / MAX_VCPU_NUM,
            vcpu: slot % MAX_VCPU_NUM,
        })
    }
}

impl Default for BoardKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl HostKernel for BoardKernel {
    fn thread_create(&mut self, vm: usize, vcpu: usize, entry: u64, affinity: u32) -> Option<ThreadId> {
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
        timer::counter()
    }

    fn counter_frequency(&self) -> u64 {
        timer::frequency()
    }

    fn timer_start(&mut self, key: TimerKey, deadline: u64) {
        if let Some(d) = self.deadlines.get_mut(timer_slot(key)) {
            *d = Some(deadline);
            self.reprogram();
        }
    }

    fn timer_stop(&mut self, key: TimerKey) {
        if let Some(d) = self.deadlines.get_mut(timer_slot(key)) {
            *d = None;
            self.reprogram();
        }
    }

    fn alloc_guest_memory(&mut self, size: u64, align: u64) -> Option<u64> {
        self.ram.alloc_aligned(size, align)
    }

    fn free_guest_memory(&mut self, base: u64, size: u64) {
        self.ram.free(base, size);
    }

    fn copy_phys(&mut self, dst: u64, src: u64, len: u64) {
        // SAFETY: guest RAM and image windows are identity mapped at EL2 and
        // never overlap.
        unsafe { copy_nonoverlapping(src as *const u8, dst as *mut u8, len as usize) }
    }

    fn console_read(&mut self, offset: u64) -> u32 {
        unsafe { read_volatile((UART_BASE as u64 + offset) as *const u32) }
    }

    fn console_write(&mut self, offset: u64, value: u32) {
        unsafe { write_volatile((UART_BASE as u64 + offset) as *mut u32, value) }
    }
}

/// The machine as seen by `Hypervisor<BoardPlatform>`
pub struct BoardPlatform {
    pub regs: HostSysRegs,
    pub gic: GicV3,
    pub kernel: BoardKernel,
}

impl BoardPlatform {
    pub const fn new() -> Self {
        Self {
            regs: HostSysRegs {},
            gic: GicV3::new(GICD_BASE, GICR_BASE, 0),
            kernel: BoardKernel::new(),
        }
    }

    /// Bring up the physical GIC and the EL2 timer.
    pub fn init(&mut self) {
        self.gic.init();
        timer::init_hypervisor_timer();
        self.gic.unmask(timer::HYP_TIMER_INTID);
    }
}

impl Default for BoardPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl SysRegAccess for BoardPlatform {
    fn read(&self, reg: SysReg) -> u64 {
        self.regs.read(reg)
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

impl PhysicalGic for BoardPlatform {
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

impl HostKernel for BoardPlatform {
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
