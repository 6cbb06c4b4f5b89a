//! Virtual generic timer
//!
//! Each vCPU has two timers:
//! - the EL1 physical timer (`CNTP_*`, PPI 30), which traps and is emulated
//!   on top of a host one-shot timer;
//! - the EL1 virtual timer (`CNTV_*`, PPI 27), which the guest drives
//!   directly in hardware and which is saved and restored on every switch.
//!
//! Guest time is the host counter minus the VM's counter offset, the host
//! counter value when the VM was created.

use bitflags::bitflags;
use log::trace;

use crate::arch::traits::{HostKernel, SysReg, SysRegAccess, TimerKey};

bitflags! {
    /// CNTx_CTL_EL0
    pub struct TimerCtl: u64 {
        const ENABLE = 1 << 0;
        const IMASK = 1 << 1;
        const ISTATUS = 1 << 2;
    }
}

/// Trapped CNTP register
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerReg {
    Ctl,
    Cval,
    Tval,
    /// CNTPCT_EL0, read-only
    Count,
}

/// Emulated physical timer
#[derive(Clone, Copy, Debug)]
pub struct EmulatedTimer {
    ctl: TimerCtl,
    /// Compare value in guest counter ticks
    cval: u64,
}

impl EmulatedTimer {
    pub const fn new() -> Self {
        Self {
            ctl: TimerCtl::empty(),
            cval: 0,
        }
    }

    pub fn ctl(&self) -> TimerCtl {
        self.ctl
    }

    pub fn cval(&self) -> u64 {
        self.cval
    }

    fn firing(&self, guest_now: u64) -> bool {
        self.ctl.contains(TimerCtl::ENABLE) && guest_now >= self.cval
    }

    /// The timer should raise its interrupt.
    pub fn asserted(&self) -> bool {
        self.ctl.contains(TimerCtl::ENABLE | TimerCtl::ISTATUS) && !self.ctl.contains(TimerCtl::IMASK)
    }
}

impl Default for EmulatedTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// CNTV_* as last seen in hardware
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SavedVtimer {
    pub ctl: u64,
    pub cval: u64,
    /// Host counter at save time
    pub saved_at: u64,
}

/// Timer state of one vCPU
pub struct VcpuTimer {
    key: TimerKey,
    ptimer: EmulatedTimer,
    vtimer: SavedVtimer,
}

impl VcpuTimer {
    pub fn new(vm: usize, vcpu: usize) -> Self {
        Self {
            key: TimerKey { vm, vcpu },
            ptimer: EmulatedTimer::new(),
            vtimer: SavedVtimer::default(),
        }
    }

    pub fn key(&self) -> TimerKey {
        self.key
    }

    pub fn ptimer(&self) -> &EmulatedTimer {
        &self.ptimer
    }

    pub fn saved_vtimer(&self) -> &SavedVtimer {
        &self.vtimer
    }

    /// Disarm everything and return to reset state.
    pub fn reset<K: HostKernel + ?Sized>(&mut self, kernel: &mut K) {
        kernel.timer_stop(self.key);
        self.ptimer = EmulatedTimer::new();
        self.vtimer = SavedVtimer::default();
    }

    /// Guest read of a trapped timer register.
    pub fn read(&self, reg: TimerReg, guest_now: u64) -> u64 {
        match reg {
            TimerReg::Ctl => {
                let mut ctl = self.ptimer.ctl;
                if self.ptimer.firing(guest_now) {
                    ctl |= TimerCtl::ISTATUS;
                }
                ctl.bits()
            }
            TimerReg::Cval => self.ptimer.cval,
            TimerReg::Tval => self.ptimer.cval.wrapping_sub(guest_now) as u32 as u64,
            TimerReg::Count => guest_now,
        }
    }

    /// Guest write of a trapped timer register; re-arms or disarms the
    /// backing host timer.
    pub fn write<K: HostKernel + ?Sized>(
        &mut self,
        kernel: &mut K,
        reg: TimerReg,
        value: u64,
        cnt_offset: u64,
    ) {
        let guest_now = kernel.now().wrapping_sub(cnt_offset);
        match reg {
            TimerReg::Ctl => {
                // ISTATUS is read-only.
                let ctl = TimerCtl::from_bits_truncate(value) & (TimerCtl::ENABLE | TimerCtl::IMASK);
                self.ptimer.ctl = ctl;
            }
            TimerReg::Cval => {
                self.ptimer.cval = value;
                self.ptimer.ctl.remove(TimerCtl::ISTATUS);
            }
            TimerReg::Tval => {
                // TVAL is a signed 32-bit offset from now.
                let delta = value as u32 as i32 as i64;
                self.ptimer.cval = guest_now.wrapping_add(delta as u64);
                self.ptimer.ctl.remove(TimerCtl::ISTATUS);
            }
            TimerReg::Count => return,
        }
        self.rearm(kernel, cnt_offset);
    }

    fn rearm<K: HostKernel + ?Sized>(&mut self, kernel: &mut K, cnt_offset: u64) {
        let ctl = self.ptimer.ctl;
        if ctl.contains(TimerCtl::ENABLE) && !ctl.contains(TimerCtl::IMASK) {
            let deadline = self.ptimer.cval.wrapping_add(cnt_offset);
            trace!(
                "vtimer: vm {} vcpu {} armed at {:#x}",
                self.key.vm,
                self.key.vcpu,
                deadline
            );
            kernel.timer_start(self.key, deadline);
        } else {
            kernel.timer_stop(self.key);
        }
    }

    /// Host timer callback: latch ISTATUS. Returns whether the timer
    /// interrupt should be injected.
    pub fn expire(&mut self) -> bool {
        if !self.ptimer.ctl.contains(TimerCtl::ENABLE) {
            return false;
        }
        self.ptimer.ctl.insert(TimerCtl::ISTATUS);
        self.ptimer.asserted()
    }

    /// Switch-out: capture CNTV and stop it so it cannot fire for the wrong
    /// vCPU.
    pub fn save<R: SysRegAccess + ?Sized>(&mut self, regs: &mut R, now: u64) {
        self.vtimer = SavedVtimer {
            ctl: regs.read(SysReg::CntvCtl),
            cval: regs.read(SysReg::CntvCval),
            saved_at: now,
        };
        regs.write(SysReg::CntvCtl, 0);
    }

    /// Switch-in: push the deadline out by the time spent switched out and
    /// reprogram CNTV.
    pub fn restore<R: SysRegAccess + ?Sized>(&mut self, regs: &mut R, now: u64) {
        let elapsed = now.wrapping_sub(self.vtimer.saved_at);
        self.vtimer.cval = self.vtimer.cval.wrapping_add(elapsed);
        self.vtimer.saved_at = now;
        regs.write(SysReg::CntvCval, self.vtimer.cval);
        regs.write(SysReg::CntvCtl, self.vtimer.ctl & !TimerCtl::ISTATUS.bits());
    }
}
