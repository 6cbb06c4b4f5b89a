//! Virtual CPU (vCPU) Management
//!
//! A vCPU is backed by exactly one host thread. Its status follows the
//! thread: `Online` while the thread is runnable or running, `Suspended`
//! while it is blocked, `Offline` once the thread is gone.

use core::fmt;

use log::{debug, error};

use crate::arch::aarch64::defs::HCR_GUEST_FLAGS;
use crate::arch::aarch64::VcpuContext;
use crate::arch::traits::{HostKernel, ThreadId};
use crate::error::HypError;
use crate::vtimer::VcpuTimer;

/// Virtual CPU Status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuStatus {
    /// Created, thread not yet started
    NeverRun,

    /// Thread runnable or running
    Online,

    /// Thread blocked (pause or WFI)
    Suspended,

    /// Thread deleted
    Offline,

    /// An unexpected transition was requested
    Unknown,
}

impl VcpuStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            VcpuStatus::NeverRun => "never",
            VcpuStatus::Online => "online",
            VcpuStatus::Suspended => "suspend",
            VcpuStatus::Offline => "offline",
            VcpuStatus::Unknown => "unknown",
        }
    }
}

/// Virtual CPU
pub struct Vcpu {
    /// Index within the owning VM
    id: usize,

    /// Owning VM slot
    vm: usize,

    status: VcpuStatus,

    /// Physical CPU the backing thread is bound to
    affinity: u32,

    /// Guest entry point used on (re)start
    entry: u64,

    thread: Option<ThreadId>,

    /// Suspended by a WFI/WFE trap rather than by `pause`
    waiting: bool,

    /// Register context for this vCPU
    pub context: VcpuContext,

    /// HCR_EL2 value loaded while this vCPU runs
    pub hcr: u64,

    pub timer: VcpuTimer,
}

impl Vcpu {
    pub fn new(vm: usize, id: usize, entry: u64, affinity: u32) -> Self {
        Self {
            id,
            vm,
            status: VcpuStatus::NeverRun,
            affinity,
            entry,
            thread: None,
            waiting: false,
            context: VcpuContext::reset(entry, id),
            hcr: HCR_GUEST_FLAGS,
            timer: VcpuTimer::new(vm, id),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn vm(&self) -> usize {
        self.vm
    }

    pub fn status(&self) -> VcpuStatus {
        self.status
    }

    pub fn thread(&self) -> Option<ThreadId> {
        self.thread
    }

    pub fn affinity(&self) -> u32 {
        self.affinity
    }

    /// Parked on WFI and waiting for an interrupt.
    pub fn is_waiting(&self) -> bool {
        self.waiting
    }

    /// An illegal transition leaves the vCPU `Unknown` and takes the fault
    /// path, so it ends up `Offline` with its thread deleted.
    fn unexpected<K: HostKernel + ?Sized>(&mut self, kernel: &mut K, op: &str) -> HypError {
        let from = self.status;
        self.status = VcpuStatus::Unknown;
        self.fault(kernel, format_args!("{} not allowed in state {}", op, from.as_str()));
        HypError::InvalidState
    }

    /// `NeverRun | Offline | Suspended -> Online`
    ///
    /// A vCPU coming from `NeverRun` or `Offline` gets a fresh thread and a
    /// reset register context.
    pub fn go<K: HostKernel + ?Sized>(&mut self, kernel: &mut K) -> Result<(), HypError> {
        match self.status {
            VcpuStatus::NeverRun | VcpuStatus::Offline => {
                self.context = VcpuContext::reset(self.entry, self.id);
                self.hcr = HCR_GUEST_FLAGS;
                self.timer.reset(kernel);
                let thread = kernel
                    .thread_create(self.vm, self.id, self.entry, self.affinity)
                    .ok_or(HypError::AllocFailure)?;
                kernel.thread_start(thread);
                self.thread = Some(thread);
            }
            VcpuStatus::Suspended => {
                if let Some(thread) = self.thread {
                    kernel.thread_resume(thread);
                }
            }
            VcpuStatus::Online | VcpuStatus::Unknown => return Err(self.unexpected(kernel, "go")),
        }
        debug!("vcpu {}.{}: online", self.vm, self.id);
        self.status = VcpuStatus::Online;
        self.waiting = false;
        Ok(())
    }

    /// `Online -> Suspended`
    pub fn suspend<K: HostKernel + ?Sized>(&mut self, kernel: &mut K) -> Result<(), HypError> {
        if self.status != VcpuStatus::Online {
            return Err(self.unexpected(kernel, "suspend"));
        }
        if let Some(thread) = self.thread {
            kernel.thread_suspend(thread);
        }
        self.status = VcpuStatus::Suspended;
        Ok(())
    }

    /// WFI/WFE: suspend until an interrupt is injected.
    pub fn wait<K: HostKernel + ?Sized>(&mut self, kernel: &mut K) -> Result<(), HypError> {
        self.suspend(kernel)?;
        self.waiting = true;
        Ok(())
    }

    /// Resume a vCPU parked by `wait`. Returns whether it was woken.
    pub fn wake<K: HostKernel + ?Sized>(&mut self, kernel: &mut K) -> bool {
        if self.status != VcpuStatus::Suspended || !self.waiting {
            return false;
        }
        if let Some(thread) = self.thread {
            kernel.thread_resume(thread);
        }
        self.status = VcpuStatus::Online;
        self.waiting = false;
        true
    }

    /// Turn a WFI wait into a plain suspension, so interrupts no longer wake
    /// the vCPU.
    pub fn hold(&mut self) {
        self.waiting = false;
    }

    /// `Online | Suspended -> Offline`; a vCPU that never ran goes straight
    /// to `Offline`.
    pub fn shutdown<K: HostKernel + ?Sized>(&mut self, kernel: &mut K) -> Result<(), HypError> {
        match self.status {
            VcpuStatus::Online | VcpuStatus::Suspended | VcpuStatus::NeverRun => {
                self.release(kernel);
                Ok(())
            }
            VcpuStatus::Offline | VcpuStatus::Unknown => Err(self.unexpected(kernel, "shutdown")),
        }
    }

    /// Fault path: dump the registers and force the vCPU offline whatever
    /// state it is in.
    pub fn fault<K: HostKernel + ?Sized>(&mut self, kernel: &mut K, reason: fmt::Arguments<'_>) {
        error!("vcpu {}.{}: {}", self.vm, self.id, reason);
        error!("{}", self.dump());
        self.release(kernel);
    }

    fn release<K: HostKernel + ?Sized>(&mut self, kernel: &mut K) {
        self.timer.reset(kernel);
        if let Some(thread) = self.thread.take() {
            kernel.thread_delete(thread);
        }
        self.status = VcpuStatus::Offline;
        self.waiting = false;
    }

    pub fn dump(&self) -> VcpuDump<'_> {
        VcpuDump(self)
    }
}

impl fmt::Debug for Vcpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vcpu")
            .field("vm", &self.vm)
            .field("id", &self.id)
            .field("status", &self.status)
            .field("thread", &self.thread)
            .field("pc", &format_args!("{:#x}", self.context.pc))
            .finish()
    }
}

/// Register dump of one vCPU
pub struct VcpuDump<'a>(&'a Vcpu);

impl fmt::Display for VcpuDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = self.0;
        writeln!(
            f,
            "vcpu {} of vm {} ({}), hcr_el2: 0x{:016x}",
            v.id,
            v.vm,
            v.status.as_str(),
            v.hcr
        )?;
        write!(f, "{}", v.context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::soft::SimKernel;
    use crate::scheduler::RunState;

    #[test]
    fn test_lifecycle_tracks_thread() {
        let mut k = SimKernel::new();
        let mut v = Vcpu::new(0, 0, 0x4000_0000, 0);
        assert_eq!(v.status(), VcpuStatus::NeverRun);

        v.go(&mut k).unwrap();
        let t = v.thread().unwrap();
        assert_eq!(v.status(), VcpuStatus::Online);
        assert_eq!(k.thread_state(t), RunState::Ready);

        v.suspend(&mut k).unwrap();
        assert_eq!(k.thread_state(t), RunState::Blocked);

        v.go(&mut k).unwrap();
        assert_eq!(v.thread(), Some(t));
        assert_eq!(k.thread_state(t), RunState::Ready);

        v.shutdown(&mut k).unwrap();
        assert_eq!(v.status(), VcpuStatus::Offline);
        assert_eq!(v.thread(), None);
        assert_eq!(k.thread_state(t), RunState::None);
    }

    #[test]
    fn test_double_shutdown_is_unexpected() {
        let mut k = SimKernel::new();
        let mut v = Vcpu::new(0, 1, 0, 0);
        v.go(&mut k).unwrap();
        v.shutdown(&mut k).unwrap();
        assert_eq!(v.shutdown(&mut k), Err(HypError::InvalidState));
        assert_eq!(v.status(), VcpuStatus::Offline);
        assert_eq!(v.thread(), None);
    }

    #[test]
    fn test_go_on_online_is_unexpected() {
        let mut k = SimKernel::new();
        let mut v = Vcpu::new(0, 0, 0, 0);
        v.go(&mut k).unwrap();
        let t = v.thread().unwrap();
        assert_eq!(v.go(&mut k), Err(HypError::InvalidState));
        assert_eq!(v.status(), VcpuStatus::Offline);
        assert_eq!(v.thread(), None);
        assert_eq!(k.thread_state(t), RunState::None);
    }

    #[test]
    fn test_suspend_while_suspended_faults() {
        let mut k = SimKernel::new();
        let mut v = Vcpu::new(0, 0, 0, 0);
        v.go(&mut k).unwrap();
        let t = v.thread().unwrap();
        v.suspend(&mut k).unwrap();
        assert_eq!(v.suspend(&mut k), Err(HypError::InvalidState));
        assert_eq!(v.status(), VcpuStatus::Offline);
        assert_eq!(k.thread_state(t), RunState::None);
        // A faulted vCPU can be started again.
        v.go(&mut k).unwrap();
        assert_eq!(v.status(), VcpuStatus::Online);
    }

    #[test]
    fn test_wait_and_wake() {
        let mut k = SimKernel::new();
        let mut v = Vcpu::new(0, 0, 0, 0);
        v.go(&mut k).unwrap();
        v.suspend(&mut k).unwrap();
        // Paused, not waiting: an interrupt does not wake it.
        assert!(!v.wake(&mut k));
        v.go(&mut k).unwrap();
        v.wait(&mut k).unwrap();
        assert!(v.is_waiting());
        assert!(v.wake(&mut k));
        assert_eq!(v.status(), VcpuStatus::Online);
    }

    #[test]
    fn test_restart_resets_context() {
        let mut k = SimKernel::new();
        let mut v = Vcpu::new(0, 0, 0x8_0000, 0);
        v.go(&mut k).unwrap();
        v.context.advance_pc(0x40);
        v.context.set_gpr(3, 7);
        v.shutdown(&mut k).unwrap();
        v.go(&mut k).unwrap();
        assert_eq!(v.context.pc, 0x8_0000);
        assert_eq!(v.context.get_gpr(3), 0);
    }

    #[test]
    fn test_thread_creation_failure() {
        let mut k = SimKernel::new();
        k.thread_limit = 0;
        let mut v = Vcpu::new(0, 0, 0, 0);
        assert_eq!(v.go(&mut k), Err(HypError::AllocFailure));
        assert_eq!(v.status(), VcpuStatus::NeverRun);
    }
}
