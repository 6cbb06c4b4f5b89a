//! Host thread table with round-robin selection
//!
//! Stands in for the host kernel's thread facility: every vCPU is backed by
//! one entry here. The simulated platform and the bare-metal board both keep
//! their vCPU threads in a `Scheduler`.

use crate::arch::traits::ThreadId;
use crate::platform::{MAX_VCPU_NUM, MAX_VM_NUM};
use crate::switch::ExecContext;

pub const MAX_THREADS: usize = MAX_VM_NUM * MAX_VCPU_NUM;

/// Run state for a host thread
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RunState {
    /// Slot is free
    None,
    /// Runnable, waiting to be picked
    Ready,
    /// Currently on the CPU
    Running,
    /// Created but not started, or suspended
    Blocked,
}

/// One vCPU-backing thread
#[derive(Clone, Copy, Debug)]
pub struct ThreadSlot {
    pub vm: usize,
    pub vcpu: usize,
    pub entry: u64,
    pub affinity: u32,
    pub state: RunState,
}

pub struct Scheduler {
    threads: [Option<ThreadSlot>; MAX_THREADS],
    /// Currently running thread (if any)
    current: Option<usize>,
    /// Next index to check in round-robin
    next_idx: usize,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            threads: [None; MAX_THREADS],
            current: None,
            next_idx: 0,
        }
    }

    /// Create a blocked thread for (vm, vcpu).
    pub fn create(&mut self, vm: usize, vcpu: usize, entry: u64, affinity: u32) -> Option<ThreadId> {
        let idx = self.threads.iter().position(|t| t.is_none())?;
        self.threads[idx] = Some(ThreadSlot {
            vm,
            vcpu,
            entry,
            affinity,
            state: RunState::Blocked,
        });
        Some(ThreadId(idx))
    }

    /// Make a blocked thread runnable (start and resume are the same here).
    pub fn unblock(&mut self, id: ThreadId) {
        if let Some(Some(t)) = self.threads.get_mut(id.0) {
            if t.state == RunState::Blocked {
                t.state = RunState::Ready;
            }
        }
    }

    pub fn block(&mut self, id: ThreadId) {
        if let Some(Some(t)) = self.threads.get_mut(id.0) {
            t.state = RunState::Blocked;
        }
        if self.current == Some(id.0) {
            self.current = None;
            self.next_idx = (id.0 + 1) % MAX_THREADS;
        }
    }

    pub fn delete(&mut self, id: ThreadId) {
        if let Some(slot) = self.threads.get_mut(id.0) {
            *slot = None;
        }
        if self.current == Some(id.0) {
            self.current = None;
        }
    }

    /// Pick the next thread to run (round-robin).
    ///
    /// The running thread, if still runnable, goes back to `Ready` and is
    /// considered last.
    pub fn pick_next(&mut self) -> Option<ThreadId> {
        if let Some(cur) = self.current.take() {
            if let Some(t) = self.threads[cur].as_mut() {
                if t.state == RunState::Running {
                    t.state = RunState::Ready;
                }
            }
            self.next_idx = (cur + 1) % MAX_THREADS;
        }

        for i in 0..MAX_THREADS {
            let idx = (self.next_idx + i) % MAX_THREADS;
            if let Some(t) = self.threads[idx].as_mut() {
                if t.state == RunState::Ready {
                    t.state = RunState::Running;
                    self.current = Some(idx);
                    return Some(ThreadId(idx));
                }
            }
        }
        None
    }

    /// Get the currently running thread (if any)
    pub fn current(&self) -> Option<ThreadId> {
        self.current.map(ThreadId)
    }

    pub fn state(&self, id: ThreadId) -> RunState {
        match self.threads.get(id.0) {
            Some(Some(t)) => t.state,
            _ => RunState::None,
        }
    }

    pub fn slot(&self, id: ThreadId) -> Option<&ThreadSlot> {
        self.threads.get(id.0)?.as_ref()
    }

    /// What `id` executes; no thread means the host idles.
    pub fn exec_context(&self, id: Option<ThreadId>) -> ExecContext {
        match id.and_then(|id| self.slot(id)) {
            Some(t) => ExecContext::Vcpu { vm: t.vm, vcpu: t.vcpu },
            None => ExecContext::Host,
        }
    }

    /// Number of live threads
    pub fn len(&self) -> usize {
        self.threads.iter().filter(|t| t.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
