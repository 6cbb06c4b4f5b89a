//! Global heap management
//!
//! Bare-metal builds register `HostHeap` as the `#[global_allocator]` over
//! a fixed physical window. Memory is never returned except for the most
//! recent allocation, which is enough for the VM tables that are built once
//! at start-up and torn down rarely.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

use super::BumpAllocator;
use crate::sync::SpinLock;

pub struct HostHeap {
    allocator: SpinLock<Option<BumpAllocator>>,
}

impl HostHeap {
    pub const fn new() -> Self {
        Self {
            allocator: SpinLock::new(None),
        }
    }

    /// Hand the window `start..start+size` to the heap. Must be called
    /// before the first allocation; later calls are ignored.
    pub fn init(&self, start: u64, size: u64) {
        let mut guard = self.allocator.lock();
        if guard.is_none() {
            *guard = Some(BumpAllocator::new(start, size));
        }
    }

    /// Get remaining heap space
    pub fn remaining(&self) -> u64 {
        self.allocator
            .lock()
            .as_ref()
            .map(|a| a.remaining())
            .unwrap_or(0)
    }

    /// Get total allocated bytes
    pub fn allocated(&self) -> u64 {
        self.allocator
            .lock()
            .as_ref()
            .map(|a| a.allocated())
            .unwrap_or(0)
    }
}

impl Default for HostHeap {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl GlobalAlloc for HostHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let mut guard = self.allocator.lock();
        match guard
            .as_mut()
            .and_then(|a| a.alloc_aligned(layout.size() as u64, layout.align() as u64))
        {
            Some(addr) => addr as *mut u8,
            None => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let Some(a) = self.allocator.lock().as_mut() {
            a.free(ptr as u64, layout.size() as u64);
        }
    }
}
