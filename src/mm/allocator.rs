//! Fixed-capacity index allocation and a simple bump allocator

/// Index allocator over at most 64 slots.
///
/// Used for VM slots and for the per-VM page-table page pool. Always hands
/// out the lowest free index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Bitmap64 {
    bits: u64,
    capacity: usize,
}

impl Bitmap64 {
    pub const fn new(capacity: usize) -> Self {
        let capacity = if capacity > 64 { 64 } else { capacity };
        Self { bits: 0, capacity }
    }

    /// Claim the lowest free index.
    pub fn alloc(&mut self) -> Option<usize> {
        let free = !self.bits;
        if free == 0 {
            return None;
        }
        let idx = free.trailing_zeros() as usize;
        if idx >= self.capacity {
            return None;
        }
        self.bits |= 1 << idx;
        Some(idx)
    }

    /// Release an index; freeing an unallocated index is a no-op.
    pub fn free(&mut self, idx: usize) {
        if idx < self.capacity {
            self.bits &= !(1u64 << idx);
        }
    }

    pub fn is_set(&self, idx: usize) -> bool {
        idx < self.capacity && self.bits & (1u64 << idx) != 0
    }

    pub fn count(&self) -> usize {
        self.bits.count_ones() as usize
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.count() >= self.capacity
    }

    /// Iterate over allocated indices in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.capacity).filter(move |&i| self.is_set(i))
    }
}

pub struct BumpAllocator {
    next: u64,
    end: u64,
    allocated: u64,
}

impl BumpAllocator {
    pub const fn new(start: u64, size: u64) -> Self {
        Self {
            next: start,
            end: start + size,
            allocated: 0,
        }
    }

    pub fn alloc_aligned(&mut self, size: u64, align: u64) -> Option<u64> {
        let align = align.max(1);
        let aligned = self.next.checked_add(align - 1)? & !(align - 1);
        let new_next = aligned.checked_add(size)?;

        if new_next > self.end {
            return None;
        }

        self.next = new_next;
        self.allocated += size;
        Some(aligned)
    }

    pub fn remaining(&self) -> u64 {
        self.end - self.next
    }

    pub fn allocated(&self) -> u64 {
        self.allocated
    }

    /// Give back the most recent allocation if `base..base+size` is the top
    /// of the arena. Anything else stays allocated until the arena is reset.
    pub fn free(&mut self, base: u64, size: u64) {
        if base.checked_add(size) == Some(self.next) {
            self.next = base;
            self.allocated = self.allocated.saturating_sub(size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitmap_lowest_first() {
        let mut bm = Bitmap64::new(4);
        assert_eq!(bm.alloc(), Some(0));
        assert_eq!(bm.alloc(), Some(1));
        bm.free(0);
        assert_eq!(bm.alloc(), Some(0));
        assert_eq!(bm.alloc(), Some(2));
        assert_eq!(bm.alloc(), Some(3));
        assert_eq!(bm.alloc(), None);
        assert!(bm.is_full());
        assert_eq!(bm.iter().count(), 4);
    }

    #[test]
    fn test_bitmap_full_width() {
        let mut bm = Bitmap64::new(64);
        for i in 0..64 {
            assert_eq!(bm.alloc(), Some(i));
        }
        assert_eq!(bm.alloc(), None);
        bm.free(63);
        assert!(!bm.is_set(63));
        assert_eq!(bm.alloc(), Some(63));
    }

    #[test]
    fn test_bump_alignment() {
        let mut bump = BumpAllocator::new(0x1000, 0x40_0000);
        let a = bump.alloc_aligned(0x10, 8).unwrap();
        assert_eq!(a, 0x1000);
        let b = bump.alloc_aligned(0x20_0000, 0x20_0000).unwrap();
        assert_eq!(b, 0x20_0000);
        assert!(bump.alloc_aligned(0x40_0000, 0x1000).is_none());
        bump.free(b, 0x20_0000);
        assert_eq!(bump.alloc_aligned(0x20_0000, 0x20_0000), Some(0x20_0000));
    }
}
