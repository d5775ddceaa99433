//! App heap allocator backing `module_malloc` / `module_free`.
//!
//! The allocator hands out app offsets inside `[base, base + size)`. All of
//! its bookkeeping lives in host memory, never in the guest-visible heap
//! bytes, so a misbehaving guest can scribble over its heap without being able
//! to corrupt the free list.

use std::collections::BTreeMap;

/// Alignment of every block handed out.
pub const HEAP_ALIGN: u32 = 8;

/// How a free block is chosen for a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AllocPolicy {
    /// Lowest-addressed free block that fits.
    #[default]
    FirstFit,
    /// Smallest free block that fits, ties broken by address.
    BestFit,
}

/// Allocation statistics of one heap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub total_size: u32,
    pub total_free: u32,
    pub highmark_used: u32,
    pub live_blocks: usize,
}

/// Outcome of a successful `realloc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Realloc {
    /// The block kept its offset.
    InPlace(u32),
    /// The block moved. The caller copies `copy_len` bytes from `from` to `to`;
    /// the old block is already released.
    Moved { from: u32, to: u32, copy_len: u32 },
}

#[derive(Debug)]
pub struct HeapAllocator {
    start: u32,
    end: u64,
    policy: AllocPolicy,
    /// Free blocks: offset -> length.
    free: BTreeMap<u32, u32>,
    /// Live blocks: offset -> length (rounded up to `HEAP_ALIGN`).
    used: BTreeMap<u32, u32>,
    in_use: u32,
    highmark: u32,
}

impl HeapAllocator {
    /// Create an allocator over `[base, base + size)`.
    ///
    /// The usable range is shrunk to `HEAP_ALIGN` boundaries, and offset 0 is
    /// never handed out, so that 0 can keep meaning "no allocation".
    #[must_use]
    pub fn new(base: u32, size: u32, policy: AllocPolicy) -> Self {
        let end = u64::from(base) + u64::from(size);
        let mut start = crate::config::align_up(u64::from(base), u64::from(HEAP_ALIGN));
        if start == 0 {
            start = u64::from(HEAP_ALIGN);
        }
        let end = end & !u64::from(HEAP_ALIGN - 1);

        let mut free = BTreeMap::new();
        let start = start.min(end);
        let len = end - start;
        if len > 0 {
            free.insert(start as u32, len as u32);
        }
        Self {
            start: start as u32,
            end,
            policy,
            free,
            used: BTreeMap::new(),
            in_use: 0,
            highmark: 0,
        }
    }

    /// Allocate `size` bytes. Returns the app offset of the block, or `None`
    /// for a zero-sized request or when no free block is large enough.
    pub fn malloc(&mut self, size: u32) -> Option<u32> {
        if size == 0 {
            return None;
        }
        let need = round_size(size)?;
        let (offset, len) = self.find_block(need)?;

        self.free.remove(&offset);
        if len > need {
            self.free.insert(offset + need, len - need);
        }
        self.used.insert(offset, need);
        self.in_use += need;
        self.highmark = self.highmark.max(self.in_use);
        Some(offset)
    }

    /// Release the block starting at `offset`.
    pub fn free(&mut self, offset: u32) -> crate::Result<()> {
        let Some(len) = self.used.remove(&offset) else {
            tracing::warn!("free of {offset:#x}: not a live block of this heap");
            return Err(crate::Error::InvalidFree(u64::from(offset)));
        };
        self.in_use -= len;
        self.insert_free(offset, len);
        Ok(())
    }

    /// Resize the block at `offset` to `new_size` bytes.
    ///
    /// Shrinking and growing into an adjacent free block happen in place.
    /// Otherwise a new block is taken and the old one released. On failure the
    /// original block is left untouched.
    pub fn realloc(&mut self, offset: u32, new_size: u32) -> crate::Result<Option<Realloc>> {
        let Some(&old_len) = self.used.get(&offset) else {
            return Err(crate::Error::InvalidFree(u64::from(offset)));
        };
        if new_size == 0 {
            return Ok(None);
        }
        let Some(need) = round_size(new_size) else {
            return Ok(None);
        };

        if need <= old_len {
            if need < old_len {
                self.used.insert(offset, need);
                self.in_use -= old_len - need;
                self.insert_free(offset + need, old_len - need);
            }
            return Ok(Some(Realloc::InPlace(offset)));
        }

        let extra = need - old_len;
        if let Some(next) = offset.checked_add(old_len)
            && let Some(&next_len) = self.free.get(&next)
            && next_len >= extra
        {
            self.free.remove(&next);
            if next_len > extra {
                self.free.insert(next + extra, next_len - extra);
            }
            self.used.insert(offset, need);
            self.in_use += extra;
            self.highmark = self.highmark.max(self.in_use);
            return Ok(Some(Realloc::InPlace(offset)));
        }

        let Some(to) = self.malloc(new_size) else {
            return Ok(None);
        };
        self.free(offset)?;
        Ok(Some(Realloc::Moved {
            from: offset,
            to,
            copy_len: old_len,
        }))
    }

    /// Usable size of the live block at `offset`.
    #[must_use]
    pub fn allocated_size(&self, offset: u32) -> Option<u32> {
        self.used.get(&offset).copied()
    }

    #[must_use]
    pub fn is_allocated(&self, offset: u32) -> bool {
        self.used.contains_key(&offset)
    }

    /// Whether `offset` lies in the managed range (allocated or not).
    #[must_use]
    pub fn owns(&self, offset: u32) -> bool {
        offset >= self.start && u64::from(offset) < self.end
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let total_size = (self.end - u64::from(self.start)) as u32;
        HeapStats {
            total_size,
            total_free: total_size - self.in_use,
            highmark_used: self.highmark,
            live_blocks: self.used.len(),
        }
    }

    fn find_block(&self, need: u32) -> Option<(u32, u32)> {
        let fits = self.free.iter().filter(|&(_, &len)| len >= need);
        match self.policy {
            AllocPolicy::FirstFit => fits.map(|(&o, &l)| (o, l)).next(),
            AllocPolicy::BestFit => fits.min_by_key(|&(&o, &l)| (l, o)).map(|(&o, &l)| (o, l)),
        }
    }

    fn insert_free(&mut self, mut offset: u32, mut len: u32) {
        if let Some((&prev, &prev_len)) = self.free.range(..offset).next_back()
            && prev + prev_len == offset
        {
            self.free.remove(&prev);
            offset = prev;
            len += prev_len;
        }
        if let Some(next) = offset.checked_add(len)
            && let Some(next_len) = self.free.remove(&next)
        {
            len += next_len;
        }
        self.free.insert(offset, len);
    }
}

fn round_size(size: u32) -> Option<u32> {
    size.checked_add(HEAP_ALIGN - 1).map(|s| s & !(HEAP_ALIGN - 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malloc_within_region() {
        let mut heap = HeapAllocator::new(57344, 8192, AllocPolicy::FirstFit);
        let a = heap.malloc(100).expect("alloc");
        assert!(a >= 57344);
        assert_eq!(a % HEAP_ALIGN, 0);
        assert_eq!(heap.allocated_size(a), Some(104));
        let b = heap.malloc(100).expect("alloc");
        assert!(b >= a + 104);
    }

    #[test]
    fn test_zero_and_oversized_requests_fail() {
        let mut heap = HeapAllocator::new(1024, 1024, AllocPolicy::FirstFit);
        assert_eq!(heap.malloc(0), None);
        assert_eq!(heap.malloc(1025), None);
        assert_eq!(heap.malloc(u32::MAX), None);
        assert!(heap.malloc(1024).is_some());
        assert_eq!(heap.malloc(1), None);
    }

    #[test]
    fn test_offset_zero_never_returned() {
        let mut heap = HeapAllocator::new(0, 64, AllocPolicy::FirstFit);
        let first = heap.malloc(8).expect("alloc");
        assert_ne!(first, 0);
        assert_eq!(heap.stats().total_size, 56);
    }

    #[test]
    fn test_double_free_is_reported() {
        let mut heap = HeapAllocator::new(1024, 1024, AllocPolicy::FirstFit);
        let a = heap.malloc(16).expect("alloc");
        heap.free(a).expect("first free");
        assert!(matches!(heap.free(a), Err(crate::Error::InvalidFree(_))));
    }

    #[test]
    fn test_foreign_and_interior_addresses_are_rejected() {
        let mut heap = HeapAllocator::new(1024, 1024, AllocPolicy::FirstFit);
        let a = heap.malloc(64).expect("alloc");
        assert!(heap.free(a + 8).is_err());
        assert!(heap.free(10).is_err());
        assert!(heap.free(u32::MAX).is_err());
        assert!(heap.is_allocated(a));
    }

    #[test]
    fn test_free_coalesces_neighbours() {
        let mut heap = HeapAllocator::new(1024, 96, AllocPolicy::FirstFit);
        let a = heap.malloc(32).expect("a");
        let b = heap.malloc(32).expect("b");
        let c = heap.malloc(32).expect("c");
        heap.free(a).expect("free a");
        heap.free(c).expect("free c");
        heap.free(b).expect("free b");
        // The whole region is one block again.
        assert_eq!(heap.malloc(96), Some(1024));
    }

    #[test]
    fn test_best_fit_picks_smallest_hole() {
        let mut heap = HeapAllocator::new(0x1000, 0x1000, AllocPolicy::BestFit);
        let a = heap.malloc(64).expect("a");
        let _guard1 = heap.malloc(8).expect("guard");
        let b = heap.malloc(16).expect("b");
        let _guard2 = heap.malloc(8).expect("guard");
        heap.free(a).expect("free a");
        heap.free(b).expect("free b");
        assert_eq!(heap.malloc(16), Some(b));

        let mut first = HeapAllocator::new(0x1000, 0x1000, AllocPolicy::FirstFit);
        let a = first.malloc(64).expect("a");
        let _guard1 = first.malloc(8).expect("guard");
        let b = first.malloc(16).expect("b");
        let _guard2 = first.malloc(8).expect("guard");
        first.free(a).expect("free a");
        first.free(b).expect("free b");
        assert_eq!(first.malloc(16), Some(a));
    }

    #[test]
    fn test_realloc_in_place_and_moved() {
        let mut heap = HeapAllocator::new(1024, 1024, AllocPolicy::FirstFit);
        let a = heap.malloc(16).expect("a");
        assert_eq!(heap.realloc(a, 64).expect("realloc"), Some(Realloc::InPlace(a)));
        assert_eq!(heap.realloc(a, 8).expect("realloc"), Some(Realloc::InPlace(a)));
        let _b = heap.malloc(16).expect("b");
        match heap.realloc(a, 128).expect("realloc") {
            Some(Realloc::Moved { from, to, copy_len }) => {
                assert_eq!(from, a);
                assert_ne!(to, a);
                assert_eq!(copy_len, 8);
                assert!(!heap.is_allocated(a));
            }
            other => panic!("expected move, got {other:?}"),
        }
    }

    #[test]
    fn test_stats_track_highmark() {
        let mut heap = HeapAllocator::new(1024, 1024, AllocPolicy::FirstFit);
        let a = heap.malloc(100).expect("a");
        let b = heap.malloc(200).expect("b");
        heap.free(a).expect("free");
        let stats = heap.stats();
        assert_eq!(stats.total_size, 1024);
        assert_eq!(stats.total_free, 1024 - 200);
        assert_eq!(stats.highmark_used, 104 + 200);
        assert_eq!(stats.live_blocks, 1);
        heap.free(b).expect("free");
        assert_eq!(heap.stats().total_free, 1024);
    }
}
