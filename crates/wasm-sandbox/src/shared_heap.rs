//! Shared heap: one allocator-managed region that several module instances
//! can attach to at the same time.
//!
//! A shared heap of `size` bytes is mapped at the very top of each attached
//! instance's 32-bit app address space, `[2^32 - size, 2^32)`. Instances keep
//! their linear memory strictly below that range; attaching and growing both
//! check it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::{APP_HEAP_SIZE_MAX, APP_HEAP_SIZE_MIN, HOST_PAGE_SIZE, align_up};
use crate::memory::heap::{AllocPolicy, HeapAllocator, HeapStats};
use crate::memory::linear::range_of;
use crate::memory::translate::{self, NativePtr};
use crate::{Error, Result};

const APP_ADDRESS_SPACE: u64 = 1 << 32;

#[derive(Debug)]
pub struct SharedHeap {
    size: u32,
    start: u32,
    bytes: RwLock<Vec<u8>>,
    alloc: Mutex<HeapAllocator>,
}

impl SharedHeap {
    /// Create a shared heap of at least `size` bytes (rounded up to the host
    /// page size).
    pub fn create(size: u32, policy: AllocPolicy) -> Result<Arc<Self>> {
        let aligned = align_up(u64::from(size), u64::from(HOST_PAGE_SIZE));
        if aligned < u64::from(APP_HEAP_SIZE_MIN)
            || aligned > u64::from(u32::MAX - APP_HEAP_SIZE_MAX + 1)
        {
            return Err(Error::InvalidSharedHeapSize(u64::from(size)));
        }
        let len = usize::try_from(aligned)
            .map_err(|_| Error::OutOfMemory(format!("{aligned} bytes exceed the host address space")))?;
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(len)
            .map_err(|e| Error::OutOfMemory(e.to_string()))?;
        bytes.resize(len, 0);

        let size = aligned as u32;
        let start = (APP_ADDRESS_SPACE - aligned) as u32;
        tracing::debug!(size, start, "created shared heap");
        Ok(Arc::new(Self {
            size,
            start,
            bytes: RwLock::new(bytes),
            alloc: Mutex::new(HeapAllocator::new(start, size, policy)),
        }))
    }

    #[must_use]
    pub fn size(&self) -> u32 {
        self.size
    }

    /// First app offset of the shared heap in every attached instance.
    #[must_use]
    pub fn start_offset(&self) -> u32 {
        self.start
    }

    /// Whether `[app_offset, app_offset + bytes)` lies inside the shared heap.
    #[must_use]
    pub fn contains_app(&self, app_offset: u32, bytes: u32) -> bool {
        app_offset >= self.start && u64::from(app_offset) + u64::from(bytes) <= APP_ADDRESS_SPACE
    }

    /// Allocate from the shared heap, returning the app offset.
    pub fn malloc(&self, size: u32) -> Result<u32> {
        self.alloc_lock()
            .malloc(size)
            .ok_or_else(|| Error::OutOfMemory(format!("shared heap cannot satisfy {size} bytes")))
    }

    pub fn free(&self, app_offset: u32) -> Result<()> {
        self.alloc_lock().free(app_offset)
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        self.alloc_lock().stats()
    }

    #[must_use]
    pub fn view(&self) -> SharedHeapView<'_> {
        SharedHeapView {
            heap: self,
            guard: self.bytes.read().unwrap_or_else(PoisonError::into_inner),
        }
    }

    #[must_use]
    pub fn view_mut(&self) -> SharedHeapViewMut<'_> {
        SharedHeapViewMut {
            heap: self,
            guard: self.bytes.write().unwrap_or_else(PoisonError::into_inner),
        }
    }

    fn alloc_lock(&self) -> MutexGuard<'_, HeapAllocator> {
        self.alloc.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn local(&self, app_offset: u32) -> Result<u32> {
        app_offset.checked_sub(self.start).ok_or(Error::OutOfBounds {
            offset: u64::from(app_offset),
            size: 0,
        })
    }
}

pub struct SharedHeapView<'a> {
    heap: &'a SharedHeap,
    guard: RwLockReadGuard<'a, Vec<u8>>,
}

impl SharedHeapView<'_> {
    #[must_use]
    pub fn base(&self) -> NativePtr {
        NativePtr::of_slice(&self.guard)
    }

    pub fn slice(&self, app_offset: u32, len: u32) -> Result<&[u8]> {
        let local = self.heap.local(app_offset)?;
        let range = range_of(self.guard.len() as u64, local, len as usize)?;
        Ok(&self.guard[range])
    }

    /// Bytes of the NUL-terminated string at `app_offset`, terminator excluded.
    pub fn c_str(&self, app_offset: u32) -> Result<&[u8]> {
        let local = self.heap.local(app_offset)?;
        let len = crate::memory::bounds::str_len(&self.guard, local).ok_or(Error::OutOfBounds {
            offset: u64::from(app_offset),
            size: 0,
        })?;
        let start = local as usize;
        Ok(&self.guard[start..start + len])
    }

    #[must_use]
    pub fn app_to_native(&self, app_offset: u32) -> Option<NativePtr> {
        let local = self.heap.local(app_offset).ok()?;
        (local < self.heap.size)
            .then(|| translate::app_to_native(self.base(), u64::from(self.heap.size), local))
    }

    #[must_use]
    pub fn native_to_app(&self, ptr: NativePtr) -> Option<u32> {
        translate::native_to_app(self.base(), u64::from(self.heap.size), ptr)
            .map(|local| self.heap.start + local)
    }

    #[must_use]
    pub fn contains_native(&self, ptr: NativePtr, size: u64) -> bool {
        translate::native_range_in(self.base(), u64::from(self.heap.size), ptr, size)
    }
}

pub struct SharedHeapViewMut<'a> {
    heap: &'a SharedHeap,
    guard: RwLockWriteGuard<'a, Vec<u8>>,
}

impl SharedHeapViewMut<'_> {
    pub fn slice_mut(&mut self, app_offset: u32, len: u32) -> Result<&mut [u8]> {
        let local = self.heap.local(app_offset)?;
        let range = range_of(self.guard.len() as u64, local, len as usize)?;
        Ok(&mut self.guard[range])
    }

    pub fn write(&mut self, app_offset: u32, data: &[u8]) -> Result<()> {
        let len = u32::try_from(data.len()).map_err(|_| Error::OutOfBounds {
            offset: u64::from(app_offset),
            size: data.len() as u64,
        })?;
        self.slice_mut(app_offset, len)?.copy_from_slice(data);
        Ok(())
    }
}
