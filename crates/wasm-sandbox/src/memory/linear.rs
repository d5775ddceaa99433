//! Linear memory instances: creation, `memory.grow`, guarded access, and the
//! app heap placed either in the initial memory or in pages of its own.
//!
//! The backing buffer and its page count sit behind one `RwLock`. Readers get
//! a consistent snapshot of base address and size; `grow` holds the write lock
//! from the ceiling check until the new buffer is in place, so nobody can see
//! a half-grown memory.

use std::ops::Range;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::bounds::{self, AddressSpace};
use super::heap::{HeapAllocator, HeapStats, Realloc};
use super::translate::{self, NativePtr};
use crate::config::{
    DEFAULT_APP_HEAP_BASE_OFFSET, MAX_PAGE_COUNT, RuntimeConfig, WASM_PAGE_SIZE,
};
use crate::{Error, Result};

#[derive(Debug)]
struct LinearMemory {
    bytes: Vec<u8>,
    page_count: u32,
}

#[derive(Debug)]
pub struct MemoryInstance {
    data: RwLock<LinearMemory>,
    heap: Mutex<HeapAllocator>,
    max_page_count: u32,
    heap_base_offset: u32,
    heap_size: u32,
    is_shared: bool,
}

impl MemoryInstance {
    /// Create a memory of `initial_pages` pages that may grow to `max_pages`,
    /// with the default app heap size.
    pub fn create(initial_pages: u32, max_pages: u32, shared: bool) -> Result<Self> {
        Self::create_with_config(initial_pages, max_pages, shared, &RuntimeConfig::default())
    }

    /// Create a memory, sizing the app heap and the growth ceiling from `config`.
    ///
    /// The heap occupies the top `heap_size` bytes of the initial memory (never
    /// starting above `DEFAULT_APP_HEAP_BASE_OFFSET`). A memory with no pages has
    /// no heap.
    pub fn create_with_config(
        initial_pages: u32,
        max_pages: u32,
        shared: bool,
        config: &RuntimeConfig,
    ) -> Result<Self> {
        check_limits(initial_pages, max_pages)?;

        let size = pages_to_bytes(initial_pages);
        let requested_heap = u64::from(config.heap_size());
        let heap_size = requested_heap.min(size) & !7;
        if heap_size < requested_heap {
            tracing::warn!(
                "app heap of {requested_heap} bytes does not fit in {initial_pages} pages, using {heap_size}"
            );
        }
        let heap_base_offset = (size - heap_size).min(u64::from(DEFAULT_APP_HEAP_BASE_OFFSET));

        Self::build(
            initial_pages,
            max_pages,
            shared,
            config,
            heap_base_offset as u32,
            heap_size as u32,
        )
    }

    /// Create a module's default memory with the app heap in pages of its own.
    ///
    /// The declared `initial_pages` stay entirely guest-owned: the heap starts
    /// at `initial_pages * WASM_PAGE_SIZE` and the pages holding it are added on
    /// top of both the initial and the maximum page count. With a zero heap size
    /// this is the same as [`MemoryInstance::create_with_config`].
    pub fn create_with_heap_pages(
        initial_pages: u32,
        max_pages: u32,
        shared: bool,
        config: &RuntimeConfig,
    ) -> Result<Self> {
        check_limits(initial_pages, max_pages)?;

        let heap_size = config.heap_size() & !7;
        if heap_size == 0 {
            return Self::create_with_config(initial_pages, max_pages, shared, config);
        }

        let heap_pages = heap_size.div_ceil(WASM_PAGE_SIZE);
        let total_initial = initial_pages
            .checked_add(heap_pages)
            .filter(|&pages| pages <= MAX_PAGE_COUNT)
            .ok_or(Error::InvalidLimits {
                initial: initial_pages.saturating_add(heap_pages),
                max: max_pages,
            })?;
        let total_max = max_pages.saturating_add(heap_pages).min(MAX_PAGE_COUNT);

        Self::build(
            total_initial,
            total_max,
            shared,
            config,
            pages_to_bytes(initial_pages) as u32,
            heap_size,
        )
    }

    fn build(
        initial_pages: u32,
        max_pages: u32,
        shared: bool,
        config: &RuntimeConfig,
        heap_base_offset: u32,
        heap_size: u32,
    ) -> Result<Self> {
        let max_page_count = config.effective_max_pages(initial_pages, max_pages);
        let bytes = alloc_zeroed(pages_to_bytes(initial_pages))?;

        tracing::debug!(
            initial_pages,
            max_page_count,
            shared,
            heap_base_offset,
            heap_size,
            "created linear memory"
        );

        Ok(Self {
            data: RwLock::new(LinearMemory {
                bytes,
                page_count: initial_pages,
            }),
            heap: Mutex::new(HeapAllocator::new(
                heap_base_offset,
                heap_size,
                config.alloc_policy(),
            )),
            max_page_count,
            heap_base_offset,
            heap_size,
            is_shared: shared,
        })
    }

    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.is_shared
    }

    #[must_use]
    pub fn heap_base_offset(&self) -> u32 {
        self.heap_base_offset
    }

    #[must_use]
    pub fn heap_size(&self) -> u32 {
        self.heap_size
    }

    #[must_use]
    pub fn max_page_count(&self) -> u32 {
        self.max_page_count
    }

    #[must_use]
    pub fn max_memory_data_size(&self) -> u64 {
        pages_to_bytes(self.max_page_count)
    }

    #[must_use]
    pub fn page_count(&self) -> u32 {
        self.read_lock().page_count
    }

    #[must_use]
    pub fn memory_data_size(&self) -> u64 {
        self.read_lock().bytes.len() as u64
    }

    /// Base address, size and heap bounds read together under one lock.
    #[must_use]
    pub fn address_space(&self) -> AddressSpace {
        self.view().address_space()
    }

    /// Shared access to the memory bytes. Growth is blocked while the view lives.
    #[must_use]
    pub fn view(&self) -> MemoryView<'_> {
        MemoryView {
            memory: self,
            guard: self.read_lock(),
        }
    }

    /// Exclusive access to the memory bytes.
    #[must_use]
    pub fn view_mut(&self) -> MemoryViewMut<'_> {
        MemoryViewMut {
            memory: self,
            guard: self.write_lock(),
        }
    }

    /// Copy `buf.len()` bytes starting at `offset` into `buf`.
    pub fn read(&self, offset: u32, buf: &mut [u8]) -> Result<()> {
        let len = checked_len(buf.len(), offset)?;
        buf.copy_from_slice(self.view().slice(offset, len)?);
        Ok(())
    }

    /// Copy `data` into the memory at `offset`.
    pub fn write(&self, offset: u32, data: &[u8]) -> Result<()> {
        self.view_mut().write(offset, data)
    }

    /// Grow by `delta_pages` pages. Returns the previous page count.
    pub fn grow(&self, delta_pages: u32) -> Result<u32> {
        self.grow_within(delta_pages, self.max_memory_data_size())
    }

    /// Grow by `delta_pages`, never past `ceiling` bytes (nor past the memory's
    /// own maximum). On failure the memory is left untouched.
    pub fn grow_within(&self, delta_pages: u32, ceiling: u64) -> Result<u32> {
        let mut mem = self.write_lock();
        let old_pages = mem.page_count;
        if delta_pages == 0 {
            return Ok(old_pages);
        }

        let ceiling_pages = self
            .max_page_count
            .min(u32::try_from(ceiling / u64::from(WASM_PAGE_SIZE)).unwrap_or(u32::MAX));
        let new_pages = u64::from(old_pages) + u64::from(delta_pages);
        if new_pages > u64::from(ceiling_pages) {
            return Err(Error::LimitExceeded {
                requested: new_pages,
                max: ceiling_pages,
            });
        }

        let new_len = usize::try_from(new_pages * u64::from(WASM_PAGE_SIZE))
            .map_err(|_| Error::OutOfMemory(format!("{new_pages} pages exceed the host address space")))?;
        let old_base = NativePtr::of_slice(&mem.bytes);
        let additional = new_len - mem.bytes.len();
        mem.bytes
            .try_reserve_exact(additional)
            .map_err(|e| Error::OutOfMemory(e.to_string()))?;
        mem.bytes.resize(new_len, 0);
        mem.page_count = new_pages as u32;

        tracing::debug!(
            old_pages,
            new_pages,
            relocated = old_base != NativePtr::of_slice(&mem.bytes),
            "grew linear memory"
        );
        Ok(old_pages)
    }

    /// `memory.grow` as the guest sees it: the previous page count, or -1.
    #[must_use]
    pub fn memory_grow(&self, delta_pages: u32) -> i32 {
        grow_result_to_guest(self.grow(delta_pages))
    }

    /// Allocate `size` bytes from the app heap, returning the app offset.
    pub fn malloc(&self, size: u32) -> Result<u32> {
        self.heap_lock().malloc(size).ok_or_else(|| {
            Error::OutOfMemory(format!("app heap cannot satisfy {size} bytes"))
        })
    }

    /// Return a block to the app heap.
    pub fn free(&self, offset: u32) -> Result<()> {
        self.heap_lock().free(offset)
    }

    /// Resize a heap block, moving its contents when it cannot grow in place.
    pub fn realloc(&self, offset: u32, size: u32) -> Result<u32> {
        let mut heap = self.heap_lock();
        match heap.realloc(offset, size)? {
            Some(Realloc::InPlace(offset)) => Ok(offset),
            Some(Realloc::Moved { from, to, copy_len }) => {
                let mut view = self.view_mut();
                let len = copy_len.min(size) as usize;
                let src = range_of(view.size(), from, len)?;
                view.guard.bytes.copy_within(src, to as usize);
                Ok(to)
            }
            None => Err(Error::OutOfMemory(format!(
                "app heap cannot satisfy {size} bytes"
            ))),
        }
    }

    /// Usable size of the heap block at `offset`.
    #[must_use]
    pub fn allocated_size(&self, offset: u32) -> Option<u32> {
        self.heap_lock().allocated_size(offset)
    }

    #[must_use]
    pub fn heap_stats(&self) -> HeapStats {
        self.heap_lock().stats()
    }

    /// Release the backing buffer and heap state.
    pub fn destroy(self) {
        tracing::debug!(
            pages = self.page_count(),
            shared = self.is_shared,
            "destroying linear memory"
        );
    }

    fn read_lock(&self) -> RwLockReadGuard<'_, LinearMemory> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_lock(&self) -> RwLockWriteGuard<'_, LinearMemory> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn heap_lock(&self) -> MutexGuard<'_, HeapAllocator> {
        self.heap.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Read access to a memory, holding its lock.
pub struct MemoryView<'a> {
    memory: &'a MemoryInstance,
    guard: RwLockReadGuard<'a, LinearMemory>,
}

impl MemoryView<'_> {
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.guard.bytes
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.guard.bytes.len() as u64
    }

    #[must_use]
    pub fn base(&self) -> NativePtr {
        NativePtr::of_slice(&self.guard.bytes)
    }

    #[must_use]
    pub fn address_space(&self) -> AddressSpace {
        AddressSpace {
            memory_data_size: self.size(),
            max_memory_data_size: self.memory.max_memory_data_size(),
            heap_base_offset: self.memory.heap_base_offset,
            heap_size: self.memory.heap_size,
        }
    }

    #[must_use]
    pub fn validate_range(&self, offset: u32, size: u32) -> bool {
        bounds::validate_range(self.size(), offset, size)
    }

    #[must_use]
    pub fn validate_str(&self, offset: u32) -> bool {
        bounds::validate_str(&self.guard.bytes, offset)
    }

    pub fn slice(&self, offset: u32, len: u32) -> Result<&[u8]> {
        let range = range_of(self.size(), offset, len as usize)?;
        Ok(&self.guard.bytes[range])
    }

    /// Bytes of the NUL-terminated string at `offset`, terminator excluded.
    pub fn c_str(&self, offset: u32) -> Result<&[u8]> {
        c_str_in(&self.guard.bytes, offset)
    }

    /// Native address of a validated offset; `None` when out of range.
    #[must_use]
    pub fn app_to_native(&self, offset: u32) -> Option<NativePtr> {
        (u64::from(offset) < self.size())
            .then(|| translate::app_to_native(self.base(), self.size(), offset))
    }

    #[must_use]
    pub fn native_to_app(&self, ptr: NativePtr) -> Option<u32> {
        translate::native_to_app(self.base(), self.size(), ptr)
    }

    #[must_use]
    pub fn contains_native(&self, ptr: NativePtr, size: u64) -> bool {
        translate::native_range_in(self.base(), self.size(), ptr, size)
    }
}

/// Write access to a memory, holding its lock exclusively.
pub struct MemoryViewMut<'a> {
    memory: &'a MemoryInstance,
    guard: RwLockWriteGuard<'a, LinearMemory>,
}

impl MemoryViewMut<'_> {
    #[must_use]
    pub fn size(&self) -> u64 {
        self.guard.bytes.len() as u64
    }

    #[must_use]
    pub fn base(&self) -> NativePtr {
        NativePtr::of_slice(&self.guard.bytes)
    }

    #[must_use]
    pub fn address_space(&self) -> AddressSpace {
        AddressSpace {
            memory_data_size: self.size(),
            max_memory_data_size: self.memory.max_memory_data_size(),
            heap_base_offset: self.memory.heap_base_offset,
            heap_size: self.memory.heap_size,
        }
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.guard.bytes
    }

    pub fn slice(&self, offset: u32, len: u32) -> Result<&[u8]> {
        let range = range_of(self.size(), offset, len as usize)?;
        Ok(&self.guard.bytes[range])
    }

    pub fn c_str(&self, offset: u32) -> Result<&[u8]> {
        c_str_in(&self.guard.bytes, offset)
    }

    pub fn slice_mut(&mut self, offset: u32, len: u32) -> Result<&mut [u8]> {
        let range = range_of(self.size(), offset, len as usize)?;
        Ok(&mut self.guard.bytes[range])
    }

    pub fn write(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        let range = range_of(self.size(), offset, data.len())?;
        self.guard.bytes[range].copy_from_slice(data);
        Ok(())
    }

    pub fn fill(&mut self, offset: u32, len: u32, value: u8) -> Result<()> {
        self.slice_mut(offset, len)?.fill(value);
        Ok(())
    }
}

/// Map a grow outcome onto the guest's `memory.grow` result.
pub(crate) fn grow_result_to_guest(result: Result<u32>) -> i32 {
    match result {
        Ok(old_pages) => old_pages as i32,
        Err(e) => {
            tracing::warn!("memory.grow failed: {e}");
            -1
        }
    }
}

fn check_limits(initial_pages: u32, max_pages: u32) -> Result<()> {
    if initial_pages > max_pages || max_pages > MAX_PAGE_COUNT {
        return Err(Error::InvalidLimits {
            initial: initial_pages,
            max: max_pages,
        });
    }
    Ok(())
}

pub(crate) fn pages_to_bytes(pages: u32) -> u64 {
    u64::from(pages) * u64::from(WASM_PAGE_SIZE)
}

fn alloc_zeroed(size: u64) -> Result<Vec<u8>> {
    let len = usize::try_from(size)
        .map_err(|_| Error::OutOfMemory(format!("{size} bytes exceed the host address space")))?;
    let mut bytes = Vec::new();
    bytes
        .try_reserve_exact(len)
        .map_err(|e| Error::OutOfMemory(e.to_string()))?;
    bytes.resize(len, 0);
    Ok(bytes)
}

fn checked_len(len: usize, offset: u32) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::OutOfBounds {
        offset: u64::from(offset),
        size: len as u64,
    })
}

fn c_str_in(bytes: &[u8], offset: u32) -> Result<&[u8]> {
    let len = bounds::str_len(bytes, offset).ok_or(Error::OutOfBounds {
        offset: u64::from(offset),
        size: 0,
    })?;
    let start = offset as usize;
    Ok(&bytes[start..start + len])
}

/// Byte range for `[offset, offset + len)` in a memory of `size` bytes.
pub(crate) fn range_of(size: u64, offset: u32, len: usize) -> Result<Range<usize>> {
    let oob = || Error::OutOfBounds {
        offset: u64::from(offset),
        size: len as u64,
    };
    let len32 = u32::try_from(len).map_err(|_| oob())?;
    if !bounds::validate_range(size, offset, len32) {
        return Err(oob());
    }
    let start = offset as usize;
    Ok(start..start + len)
}
