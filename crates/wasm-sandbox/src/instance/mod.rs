//! Module instances and the address-checking surface host functions use.
//!
//! Everything a host function does with a guest address goes through a
//! [`ModuleInstance`]: validate an app offset (or native pointer), borrow the
//! bytes for the duration of a closure, allocate from the app heap. A failed
//! check stores an exception on the instance, which the guest observes as a
//! trap once the host function returns.
//!
//! Lock order: shared heap slot, then heap allocator, then memory bytes.

pub mod app_memory;
pub mod global;
pub mod instantiate;
pub mod table;

use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{
    Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

pub use app_memory::AppMemory;
pub use global::{GlobalInstance, Val, ValType};
pub use instantiate::Module;
pub use table::TableInstance;

use crate::error::{EXCEPTION_OUT_OF_BOUNDS, EXCEPTION_OUT_OF_MEMORY};
use crate::memory::linear::grow_result_to_guest;
use crate::memory::{MemoryInstance, NativePtr};
use crate::native::NativeSymbol;
use crate::shared_heap::SharedHeap;
use crate::{Error, Result};

/// Exception text left by [`ModuleInstance::terminate`].
pub const EXCEPTION_TERMINATED: &str = "terminated by user";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    Func,
    Table,
    Memory,
    Global,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    pub name: String,
    pub kind: ExportKind,
    pub index: u32,
}

enum AppRegion<'a> {
    Memory(&'a MemoryInstance),
    Shared(Arc<SharedHeap>),
}

impl AppRegion<'_> {
    fn read(&self, app_offset: u32, len: u32) -> Result<Vec<u8>> {
        match self {
            Self::Memory(memory) => Ok(memory.view().slice(app_offset, len)?.to_vec()),
            Self::Shared(heap) => Ok(heap.view().slice(app_offset, len)?.to_vec()),
        }
    }

    fn write(&self, app_offset: u32, data: &[u8]) -> Result<()> {
        match self {
            Self::Memory(memory) => memory.write(app_offset, data),
            Self::Shared(heap) => heap.view_mut().write(app_offset, data),
        }
    }
}

/// A function import and the host function it was bound to, if any.
#[derive(Debug, Clone)]
pub(crate) struct LinkedImport {
    pub(crate) module: String,
    pub(crate) name: String,
    pub(crate) symbol: Option<NativeSymbol>,
}

pub(crate) struct InstanceParts {
    pub(crate) memories: Vec<Arc<MemoryInstance>>,
    pub(crate) tables: Vec<TableInstance>,
    pub(crate) globals: Vec<GlobalInstance>,
    pub(crate) imports: Vec<LinkedImport>,
    pub(crate) exports: Vec<Export>,
}

/// Observable lifecycle of a module instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Instantiated,
    Running,
    ExceptionPending,
    Deinstantiating,
    Destroyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Instantiated,
    Running,
    Deinstantiating,
    Destroyed,
}

#[derive(Debug)]
struct Lifecycle {
    phase: Phase,
    exec_envs: usize,
}

#[derive(Debug)]
pub struct ModuleInstance {
    memories: Vec<Arc<MemoryInstance>>,
    tables: Vec<Mutex<TableInstance>>,
    globals: RwLock<Vec<GlobalInstance>>,
    imports: Vec<LinkedImport>,
    exports: Vec<Export>,
    shared_heap: RwLock<Option<Arc<SharedHeap>>>,
    exception: Mutex<Option<String>>,
    lifecycle: Mutex<Lifecycle>,
    retired: Condvar,
    terminating: AtomicBool,
}

impl ModuleInstance {
    /// An instance owning just `memories`, with no tables, globals or imports.
    #[must_use]
    pub fn with_memories(memories: Vec<MemoryInstance>) -> Arc<Self> {
        Arc::new(Self::from_parts(InstanceParts {
            memories: memories.into_iter().map(Arc::new).collect(),
            tables: Vec::new(),
            globals: Vec::new(),
            imports: Vec::new(),
            exports: Vec::new(),
        }))
    }

    pub(crate) fn from_parts(parts: InstanceParts) -> Self {
        tracing::debug!(
            memories = parts.memories.len(),
            tables = parts.tables.len(),
            globals = parts.globals.len(),
            imports = parts.imports.len(),
            "module instance created"
        );
        Self {
            memories: parts.memories,
            tables: parts.tables.into_iter().map(Mutex::new).collect(),
            globals: RwLock::new(parts.globals),
            imports: parts.imports,
            exports: parts.exports,
            shared_heap: RwLock::new(None),
            exception: Mutex::new(None),
            lifecycle: Mutex::new(Lifecycle {
                phase: Phase::Instantiated,
                exec_envs: 0,
            }),
            retired: Condvar::new(),
            terminating: AtomicBool::new(false),
        }
    }

    // ---- memories ----

    /// Memory 0, which all address checks and the app heap refer to.
    pub fn default_memory(&self) -> Result<&Arc<MemoryInstance>> {
        self.memories.first().ok_or(Error::NoMemory)
    }

    pub fn memory(&self, index: u32) -> Result<&Arc<MemoryInstance>> {
        self.memories
            .get(index as usize)
            .ok_or(Error::MemoryIndex(index))
    }

    #[must_use]
    pub fn memory_count(&self) -> usize {
        self.memories.len()
    }

    /// Current page count of the default memory; 0 without one.
    #[must_use]
    pub fn memory_size(&self) -> u32 {
        self.memories.first().map_or(0, |m| m.page_count())
    }

    /// `memory.grow` on the default memory.
    #[must_use]
    pub fn memory_grow(&self, delta_pages: u32) -> i32 {
        self.memory_grow_with_idx(0, delta_pages)
    }

    /// `memory.grow` on memory `index`: the previous page count, or -1.
    #[must_use]
    pub fn memory_grow_with_idx(&self, index: u32, delta_pages: u32) -> i32 {
        grow_result_to_guest(self.grow_memory(index, delta_pages))
    }

    /// Grow memory `index`. The default memory never grows into an attached
    /// shared heap.
    pub fn grow_memory(&self, index: u32, delta_pages: u32) -> Result<u32> {
        let memory = self.memory(index)?;
        if index != 0 {
            return memory.grow(delta_pages);
        }
        let slot = self.shared_heap_slot();
        let Some(heap) = slot.as_ref() else {
            return memory.grow(delta_pages);
        };
        memory
            .grow_within(delta_pages, u64::from(heap.start_offset()))
            .map_err(|e| match e {
                Error::LimitExceeded { requested, .. }
                    if requested <= u64::from(memory.max_page_count()) =>
                {
                    Error::SharedHeapOverlap
                }
                other => other,
            })
    }

    // ---- address validation and translation ----

    /// Whether `[app_offset, app_offset + size)` is inside the default memory
    /// or the attached shared heap. Sets the out-of-bounds exception if not.
    pub fn validate_app_addr(&self, app_offset: u32, size: u32) -> bool {
        let in_memory = self
            .memories
            .first()
            .is_some_and(|m| m.view().validate_range(app_offset, size));
        if in_memory || self.shared_heap().is_some_and(|h| h.contains_app(app_offset, size)) {
            return true;
        }
        self.set_exception(EXCEPTION_OUT_OF_BOUNDS);
        false
    }

    /// Whether a NUL-terminated string starts at `app_offset` and ends inside
    /// the same region. Sets the out-of-bounds exception if not.
    pub fn validate_app_str_addr(&self, app_offset: u32) -> bool {
        let in_memory = self
            .memories
            .first()
            .is_some_and(|m| m.view().validate_str(app_offset));
        if in_memory || self.shared_heap().is_some_and(|h| h.view().c_str(app_offset).is_ok()) {
            return true;
        }
        self.set_exception(EXCEPTION_OUT_OF_BOUNDS);
        false
    }

    /// Whether `[ptr, ptr + size)` lies inside the current backing buffer of
    /// the default memory or the shared heap. Sets the out-of-bounds
    /// exception if not.
    pub fn validate_native_addr(&self, ptr: NativePtr, size: u64) -> bool {
        let in_memory = self
            .memories
            .first()
            .is_some_and(|m| m.view().contains_native(ptr, size));
        if in_memory || self.shared_heap().is_some_and(|h| h.view().contains_native(ptr, size)) {
            return true;
        }
        self.set_exception(EXCEPTION_OUT_OF_BOUNDS);
        false
    }

    /// Native address of `app_offset` in the current backing buffer. Only
    /// meaningful until the memory next grows.
    #[must_use]
    pub fn addr_app_to_native(&self, app_offset: u32) -> Option<NativePtr> {
        self.memories
            .first()
            .and_then(|m| m.view().app_to_native(app_offset))
            .or_else(|| self.shared_heap()?.view().app_to_native(app_offset))
    }

    #[must_use]
    pub fn addr_native_to_app(&self, ptr: NativePtr) -> Option<u32> {
        self.memories
            .first()
            .and_then(|m| m.view().native_to_app(ptr))
            .or_else(|| self.shared_heap()?.view().native_to_app(ptr))
    }

    /// App offsets of the region containing `app_offset`.
    #[must_use]
    pub fn get_app_addr_range(&self, app_offset: u32) -> Option<Range<u64>> {
        if let Some(memory) = self.memories.first() {
            let size = memory.memory_data_size();
            if u64::from(app_offset) < size {
                return Some(0..size);
            }
        }
        let heap = self.shared_heap()?;
        heap.contains_app(app_offset, 1)
            .then(|| u64::from(heap.start_offset())..1 << 32)
    }

    /// Native bounds of the region containing `ptr`.
    #[must_use]
    pub fn get_native_addr_range(&self, ptr: NativePtr) -> Option<Range<NativePtr>> {
        if let Some(memory) = self.memories.first() {
            let view = memory.view();
            if view.contains_native(ptr, 1) {
                return Some(view.base()..view.base().checked_add(view.size())?);
            }
        }
        let heap = self.shared_heap()?;
        let view = heap.view();
        if view.contains_native(ptr, 1) {
            return Some(view.base()..view.base().checked_add(u64::from(heap.size()))?);
        }
        None
    }

    // ---- borrowing accessors ----

    /// Run `f` over a copy of the guest bytes `[app_offset, app_offset + len)`.
    ///
    /// No lock is held while `f` runs, so `f` may call back into this
    /// instance, including [`module_malloc`](Self::module_malloc) and
    /// [`memory_grow`](Self::memory_grow).
    pub fn with_app_bytes<R>(&self, app_offset: u32, len: u32, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let bytes = self.read_app_bytes(app_offset, len)?;
        Ok(f(&bytes))
    }

    /// Like [`with_app_bytes`](Self::with_app_bytes), with write access.
    ///
    /// The bytes are copied back once `f` returns, overwriting whatever was
    /// written to the same range in the meantime. Use
    /// [`with_app_memory`](Self::with_app_memory) to modify memory in place.
    pub fn with_app_bytes_mut<R>(
        &self,
        app_offset: u32,
        len: u32,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R> {
        let region = self.app_region(app_offset, len)?;
        let mut bytes = region.read(app_offset, len)?;
        let result = f(&mut bytes);
        region.write(app_offset, &bytes)?;
        Ok(result)
    }

    /// Run `f` with in-place access to the default memory.
    ///
    /// `f` receives an [`AppMemory`] bound to the memory's write lock, which
    /// is held for the whole call. Checks and slices taken through it need
    /// no further lock. Shared heap addresses are not reachable this way.
    ///
    /// # Deadlocks
    ///
    /// Calling a method of this instance that touches the default memory from
    /// inside `f` blocks forever. Go through the [`AppMemory`] instead.
    pub fn with_app_memory<R>(&self, f: impl FnOnce(&mut AppMemory<'_>) -> R) -> Result<R> {
        let memory = self.default_memory()?;
        let mut access = AppMemory::new(self, memory.view_mut());
        Ok(f(&mut access))
    }

    /// Copy out the NUL-terminated string at `app_offset`, replacing invalid
    /// UTF-8.
    pub fn read_app_str(&self, app_offset: u32) -> Result<String> {
        if let Some(memory) = self.memories.first()
            && let Ok(bytes) = memory.view().c_str(app_offset)
        {
            return Ok(String::from_utf8_lossy(bytes).into_owned());
        }
        if let Some(heap) = self.shared_heap()
            && let Ok(bytes) = heap.view().c_str(app_offset)
        {
            return Ok(String::from_utf8_lossy(bytes).into_owned());
        }
        Err(self.out_of_bounds(app_offset, 0))
    }

    pub fn read_app_bytes(&self, app_offset: u32, len: u32) -> Result<Vec<u8>> {
        self.app_region(app_offset, len)?.read(app_offset, len)
    }

    pub fn write_app_bytes(&self, app_offset: u32, data: &[u8]) -> Result<()> {
        let len = u32::try_from(data.len())
            .map_err(|_| self.out_of_bounds(app_offset, data.len() as u64))?;
        self.app_region(app_offset, len)?.write(app_offset, data)
    }

    // ---- app heap ----

    /// Allocate `size` bytes from the app heap of the default memory.
    ///
    /// Returns the app offset and its native address at the time of the call.
    /// On failure the out-of-memory exception is set.
    pub fn module_malloc(&self, size: u32) -> Result<(u32, NativePtr)> {
        let memory = self.default_memory()?;
        let offset = memory.malloc(size).inspect_err(|e| {
            tracing::warn!("module_malloc({size}) failed: {e}");
            self.set_exception(EXCEPTION_OUT_OF_MEMORY);
        })?;
        let ptr = memory
            .view()
            .app_to_native(offset)
            .ok_or_else(|| Error::Internal(format!("heap returned offset {offset:#x} outside memory")))?;
        Ok((offset, ptr))
    }

    /// Free a block returned by [`module_malloc`](Self::module_malloc) or
    /// [`module_shared_malloc`](Self::module_shared_malloc). Freeing 0 does
    /// nothing.
    pub fn module_free(&self, app_offset: u32) -> Result<()> {
        if app_offset == 0 {
            return Ok(());
        }
        if let Some(heap) = self.shared_heap()
            && heap.contains_app(app_offset, 1)
        {
            return heap.free(app_offset);
        }
        self.default_memory()?.free(app_offset)
    }

    /// Resize a heap block, preserving its contents. Offset 0 allocates.
    pub fn module_realloc(&self, app_offset: u32, size: u32) -> Result<u32> {
        if app_offset == 0 {
            return self.module_malloc(size).map(|(offset, _)| offset);
        }
        self.default_memory()?
            .realloc(app_offset, size)
            .inspect_err(|e| {
                if matches!(e, Error::OutOfMemory(_)) {
                    self.set_exception(EXCEPTION_OUT_OF_MEMORY);
                }
            })
    }

    /// Copy `data` into a fresh app heap block.
    pub fn module_dup_data(&self, data: &[u8]) -> Result<u32> {
        let size = u32::try_from(data.len()).map_err(|_| {
            self.set_exception(EXCEPTION_OUT_OF_MEMORY);
            Error::OutOfMemory(format!("{} bytes do not fit the app heap", data.len()))
        })?;
        let (offset, _) = self.module_malloc(size)?;
        if let Err(e) = self.default_memory()?.write(offset, data) {
            self.module_free(offset)?;
            return Err(e);
        }
        Ok(offset)
    }

    // ---- shared heap ----

    /// Map `heap` into this instance's address space.
    ///
    /// Fails with [`Error::SharedHeapOverlap`] if the default memory already
    /// reaches the heap's start offset. Attaching while another heap is
    /// attached keeps the existing one.
    pub fn attach_shared_heap(&self, heap: Arc<SharedHeap>) -> Result<()> {
        let mut slot = self.shared_heap_slot_mut();
        if slot.is_some() {
            tracing::warn!("a shared heap is already attached to this instance");
            return Ok(());
        }
        if let Some(memory) = self.memories.first()
            && memory.memory_data_size() > u64::from(heap.start_offset())
        {
            return Err(Error::SharedHeapOverlap);
        }
        tracing::debug!(
            start = heap.start_offset(),
            size = heap.size(),
            "attached shared heap"
        );
        *slot = Some(heap);
        Ok(())
    }

    pub fn detach_shared_heap(&self) -> Option<Arc<SharedHeap>> {
        self.shared_heap_slot_mut().take()
    }

    #[must_use]
    pub fn shared_heap(&self) -> Option<Arc<SharedHeap>> {
        self.shared_heap_slot().clone()
    }

    pub fn module_shared_malloc(&self, size: u32) -> Result<(u32, NativePtr)> {
        let heap = self.shared_heap().ok_or(Error::NoSharedHeap)?;
        let offset = heap.malloc(size).inspect_err(|_| {
            self.set_exception(EXCEPTION_OUT_OF_MEMORY);
        })?;
        let ptr = heap
            .view()
            .app_to_native(offset)
            .ok_or_else(|| Error::Internal(format!("shared heap returned {offset:#x}")))?;
        Ok((offset, ptr))
    }

    pub fn module_shared_free(&self, app_offset: u32) -> Result<()> {
        self.shared_heap().ok_or(Error::NoSharedHeap)?.free(app_offset)
    }

    // ---- tables and globals ----

    pub fn table_size(&self, table: u32) -> Result<u32> {
        Ok(self.table(table)?.size())
    }

    pub fn table_get(&self, table: u32, index: u32) -> Result<Option<u32>> {
        self.table(table)?.get(index)
    }

    pub fn table_set(&self, table: u32, index: u32, func: Option<u32>) -> Result<()> {
        self.table(table)?.set(index, func)
    }

    /// `table.grow`: the previous size, or -1.
    #[must_use]
    pub fn table_grow(&self, table: u32, delta: u32, init: Option<u32>) -> i32 {
        match self.table(table).and_then(|mut t| t.grow(delta, init)) {
            Ok(old) => old as i32,
            Err(e) => {
                tracing::warn!("table.grow failed: {e}");
                -1
            }
        }
    }

    pub fn global_get(&self, index: u32) -> Result<Val> {
        self.globals_read()
            .get(index as usize)
            .map(GlobalInstance::get)
            .ok_or(Error::GlobalIndex(index))
    }

    pub fn global_set(&self, index: u32, value: Val) -> Result<()> {
        self.globals_write()
            .get_mut(index as usize)
            .ok_or(Error::GlobalIndex(index))?
            .set(index, value)
    }

    #[must_use]
    pub fn global_count(&self) -> usize {
        self.globals_read().len()
    }

    // ---- imports and exports ----

    #[must_use]
    pub fn exports(&self) -> &[Export] {
        &self.exports
    }

    #[must_use]
    pub fn export(&self, name: &str) -> Option<&Export> {
        self.exports.iter().find(|e| e.name == name)
    }

    #[must_use]
    pub fn exported_memory(&self, name: &str) -> Option<&Arc<MemoryInstance>> {
        self.export(name)
            .filter(|e| e.kind == ExportKind::Memory)
            .and_then(|e| self.memories.get(e.index as usize))
    }

    #[must_use]
    pub fn exported_global(&self, name: &str) -> Option<Val> {
        self.export(name)
            .filter(|e| e.kind == ExportKind::Global)
            .and_then(|e| self.global_get(e.index).ok())
    }

    #[must_use]
    pub fn import_count(&self) -> usize {
        self.imports.len()
    }

    pub(crate) fn import(&self, index: u32) -> Option<&LinkedImport> {
        self.imports.get(index as usize)
    }

    /// `(module, name)` of every function import no host function is bound to.
    #[must_use]
    pub fn unlinked_imports(&self) -> Vec<(String, String)> {
        self.imports
            .iter()
            .filter(|i| i.symbol.is_none())
            .map(|i| (i.module.clone(), i.name.clone()))
            .collect()
    }

    // ---- exceptions ----

    pub fn set_exception(&self, message: &str) {
        tracing::debug!("exception: {message}");
        *self.exception_lock() = Some(message.to_string());
    }

    #[must_use]
    pub fn get_exception(&self) -> Option<String> {
        self.exception_lock().clone()
    }

    pub fn clear_exception(&self) {
        *self.exception_lock() = None;
    }

    /// Remove the pending exception, as an [`Error::Exception`].
    pub fn take_exception(&self) -> Option<Error> {
        self.exception_lock().take().map(Error::Exception)
    }

    // ---- lifecycle ----

    #[must_use]
    pub fn state(&self) -> InstanceState {
        let phase = self.lifecycle_lock().phase;
        match phase {
            Phase::Deinstantiating => InstanceState::Deinstantiating,
            Phase::Destroyed => InstanceState::Destroyed,
            _ if self.exception_lock().is_some() => InstanceState::ExceptionPending,
            Phase::Instantiated => InstanceState::Instantiated,
            Phase::Running => InstanceState::Running,
        }
    }

    /// Ask every thread running in this instance to stop. Blocking operations
    /// refuse to start afterwards.
    pub fn terminate(&self) {
        if !self.terminating.swap(true, Ordering::SeqCst) {
            tracing::debug!("terminating module instance");
        }
        self.set_exception(EXCEPTION_TERMINATED);
    }

    #[must_use]
    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::SeqCst)
    }

    /// Number of live execution environments.
    #[must_use]
    pub fn exec_env_count(&self) -> usize {
        self.lifecycle_lock().exec_envs
    }

    /// Terminate the instance, wait for every execution environment to be
    /// dropped, then release the memories.
    ///
    /// Must not be called from a thread that still holds an
    /// [`ExecEnv`](crate::exec_env::ExecEnv) of this instance; the wait has no
    /// timeout.
    pub fn deinstantiate(self: Arc<Self>) {
        self.lifecycle_lock().phase = Phase::Deinstantiating;
        self.terminate();
        {
            let life = self.lifecycle_lock();
            let mut life = self
                .retired
                .wait_while(life, |life| life.exec_envs > 0)
                .unwrap_or_else(PoisonError::into_inner);
            life.phase = Phase::Destroyed;
        }
        match Arc::try_unwrap(self) {
            Ok(inst) => inst.destroy(),
            Err(inst) => tracing::debug!(
                refs = Arc::strong_count(&inst),
                "instance still referenced, memories are released with the last reference"
            ),
        }
    }

    pub(crate) fn register_exec_env(&self) -> Result<()> {
        let mut life = self.lifecycle_lock();
        match life.phase {
            Phase::Instantiated | Phase::Running => {
                life.phase = Phase::Running;
                life.exec_envs += 1;
                Ok(())
            }
            Phase::Deinstantiating | Phase::Destroyed => Err(Error::Terminated),
        }
    }

    pub(crate) fn retire_exec_env(&self) {
        let mut life = self.lifecycle_lock();
        life.exec_envs = life.exec_envs.saturating_sub(1);
        if life.exec_envs == 0 {
            self.retired.notify_all();
        }
    }

    fn destroy(self) {
        for memory in self.memories {
            match Arc::try_unwrap(memory) {
                Ok(memory) => memory.destroy(),
                Err(_) => tracing::debug!("memory shared with another owner, not released"),
            }
        }
        tracing::debug!("module instance destroyed");
    }

    // ---- helpers ----

    /// The region holding `[app_offset, app_offset + len)`. Memories never
    /// shrink, so the answer stays valid after the lock is released.
    fn app_region(&self, app_offset: u32, len: u32) -> Result<AppRegion<'_>> {
        if let Some(memory) = self.memories.first()
            && memory.view().validate_range(app_offset, len)
        {
            return Ok(AppRegion::Memory(memory));
        }
        if let Some(heap) = self.shared_heap()
            && heap.contains_app(app_offset, len)
        {
            return Ok(AppRegion::Shared(heap));
        }
        Err(self.out_of_bounds(app_offset, u64::from(len)))
    }

    fn out_of_bounds(&self, app_offset: u32, size: u64) -> Error {
        self.set_exception(EXCEPTION_OUT_OF_BOUNDS);
        Error::OutOfBounds {
            offset: u64::from(app_offset),
            size,
        }
    }

    fn table(&self, index: u32) -> Result<MutexGuard<'_, TableInstance>> {
        Ok(self
            .tables
            .get(index as usize)
            .ok_or(Error::TableIndex(index))?
            .lock()
            .unwrap_or_else(PoisonError::into_inner))
    }

    fn shared_heap_slot(&self) -> RwLockReadGuard<'_, Option<Arc<SharedHeap>>> {
        self.shared_heap.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn shared_heap_slot_mut(&self) -> RwLockWriteGuard<'_, Option<Arc<SharedHeap>>> {
        self.shared_heap.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn globals_read(&self) -> RwLockReadGuard<'_, Vec<GlobalInstance>> {
        self.globals.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn globals_write(&self) -> RwLockWriteGuard<'_, Vec<GlobalInstance>> {
        self.globals.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn exception_lock(&self) -> MutexGuard<'_, Option<String>> {
        self.exception.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lifecycle_lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
