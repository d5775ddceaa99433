//! Runtime configuration and the memory sizing constants.
//!
//! ```text
//! App address space of one module instance (default memory):
//!   0x00000000 - declared pages            Data / shadow stack, managed by the guest
//!   heap_base_offset - +heap_size          App heap in its own pages (module_malloc / module_free)
//!   ... - memory_data_size                 Pages added by memory.grow
//!   2^32 - shared_heap_size - 2^32         Shared heap, when one is attached
//! ```

use crate::memory::heap::AllocPolicy;

/// WebAssembly page size in bytes. `memory.grow` works in whole pages.
pub const WASM_PAGE_SIZE: u32 = 65536;

/// Maximum number of pages of a 32-bit linear memory (4 GiB).
pub const MAX_PAGE_COUNT: u32 = 65536;

/// Largest linear memory in bytes.
pub const MAX_LINEAR_MEMORY_SIZE: u64 = WASM_PAGE_SIZE as u64 * MAX_PAGE_COUNT as u64;

/// Default app heap size of each instance.
pub const APP_HEAP_SIZE_DEFAULT: u32 = 8 * 1024;

/// Smallest app heap size accepted; smaller requests are raised to this.
pub const APP_HEAP_SIZE_MIN: u32 = 2 * 1024;

/// Largest app heap size accepted; larger requests are lowered to this.
pub const APP_HEAP_SIZE_MAX: u32 = 1024 * 1024;

/// A heap carved from the initial memory is never placed above this offset.
pub const DEFAULT_APP_HEAP_BASE_OFFSET: u32 = 1024 * 1024 * 1024;

/// Share of the global memory budget one linear memory may grow to, as
/// `(numerator, denominator)`.
pub const APP_MEMORY_MAX_GLOBAL_HEAP_PERCENT: (u64, u64) = (1, 3);

/// Host page granularity used to round shared heap sizes.
pub const HOST_PAGE_SIZE: u32 = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    heap_size: u32,
    alloc_policy: AllocPolicy,
    memory_budget: Option<u64>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            heap_size: APP_HEAP_SIZE_DEFAULT,
            alloc_policy: AllocPolicy::FirstFit,
            memory_budget: None,
        }
    }
}

impl RuntimeConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the app heap size. Zero disables the app heap; any other value is
    /// clamped into `[APP_HEAP_SIZE_MIN, APP_HEAP_SIZE_MAX]`.
    #[must_use]
    pub fn with_heap_size(mut self, size: u32) -> Self {
        self.heap_size = if size == 0 {
            0
        } else {
            size.clamp(APP_HEAP_SIZE_MIN, APP_HEAP_SIZE_MAX)
        };
        self
    }

    #[must_use]
    pub fn with_alloc_policy(mut self, policy: AllocPolicy) -> Self {
        self.alloc_policy = policy;
        self
    }

    /// Total bytes the embedder is willing to spend on linear memory. When set,
    /// a single memory may only grow to `APP_MEMORY_MAX_GLOBAL_HEAP_PERCENT` of it.
    #[must_use]
    pub fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget = Some(bytes);
        self
    }

    #[must_use]
    pub fn heap_size(&self) -> u32 {
        self.heap_size
    }

    #[must_use]
    pub fn alloc_policy(&self) -> AllocPolicy {
        self.alloc_policy
    }

    #[must_use]
    pub fn memory_budget(&self) -> Option<u64> {
        self.memory_budget
    }

    /// Page ceiling for a memory declaring `declared_max` pages once the
    /// global budget is taken into account. Never below `initial_pages`.
    #[must_use]
    pub fn effective_max_pages(&self, initial_pages: u32, declared_max: u32) -> u32 {
        let Some(budget) = self.memory_budget else {
            return declared_max;
        };
        let (num, den) = APP_MEMORY_MAX_GLOBAL_HEAP_PERCENT;
        let budget_pages = budget / den * num / u64::from(WASM_PAGE_SIZE);
        let capped = u32::try_from(budget_pages).unwrap_or(u32::MAX);
        declared_max.min(capped).max(initial_pages)
    }
}

/// Round `value` up to a multiple of `align` (a power of two).
#[must_use]
pub(crate) fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}
