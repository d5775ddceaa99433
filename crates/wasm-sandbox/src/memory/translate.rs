//! Translation between app offsets and native (host) addresses.
//!
//! A `NativePtr` is only an address value: it can be compared, offset and
//! translated back, but never dereferenced. Reading or writing guest bytes
//! goes through a borrowed slice from a `MemoryView`, which ties the access to
//! the lifetime of the memory lock. A `NativePtr` is stale as soon as the
//! memory grows and must be derived again after any call that may grow it.

use std::fmt;

/// Host address inside a linear memory or shared heap.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NativePtr(usize);

impl NativePtr {
    #[must_use]
    pub fn from_addr(addr: usize) -> Self {
        Self(addr)
    }

    #[must_use]
    pub fn of_slice(bytes: &[u8]) -> Self {
        Self(bytes.as_ptr() as usize)
    }

    #[must_use]
    pub fn addr(self) -> usize {
        self.0
    }

    /// The address `bytes` further on, or `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        let bytes = usize::try_from(bytes).ok()?;
        self.0.checked_add(bytes).map(Self)
    }
}

impl fmt::Debug for NativePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativePtr({:#x})", self.0)
    }
}

/// Native address of `app_offset` in a memory based at `base`.
///
/// # Panics
///
/// The caller must have validated the offset. An offset past the end of the
/// memory is a broken invariant and aborts instead of producing an address
/// outside the sandbox.
#[must_use]
pub fn app_to_native(base: NativePtr, memory_data_size: u64, app_offset: u32) -> NativePtr {
    assert!(
        u64::from(app_offset) <= memory_data_size,
        "app offset {app_offset:#x} translated without validation (memory size {memory_data_size:#x})"
    );
    NativePtr(base.0 + app_offset as usize)
}

/// App offset of `ptr` in a memory based at `base`, or `None` when `ptr` is
/// outside `[base, base + memory_data_size)`.
#[must_use]
pub fn native_to_app(base: NativePtr, memory_data_size: u64, ptr: NativePtr) -> Option<u32> {
    let delta = ptr.0.checked_sub(base.0)?;
    let delta = u64::try_from(delta).ok()?;
    if delta >= memory_data_size {
        return None;
    }
    u32::try_from(delta).ok()
}

/// Whether `[ptr, ptr + size)` lies inside `[base, base + memory_data_size)`.
#[must_use]
pub fn native_range_in(base: NativePtr, memory_data_size: u64, ptr: NativePtr, size: u64) -> bool {
    let Some(delta) = ptr.0.checked_sub(base.0) else {
        return false;
    };
    let Ok(delta) = u64::try_from(delta) else {
        return false;
    };
    delta <= memory_data_size && size <= memory_data_size - delta
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let base = NativePtr::from_addr(0x1000_0000);
        for offset in [0u32, 1, 4095, 65535] {
            let ptr = app_to_native(base, 65536, offset);
            assert_eq!(native_to_app(base, 65536, ptr), Some(offset));
        }
    }

    #[test]
    fn test_native_outside_memory() {
        let base = NativePtr::from_addr(0x1000_0000);
        assert_eq!(native_to_app(base, 65536, NativePtr::from_addr(0x0fff_ffff)), None);
        assert_eq!(native_to_app(base, 65536, NativePtr::from_addr(0x1001_0000)), None);
    }

    #[test]
    #[should_panic(expected = "translated without validation")]
    fn test_unvalidated_translation_aborts() {
        let _ = app_to_native(NativePtr::from_addr(0x1000), 65536, 65537);
    }

    #[test]
    fn test_native_range() {
        let base = NativePtr::from_addr(0x2000);
        assert!(native_range_in(base, 16, NativePtr::from_addr(0x2000), 16));
        assert!(native_range_in(base, 16, NativePtr::from_addr(0x2010), 0));
        assert!(!native_range_in(base, 16, NativePtr::from_addr(0x2008), 9));
        assert!(!native_range_in(base, 16, NativePtr::from_addr(0x1fff), 1));
        assert!(!native_range_in(base, 16, NativePtr::from_addr(0x2001), u64::MAX));
    }
}
