//! Bounds validation of app addresses against a linear memory.
//!
//! Every check here is done in `u64` so that `offset + size` can never wrap
//! around a 32-bit boundary and turn into a small, seemingly valid address.

/// Snapshot of the address layout of one linear memory.
///
/// Taken under the memory's lock, so `memory_data_size` and the heap bounds
/// always belong to the same moment in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpace {
    /// Current committed size in bytes (a multiple of the page size).
    pub memory_data_size: u64,
    /// Upper bound for `memory_data_size`, fixed at instantiation.
    pub max_memory_data_size: u64,
    /// First app offset of the instance heap.
    pub heap_base_offset: u32,
    /// Size of the instance heap in bytes.
    pub heap_size: u32,
}

impl AddressSpace {
    /// Whether `[offset, offset + size)` lies inside the memory.
    #[must_use]
    pub fn contains(&self, offset: u32, size: u32) -> bool {
        validate_range(self.memory_data_size, offset, size)
    }

    /// Whether `offset` falls inside the app heap region.
    #[must_use]
    pub fn heap_contains(&self, offset: u32) -> bool {
        let offset = u64::from(offset);
        let base = u64::from(self.heap_base_offset);
        offset >= base && offset < base + u64::from(self.heap_size)
    }

    /// First offset past the app heap.
    #[must_use]
    pub fn heap_end_offset(&self) -> u64 {
        u64::from(self.heap_base_offset) + u64::from(self.heap_size)
    }

    #[must_use]
    pub fn page_count(&self) -> u32 {
        (self.memory_data_size / u64::from(crate::config::WASM_PAGE_SIZE)) as u32
    }
}

/// Check that `[app_offset, app_offset + size)` lies inside a memory of
/// `memory_data_size` bytes. A zero-length range is valid at any offset up to
/// and including `memory_data_size`.
#[must_use]
pub fn validate_range(memory_data_size: u64, app_offset: u32, size: u32) -> bool {
    let offset = u64::from(app_offset);
    let size = u64::from(size);
    if offset > memory_data_size || size > memory_data_size {
        return false;
    }
    offset + size <= memory_data_size
}

/// Check that a NUL-terminated string starts at `app_offset` and ends before
/// the end of `bytes`. Never looks past `bytes.len()`.
#[must_use]
pub fn validate_str(bytes: &[u8], app_offset: u32) -> bool {
    str_len(bytes, app_offset).is_some()
}

/// Length of the NUL-terminated string at `app_offset`, excluding the
/// terminator, or `None` when no terminator exists inside `bytes`.
#[must_use]
pub fn str_len(bytes: &[u8], app_offset: u32) -> Option<usize> {
    let start = usize::try_from(app_offset).ok()?;
    bytes.get(start..)?.iter().position(|&b| b == 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZE: u64 = 65536;

    #[test]
    fn test_boundary_offsets() {
        assert!(validate_range(SIZE, 65535, 1));
        assert!(!validate_range(SIZE, 65536, 1));
        assert!(!validate_range(SIZE, 65535, 2));
        assert!(validate_range(SIZE, 0, 65536));
        assert!(!validate_range(SIZE, 0, 65537));
    }

    #[test]
    fn test_zero_length() {
        assert!(validate_range(SIZE, 0, 0));
        assert!(validate_range(SIZE, 65536, 0));
        assert!(!validate_range(SIZE, 65537, 0));
        assert!(validate_range(0, 0, 0));
        assert!(!validate_range(0, 0, 1));
    }

    #[test]
    fn test_no_wraparound() {
        assert!(!validate_range(SIZE, u32::MAX, 1));
        assert!(!validate_range(SIZE, 1, u32::MAX));
        assert!(!validate_range(SIZE, u32::MAX, u32::MAX));
        // Even a full 4 GiB memory rejects the last byte plus one.
        assert!(validate_range(1 << 32, u32::MAX, 1));
        assert!(!validate_range(1 << 32, u32::MAX, 2));
    }

    #[test]
    fn test_validate_str() {
        let bytes = b"abc\0def";
        assert!(validate_str(bytes, 0));
        assert!(validate_str(bytes, 3));
        assert!(!validate_str(bytes, 4));
        assert!(!validate_str(bytes, 7));
        assert!(!validate_str(bytes, u32::MAX));
        assert_eq!(str_len(bytes, 1), Some(2));
    }

    #[test]
    fn test_heap_contains() {
        let space = AddressSpace {
            memory_data_size: SIZE,
            max_memory_data_size: SIZE * 2,
            heap_base_offset: 57344,
            heap_size: 8192,
        };
        assert!(!space.heap_contains(57343));
        assert!(space.heap_contains(57344));
        assert!(space.heap_contains(65535));
        assert!(!space.heap_contains(65536));
        assert_eq!(space.heap_end_offset(), SIZE);
        assert_eq!(space.page_count(), 1);
    }
}
