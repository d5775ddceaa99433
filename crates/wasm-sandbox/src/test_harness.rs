//! Test harness for wasm-sandbox tests
//!
//! Helpers to build instances from WAT and to check memory contents.
//! Available in unit tests and behind the `test-harness` feature.
//!
//! # Example
//!
//! ```rust
//! use wasm_sandbox::test_harness::*;
//!
//! let inst = instantiate_wat(r#"(module (memory 1 2))"#).expect("instantiate");
//! let memory = inst.default_memory().expect("memory");
//!
//! // The app heap adds a page above the declared one.
//! fill_pattern(memory, 0..65536, 7);
//! assert_eq!(inst.memory_grow(1), 2);
//! assert_pattern(memory, 0..65536, 7);
//! assert_zeroed(memory, 131072..196608);
//! ```

#![allow(
    clippy::must_use_candidate,
    clippy::manual_assert,
    clippy::missing_panics_doc,
    clippy::uninlined_format_args
)]

use std::ops::Range;
use std::sync::Arc;

use crate::config::RuntimeConfig;
use crate::instance::ModuleInstance;
use crate::memory::MemoryInstance;
use crate::runtime::Runtime;
use crate::{Error, Result};

/// Parse WAT (WebAssembly Text) format to WASM binary
pub fn wat_to_wasm(wat: &str) -> Result<Vec<u8>> {
    wat::parse_str(wat).map_err(|e| Error::Internal(format!("WAT parse error: {e}")))
}

/// Instantiate WAT with a default runtime (no host functions).
pub fn instantiate_wat(wat: &str) -> Result<Arc<ModuleInstance>> {
    instantiate_wat_with(&Runtime::new(RuntimeConfig::default()), wat)
}

/// Instantiate WAT with `runtime`'s config and host functions.
pub fn instantiate_wat_with(runtime: &Runtime, wat: &str) -> Result<Arc<ModuleInstance>> {
    let wasm = wat_to_wasm(wat)?;
    let module = runtime.load(&wasm)?;
    runtime.instantiate(&module)
}

/// Byte `index` of the test pattern with `seed`. Never zero, so a pattern is
/// distinguishable from fresh pages.
pub fn pattern_byte(index: u64, seed: u8) -> u8 {
    let byte = (index.wrapping_mul(31) as u8) ^ seed;
    if byte == 0 { 0xA5 } else { byte }
}

/// Write the pattern over `range` of `memory`.
pub fn fill_pattern(memory: &MemoryInstance, range: Range<u32>, seed: u8) {
    let mut view = memory.view_mut();
    let bytes = view
        .slice_mut(range.start, range.end - range.start)
        .unwrap_or_else(|e| panic!("pattern range {:?} out of bounds: {e}", range));
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte = pattern_byte(u64::from(range.start) + i as u64, seed);
    }
}

/// Assert `range` of `memory` still holds the pattern written with `seed`.
pub fn assert_pattern(memory: &MemoryInstance, range: Range<u32>, seed: u8) {
    let view = memory.view();
    let bytes = view
        .slice(range.start, range.end - range.start)
        .unwrap_or_else(|e| panic!("pattern range {:?} out of bounds: {e}", range));
    for (i, &byte) in bytes.iter().enumerate() {
        let offset = u64::from(range.start) + i as u64;
        let expected = pattern_byte(offset, seed);
        if byte != expected {
            panic!(
                "Pattern mismatch at offset {:#x}: expected {:#04x}, got {:#04x}",
                offset, expected, byte
            );
        }
    }
}

/// Assert every byte in `range` of `memory` is zero.
pub fn assert_zeroed(memory: &MemoryInstance, range: Range<u32>) {
    let view = memory.view();
    let bytes = view
        .slice(range.start, range.end - range.start)
        .unwrap_or_else(|e| panic!("range {:?} out of bounds: {e}", range));
    if let Some(pos) = bytes.iter().position(|&b| b != 0) {
        panic!(
            "Expected zeroed memory, found {:#04x} at offset {:#x}",
            bytes[pos],
            u64::from(range.start) + pos as u64
        );
    }
}

/// Assert no two `(offset, size)` blocks overlap.
pub fn assert_disjoint(blocks: &[(u32, u32)]) {
    let mut sorted = blocks.to_vec();
    sorted.sort_unstable();
    for pair in sorted.windows(2) {
        let (a, a_size) = pair[0];
        let (b, _) = pair[1];
        if u64::from(a) + u64::from(a_size) > u64::from(b) {
            panic!(
                "Blocks overlap: [{:#x}, +{}) and [{:#x}, ...)\n\nAll blocks: {:?}",
                a, a_size, b, sorted
            );
        }
    }
}
