#![allow(
    clippy::cast_possible_truncation, // intentional: app offsets are u32, host sizes are u64/usize
    clippy::cast_possible_wrap, // intentional: memory.grow reports page counts as i32
    clippy::cast_sign_loss, // intentional: guest i32 arguments are reinterpreted as u32 offsets
    clippy::missing_errors_doc // error variants are documented on `Error`
)]

pub mod config;
pub mod error;
pub mod exec_env;
pub mod instance;
pub mod memory;
pub mod native;
pub mod runtime;
pub mod shared_heap;

/// Test harness module for writing unit and integration tests.
///
/// This module is only available when running tests or when the
/// `test-harness` feature is enabled.
#[cfg(any(test, feature = "test-harness"))]
pub mod test_harness;

pub use config::RuntimeConfig;
pub use error::{Error, Result};
pub use exec_env::{ExecEnv, get_module_inst};
pub use instance::{InstanceState, Module, ModuleInstance, Val, ValType};
pub use memory::{AllocPolicy, MemoryInstance, NativePtr};
pub use native::NativeRegistry;
pub use runtime::Runtime;
pub use shared_heap::SharedHeap;
