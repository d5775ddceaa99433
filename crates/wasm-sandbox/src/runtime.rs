use std::sync::Arc;

use crate::config::RuntimeConfig;
use crate::instance::instantiate::{self, Module};
use crate::instance::ModuleInstance;
use crate::native::NativeRegistry;
use crate::shared_heap::SharedHeap;
use crate::Result;

/// Configuration plus the host functions modules link against. One runtime
/// can load and instantiate any number of modules.
#[derive(Debug, Default)]
pub struct Runtime {
    config: RuntimeConfig,
    natives: NativeRegistry,
}

impl Runtime {
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            natives: NativeRegistry::new(),
        }
    }

    #[must_use]
    pub fn with_natives(config: RuntimeConfig, natives: NativeRegistry) -> Self {
        Self { config, natives }
    }

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    #[must_use]
    pub fn natives(&self) -> &NativeRegistry {
        &self.natives
    }

    pub fn natives_mut(&mut self) -> &mut NativeRegistry {
        &mut self.natives
    }

    /// Validate and parse a WASM binary.
    pub fn load(&self, wasm: &[u8]) -> Result<Module> {
        Module::from_binary(wasm)
    }

    pub fn instantiate(&self, module: &Module) -> Result<Arc<ModuleInstance>> {
        let inst = instantiate::instantiate(module, &self.config, &self.natives)?;
        Ok(Arc::new(inst))
    }

    /// Create a shared heap using this runtime's allocation policy.
    pub fn create_shared_heap(&self, size: u32) -> Result<Arc<SharedHeap>> {
        SharedHeap::create(size, self.config.alloc_policy())
    }
}
