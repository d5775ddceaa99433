use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::instance::{ModuleInstance, Val};
use crate::native;
use crate::{Error, Result};

/// Per-thread handle on a running module instance. Host functions receive it
/// and reach the instance through [`get_module_inst`].
///
/// Holding an `ExecEnv` keeps the instance alive; dropping it lets a pending
/// [`ModuleInstance::deinstantiate`] proceed.
#[derive(Debug)]
pub struct ExecEnv {
    module_inst: Arc<ModuleInstance>,
    in_blocking_op: AtomicBool,
}

impl ExecEnv {
    pub fn new(module_inst: &Arc<ModuleInstance>) -> Result<Self> {
        module_inst.register_exec_env()?;
        Ok(Self {
            module_inst: Arc::clone(module_inst),
            in_blocking_op: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn module_inst(&self) -> &Arc<ModuleInstance> {
        &self.module_inst
    }

    /// Enter a blocking host operation. Returns false, without entering, once
    /// termination has been requested; the caller must then bail out.
    pub fn begin_blocking_op(&self) -> bool {
        if self.module_inst.is_terminating() {
            return false;
        }
        self.in_blocking_op.store(true, Ordering::SeqCst);
        // Termination may have raced with the store above.
        if self.module_inst.is_terminating() {
            self.in_blocking_op.store(false, Ordering::SeqCst);
            return false;
        }
        true
    }

    pub fn end_blocking_op(&self) {
        self.in_blocking_op.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_in_blocking_op(&self) -> bool {
        self.in_blocking_op.load(Ordering::SeqCst)
    }

    /// Call function import `index` of the instance with `args`, as guest
    /// code would. An unlinked import traps.
    pub fn call_import(&self, index: u32, args: &[Val]) -> Result<Option<Val>> {
        let import = self
            .module_inst
            .import(index)
            .ok_or_else(|| Error::Internal(format!("function import {index} out of range")))?;
        let Some(symbol) = &import.symbol else {
            return Err(native::unlinked_import(
                &self.module_inst,
                &import.module,
                &import.name,
            ));
        };
        native::invoke(self, symbol, args)
    }
}

impl Drop for ExecEnv {
    fn drop(&mut self) {
        self.module_inst.retire_exec_env();
    }
}

/// The module instance `exec_env` runs in.
#[must_use]
pub fn get_module_inst(exec_env: &ExecEnv) -> &Arc<ModuleInstance> {
    exec_env.module_inst()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::InstanceState;
    use crate::memory::MemoryInstance;

    fn instance() -> Arc<ModuleInstance> {
        ModuleInstance::with_memories(vec![MemoryInstance::create(1, 1, false).expect("memory")])
    }

    #[test]
    fn test_exec_env_moves_instance_to_running() {
        let inst = instance();
        assert_eq!(inst.state(), InstanceState::Instantiated);
        let env = ExecEnv::new(&inst).expect("exec env");
        assert_eq!(inst.state(), InstanceState::Running);
        assert_eq!(inst.exec_env_count(), 1);
        assert!(Arc::ptr_eq(get_module_inst(&env), &inst));
        drop(env);
        assert_eq!(inst.exec_env_count(), 0);
    }

    #[test]
    fn test_blocking_op_refused_after_terminate() {
        let inst = instance();
        let env = ExecEnv::new(&inst).expect("exec env");
        assert!(env.begin_blocking_op());
        assert!(env.is_in_blocking_op());
        env.end_blocking_op();
        inst.terminate();
        assert!(!env.begin_blocking_op());
        assert!(!env.is_in_blocking_op());
    }

    #[test]
    fn test_call_import_out_of_range() {
        let inst = instance();
        let env = ExecEnv::new(&inst).expect("exec env");
        assert!(matches!(env.call_import(0, &[]), Err(Error::Internal(_))));
    }
}
