//! In-place access to a default memory whose write lock is already held.

use super::ModuleInstance;
use crate::error::EXCEPTION_OUT_OF_BOUNDS;
use crate::memory::{MemoryViewMut, validate_range, validate_str};
use crate::{Error, Result};

/// The default memory of an instance, locked for writing.
///
/// Handed to the closure of [`ModuleInstance::with_app_memory`]. Failed checks
/// set the out-of-bounds exception on the instance, as the instance's own
/// methods do.
pub struct AppMemory<'a> {
    inst: &'a ModuleInstance,
    view: MemoryViewMut<'a>,
}

impl<'a> AppMemory<'a> {
    pub(crate) fn new(inst: &'a ModuleInstance, view: MemoryViewMut<'a>) -> Self {
        Self { inst, view }
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.view.size()
    }

    pub fn validate_app_addr(&self, app_offset: u32, size: u32) -> bool {
        if validate_range(self.view.size(), app_offset, size) {
            return true;
        }
        self.inst.set_exception(EXCEPTION_OUT_OF_BOUNDS);
        false
    }

    pub fn validate_app_str_addr(&self, app_offset: u32) -> bool {
        if validate_str(self.view.bytes(), app_offset) {
            return true;
        }
        self.inst.set_exception(EXCEPTION_OUT_OF_BOUNDS);
        false
    }

    pub fn bytes(&self, app_offset: u32, len: u32) -> Result<&[u8]> {
        let inst = self.inst;
        self.view.slice(app_offset, len).map_err(|e| flag(inst, e))
    }

    pub fn bytes_mut(&mut self, app_offset: u32, len: u32) -> Result<&mut [u8]> {
        let inst = self.inst;
        self.view.slice_mut(app_offset, len).map_err(|e| flag(inst, e))
    }

    /// Copy out the NUL-terminated string at `app_offset`.
    pub fn read_str(&self, app_offset: u32) -> Result<String> {
        let inst = self.inst;
        let bytes = self.view.c_str(app_offset).map_err(|e| flag(inst, e))?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    pub fn write(&mut self, app_offset: u32, data: &[u8]) -> Result<()> {
        let inst = self.inst;
        self.view.write(app_offset, data).map_err(|e| flag(inst, e))
    }
}

fn flag(inst: &ModuleInstance, e: Error) -> Error {
    if matches!(e, Error::OutOfBounds { .. }) {
        inst.set_exception(EXCEPTION_OUT_OF_BOUNDS);
    }
    e
}
