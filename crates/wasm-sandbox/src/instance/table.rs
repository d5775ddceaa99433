use crate::{Error, Result};

/// Upper bound on table elements, matching the limit on table sizes that
/// engines accept in practice.
pub const MAX_TABLE_SIZE: u32 = 10_000_000;

/// A funcref table: each slot holds a function index or is empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInstance {
    elements: Vec<Option<u32>>,
    max: u32,
}

impl TableInstance {
    pub fn new(initial: u32, max: Option<u32>) -> Result<Self> {
        let max = max.unwrap_or(MAX_TABLE_SIZE).min(MAX_TABLE_SIZE);
        if initial > max {
            return Err(Error::Instantiation(format!(
                "table initial size {initial} exceeds maximum {max}"
            )));
        }
        Ok(Self {
            elements: vec![None; initial as usize],
            max,
        })
    }

    #[must_use]
    pub fn size(&self) -> u32 {
        self.elements.len() as u32
    }

    #[must_use]
    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn get(&self, index: u32) -> Result<Option<u32>> {
        self.elements
            .get(index as usize)
            .copied()
            .ok_or(self.out_of_bounds(u64::from(index)))
    }

    pub fn set(&mut self, index: u32, func: Option<u32>) -> Result<()> {
        let oob = self.out_of_bounds(u64::from(index));
        let slot = self.elements.get_mut(index as usize).ok_or(oob)?;
        *slot = func;
        Ok(())
    }

    /// Write `funcs` starting at `offset`. Nothing is written unless the whole
    /// range fits.
    pub fn init(&mut self, offset: u32, funcs: &[Option<u32>]) -> Result<()> {
        let end = u64::from(offset) + funcs.len() as u64;
        if end > u64::from(self.size()) {
            return Err(self.out_of_bounds(end));
        }
        let start = offset as usize;
        self.elements[start..start + funcs.len()].copy_from_slice(funcs);
        Ok(())
    }

    /// Grow by `delta` slots filled with `init`. Returns the previous size.
    pub fn grow(&mut self, delta: u32, init: Option<u32>) -> Result<u32> {
        let old = self.size();
        let new = u64::from(old) + u64::from(delta);
        if new > u64::from(self.max) {
            return Err(self.out_of_bounds(new));
        }
        self.elements.resize(new as usize, init);
        Ok(old)
    }

    fn out_of_bounds(&self, index: u64) -> Error {
        Error::TableOutOfBounds {
            index,
            size: self.size(),
        }
    }
}
