use std::fmt;

use crate::{Error, Result};

/// Value types a global or native parameter can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValType {
    I32,
    I64,
    F32,
    F64,
}

impl ValType {
    pub(crate) fn from_wasm(ty: wasmparser::ValType) -> Result<Self> {
        match ty {
            wasmparser::ValType::I32 => Ok(Self::I32),
            wasmparser::ValType::I64 => Ok(Self::I64),
            wasmparser::ValType::F32 => Ok(Self::F32),
            wasmparser::ValType::F64 => Ok(Self::F64),
            other => Err(Error::Unsupported(format!("value type {other:?}"))),
        }
    }
}

impl fmt::Display for ValType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::F32 => "f32",
            Self::F64 => "f64",
        };
        f.write_str(name)
    }
}

/// A runtime value. Floats are kept as their bit patterns so NaN payloads
/// survive untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Val {
    I32(i32),
    I64(i64),
    F32(u32),
    F64(u64),
}

impl Val {
    #[must_use]
    pub fn ty(&self) -> ValType {
        match self {
            Self::I32(_) => ValType::I32,
            Self::I64(_) => ValType::I64,
            Self::F32(_) => ValType::F32,
            Self::F64(_) => ValType::F64,
        }
    }

    #[must_use]
    pub fn default_for(ty: ValType) -> Self {
        match ty {
            ValType::I32 => Self::I32(0),
            ValType::I64 => Self::I64(0),
            ValType::F32 => Self::F32(0),
            ValType::F64 => Self::F64(0),
        }
    }

    /// The value as an unsigned 32-bit app offset, if it is an i32.
    #[must_use]
    pub fn as_u32(&self) -> Option<u32> {
        match *self {
            Self::I32(v) => Some(v as u32),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalInstance {
    ty: ValType,
    mutable: bool,
    value: Val,
}

impl GlobalInstance {
    pub fn new(value: Val, mutable: bool) -> Self {
        Self {
            ty: value.ty(),
            mutable,
            value,
        }
    }

    #[must_use]
    pub fn ty(&self) -> ValType {
        self.ty
    }

    #[must_use]
    pub fn is_mutable(&self) -> bool {
        self.mutable
    }

    #[must_use]
    pub fn get(&self) -> Val {
        self.value
    }

    /// Store `value`. `index` is only used for the error.
    pub fn set(&mut self, index: u32, value: Val) -> Result<()> {
        if !self.mutable {
            return Err(Error::ImmutableGlobal(index));
        }
        if value.ty() != self.ty {
            return Err(Error::TypeMismatch(format!(
                "global {index} has type {}, got {}",
                self.ty,
                value.ty()
            )));
        }
        self.value = value;
        Ok(())
    }
}
