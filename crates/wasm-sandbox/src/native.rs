//! Registry of host functions callable from guest code.
//!
//! Each symbol carries a signature string in the usual WAMR notation:
//!
//! ```text
//! "(i*~$)i"
//!   i  i32      I  i64      f  f32      F  f64
//!   *  app pointer (i32); validated for the length given by a following `~`,
//!      or for one byte otherwise
//!   ~  byte length (i32) of the pointer just before it
//!   $  app pointer (i32) to a NUL-terminated string
//! ```
//!
//! Pointer and string arguments are validated against the caller's module
//! instance before the host function runs, so host code only ever sees app
//! offsets that are inside the sandbox.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::exec_env::ExecEnv;
use crate::instance::{ModuleInstance, Val, ValType};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    I32,
    I64,
    F32,
    F64,
    /// `*`: app pointer.
    Ptr,
    /// `~`: byte length of the preceding pointer.
    BufLen,
    /// `$`: app pointer to a NUL-terminated string.
    Str,
}

impl ParamKind {
    #[must_use]
    pub fn val_type(self) -> ValType {
        match self {
            Self::I64 => ValType::I64,
            Self::F32 => ValType::F32,
            Self::F64 => ValType::F64,
            Self::I32 | Self::Ptr | Self::BufLen | Self::Str => ValType::I32,
        }
    }

    fn symbol(self) -> char {
        match self {
            Self::I32 => 'i',
            Self::I64 => 'I',
            Self::F32 => 'f',
            Self::F64 => 'F',
            Self::Ptr => '*',
            Self::BufLen => '~',
            Self::Str => '$',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    params: Vec<ParamKind>,
    result: Option<ValType>,
}

impl Signature {
    #[must_use]
    pub fn params(&self) -> &[ParamKind] {
        &self.params
    }

    #[must_use]
    pub fn result(&self) -> Option<ValType> {
        self.result
    }

    /// Whether a guest function type can be bound to this signature.
    #[must_use]
    pub fn matches(&self, ty: &wasmparser::FuncType) -> bool {
        let params_match = ty.params().len() == self.params.len()
            && ty
                .params()
                .iter()
                .zip(&self.params)
                .all(|(&wasm, kind)| ValType::from_wasm(wasm).ok() == Some(kind.val_type()));
        let results_match = match (ty.results(), self.result) {
            ([], None) => true,
            ([wasm], Some(ty)) => ValType::from_wasm(*wasm).ok() == Some(ty),
            _ => false,
        };
        params_match && results_match
    }

    fn check_args(&self, args: &[Val]) -> Result<()> {
        if args.len() != self.params.len() {
            return Err(Error::SignatureMismatch(format!(
                "expected {} arguments, got {}",
                self.params.len(),
                args.len()
            )));
        }
        for (index, (arg, kind)) in args.iter().zip(&self.params).enumerate() {
            if arg.ty() != kind.val_type() {
                return Err(Error::SignatureMismatch(format!(
                    "argument {index} should be {}, got {}",
                    kind.val_type(),
                    arg.ty()
                )));
            }
        }
        Ok(())
    }
}

impl FromStr for Signature {
    type Err = Error;

    fn from_str(signature: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidSignature {
            signature: signature.to_string(),
            reason: reason.to_string(),
        };
        let rest = signature
            .strip_prefix('(')
            .ok_or_else(|| invalid("missing '('"))?;
        let (params_str, result_str) = rest
            .split_once(')')
            .ok_or_else(|| invalid("missing ')'"))?;

        let mut params = Vec::with_capacity(params_str.len());
        for c in params_str.chars() {
            let kind = match c {
                'i' => ParamKind::I32,
                'I' => ParamKind::I64,
                'f' => ParamKind::F32,
                'F' => ParamKind::F64,
                '*' => ParamKind::Ptr,
                '$' => ParamKind::Str,
                '~' => {
                    if params.last() != Some(&ParamKind::Ptr) {
                        return Err(invalid("'~' must follow '*'"));
                    }
                    ParamKind::BufLen
                }
                other => return Err(invalid(&format!("unknown parameter type '{other}'"))),
            };
            params.push(kind);
        }

        let result = match result_str {
            "" => None,
            "i" => Some(ValType::I32),
            "I" => Some(ValType::I64),
            "f" => Some(ValType::F32),
            "F" => Some(ValType::F64),
            other => return Err(invalid(&format!("unknown result type '{other}'"))),
        };
        Ok(Self { params, result })
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for kind in &self.params {
            write!(f, "{}", kind.symbol())?;
        }
        f.write_str(")")?;
        match self.result {
            Some(ValType::I32) => f.write_str("i"),
            Some(ValType::I64) => f.write_str("I"),
            Some(ValType::F32) => f.write_str("f"),
            Some(ValType::F64) => f.write_str("F"),
            None => Ok(()),
        }
    }
}

/// Host function body. Receives the calling thread's execution environment
/// and the already-validated arguments.
///
/// The body may call back into the instance freely, including from inside
/// [`ModuleInstance::with_app_bytes`](crate::ModuleInstance::with_app_bytes).
/// Inside [`ModuleInstance::with_app_memory`](crate::ModuleInstance::with_app_memory)
/// it must use the `AppMemory` it is handed instead.
pub type NativeFn = dyn Fn(&ExecEnv, &[Val]) -> Result<Option<Val>> + Send + Sync;

#[derive(Clone)]
pub struct NativeSymbol {
    name: String,
    signature: Signature,
    func: Arc<NativeFn>,
}

impl NativeSymbol {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn signature(&self) -> &Signature {
        &self.signature
    }
}

impl fmt::Debug for NativeSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeSymbol")
            .field("name", &self.name)
            .field("signature", &self.signature.to_string())
            .finish_non_exhaustive()
    }
}

/// Host functions and global values that module imports resolve against.
#[derive(Debug, Default, Clone)]
pub struct NativeRegistry {
    funcs: HashMap<String, HashMap<String, NativeSymbol>>,
    globals: HashMap<(String, String), Val>,
}

impl NativeRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `func` as `module.name`. Replaces an earlier registration of
    /// the same name.
    pub fn register<F>(&mut self, module: &str, name: &str, signature: &str, func: F) -> Result<()>
    where
        F: Fn(&ExecEnv, &[Val]) -> Result<Option<Val>> + Send + Sync + 'static,
    {
        let signature: Signature = signature.parse()?;
        tracing::debug!("registered native {module}.{name}{signature}");
        let symbol = NativeSymbol {
            name: name.to_string(),
            signature,
            func: Arc::new(func),
        };
        if self
            .funcs
            .entry(module.to_string())
            .or_default()
            .insert(name.to_string(), symbol)
            .is_some()
        {
            tracing::warn!("native {module}.{name} registered twice, keeping the latest");
        }
        Ok(())
    }

    pub fn register_global(&mut self, module: &str, name: &str, value: Val) {
        self.globals
            .insert((module.to_string(), name.to_string()), value);
    }

    #[must_use]
    pub fn lookup(&self, module: &str, name: &str) -> Option<&NativeSymbol> {
        self.funcs.get(module)?.get(name)
    }

    #[must_use]
    pub fn lookup_global(&self, module: &str, name: &str) -> Option<Val> {
        self.globals
            .get(&(module.to_string(), name.to_string()))
            .copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.funcs.values().map(HashMap::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Call `symbol` on behalf of the guest running in `exec_env`.
///
/// Arguments are type-checked against the signature, then every pointer and
/// string argument is validated against the module instance. A failed
/// validation leaves the out-of-bounds exception on the instance and the host
/// function is not called.
pub fn invoke(exec_env: &ExecEnv, symbol: &NativeSymbol, args: &[Val]) -> Result<Option<Val>> {
    let inst = exec_env.module_inst();
    if inst.is_terminating() {
        return Err(Error::Terminated);
    }
    symbol.signature.check_args(args)?;

    let params = &symbol.signature.params;
    for (index, kind) in params.iter().enumerate() {
        let offset = args[index].as_u32().unwrap_or_default();
        let valid = match kind {
            ParamKind::Ptr => {
                let len = match params.get(index + 1) {
                    Some(ParamKind::BufLen) => args[index + 1].as_u32().unwrap_or_default(),
                    _ => 1,
                };
                inst.validate_app_addr(offset, len)
            }
            ParamKind::Str => inst.validate_app_str_addr(offset),
            _ => true,
        };
        if !valid {
            tracing::debug!(
                "native {} argument {index} fails validation at {offset:#x}",
                symbol.name
            );
            return Err(Error::OutOfBounds {
                offset: u64::from(offset),
                size: 0,
            });
        }
    }

    let result = (symbol.func)(exec_env, args).inspect_err(|e| {
        if inst.get_exception().is_none() {
            match e {
                Error::Exception(message) => inst.set_exception(message),
                other => inst.set_exception(&other.to_string()),
            }
        }
    })?;
    if result.map(|v| v.ty()) != symbol.signature.result {
        let message = format!(
            "native {} returned {:?}, signature is {}",
            symbol.name, result, symbol.signature
        );
        inst.set_exception(&message);
        return Err(Error::SignatureMismatch(message));
    }
    Ok(result)
}

/// Trap for a call to an import nothing was linked to.
pub(crate) fn unlinked_import(inst: &ModuleInstance, module: &str, name: &str) -> Error {
    const MESSAGE: &str = "failed to call unlinked import function";
    tracing::warn!("call to unlinked import {module}.{name}");
    inst.set_exception(MESSAGE);
    Error::Exception(MESSAGE.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_signature() {
        let sig: Signature = "(i*~$)i".parse().expect("parse");
        assert_eq!(
            sig.params(),
            &[ParamKind::I32, ParamKind::Ptr, ParamKind::BufLen, ParamKind::Str]
        );
        assert_eq!(sig.result(), Some(ValType::I32));
        assert_eq!(sig.to_string(), "(i*~$)i");

        let sig: Signature = "(IfF)".parse().expect("parse");
        assert_eq!(sig.result(), None);
    }

    #[test]
    fn test_reject_malformed_signatures() {
        for bad in ["i)i", "(i", "(~)", "(i~)", "(x)", "(i)ii", "(i)*"] {
            assert!(
                matches!(bad.parse::<Signature>(), Err(Error::InvalidSignature { .. })),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_matches_func_type() {
        use wasmparser::ValType as W;
        let sig: Signature = "(*~I)f".parse().expect("parse");
        let good = wasmparser::FuncType::new([W::I32, W::I32, W::I64], [W::F32]);
        let bad = wasmparser::FuncType::new([W::I32, W::I32], [W::F32]);
        assert!(sig.matches(&good));
        assert!(!sig.matches(&bad));
    }

    #[test]
    fn test_check_args() {
        let sig: Signature = "(*I)".parse().expect("parse");
        assert!(sig.check_args(&[Val::I32(0), Val::I64(0)]).is_ok());
        assert!(sig.check_args(&[Val::I32(0)]).is_err());
        assert!(sig.check_args(&[Val::I64(0), Val::I64(0)]).is_err());
    }

    #[test]
    fn test_registry_lookup() {
        let mut natives = NativeRegistry::new();
        assert!(natives.is_empty());
        natives
            .register("env", "noop", "()", |_, _| Ok(None))
            .expect("register");
        natives.register_global("env", "g", Val::I32(3));
        assert_eq!(natives.len(), 1);
        assert!(natives.lookup("env", "noop").is_some());
        assert!(natives.lookup("env", "other").is_none());
        assert_eq!(natives.lookup_global("env", "g"), Some(Val::I32(3)));
        assert!(natives.register("env", "bad", "(~)", |_, _| Ok(None)).is_err());
    }
}
