// Parsing code narrows WASM u64 limit fields to the u32 page and element
// counts the runtime works with, after checking them.
#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]

use std::sync::Arc;

use wasmparser::{ExternalKind, Operator, Parser, Payload, TypeRef};

use super::global::{GlobalInstance, Val, ValType};
use super::table::TableInstance;
use super::{Export, ExportKind, InstanceParts, LinkedImport, ModuleInstance};
use crate::config::{MAX_PAGE_COUNT, RuntimeConfig};
use crate::memory::MemoryInstance;
use crate::memory::linear::pages_to_bytes;
use crate::native::NativeRegistry;
use crate::{Error, Result};

/// Declared linear memory, imported or defined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryDecl {
    pub initial_pages: u32,
    pub max_pages: u32,
    pub shared: bool,
    /// `(module, name)` when the memory is imported.
    pub import: Option<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDecl {
    pub initial: u32,
    pub max: Option<u32>,
    pub import: Option<(String, String)>,
}

/// One step of a constant expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstOp {
    Push(Val),
    GlobalGet(u32),
    I32Add,
    I32Sub,
    I32Mul,
    I64Add,
    I64Sub,
    I64Mul,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobalInit {
    Import { module: String, name: String },
    Expr(Vec<ConstOp>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalDecl {
    pub ty: ValType,
    pub mutable: bool,
    pub init: GlobalInit,
}

/// Active data segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSegment {
    pub memory_index: u32,
    pub offset: Vec<ConstOp>,
    pub data: Vec<u8>,
}

/// Active element segment; `None` items are null references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementSegment {
    pub table_index: u32,
    pub offset: Vec<ConstOp>,
    pub items: Vec<Option<u32>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuncImport {
    pub module: String,
    pub name: String,
    pub ty: wasmparser::FuncType,
}

/// What instantiation needs from a validated WASM binary.
#[derive(Debug, Clone, Default)]
pub struct Module {
    pub memories: Vec<MemoryDecl>,
    pub tables: Vec<TableDecl>,
    pub globals: Vec<GlobalDecl>,
    pub data_segments: Vec<DataSegment>,
    pub element_segments: Vec<ElementSegment>,
    /// Function imports in function index order.
    pub func_imports: Vec<FuncImport>,
    pub exports: Vec<Export>,
}

impl Module {
    /// Validate `wasm` and extract its memories, tables, globals, segments,
    /// imports and exports.
    pub fn from_binary(wasm: &[u8]) -> Result<Self> {
        wasmparser::validate(wasm)?;

        let mut module = Module::default();
        let mut func_types: Vec<wasmparser::FuncType> = Vec::new();

        for payload in Parser::new(0).parse_all(wasm) {
            match payload? {
                Payload::TypeSection(reader) => {
                    for rec_group in reader {
                        for sub_type in rec_group?.into_types() {
                            if let wasmparser::CompositeInnerType::Func(f) =
                                &sub_type.composite_type.inner
                            {
                                func_types.push(f.clone());
                            }
                        }
                    }
                }
                Payload::ImportSection(reader) => {
                    for import in reader {
                        let import = import?;
                        let names = (import.module.to_string(), import.name.to_string());
                        match import.ty {
                            TypeRef::Func(type_idx) => {
                                let ty = func_types.get(type_idx as usize).cloned().ok_or_else(
                                    || Error::Internal(format!("missing function type {type_idx}")),
                                )?;
                                module.func_imports.push(FuncImport {
                                    module: names.0,
                                    name: names.1,
                                    ty,
                                });
                            }
                            TypeRef::Memory(ty) => {
                                module.memories.push(memory_decl(&ty, Some(names))?);
                            }
                            TypeRef::Table(ty) => {
                                module.tables.push(table_decl(&ty, Some(names))?);
                            }
                            TypeRef::Global(ty) => module.globals.push(GlobalDecl {
                                ty: ValType::from_wasm(ty.content_type)?,
                                mutable: ty.mutable,
                                init: GlobalInit::Import {
                                    module: names.0,
                                    name: names.1,
                                },
                            }),
                            TypeRef::Tag(_) => {
                                return Err(Error::Unsupported("tag imports".into()));
                            }
                        }
                    }
                }
                Payload::TableSection(reader) => {
                    for table in reader {
                        module.tables.push(table_decl(&table?.ty, None)?);
                    }
                }
                Payload::MemorySection(reader) => {
                    for memory in reader {
                        module.memories.push(memory_decl(&memory?, None)?);
                    }
                }
                Payload::GlobalSection(reader) => {
                    for global in reader {
                        let g = global?;
                        module.globals.push(GlobalDecl {
                            ty: ValType::from_wasm(g.ty.content_type)?,
                            mutable: g.ty.mutable,
                            init: GlobalInit::Expr(read_const_expr(&g.init_expr)?),
                        });
                    }
                }
                Payload::ExportSection(reader) => {
                    for export in reader {
                        let export = export?;
                        let kind = match export.kind {
                            ExternalKind::Func => ExportKind::Func,
                            ExternalKind::Table => ExportKind::Table,
                            ExternalKind::Memory => ExportKind::Memory,
                            ExternalKind::Global => ExportKind::Global,
                            ExternalKind::Tag => continue,
                        };
                        module.exports.push(Export {
                            name: export.name.to_string(),
                            kind,
                            index: export.index,
                        });
                    }
                }
                Payload::ElementSection(reader) => {
                    for element in reader {
                        let element = element?;
                        let wasmparser::ElementKind::Active {
                            table_index,
                            offset_expr,
                        } = element.kind
                        else {
                            continue;
                        };
                        let items = match element.items {
                            wasmparser::ElementItems::Functions(reader) => reader
                                .into_iter()
                                .map(|idx| idx.map(Some))
                                .collect::<std::result::Result<_, _>>()?,
                            wasmparser::ElementItems::Expressions(_, reader) => {
                                let mut items = Vec::new();
                                for expr in reader {
                                    items.push(read_const_ref(&expr?)?);
                                }
                                items
                            }
                        };
                        module.element_segments.push(ElementSegment {
                            table_index: table_index.unwrap_or(0),
                            offset: read_const_expr(&offset_expr)?,
                            items,
                        });
                    }
                }
                Payload::DataSection(reader) => {
                    for data in reader {
                        let data = data?;
                        if let wasmparser::DataKind::Active {
                            memory_index,
                            offset_expr,
                        } = data.kind
                        {
                            module.data_segments.push(DataSegment {
                                memory_index,
                                offset: read_const_expr(&offset_expr)?,
                                data: data.data.to_vec(),
                            });
                        }
                    }
                }
                _ => {}
            }
        }

        tracing::debug!(
            memories = module.memories.len(),
            tables = module.tables.len(),
            globals = module.globals.len(),
            func_imports = module.func_imports.len(),
            data_segments = module.data_segments.len(),
            "parsed module"
        );
        Ok(module)
    }
}

fn memory_decl(
    ty: &wasmparser::MemoryType,
    import: Option<(String, String)>,
) -> Result<MemoryDecl> {
    if ty.memory64 {
        return Err(Error::Unsupported("memory64".into()));
    }
    if ty.page_size_log2.is_some_and(|log2| log2 != 16) {
        return Err(Error::Unsupported("custom page sizes".into()));
    }
    let initial_pages = u32::try_from(ty.initial)
        .map_err(|_| Error::Unsupported(format!("{} initial pages", ty.initial)))?;
    let max_pages = ty
        .maximum
        .map_or(MAX_PAGE_COUNT, |max| max.min(u64::from(MAX_PAGE_COUNT)) as u32);
    Ok(MemoryDecl {
        initial_pages,
        max_pages,
        shared: ty.shared,
        import,
    })
}

fn table_decl(ty: &wasmparser::TableType, import: Option<(String, String)>) -> Result<TableDecl> {
    let initial = u32::try_from(ty.initial)
        .map_err(|_| Error::Unsupported(format!("table of {} elements", ty.initial)))?;
    Ok(TableDecl {
        initial,
        max: ty.maximum.map(|max| max.min(u64::from(u32::MAX)) as u32),
        import,
    })
}

fn read_const_expr(expr: &wasmparser::ConstExpr) -> Result<Vec<ConstOp>> {
    let mut ops = Vec::new();
    let mut reader = expr.get_binary_reader();
    while !reader.eof() {
        let op = match reader.read_operator()? {
            Operator::I32Const { value } => ConstOp::Push(Val::I32(value)),
            Operator::I64Const { value } => ConstOp::Push(Val::I64(value)),
            Operator::F32Const { value } => ConstOp::Push(Val::F32(value.bits())),
            Operator::F64Const { value } => ConstOp::Push(Val::F64(value.bits())),
            Operator::GlobalGet { global_index } => ConstOp::GlobalGet(global_index),
            Operator::I32Add => ConstOp::I32Add,
            Operator::I32Sub => ConstOp::I32Sub,
            Operator::I32Mul => ConstOp::I32Mul,
            Operator::I64Add => ConstOp::I64Add,
            Operator::I64Sub => ConstOp::I64Sub,
            Operator::I64Mul => ConstOp::I64Mul,
            Operator::End => break,
            other => {
                return Err(Error::Unsupported(format!(
                    "constant expression operator {other:?}"
                )));
            }
        };
        ops.push(op);
    }
    Ok(ops)
}

fn read_const_ref(expr: &wasmparser::ConstExpr) -> Result<Option<u32>> {
    let mut reader = expr.get_binary_reader();
    match reader.read_operator()? {
        Operator::RefFunc { function_index } => Ok(Some(function_index)),
        Operator::RefNull { .. } => Ok(None),
        other => Err(Error::Unsupported(format!(
            "element expression operator {other:?}"
        ))),
    }
}

/// Evaluate a constant expression against the globals initialized so far.
pub(crate) fn eval_const(ops: &[ConstOp], globals: &[GlobalInstance]) -> Result<Val> {
    let mut stack: Vec<Val> = Vec::with_capacity(2);
    for op in ops {
        let value = match *op {
            ConstOp::Push(v) => v,
            ConstOp::GlobalGet(idx) => globals
                .get(idx as usize)
                .map(GlobalInstance::get)
                .ok_or(Error::GlobalIndex(idx))?,
            binary => {
                let rhs = stack.pop();
                let lhs = stack.pop();
                match (binary, lhs, rhs) {
                    (ConstOp::I32Add, Some(Val::I32(a)), Some(Val::I32(b))) => {
                        Val::I32(a.wrapping_add(b))
                    }
                    (ConstOp::I32Sub, Some(Val::I32(a)), Some(Val::I32(b))) => {
                        Val::I32(a.wrapping_sub(b))
                    }
                    (ConstOp::I32Mul, Some(Val::I32(a)), Some(Val::I32(b))) => {
                        Val::I32(a.wrapping_mul(b))
                    }
                    (ConstOp::I64Add, Some(Val::I64(a)), Some(Val::I64(b))) => {
                        Val::I64(a.wrapping_add(b))
                    }
                    (ConstOp::I64Sub, Some(Val::I64(a)), Some(Val::I64(b))) => {
                        Val::I64(a.wrapping_sub(b))
                    }
                    (ConstOp::I64Mul, Some(Val::I64(a)), Some(Val::I64(b))) => {
                        Val::I64(a.wrapping_mul(b))
                    }
                    _ => {
                        return Err(Error::Internal(format!(
                            "ill-typed constant expression at {binary:?}"
                        )));
                    }
                }
            }
        };
        stack.push(value);
    }
    match stack.as_slice() {
        [value] => Ok(*value),
        _ => Err(Error::Internal(
            "constant expression must leave exactly one value".into(),
        )),
    }
}

fn eval_offset(ops: &[ConstOp], globals: &[GlobalInstance]) -> Result<u32> {
    eval_const(ops, globals)?
        .as_u32()
        .ok_or_else(|| Error::Instantiation("segment offset is not an i32".into()))
}

/// Build a module instance: globals, memories (the first one gets the app
/// heap in pages above its declared size), tables, linked imports, then
/// element and data segments.
pub(crate) fn instantiate(
    module: &Module,
    config: &RuntimeConfig,
    natives: &NativeRegistry,
) -> Result<ModuleInstance> {
    let mut globals: Vec<GlobalInstance> = Vec::with_capacity(module.globals.len());
    for (index, decl) in module.globals.iter().enumerate() {
        let value = match &decl.init {
            GlobalInit::Import { module, name } => natives
                .lookup_global(module, name)
                .ok_or_else(|| Error::UnresolvedImport(format!("global {module}.{name}")))?,
            GlobalInit::Expr(ops) => eval_const(ops, &globals)?,
        };
        if value.ty() != decl.ty {
            return Err(Error::TypeMismatch(format!(
                "global {index} declared {}, initialized with {}",
                decl.ty,
                value.ty()
            )));
        }
        globals.push(GlobalInstance::new(value, decl.mutable));
    }

    let no_heap = config.clone().with_heap_size(0);
    let mut memories = Vec::with_capacity(module.memories.len());
    for (index, decl) in module.memories.iter().enumerate() {
        let memory_config = if index == 0 { config } else { &no_heap };
        if let Some((module_name, name)) = &decl.import {
            tracing::debug!("creating imported memory {module_name}.{name}");
        }
        let memory = MemoryInstance::create_with_heap_pages(
            decl.initial_pages,
            decl.max_pages,
            decl.shared,
            memory_config,
        )?;
        memories.push(Arc::new(memory));
    }

    let mut tables = module
        .tables
        .iter()
        .map(|decl| TableInstance::new(decl.initial, decl.max))
        .collect::<Result<Vec<_>>>()?;

    let imports = module
        .func_imports
        .iter()
        .map(|import| link_import(import, natives))
        .collect::<Result<Vec<_>>>()?;

    for segment in &module.element_segments {
        let offset = eval_offset(&segment.offset, &globals)?;
        let table = tables
            .get_mut(segment.table_index as usize)
            .ok_or(Error::TableIndex(segment.table_index))?;
        table
            .init(offset, &segment.items)
            .map_err(|_| Error::Instantiation("out of bounds table access".into()))?;
    }

    for segment in &module.data_segments {
        let offset = eval_offset(&segment.offset, &globals)?;
        let memory = memories
            .get(segment.memory_index as usize)
            .ok_or(Error::MemoryIndex(segment.memory_index))?;
        // Segments must land in the declared pages, never in the app heap.
        let declared = module.memories[segment.memory_index as usize].initial_pages;
        let end = u64::from(offset) + segment.data.len() as u64;
        if end > pages_to_bytes(declared) {
            return Err(Error::Instantiation("data segment does not fit".into()));
        }
        memory
            .write(offset, &segment.data)
            .map_err(|_| Error::Instantiation("data segment does not fit".into()))?;
    }

    Ok(ModuleInstance::from_parts(InstanceParts {
        memories,
        tables,
        globals,
        imports,
        exports: module.exports.clone(),
    }))
}

fn link_import(import: &FuncImport, natives: &NativeRegistry) -> Result<LinkedImport> {
    let symbol = match natives.lookup(&import.module, &import.name) {
        Some(symbol) if !symbol.signature().matches(&import.ty) => {
            return Err(Error::Instantiation(format!(
                "import {}.{} expects {:?}, native signature is {}",
                import.module,
                import.name,
                import.ty,
                symbol.signature()
            )));
        }
        Some(symbol) => Some(symbol.clone()),
        None => {
            tracing::warn!(
                "failed to link import function ({}, {})",
                import.module,
                import.name
            );
            None
        }
    };
    Ok(LinkedImport {
        module: import.module.clone(),
        name: import.name.clone(),
        symbol,
    })
}
