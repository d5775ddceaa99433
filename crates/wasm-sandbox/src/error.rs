/// Exception text stored on a module instance when a guest-supplied address
/// fails validation.
pub const EXCEPTION_OUT_OF_BOUNDS: &str = "out of bounds memory access";

/// Exception text stored on a module instance when the app heap is exhausted.
pub const EXCEPTION_OUT_OF_MEMORY: &str = "out of memory";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("WASM parsing error: {0}")]
    WasmParse(#[from] wasmparser::BinaryReaderError),

    #[error("invalid memory limits: initial {initial} pages, maximum {max} pages")]
    InvalidLimits { initial: u32, max: u32 },

    #[error("allocate memory failed: {0}")]
    OutOfMemory(String),

    #[error("memory size limit exceeded: {requested} pages requested, maximum is {max}")]
    LimitExceeded { requested: u64, max: u32 },

    #[error("out of bounds memory access (offset {offset}, size {size})")]
    OutOfBounds { offset: u64, size: u64 },

    #[error("address {0:#x} is not a live allocation of this heap")]
    InvalidFree(u64),

    #[error("module instance has no linear memory")]
    NoMemory,

    #[error("memory index {0} out of range")]
    MemoryIndex(u32),

    #[error("table index {0} out of range")]
    TableIndex(u32),

    #[error("out of bounds table access (index {index}, table size {size})")]
    TableOutOfBounds { index: u64, size: u32 },

    #[error("global index {0} out of range")]
    GlobalIndex(u32),

    #[error("global {0} is immutable")]
    ImmutableGlobal(u32),

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("no shared heap is attached to the module instance")]
    NoSharedHeap,

    #[error("linear memory would overlap the shared heap")]
    SharedHeapOverlap,

    #[error("invalid size of shared heap: {0}")]
    InvalidSharedHeapSize(u64),

    #[error("invalid native signature {signature:?}: {reason}")]
    InvalidSignature { signature: String, reason: String },

    #[error("native call signature mismatch: {0}")]
    SignatureMismatch(String),

    #[error("unresolved import: {0}")]
    UnresolvedImport(String),

    #[error("instantiation failed: {0}")]
    Instantiation(String),

    #[error("Unsupported WASM feature: {0}")]
    Unsupported(String),

    #[error("module instance is terminated")]
    Terminated,

    #[error("Exception: {0}")]
    Exception(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
