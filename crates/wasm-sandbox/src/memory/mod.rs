pub mod bounds;
pub mod heap;
pub mod linear;
pub mod translate;

pub use bounds::{AddressSpace, validate_range, validate_str};
pub use heap::{AllocPolicy, HeapAllocator, HeapStats};
pub use linear::{MemoryInstance, MemoryView, MemoryViewMut};
pub use translate::NativePtr;
