//! End-to-end scenarios on a one-page memory that may grow to two pages.

use std::sync::Arc;

use wasm_sandbox::error::EXCEPTION_OUT_OF_BOUNDS;
use wasm_sandbox::test_harness::*;
use wasm_sandbox::{Error, MemoryInstance, ModuleInstance};

const PAGE: u64 = 65536;

fn one_of_two_pages() -> Arc<ModuleInstance> {
    ModuleInstance::with_memories(vec![MemoryInstance::create(1, 2, false).expect("memory")])
}

#[test]
fn test_malloc_survives_grow() {
    let inst = one_of_two_pages();
    let memory = Arc::clone(inst.default_memory().expect("memory"));
    assert_eq!(memory.memory_data_size(), PAGE);

    let (offset, _) = inst.module_malloc(100).expect("malloc");
    assert!(offset >= memory.heap_base_offset());
    assert!(inst.validate_app_addr(offset, 100));

    let payload: Vec<u8> = (0..100u8).collect();
    inst.write_app_bytes(offset, &payload).expect("write");

    assert_eq!(inst.memory_grow(1), 1);
    assert_eq!(memory.memory_data_size(), 2 * PAGE);

    assert!(inst.validate_app_addr(offset, 100));
    assert_eq!(inst.read_app_bytes(offset, 100).expect("read"), payload);
    assert!(inst.get_exception().is_none());
}

#[test]
fn test_grow_past_max_reports_minus_one() {
    let inst = one_of_two_pages();
    assert_eq!(inst.memory_grow(1), 1);
    assert_eq!(inst.memory_grow(2), -1);
    assert_eq!(
        inst.default_memory().expect("memory").memory_data_size(),
        2 * PAGE
    );
    assert_eq!(inst.memory_size(), 2);

    // The instance stays usable after the failure.
    assert!(inst.module_malloc(16).is_ok());
}

#[test]
fn test_unterminated_string_is_rejected() {
    let inst = one_of_two_pages();
    let memory = inst.default_memory().expect("memory");
    memory.view_mut().fill(65000, 536, b'x').expect("fill");

    assert!(!inst.validate_app_str_addr(65000));
    assert_eq!(inst.get_exception().as_deref(), Some(EXCEPTION_OUT_OF_BOUNDS));
    assert!(matches!(
        inst.read_app_str(65000),
        Err(Error::OutOfBounds { .. })
    ));

    inst.clear_exception();
    memory.write(65535, &[0]).expect("terminate");
    assert!(inst.validate_app_str_addr(65000));
    assert_eq!(inst.read_app_str(65000).expect("str").len(), 535);
}

#[test]
fn test_boundary_checks() {
    let inst = one_of_two_pages();
    assert!(inst.validate_app_addr(65535, 1));
    assert!(!inst.validate_app_addr(65536, 1));
    assert!(!inst.validate_app_addr(65535, 2));
    assert!(!inst.validate_app_addr(0xFFFF_FFFF, 1));
    assert!(inst.validate_app_addr(65536, 0));
}

#[test]
fn test_double_free_is_reported() {
    let inst = one_of_two_pages();
    let (offset, _) = inst.module_malloc(24).expect("malloc");
    inst.module_free(offset).expect("first free");
    assert!(matches!(
        inst.module_free(offset),
        Err(Error::InvalidFree(_))
    ));
    // A foreign address is rejected the same way.
    assert!(inst.module_free(8).is_err());
}

#[test]
fn test_scenarios_through_wat() {
    let inst = instantiate_wat(r#"(module (memory (export "memory") 1 2))"#).expect("instantiate");
    let memory = inst.exported_memory("memory").expect("exported memory");
    fill_pattern(memory, 0..1024, 3);
    let (offset, _) = inst.module_malloc(100).expect("malloc");
    assert!(offset >= 65536);
    assert_eq!(inst.memory_grow(1), 2);
    assert_eq!(inst.memory_grow(2), -1);
    assert_pattern(memory, 0..1024, 3);
    assert!(inst.validate_app_addr(offset, 100));
}
