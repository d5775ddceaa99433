use std::sync::Arc;
use std::thread;

use wasm_sandbox::config::RuntimeConfig;
use wasm_sandbox::test_harness::*;
use wasm_sandbox::{Error, Runtime};

#[test]
fn test_two_instances_share_one_heap() {
    let runtime = Runtime::new(RuntimeConfig::default());
    let heap = runtime.create_shared_heap(64 * 1024).expect("shared heap");
    let a = instantiate_wat_with(&runtime, "(module (memory 1))").expect("a");
    let b = instantiate_wat_with(&runtime, "(module (memory 2))").expect("b");
    a.attach_shared_heap(Arc::clone(&heap)).expect("attach a");
    b.attach_shared_heap(Arc::clone(&heap)).expect("attach b");

    let (offset, ptr_a) = a.module_shared_malloc(32).expect("shared malloc");
    a.write_app_bytes(offset, b"from a\0").expect("write");

    assert!(b.validate_app_addr(offset, 32));
    assert_eq!(b.read_app_str(offset).expect("read"), "from a");
    assert_eq!(b.addr_app_to_native(offset), Some(ptr_a));
    assert_eq!(b.addr_native_to_app(ptr_a), Some(offset));
    assert_eq!(
        b.get_app_addr_range(offset),
        Some(u64::from(heap.start_offset())..1 << 32)
    );

    b.module_shared_free(offset).expect("free through b");
    assert!(a.module_shared_free(offset).is_err());
}

#[test]
fn test_shared_heap_and_instance_heap_coexist() {
    let inst = instantiate_wat("(module (memory 1))").expect("instantiate");
    let heap = Runtime::default().create_shared_heap(8192).expect("shared heap");
    inst.attach_shared_heap(Arc::clone(&heap)).expect("attach");

    let (private, _) = inst.module_malloc(64).expect("private");
    let (shared, _) = inst.module_shared_malloc(64).expect("shared");
    assert!(u64::from(private) < inst.default_memory().expect("memory").memory_data_size());
    assert!(shared >= heap.start_offset());

    inst.module_free(private).expect("free private");
    inst.module_free(shared).expect("free shared");
    assert_eq!(heap.stats().live_blocks, 0);
}

#[test]
fn test_shared_heap_accesses_are_bounds_checked() {
    let inst = instantiate_wat("(module (memory 1))").expect("instantiate");
    let heap = Runtime::default().create_shared_heap(4096).expect("shared heap");
    inst.attach_shared_heap(Arc::clone(&heap)).expect("attach");

    let top = u32::MAX;
    assert!(inst.validate_app_addr(top, 1));
    assert!(!inst.validate_app_addr(top, 2));
    // Between the end of linear memory and the start of the shared heap.
    assert!(!inst.validate_app_addr(heap.start_offset() - 1, 1));
    let end = u32::try_from(inst.default_memory().expect("memory").memory_data_size())
        .expect("end");
    assert!(inst.validate_app_addr(end - 1, 1));
    assert!(!inst.validate_app_addr(end, 1));
    assert!(matches!(
        inst.read_app_bytes(heap.start_offset() - 4, 8),
        Err(Error::OutOfBounds { .. })
    ));
}

#[test]
fn test_shared_malloc_without_heap() {
    let inst = instantiate_wat("(module (memory 1))").expect("instantiate");
    assert!(matches!(
        inst.module_shared_malloc(8),
        Err(Error::NoSharedHeap)
    ));
}

#[test]
fn test_concurrent_shared_allocations() {
    let runtime = Runtime::default();
    let heap = runtime.create_shared_heap(256 * 1024).expect("shared heap");
    let instances: Vec<_> = (0..4)
        .map(|_| {
            let inst = instantiate_wat_with(&runtime, "(module (memory 1))").expect("instantiate");
            inst.attach_shared_heap(Arc::clone(&heap)).expect("attach");
            inst
        })
        .collect();

    let workers: Vec<_> = instances
        .iter()
        .enumerate()
        .map(|(id, inst)| {
            let inst = Arc::clone(inst);
            thread::spawn(move || {
                let mut blocks = Vec::new();
                for _ in 0..100 {
                    let (offset, _) = inst.module_shared_malloc(48).expect("malloc");
                    inst.with_app_bytes_mut(offset, 48, |b| b.fill(id as u8 + 1))
                        .expect("fill");
                    blocks.push((offset, 48));
                }
                for &(offset, len) in &blocks {
                    inst.with_app_bytes(offset, len, |b| {
                        assert!(b.iter().all(|&x| x == id as u8 + 1));
                    })
                    .expect("read");
                }
                blocks
            })
        })
        .collect();

    let mut all = Vec::new();
    for worker in workers {
        all.extend(worker.join().expect("worker"));
    }
    assert_eq!(all.len(), 400);
    assert_disjoint(&all);
    assert_eq!(heap.stats().live_blocks, 400);
}
