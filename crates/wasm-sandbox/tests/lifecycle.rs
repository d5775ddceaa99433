use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use wasm_sandbox::instance::EXCEPTION_TERMINATED;
use wasm_sandbox::test_harness::*;
use wasm_sandbox::{Error, ExecEnv, InstanceState};

#[test]
fn test_state_transitions() {
    let inst = instantiate_wat("(module (memory 1))").expect("instantiate");
    assert_eq!(inst.state(), InstanceState::Instantiated);

    let env = ExecEnv::new(&inst).expect("exec env");
    assert_eq!(inst.state(), InstanceState::Running);

    assert!(!inst.validate_app_addr(200_000, 1));
    assert_eq!(inst.state(), InstanceState::ExceptionPending);
    inst.clear_exception();
    assert_eq!(inst.state(), InstanceState::Running);
    drop(env);

    let observer = Arc::clone(&inst);
    inst.deinstantiate();
    assert_eq!(observer.state(), InstanceState::Destroyed);
    assert!(matches!(ExecEnv::new(&observer), Err(Error::Terminated)));
}

#[test]
fn test_deinstantiate_waits_for_blocked_thread() {
    let inst = instantiate_wat("(module (memory 1))").expect("instantiate");
    let (ready_tx, ready_rx) = mpsc::channel();

    let worker = {
        let inst = Arc::clone(&inst);
        thread::spawn(move || {
            let env = ExecEnv::new(&inst).expect("exec env");
            drop(inst);
            ready_tx.send(()).expect("signal");
            // A host call that keeps blocking until asked to stop.
            let mut rounds = 0u32;
            while env.begin_blocking_op() {
                thread::sleep(Duration::from_millis(1));
                env.end_blocking_op();
                rounds += 1;
            }
            assert_eq!(
                env.module_inst().get_exception().as_deref(),
                Some(EXCEPTION_TERMINATED)
            );
            rounds
        })
    };

    ready_rx.recv().expect("worker started");
    assert_eq!(inst.exec_env_count(), 1);
    let observer = Arc::clone(&inst);
    inst.deinstantiate();

    worker.join().expect("worker");
    assert_eq!(observer.exec_env_count(), 0);
    assert_eq!(observer.state(), InstanceState::Destroyed);
}

#[test]
fn test_terminate_is_sticky_for_blocking_ops() {
    let inst = instantiate_wat("(module (memory 1))").expect("instantiate");
    let env = ExecEnv::new(&inst).expect("exec env");
    inst.terminate();
    inst.clear_exception();
    assert!(inst.is_terminating());
    assert!(!env.begin_blocking_op());
}

#[test]
fn test_memory_outlives_deinstantiation_while_referenced() {
    let inst = instantiate_wat("(module (memory 1))").expect("instantiate");
    let memory = Arc::clone(inst.default_memory().expect("memory"));
    memory.write(8, b"kept").expect("write");
    inst.deinstantiate();
    let mut buf = [0u8; 4];
    memory.read(8, &mut buf).expect("read");
    assert_eq!(&buf, b"kept");
}
