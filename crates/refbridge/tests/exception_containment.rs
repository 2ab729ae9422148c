//! Exceptions never unwind across the foreign boundary untranslated.

mod common;

use std::sync::Arc;
use std::thread;

use refbridge::{
    ForeignBridge, ForeignErrorObject, ManagedException, RetainReleaseSystem, ThreadKind,
    ThreadState,
};

fn bridge(system: RetainReleaseSystem) -> ForeignBridge<RetainReleaseSystem> {
    let (_, runtime) = common::runtime();
    ForeignBridge::new(runtime, system)
}

#[test]
fn test_returned_exception_becomes_error() {
    let bridge = bridge(RetainReleaseSystem::new("Demo"));
    let err = bridge
        .call_from_foreign(|| -> Result<(), _> {
            Err(ManagedException::new("IllegalStateException", "closed"))
        })
        .unwrap_err();
    assert_eq!(err.domain, "Demo");
    assert_eq!(err.description, "IllegalStateException: closed");
}

#[test]
fn test_thrown_exception_becomes_error() {
    let bridge = bridge(RetainReleaseSystem::new("Demo"));
    let err = bridge
        .call_from_foreign(|| -> Result<u32, _> {
            ManagedException::new("ArithmeticException", "divide by zero").throw()
        })
        .unwrap_err();
    assert_eq!(
        err.exception,
        Some(ManagedException::new("ArithmeticException", "divide by zero"))
    );
}

#[test]
fn test_foreign_error_round_trips_through_nested_calls() {
    let bridge = bridge(RetainReleaseSystem::new("Demo"));
    let runtime = Arc::clone(bridge.runtime());
    let _attached = runtime.attach_current_thread(ThreadKind::Mutator);

    // managed -> foreign -> managed, where the innermost managed code throws.
    let outcome = bridge.call_foreign(|| {
        assert_eq!(runtime.threads().current_state(), Some(ThreadState::Native));
        bridge.call_from_foreign(|| -> Result<(), _> {
            assert!(runtime.threads().is_runnable());
            Err(ManagedException::new("IoException", "pipe closed"))
        })
    });

    assert_eq!(
        outcome.unwrap_err(),
        ManagedException::new("IoException", "pipe closed")
    );
    assert!(runtime.threads().is_runnable());
}

#[test]
fn test_plain_foreign_error_gets_generic_exception() {
    let bridge = bridge(RetainReleaseSystem::new("Demo"));
    let runtime = Arc::clone(bridge.runtime());
    let _attached = runtime.attach_current_thread(ThreadKind::Mutator);

    let exception = bridge
        .call_foreign(|| -> Result<(), _> {
            Err(ForeignErrorObject {
                domain: "NSPOSIXErrorDomain".into(),
                code: 2,
                description: "No such file".into(),
                exception: None,
            })
        })
        .unwrap_err();
    assert_eq!(exception.class_name, "ForeignException");
    assert!(exception.message.contains("No such file"));
}

#[test]
fn test_foreign_thread_callbacks_leave_it_native() {
    let bridge = Arc::new(bridge(RetainReleaseSystem::new("Demo")));
    let worker = Arc::clone(&bridge);
    thread::spawn(move || {
        for i in 0..3 {
            let value = worker.call_from_foreign(|| Ok(i * 2)).unwrap();
            assert_eq!(value, i * 2);
            assert_eq!(
                worker.runtime().threads().current_state(),
                Some(ThreadState::Native)
            );
        }
    })
    .join()
    .unwrap();
}

#[test]
#[should_panic(expected = "exception could not cross the foreign boundary")]
fn test_undeclared_exception_terminates() {
    let bridge = bridge(RetainReleaseSystem::new("Demo").with_declared_exceptions(["IoException"]));
    let _ = bridge.call_from_foreign(|| -> Result<(), _> {
        Err(ManagedException::new("NullPointerException", "oops"))
    });
}

#[test]
#[should_panic(expected = "exception could not cross the foreign boundary")]
fn test_non_exception_panic_terminates() {
    let bridge = bridge(RetainReleaseSystem::new("Demo"));
    let _ = bridge.call_from_foreign(|| -> Result<(), ManagedException> {
        panic!("not a managed exception")
    });
}
