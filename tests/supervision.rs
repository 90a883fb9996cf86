//! Supervision scopes interrupt the children still running at scope exit.

use filament::{Defect, Exit, Fiber, IO, Never, Runtime, RtsConfig};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

fn runtime() -> Runtime {
    Runtime::with_config(RtsConfig::default().with_thread_pool_size(4))
}

type FiberSlot = Arc<Mutex<Option<Fiber<Never, i32>>>>;

#[test]
fn supervise_interrupts_leaked_children() {
    let rts = runtime();
    let scope = Defect::new("scope");
    let leaked: FiberSlot = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&leaked);

    let program = IO::<Never, i32>::never()
        .fork::<Never>()
        .flat_map(move |child| {
            slot.lock().replace(child);
            IO::now(0)
        })
        .supervised(scope.clone());

    // The parent completes normally; the leaked child is interrupted with
    // the scope's cause before the supervised region returns.
    assert_eq!(rts.run(program), Ok(0));
    let child = leaked.lock().take().expect("child handle stored");
    assert_eq!(
        rts.run_exit(child.join().run::<Never>()),
        Exit::Completed(Exit::Terminated(scope))
    );
    assert!(rts.shutdown_and_wait(Duration::from_secs(5)));
}

#[test]
fn completed_children_are_not_disturbed() {
    let rts = runtime();
    let done: FiberSlot = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&done);

    let program = IO::<Never, i32>::now(11)
        .fork::<Never>()
        .flat_map(move |child| {
            let keep = child.clone();
            // Wait for the child to finish before leaving the scope.
            child.join().map(move |value| {
                slot.lock().replace(keep);
                value
            })
        })
        .supervised(Defect::new("scope"));

    assert_eq!(rts.run(program), Ok(11));
    let child = done.lock().take().expect("child handle stored");
    assert_eq!(
        rts.run_exit(child.join().run::<Never>()),
        Exit::Completed(Exit::Completed(11))
    );
    assert!(rts.shutdown_and_wait(Duration::from_secs(5)));
}

#[test]
fn only_the_innermost_scope_owns_a_fork() {
    let rts = runtime();
    let outer_cause = Defect::new("outer");
    let inner_cause = Defect::new("inner");
    let leaked: FiberSlot = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&leaked);

    let inner = IO::<Never, i32>::never()
        .fork::<Never>()
        .flat_map(move |child| {
            slot.lock().replace(child);
            IO::now(1)
        })
        .supervised(inner_cause.clone());

    let program = inner.supervised(outer_cause);

    assert_eq!(rts.run(program), Ok(1));
    let child = leaked.lock().take().expect("child handle stored");
    // The inner scope interrupted it with its own cause.
    assert_eq!(
        rts.run_exit(child.join().run::<Never>()),
        Exit::Completed(Exit::Terminated(inner_cause))
    );
    assert!(rts.shutdown_and_wait(Duration::from_secs(5)));
}
