//! Finalizer discipline: exactly-once on every exit path, and defects
//! raised by finalizers are reported, never raised into user code.

use filament::{Defect, Exit, IO, Never, Runtime, RtsConfig};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

fn counting_runtime() -> (Runtime, Arc<Mutex<Vec<Defect>>>) {
    let reported = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reported);
    let config = RtsConfig::default()
        .with_thread_pool_size(2)
        .with_unhandled_handler(move |defect| {
            let sink = Arc::clone(&sink);
            IO::sync(move || {
                sink.lock().push(defect);
            })
        });
    (Runtime::with_config(config), reported)
}

fn wait_until(deadline: Duration, mut probe: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if probe() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    probe()
}

#[test]
fn finalizer_runs_once_on_success() {
    let rts = Runtime::with_config(RtsConfig::default().with_thread_pool_size(2));
    let ran = Arc::new(AtomicU32::new(0));
    let ran_clone = Arc::clone(&ran);

    let program = IO::<Never, i32>::now(1).ensuring(IO::sync(move || {
        ran_clone.fetch_add(1, Ordering::SeqCst);
    }));

    assert_eq!(rts.run(program), Ok(1));
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert!(rts.shutdown_and_wait(Duration::from_secs(5)));
}

#[test]
fn finalizer_runs_once_on_failure_and_handler_recovers() {
    let rts = Runtime::with_config(RtsConfig::default().with_thread_pool_size(2));
    let ran = Arc::new(AtomicU32::new(0));
    let ran_clone = Arc::clone(&ran);

    let program = IO::<&str, i32>::fail("x")
        .ensuring(IO::sync(move || {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        }))
        .redeem(|_| IO::<&str, i32>::now(42), IO::now);

    assert_eq!(rts.run(program), Ok(42));
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert!(rts.shutdown_and_wait(Duration::from_secs(5)));
}

#[test]
fn finalizer_runs_once_on_termination() {
    let (rts, reported) = counting_runtime();
    let ran = Arc::new(AtomicU32::new(0));
    let ran_clone = Arc::clone(&ran);
    let defect = Defect::new("fatal");

    let program = IO::<Never, i32>::terminate(defect.clone()).ensuring(IO::sync(move || {
        ran_clone.fetch_add(1, Ordering::SeqCst);
    }));

    assert_eq!(rts.run_exit(program), Exit::Terminated(defect.clone()));
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    // The termination itself is reported through the unhandled handler.
    assert!(wait_until(Duration::from_secs(5), || {
        reported.lock().iter().any(|d| d == &defect)
    }));
    assert!(rts.shutdown_and_wait(Duration::from_secs(5)));
}

#[test]
fn finalizer_defect_is_reported_but_not_raised() {
    let (rts, reported) = counting_runtime();
    let boom = Defect::new("boom");

    let program = IO::<Never, i32>::now(1)
        .ensuring(IO::terminate(boom.clone()))
        .attempt::<Never>();

    // The value survives: finalizer defects bypass neither redeem nor the
    // result, they are reported out of band.
    assert_eq!(rts.run_exit(program), Exit::Completed(Ok(1)));
    assert!(wait_until(Duration::from_secs(5), || {
        reported.lock().iter().filter(|d| **d == boom).count() == 1
    }));
    // And exactly once.
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(reported.lock().iter().filter(|d| **d == boom).count(), 1);
    assert!(rts.shutdown_and_wait(Duration::from_secs(5)));
}

#[test]
fn nested_finalizers_run_innermost_first() {
    let rts = Runtime::with_config(RtsConfig::default().with_thread_pool_size(2));
    let order = Arc::new(Mutex::new(Vec::new()));
    let outer = Arc::clone(&order);
    let inner = Arc::clone(&order);

    let program = IO::<&str, i32>::fail("x")
        .ensuring(IO::sync(move || inner.lock().push("inner")))
        .ensuring(IO::sync(move || outer.lock().push("outer")))
        .redeem(|_| IO::<&str, i32>::now(0), IO::now);

    assert_eq!(rts.run(program), Ok(0));
    assert_eq!(*order.lock(), vec!["inner", "outer"]);
    assert!(rts.shutdown_and_wait(Duration::from_secs(5)));
}

#[test]
fn uncaught_failure_runs_finalizers_and_reports() {
    let (rts, reported) = counting_runtime();
    let ran = Arc::new(AtomicU32::new(0));
    let ran_clone = Arc::clone(&ran);

    let program = IO::<&str, i32>::fail("lost").ensuring(IO::sync(move || {
        ran_clone.fetch_add(1, Ordering::SeqCst);
    }));

    assert_eq!(rts.run_exit(program), Exit::Failed("lost"));
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert!(wait_until(Duration::from_secs(5), || {
        !reported.lock().is_empty()
    }));
    assert!(rts.shutdown_and_wait(Duration::from_secs(5)));
}

#[test]
fn bracket_releases_on_failure_in_use() {
    let rts = Runtime::with_config(RtsConfig::default().with_thread_pool_size(2));
    let released = Arc::new(AtomicU32::new(0));
    let released_clone = Arc::clone(&released);

    let program = IO::<&str, i32>::now(10)
        .bracket(
            move |_resource| {
                let released = Arc::clone(&released_clone);
                IO::sync(move || {
                    released.fetch_add(1, Ordering::SeqCst);
                })
            },
            |resource| IO::<&str, i32>::fail("use blew up").map(move |_| resource),
        )
        .redeem(|_| IO::<&str, i32>::now(-1), IO::now);

    assert_eq!(rts.run(program), Ok(-1));
    assert_eq!(released.load(Ordering::SeqCst), 1);
    assert!(rts.shutdown_and_wait(Duration::from_secs(5)));
}
