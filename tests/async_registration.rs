//! The async seam: synchronous results, effectful registration, callbacks
//! from foreign threads, and timer-backed delays.

use filament::{Async, Exit, IO, Never, Runtime, RtsConfig};
use std::time::{Duration, Instant};

fn runtime() -> Runtime {
    Runtime::with_config(RtsConfig::default().with_thread_pool_size(4))
}

#[test]
fn now_shape_resolves_synchronously() {
    let rts = runtime();
    let program = IO::<Never, i32>::async_register(|_cb| Async::now(Exit::Completed(5)));
    assert_eq!(rts.run(program), Ok(5));
    assert!(rts.shutdown_and_wait(Duration::from_secs(5)));
}

#[test]
fn now_shape_propagates_failures() {
    let rts = runtime();
    let program = IO::<&str, i32>::async_register(|_cb| Async::now(Exit::Failed("refused")));
    assert_eq!(rts.run_exit(program), Exit::Failed("refused"));
    assert!(rts.shutdown_and_wait(Duration::from_secs(5)));
}

#[test]
fn callback_during_registration_wins() {
    let rts = runtime();
    // The callback fires inside the registration function itself; the
    // later descriptor must not double-resolve the fiber.
    let program = IO::<Never, i32>::async_register(|cb| {
        cb.succeed(11);
        Async::later(|_| {})
    });
    assert_eq!(rts.run(program), Ok(11));
    assert!(rts.shutdown_and_wait(Duration::from_secs(5)));
}

#[test]
fn callback_from_a_foreign_thread_resumes_the_fiber() {
    let rts = runtime();
    let program = IO::<Never, i32>::async_register(|cb| {
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            cb.succeed(3);
        });
        Async::later(|_| {})
    });
    assert_eq!(rts.run(program), Ok(3));
    assert!(rts.shutdown_and_wait(Duration::from_secs(5)));
}

#[test]
fn effectful_registration_runs_on_its_own_fiber() {
    let rts = runtime();
    let program = IO::<Never, i32>::async_register_io(|cb| IO::sync(move || cb.succeed(9)));
    assert_eq!(rts.run(program), Ok(9));
    assert!(rts.shutdown_and_wait(Duration::from_secs(5)));
}

#[test]
fn delay_waits_for_the_timer() {
    let rts = runtime();
    let started = Instant::now();
    let program = IO::<Never, i32>::now(4).delay(Duration::from_millis(30));
    assert_eq!(rts.run(program), Ok(4));
    assert!(started.elapsed() >= Duration::from_millis(30));
    assert!(rts.shutdown_and_wait(Duration::from_secs(5)));
}
