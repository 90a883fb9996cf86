//! Algebraic laws of the description type, checked observationally.

use filament::{Exit, IO, Never, Runtime, RtsConfig};
use std::time::Duration;

fn runtime() -> Runtime {
    Runtime::with_config(RtsConfig::default().with_thread_pool_size(2))
}

fn double(n: i32) -> IO<Never, i32> {
    IO::now(n * 2)
}

fn add_ten(n: i32) -> IO<Never, i32> {
    IO::now(n + 10)
}

#[test]
fn flat_map_right_identity() {
    let rts = runtime();
    let plain = IO::<Never, i32>::sync(|| 5);
    let wrapped = IO::<Never, i32>::sync(|| 5).flat_map(IO::now);
    assert_eq!(rts.run_exit(plain), rts.run_exit(wrapped));
    assert!(rts.shutdown_and_wait(Duration::from_secs(5)));
}

#[test]
fn flat_map_left_identity() {
    let rts = runtime();
    let via_flat_map = IO::<Never, i32>::now(21).flat_map(double);
    let direct = double(21);
    assert_eq!(rts.run_exit(via_flat_map), rts.run_exit(direct));
    assert!(rts.shutdown_and_wait(Duration::from_secs(5)));
}

#[test]
fn flat_map_associativity() {
    let rts = runtime();
    let left = IO::<Never, i32>::now(4).flat_map(double).flat_map(add_ten);
    let right = IO::<Never, i32>::now(4).flat_map(|x| double(x).flat_map(add_ten));
    assert_eq!(rts.run_exit(left), rts.run_exit(right));
    assert_eq!(rts.run(IO::<Never, i32>::now(4).flat_map(double).flat_map(add_ten)), Ok(18));
    assert!(rts.shutdown_and_wait(Duration::from_secs(5)));
}

#[test]
fn redeem_absorbs_fail() {
    let rts = runtime();
    let redeemed = IO::<&str, i32>::fail("e").redeem(
        |e| IO::<Never, i32>::now(e.len() as i32),
        |a| IO::now(a),
    );
    assert_eq!(rts.run(redeemed), Ok(1));

    let handled_value = IO::<&str, i32>::now(3).redeem(
        |_| IO::<Never, i32>::now(-1),
        |a| IO::now(a + 1),
    );
    assert_eq!(rts.run(handled_value), Ok(4));
    assert!(rts.shutdown_and_wait(Duration::from_secs(5)));
}

#[test]
fn uninterruptible_nesting_is_idempotent() {
    let rts = runtime();
    let single = IO::<Never, i32>::sync(|| 9).uninterruptible();
    let nested = IO::<Never, i32>::sync(|| 9)
        .uninterruptible()
        .uninterruptible();
    assert_eq!(rts.run_exit(single), rts.run_exit(nested));
    assert_eq!(rts.run(IO::<Never, i32>::sync(|| 9).uninterruptible()), Ok(9));
    assert!(rts.shutdown_and_wait(Duration::from_secs(5)));
}

#[test]
fn attempt_surfaces_both_sides() {
    let rts = runtime();
    assert_eq!(
        rts.run_exit(IO::<&str, i32>::now(1).attempt::<Never>()),
        Exit::Completed(Ok(1))
    );
    assert_eq!(
        rts.run_exit(IO::<&str, i32>::fail("e").attempt::<Never>()),
        Exit::Completed(Err("e"))
    );
    assert!(rts.shutdown_and_wait(Duration::from_secs(5)));
}
