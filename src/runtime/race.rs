//! The two-fiber race coordinator.
//!
//! A shared three-state cell decides the winner. The first completion takes
//! the race; a failure cedes it to the other side unless that side has also
//! failed, in which case the second failure wins (and propagates). Only one
//! arrival can ever observe a winning transition, so the resume callback
//! fires exactly once.

use crate::io::instr::RawCallback;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};

const STARTED: u8 = 0;
const FIRST_FAILED: u8 = 1;
const FINISHED: u8 = 2;

/// How an arrival resolved against the race state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Arrival {
    /// This arrival decides the race.
    Win,
    /// The race is (or will be) decided by the other side.
    Lose,
}

/// Shared state between the two arrival callbacks and the suspended racer.
pub(crate) struct RaceState {
    state: AtomicU8,
    callback: Mutex<Option<RawCallback>>,
}

impl RaceState {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(STARTED),
            callback: Mutex::new(None),
        }
    }

    /// Installs the resume callback before the arrivals are wired up.
    pub(crate) fn install(&self, cb: RawCallback) {
        *self.callback.lock() = Some(cb);
    }

    /// Takes the resume callback; only the winning arrival calls this.
    pub(crate) fn take_callback(&self) -> Option<RawCallback> {
        self.callback.lock().take()
    }

    /// Applies one arrival to the state machine.
    pub(crate) fn arrive(&self, completed: bool) -> Arrival {
        loop {
            match self.state.load(Ordering::Acquire) {
                FINISHED => return Arrival::Lose,
                FIRST_FAILED => {
                    // The other side already failed: this arrival wins
                    // regardless of its own outcome.
                    if self
                        .state
                        .compare_exchange(
                            FIRST_FAILED,
                            FINISHED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        return Arrival::Win;
                    }
                }
                _ => {
                    if completed {
                        if self
                            .state
                            .compare_exchange(
                                STARTED,
                                FINISHED,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok()
                        {
                            return Arrival::Win;
                        }
                    } else if self
                        .state
                        .compare_exchange(
                            STARTED,
                            FIRST_FAILED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        return Arrival::Lose;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn first_completion_wins_and_second_loses() {
        let race = RaceState::new();
        assert_eq!(race.arrive(true), Arrival::Win);
        assert_eq!(race.arrive(true), Arrival::Lose);
    }

    #[test]
    fn failure_cedes_to_the_other_side() {
        let race = RaceState::new();
        assert_eq!(race.arrive(false), Arrival::Lose);
        assert_eq!(race.arrive(false), Arrival::Win);
    }

    #[test]
    fn completion_after_failure_wins() {
        let race = RaceState::new();
        assert_eq!(race.arrive(false), Arrival::Lose);
        assert_eq!(race.arrive(true), Arrival::Win);
    }

    #[test]
    fn callback_is_taken_once() {
        let race = RaceState::new();
        race.install(Box::new(|_| {}));
        assert!(race.take_callback().is_some());
        assert!(race.take_callback().is_none());
    }

    #[test]
    fn concurrent_arrivals_produce_exactly_one_winner() {
        for _ in 0..64 {
            let race = Arc::new(RaceState::new());
            let wins = Arc::new(AtomicUsize::new(0));
            let mut handles = Vec::new();
            for _ in 0..2 {
                let race = Arc::clone(&race);
                let wins = Arc::clone(&wins);
                handles.push(std::thread::spawn(move || {
                    if race.arrive(true) == Arrival::Win {
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                }));
            }
            for handle in handles {
                handle.join().expect("arrival thread panicked");
            }
            assert_eq!(wins.load(Ordering::SeqCst), 1);
        }
    }
}
