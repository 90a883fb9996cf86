//! The fiber status state machine.
//!
//! One short-critical-section lock guards the status, the parked evaluation
//! stack, and the stash for resumptions that arrive while the interpreter is
//! still inside a registration. The stack slot doubles as the suspension
//! witness: it is `Some` exactly when no thread is interpreting the fiber,
//! so the transition that takes it is the exclusive right to run (or unwind)
//! the fiber next. At most one of {interpreter, winning resumer, killing
//! thread} can hold it, which is the resumption guarantee the whole design
//! rests on.

use crate::io::instr::{RawCanceler, RawExit};
use crate::runtime::stack::EvalStack;
use crate::types::Defect;

/// A callback awaiting the fiber's final exit.
pub(crate) type JoinerFn = Box<dyn FnOnce(RawExit) + Send>;

/// A callback awaiting completion of an externally-initiated interrupt.
pub(crate) type KillerFn = Box<dyn FnOnce(RawExit) + Send>;

/// Sentinel returned by [`FiberState::enter_async_start`] when the fiber has
/// already resolved.
pub(crate) const ASYNC_ID_NONE: u32 = 0;

/// The fiber's lifecycle status.
pub(crate) enum FiberStatus {
    /// Normal interpretation.
    Executing {
        /// A deferred interruption cause, applied at the next interruptible
        /// point.
        terminating: Option<Defect>,
        joiners: Vec<JoinerFn>,
        killers: Vec<KillerFn>,
    },
    /// The interpreter has initiated one or more async registrations.
    AsyncRegion {
        terminating: Option<Defect>,
        /// Nesting depth of async initiation on the interpreter's call stack.
        reentrancy: u32,
        /// Pending callback-side resumptions expected.
        resume: u32,
        /// The innermost registered canceler.
        canceler: Option<RawCanceler>,
        joiners: Vec<JoinerFn>,
        killers: Vec<KillerFn>,
    },
    /// Terminal; never overwritten.
    Done(RawExit),
}

impl FiberStatus {
    fn initial() -> Self {
        Self::Executing {
            terminating: None,
            joiners: Vec::new(),
            killers: Vec::new(),
        }
    }
}

/// Outcome of a callback-side resumption attempt.
pub(crate) enum TryResume {
    /// This caller won the pending resumption and holds the stack.
    Run {
        stack: EvalStack,
        /// Reentrancy observed at consume time; bounds inline resumption.
        reentrancy: u32,
        exit: RawExit,
    },
    /// The resumption was consumed but the interpreter still owns the
    /// stack (the callback fired inside the registration); the exit is
    /// stashed for the registration epilogue.
    Stashed,
    /// The fiber already resolved; the resumption is discarded.
    Discarded,
}

/// Outcome of parking the fiber at a suspension point.
pub(crate) enum ParkOutcome {
    /// The stack was parked; a callback or killer will take it.
    Parked,
    /// A resumption arrived during registration; continue with it.
    Stolen { stack: EvalStack, exit: RawExit },
    /// A deferred interrupt is due; terminate instead of parking. The
    /// canceler is returned so the caller can undo the registration.
    Interrupted {
        stack: EvalStack,
        defect: Defect,
        canceler: Option<RawCanceler>,
    },
}

/// Outcome of an external kill request.
pub(crate) enum KillOutcome {
    /// The fiber already resolved; invoke the callback immediately.
    AlreadyDone(KillerFn),
    /// The kill was latched for the next interruptible point.
    Deferred,
    /// The fiber was suspended and interruptible: it transitioned straight
    /// to `Done`, and the caller now owns the unwind.
    Interrupt {
        stack: EvalStack,
        canceler: Option<RawCanceler>,
        joiners: Vec<JoinerFn>,
        killers: Vec<KillerFn>,
    },
}

/// Outcome of recording the fiber's exit.
pub(crate) enum DoneOutcome {
    /// The exit was recorded; fan these out.
    Fanout {
        joiners: Vec<JoinerFn>,
        killers: Vec<KillerFn>,
    },
    /// A concurrent interrupt resolved the fiber first.
    AlreadyDone,
}

/// Everything guarded by the fiber's lock.
pub(crate) struct FiberState {
    pub(crate) status: FiberStatus,
    /// The evaluation stack, present exactly while the fiber is parked.
    pub(crate) stack: Option<EvalStack>,
    /// A resumption that arrived mid-registration, awaiting the epilogue.
    pub(crate) pending_resume: Option<RawExit>,
}

impl FiberState {
    pub(crate) fn new() -> Self {
        Self {
            status: FiberStatus::initial(),
            stack: Some(EvalStack::new()),
            pending_resume: None,
        }
    }

    /// Begins an async initiation; returns the registration id.
    pub(crate) fn enter_async_start(&mut self) -> u32 {
        match &mut self.status {
            FiberStatus::Executing {
                terminating,
                joiners,
                killers,
            } => {
                self.status = FiberStatus::AsyncRegion {
                    terminating: terminating.take(),
                    reentrancy: 1,
                    resume: 1,
                    canceler: None,
                    joiners: std::mem::take(joiners),
                    killers: std::mem::take(killers),
                };
                1
            }
            FiberStatus::AsyncRegion {
                reentrancy, resume, ..
            } => {
                *reentrancy += 1;
                *resume += 1;
                *reentrancy
            }
            // The fiber raced to Done; registration proceeds but every
            // resumption will be discarded.
            FiberStatus::Done(_) => ASYNC_ID_NONE,
        }
    }

    /// Ends an async initiation.
    ///
    /// Intentionally a no-op on any status other than the two listed
    /// transitions; in particular the fiber may have raced to `Done`.
    pub(crate) fn enter_async_end(&mut self) {
        match &mut self.status {
            FiberStatus::AsyncRegion {
                terminating,
                reentrancy: 1,
                resume: 0,
                joiners,
                killers,
                ..
            } => {
                self.status = FiberStatus::Executing {
                    terminating: terminating.take(),
                    joiners: std::mem::take(joiners),
                    killers: std::mem::take(killers),
                };
            }
            FiberStatus::AsyncRegion { reentrancy, .. } if *reentrancy > 1 => {
                *reentrancy -= 1;
            }
            _ => {}
        }
    }

    /// Consumes one pending resumption without touching the stack; used on
    /// the synchronous-result path where the interpreter already runs.
    pub(crate) fn try_consume_resume(&mut self) -> bool {
        self.consume_resume()
    }

    /// Callback-side resumption: consume one pending resumption and take
    /// the stack if the fiber is parked.
    pub(crate) fn try_resume(&mut self, exit: RawExit) -> TryResume {
        let reentrancy = match &self.status {
            FiberStatus::AsyncRegion { reentrancy, .. } => *reentrancy,
            _ => 0,
        };
        if !self.consume_resume() {
            return TryResume::Discarded;
        }
        match self.stack.take() {
            Some(stack) => TryResume::Run {
                stack,
                reentrancy,
                exit,
            },
            None => {
                self.pending_resume = Some(exit);
                TryResume::Stashed
            }
        }
    }

    fn consume_resume(&mut self) -> bool {
        match &mut self.status {
            FiberStatus::AsyncRegion {
                terminating,
                reentrancy: 0,
                resume: 1,
                canceler,
                joiners,
                killers,
            } => {
                // The canceler can no longer fire; clear it explicitly
                // rather than dropping it with the region.
                *canceler = None;
                self.status = FiberStatus::Executing {
                    terminating: terminating.take(),
                    joiners: std::mem::take(joiners),
                    killers: std::mem::take(killers),
                };
                true
            }
            FiberStatus::AsyncRegion {
                resume, canceler, ..
            } if *resume > 0 => {
                *resume -= 1;
                *canceler = None;
                true
            }
            _ => false,
        }
    }

    /// Parks the stack at a suspension point, unless a stashed resumption
    /// or a due interrupt says otherwise.
    ///
    /// `interruptible` is the caller's read of `no_interrupt == 0`.
    pub(crate) fn park(
        &mut self,
        id: u32,
        canceler: RawCanceler,
        stack: EvalStack,
        interruptible: bool,
    ) -> ParkOutcome {
        if let Some(exit) = self.pending_resume.take() {
            return ParkOutcome::Stolen { stack, exit };
        }
        if interruptible {
            if let Some(defect) = self.take_terminating() {
                return ParkOutcome::Interrupted {
                    stack,
                    defect,
                    canceler: Some(canceler),
                };
            }
        }
        match &mut self.status {
            FiberStatus::AsyncRegion {
                reentrancy,
                canceler: slot,
                ..
            } if *reentrancy == id => {
                *slot = Some(canceler);
                self.stack = Some(stack);
                ParkOutcome::Parked
            }
            FiberStatus::Executing { .. } | FiberStatus::AsyncRegion { .. } => {
                // Stale id: the region advanced past this registration.
                // Park without a canceler.
                self.stack = Some(stack);
                ParkOutcome::Parked
            }
            FiberStatus::Done(_) => ParkOutcome::Interrupted {
                stack,
                defect: Defect::new("fiber resolved during async registration"),
                canceler: Some(canceler),
            },
        }
    }

    /// Parks the stack at a cooperative yield point.
    pub(crate) fn park_for_yield(&mut self, stack: EvalStack) {
        self.stack = Some(stack);
    }

    /// Takes the stack for an evaluator invocation.
    pub(crate) fn take_stack(&mut self) -> Option<EvalStack> {
        self.stack.take()
    }

    /// Takes the deferred interruption cause, if any.
    pub(crate) fn take_terminating(&mut self) -> Option<Defect> {
        match &mut self.status {
            FiberStatus::Executing { terminating, .. }
            | FiberStatus::AsyncRegion { terminating, .. } => terminating.take(),
            FiberStatus::Done(_) => None,
        }
    }

    /// Requests interruption.
    ///
    /// `interruptible` is the caller's read of `no_interrupt == 0`. The
    /// direct transition to `Done` happens only when the fiber is parked in
    /// an async region with a pending resumption and no prior deferred
    /// cause; every other shape defers.
    pub(crate) fn kill(
        &mut self,
        defect: Defect,
        cb: KillerFn,
        interruptible: bool,
    ) -> KillOutcome {
        match &mut self.status {
            FiberStatus::Done(_) => KillOutcome::AlreadyDone(cb),
            FiberStatus::AsyncRegion {
                terminating: None,
                resume,
                canceler,
                joiners,
                killers,
                ..
            } if *resume > 0 && interruptible && self.stack.is_some() => {
                let canceler = canceler.take();
                let joiners = std::mem::take(joiners);
                let mut killers = std::mem::take(killers);
                killers.push(cb);
                let stack = self
                    .stack
                    .take()
                    .unwrap_or_default();
                self.status = FiberStatus::Done(RawExit::Terminated(defect));
                KillOutcome::Interrupt {
                    stack,
                    canceler,
                    joiners,
                    killers,
                }
            }
            FiberStatus::Executing {
                terminating,
                killers,
                ..
            }
            | FiberStatus::AsyncRegion {
                terminating,
                killers,
                ..
            } => {
                // Retain the first cause only.
                if terminating.is_none() {
                    *terminating = Some(defect);
                }
                killers.push(cb);
                KillOutcome::Deferred
            }
        }
    }

    /// Records the fiber's exit. `Done` is never overwritten.
    pub(crate) fn done(&mut self, exit: RawExit) -> DoneOutcome {
        match &mut self.status {
            FiberStatus::Done(_) => DoneOutcome::AlreadyDone,
            FiberStatus::Executing {
                joiners, killers, ..
            }
            | FiberStatus::AsyncRegion {
                joiners, killers, ..
            } => {
                let joiners = std::mem::take(joiners);
                let killers = std::mem::take(killers);
                self.status = FiberStatus::Done(exit);
                DoneOutcome::Fanout { joiners, killers }
            }
        }
    }

    /// Registers a joiner, or returns it for immediate invocation when the
    /// fiber has resolved.
    pub(crate) fn register_joiner(&mut self, cb: JoinerFn) -> Option<(JoinerFn, &RawExit)> {
        match &mut self.status {
            FiberStatus::Done(exit) => Some((cb, &*exit)),
            FiberStatus::Executing { joiners, .. }
            | FiberStatus::AsyncRegion { joiners, .. } => {
                joiners.push(cb);
                None
            }
        }
    }

    /// The stored exit, once resolved.
    pub(crate) fn done_exit(&self) -> Option<&RawExit> {
        match &self.status {
            FiberStatus::Done(exit) => Some(exit),
            _ => None,
        }
    }
}
