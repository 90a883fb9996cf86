//! The erased instruction tree the interpreter walks.
//!
//! The typed [`IO`](super::IO) facade wraps an untyped [`Instr`]. Values on
//! the evaluation path are `Box<dyn Any + Send>`; continuations are boxed
//! `FnOnce` closures produced by the typed combinators, which downcast at
//! their boundaries. Keeping the interpreter monomorphic over one node type
//! is what makes a single tag-dispatched loop possible.

use crate::runtime::fiber::FiberHandle;
use crate::types::Defect;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

/// A type-erased value travelling through the evaluation stack.
pub(crate) type BoxValue = Box<dyn Any + Send>;

/// A continuation applied to a produced value.
pub(crate) type Cont = Box<dyn FnOnce(BoxValue) -> Instr + Send>;

/// A deferred value or side effect.
pub(crate) type Thunk = Box<dyn FnOnce() -> BoxValue + Send>;

/// A deferred instruction tree.
pub(crate) type SuspendFn = Box<dyn FnOnce() -> Instr + Send>;

/// The callback handed to async registrations; resumes the fiber.
pub(crate) type RawCallback = Box<dyn FnOnce(RawExit) + Send>;

/// A host-callable canceler invoked when a suspended registration is
/// interrupted.
pub(crate) type RawCanceler = Box<dyn FnOnce(Defect) + Send>;

/// A canceler expressed as an effect; lifted onto a fresh fiber when run.
pub(crate) type CancelerIoFn = Box<dyn FnOnce(Defect) -> Instr + Send>;

/// An async registration function returning one of the three descriptor
/// shapes.
pub(crate) type RegisterFn = Box<dyn FnOnce(RawCallback) -> RawAsync + Send>;

/// An async registration expressed as an effect to execute.
pub(crate) type RegisterIoFn = Box<dyn FnOnce(RawCallback) -> Instr + Send>;

/// A race finisher: applied to the winning value and the losing fiber.
pub(crate) type FinisherFn = Box<dyn FnOnce(BoxValue, FiberHandle) -> Instr + Send>;

/// Renders an erased typed error for uncaught-failure reports.
pub(crate) type ErrRender = Arc<dyn Fn(&(dyn Any + Send)) -> String + Send + Sync>;

/// Clones an erased exit so it can fan out to several joiners.
pub(crate) type ExitCloner = Arc<dyn Fn(&RawExit) -> RawExit + Send + Sync>;

/// The unhandled-defect handler carried by every fiber.
pub(crate) type UnhandledFn = Arc<dyn Fn(Defect) -> Instr + Send + Sync>;

/// The erased counterpart of [`Exit`](crate::types::Exit).
///
/// Failures carry their renderer so an uncaught failure can still be
/// reported readably after crossing an async boundary.
pub(crate) enum RawExit {
    Completed(BoxValue),
    Failed(BoxValue, ErrRender),
    Terminated(Defect),
}

impl RawExit {
    pub(crate) fn completed_unit() -> Self {
        Self::Completed(Box::new(()))
    }
}

impl std::fmt::Debug for RawExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed(_) => f.write_str("Completed(..)"),
            Self::Failed(_, _) => f.write_str("Failed(..)"),
            Self::Terminated(d) => write!(f, "Terminated({d})"),
        }
    }
}

/// Fallback renderer for failures whose type information is unavailable.
pub(crate) fn opaque_err_render() -> ErrRender {
    Arc::new(|_| "<typed failure>".to_string())
}

/// The erased counterpart of [`Async`](super::Async).
pub(crate) enum RawAsync {
    /// The registration resolved synchronously.
    Now(RawExit),
    /// The callback fires later; the canceler undoes the registration.
    MaybeLater(RawCanceler),
    /// The callback fires later; the canceler is an effect.
    MaybeLaterIo(CancelerIoFn),
}

/// Node tags, hoisted for dispatch and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tag {
    Pure,
    Point,
    Sync,
    FlatMap,
    Redeem,
    Fail,
    Terminate,
    AsyncEffect,
    AsyncIoEffect,
    Fork,
    RunToExit,
    Race,
    Suspend,
    Uninterruptible,
    Sleep,
    Supervise,
    Supervisor,
    Ensuring,
    TryFin,
}

/// One node of an effect description.
pub(crate) enum Instr {
    /// An already-computed value.
    Pure(BoxValue),
    /// A lazily-computed value.
    Point(Thunk),
    /// A side-effecting computation.
    Sync(Thunk),
    /// Sequencing: evaluate the inner node, feed its value to the
    /// continuation.
    FlatMap(Box<Instr>, Cont),
    /// Both a stack frame and a value producer: error and success handlers.
    Redeem(Box<Instr>, Cont, Cont),
    /// A typed failure, with a renderer for uncaught reports.
    Fail(BoxValue, ErrRender),
    /// An unrecoverable defect.
    Terminate(Defect),
    /// Registration of an asynchronous callback.
    AsyncEffect(RegisterFn),
    /// Registration expressed as an effect, run on a fresh fiber.
    AsyncIoEffect(RegisterIoFn),
    /// Fork a child fiber; produces its handle.
    Fork(Box<Instr>, Option<UnhandledFn>, ExitCloner),
    /// Fork a child fiber and produce its exit instead of raising.
    RunToExit(Box<Instr>, ExitCloner),
    /// Two-fiber race; the first completer's finisher wins.
    Race(Box<RaceSpec>),
    /// A deferred instruction tree.
    Suspend(SuspendFn),
    /// Defer interruption for the extent of the inner node.
    Uninterruptible(Box<Instr>),
    /// Complete with unit after the duration elapses.
    Sleep(Duration),
    /// Track fibers forked in the inner node; interrupt leftovers on exit.
    Supervise(Box<Instr>, Defect),
    /// Produce the current unhandled handler.
    Supervisor,
    /// Run the inner node after the outer, on every exit path.
    Ensuring(Box<Instr>, Box<Instr>),
    /// Internal: evaluate the inner node to a [`RawExit`] value, inline.
    /// Finalizer dispatch uses this to collect defects without forking.
    TryFin(Box<Instr>),
}

/// The race node payload: both branches, their finishers, and the exit
/// cloners for the forked children.
pub(crate) struct RaceSpec {
    pub(crate) left: Instr,
    pub(crate) right: Instr,
    pub(crate) finish_left: FinisherFn,
    pub(crate) finish_right: FinisherFn,
    pub(crate) cloner_left: ExitCloner,
    pub(crate) cloner_right: ExitCloner,
}

impl Instr {
    pub(crate) fn tag(&self) -> Tag {
        match self {
            Self::Pure(_) => Tag::Pure,
            Self::Point(_) => Tag::Point,
            Self::Sync(_) => Tag::Sync,
            Self::FlatMap(_, _) => Tag::FlatMap,
            Self::Redeem(_, _, _) => Tag::Redeem,
            Self::Fail(_, _) => Tag::Fail,
            Self::Terminate(_) => Tag::Terminate,
            Self::AsyncEffect(_) => Tag::AsyncEffect,
            Self::AsyncIoEffect(_) => Tag::AsyncIoEffect,
            Self::Fork(_, _, _) => Tag::Fork,
            Self::RunToExit(_, _) => Tag::RunToExit,
            Self::Race(_) => Tag::Race,
            Self::Suspend(_) => Tag::Suspend,
            Self::Uninterruptible(_) => Tag::Uninterruptible,
            Self::Sleep(_) => Tag::Sleep,
            Self::Supervise(_, _) => Tag::Supervise,
            Self::Supervisor => Tag::Supervisor,
            Self::Ensuring(_, _) => Tag::Ensuring,
            Self::TryFin(_) => Tag::TryFin,
        }
    }
}

/// Downcasts a produced value at a typed boundary.
///
/// A mismatch is an internal wiring defect, surfaced as a termination
/// rather than a panic.
pub(crate) fn take_value<T: 'static>(value: BoxValue) -> Result<T, Instr> {
    value
        .downcast::<T>()
        .map(|boxed| *boxed)
        .map_err(|_| Instr::Terminate(Defect::value_confusion(std::any::type_name::<T>())))
}
