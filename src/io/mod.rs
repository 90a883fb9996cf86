//! The `IO` effect description type and its combinators.
//!
//! An [`IO<E, A>`] is an inert description of a program that, when run by a
//! [`Runtime`](crate::runtime::Runtime), produces an `A`, fails with a typed
//! `E`, or is terminated by a [`Defect`]. Descriptions compose with
//! [`flat_map`](IO::flat_map), recover with [`redeem`](IO::redeem), guard
//! resources with [`ensuring`](IO::ensuring) and [`bracket`](IO::bracket),
//! and gain concurrency through [`fork`](IO::fork) and
//! [`race_with`](IO::race_with).
//!
//! The typed surface is a phantom-typed wrapper over the erased instruction
//! tree in [`instr`]; all downcasting is confined to the closures built here.

pub(crate) mod instr;

use self::instr::{
    BoxValue, Cont, FinisherFn, Instr, RaceSpec, RawAsync, RawCallback, RawExit, take_value,
};
use crate::runtime::fiber::{Fiber, FiberHandle};
use crate::types::{Defect, Exit, Never};
use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

pub(crate) use self::instr::{ErrRender, ExitCloner, UnhandledFn};

/// A host-callable canceler for a pending async registration.
pub type Canceler = Box<dyn FnOnce(Defect) + Send>;

/// A canceler expressed as an effect, run on a fresh fiber when invoked.
pub type CancelerIo = Box<dyn FnOnce(Defect) -> IO<Never, ()> + Send>;

/// The result of an async registration: resolved now, or later with one of
/// two canceler shapes.
pub enum Async<E, A> {
    /// The registration resolved synchronously; the callback will never fire.
    Now(Exit<E, A>),
    /// The callback fires later; the canceler undoes the registration.
    MaybeLater(Canceler),
    /// The callback fires later; cancellation is itself an effect.
    MaybeLaterIo(CancelerIo),
}

impl<E, A> Async<E, A> {
    /// A synchronously-completed registration.
    #[must_use]
    pub fn now(exit: Exit<E, A>) -> Self {
        Self::Now(exit)
    }

    /// A pending registration with a host-side canceler.
    #[must_use]
    pub fn later(cancel: impl FnOnce(Defect) + Send + 'static) -> Self {
        Self::MaybeLater(Box::new(cancel))
    }

    /// A pending registration whose canceler is an effect.
    #[must_use]
    pub fn later_io(cancel: impl FnOnce(Defect) -> IO<Never, ()> + Send + 'static) -> Self {
        Self::MaybeLaterIo(Box::new(cancel))
    }
}

/// The resumption callback handed to async registrations.
///
/// Exactly one call resumes the fiber; if the fiber was interrupted first,
/// the call is discarded.
pub struct AsyncCallback<E, A> {
    raw: RawCallback,
    _marker: PhantomData<fn(E, A)>,
}

impl<E: Debug + Send + 'static, A: Send + 'static> AsyncCallback<E, A> {
    pub(crate) fn new(raw: RawCallback) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    /// Resumes the fiber with the given exit.
    pub fn complete(self, exit: Exit<E, A>) {
        (self.raw)(exit_into_raw(exit));
    }

    /// Resumes the fiber with a value.
    pub fn succeed(self, value: A) {
        self.complete(Exit::Completed(value));
    }

    /// Resumes the fiber with a typed failure.
    pub fn fail(self, error: E) {
        self.complete(Exit::Failed(error));
    }

    /// Resumes the fiber with a defect.
    pub fn terminate(self, defect: Defect) {
        self.complete(Exit::Terminated(defect));
    }
}

/// The unhandled-defect handler, observable from inside a program.
#[derive(Clone)]
pub struct Handler {
    inner: UnhandledFn,
}

impl Handler {
    /// Builds the effect that reports a defect through this handler.
    #[must_use]
    pub fn report(&self, defect: Defect) -> IO<Never, ()> {
        IO::wrap((self.inner)(defect))
    }
}

impl Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler").finish_non_exhaustive()
    }
}

/// A description of an effectful program producing `A` or failing with `E`.
///
/// Values of this type do nothing until handed to a
/// [`Runtime`](crate::runtime::Runtime).
pub struct IO<E, A> {
    instr: Instr,
    _marker: PhantomData<fn() -> (E, A)>,
}

impl<E, A> Debug for IO<E, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IO({:?})", self.instr.tag())
    }
}

impl<E: Send + 'static, A: Send + 'static> IO<E, A> {
    pub(crate) fn wrap(instr: Instr) -> Self {
        Self {
            instr,
            _marker: PhantomData,
        }
    }

    pub(crate) fn into_instr(self) -> Instr {
        self.instr
    }

    /// Lifts an already-computed value.
    #[must_use]
    pub fn now(value: A) -> Self {
        Self::wrap(Instr::Pure(Box::new(value)))
    }

    /// Lifts a lazily-computed value. The thunk must be pure; use
    /// [`sync`](Self::sync) for side effects.
    pub fn point(thunk: impl FnOnce() -> A + Send + 'static) -> Self {
        Self::wrap(Instr::Point(Box::new(move || Box::new(thunk()) as BoxValue)))
    }

    /// Lifts a synchronous side effect.
    pub fn sync(effect: impl FnOnce() -> A + Send + 'static) -> Self {
        Self::wrap(Instr::Sync(Box::new(move || Box::new(effect()) as BoxValue)))
    }

    /// Fails with a typed error.
    #[must_use]
    pub fn fail(error: E) -> Self
    where
        E: Debug,
    {
        Self::wrap(Instr::Fail(Box::new(error), err_render::<E>()))
    }

    /// Terminates the fiber with a defect. Not recoverable by `redeem`.
    #[must_use]
    pub fn terminate(defect: Defect) -> Self {
        Self::wrap(Instr::Terminate(defect))
    }

    /// Defers construction of the description itself.
    pub fn suspend(thunk: impl FnOnce() -> IO<E, A> + Send + 'static) -> Self {
        Self::wrap(Instr::Suspend(Box::new(move || thunk().instr)))
    }

    /// Lifts a `Result` into a completed-or-failed description.
    #[must_use]
    pub fn from_result(result: Result<A, E>) -> Self
    where
        E: Debug,
    {
        match result {
            Ok(a) => Self::now(a),
            Err(e) => Self::fail(e),
        }
    }

    /// A description that never completes. Interruptible.
    #[must_use]
    pub fn never() -> Self
    where
        E: Debug,
    {
        Self::async_register(|_cb| Async::later(|_| {}))
    }

    /// Registers an asynchronous callback; the registration function returns
    /// one of the three [`Async`] shapes.
    pub fn async_register<F>(register: F) -> Self
    where
        E: Debug,
        F: FnOnce(AsyncCallback<E, A>) -> Async<E, A> + Send + 'static,
    {
        Self::wrap(Instr::AsyncEffect(Box::new(move |raw| {
            match register(AsyncCallback::new(raw)) {
                Async::Now(exit) => RawAsync::Now(exit_into_raw(exit)),
                Async::MaybeLater(cancel) => RawAsync::MaybeLater(cancel),
                Async::MaybeLaterIo(cancel) => {
                    RawAsync::MaybeLaterIo(Box::new(move |d| cancel(d).into_instr()))
                }
            }
        })))
    }

    /// Registers an asynchronous callback through an effect; the returned
    /// registration effect runs on a fresh fiber.
    pub fn async_register_io<F>(register: F) -> Self
    where
        E: Debug,
        F: FnOnce(AsyncCallback<E, A>) -> IO<E, ()> + Send + 'static,
    {
        Self::wrap(Instr::AsyncIoEffect(Box::new(move |raw| {
            register(AsyncCallback::new(raw)).into_instr()
        })))
    }

    /// Sequences a continuation after this description.
    pub fn flat_map<B, F>(self, f: F) -> IO<E, B>
    where
        B: Send + 'static,
        F: FnOnce(A) -> IO<E, B> + Send + 'static,
    {
        IO::wrap(Instr::FlatMap(
            Box::new(self.instr),
            Box::new(move |v| match take_value::<A>(v) {
                Ok(a) => f(a).instr,
                Err(t) => t,
            }),
        ))
    }

    /// Maps the produced value.
    pub fn map<B, F>(self, f: F) -> IO<E, B>
    where
        B: Send + 'static,
        F: FnOnce(A) -> B + Send + 'static,
    {
        self.flat_map(move |a| IO::now(f(a)))
    }

    /// Sequences another description, discarding this one's value.
    pub fn then<B: Send + 'static>(self, next: IO<E, B>) -> IO<E, B> {
        self.flat_map(move |_| next)
    }

    /// Handles both outcomes: failures through `err`, values through `ok`.
    /// Defects bypass both.
    pub fn redeem<E2, B, Ferr, Fok>(self, err: Ferr, ok: Fok) -> IO<E2, B>
    where
        E2: Send + 'static,
        B: Send + 'static,
        Ferr: FnOnce(E) -> IO<E2, B> + Send + 'static,
        Fok: FnOnce(A) -> IO<E2, B> + Send + 'static,
    {
        let err_cont: Cont = Box::new(move |v| match take_value::<E>(v) {
            Ok(e) => err(e).instr,
            Err(t) => t,
        });
        let ok_cont: Cont = Box::new(move |v| match take_value::<A>(v) {
            Ok(a) => ok(a).instr,
            Err(t) => t,
        });
        IO::wrap(Instr::Redeem(Box::new(self.instr), err_cont, ok_cont))
    }

    /// Pure-function form of [`redeem`](Self::redeem).
    pub fn redeem_pure<E2, B, Ferr, Fok>(self, err: Ferr, ok: Fok) -> IO<E2, B>
    where
        E2: Send + 'static,
        B: Send + 'static,
        Ferr: FnOnce(E) -> B + Send + 'static,
        Fok: FnOnce(A) -> B + Send + 'static,
    {
        self.redeem(move |e| IO::now(err(e)), move |a| IO::now(ok(a)))
    }

    /// Surfaces the typed failure as a `Result` value.
    pub fn attempt<E2: Send + 'static>(self) -> IO<E2, Result<A, E>> {
        self.redeem(move |e| IO::now(Err(e)), move |a| IO::now(Ok(a)))
    }

    /// Maps the typed error.
    pub fn map_err<E2, F>(self, f: F) -> IO<E2, A>
    where
        E2: Debug + Send + 'static,
        F: FnOnce(E) -> E2 + Send + 'static,
    {
        self.redeem(move |e| IO::fail(f(e)), IO::now)
    }

    /// Runs `finalizer` on every exit path through this description.
    #[must_use]
    pub fn ensuring(self, finalizer: IO<Never, ()>) -> Self {
        Self::wrap(Instr::Ensuring(
            Box::new(self.instr),
            Box::new(finalizer.instr),
        ))
    }

    /// Acquire/use/release: this description acquires the resource,
    /// `release` always runs, `use_fn` may be interrupted.
    pub fn bracket<B, R, U>(self, release: R, use_fn: U) -> IO<E, B>
    where
        A: Clone,
        B: Send + 'static,
        R: FnOnce(A) -> IO<Never, ()> + Send + 'static,
        U: FnOnce(A) -> IO<E, B> + Send + 'static,
    {
        self.uninterruptible()
            .flat_map(move |a| use_fn(a.clone()).ensuring(release(a)))
    }

    /// Defers interruption for the extent of this description.
    #[must_use]
    pub fn uninterruptible(self) -> Self {
        Self::wrap(Instr::Uninterruptible(Box::new(self.instr)))
    }

    /// Tracks fibers forked within this description and interrupts the ones
    /// still running when it exits, with `cause`.
    #[must_use]
    pub fn supervised(self, cause: Defect) -> Self {
        Self::wrap(Instr::Supervise(Box::new(self.instr), cause))
    }

    /// Starts this description on a new fiber and produces its handle.
    pub fn fork<E2: Send + 'static>(self) -> IO<E2, Fiber<E, A>>
    where
        E: Clone,
        A: Clone,
    {
        self.fork_instr(None)
    }

    /// Like [`fork`](Self::fork), overriding the child's unhandled-defect
    /// handler.
    pub fn fork_with<E2, H>(self, handler: H) -> IO<E2, Fiber<E, A>>
    where
        E: Clone,
        A: Clone,
        E2: Send + 'static,
        H: Fn(Defect) -> IO<Never, ()> + Send + Sync + 'static,
    {
        let unhandled: UnhandledFn = Arc::new(move |d| handler(d).into_instr());
        self.fork_instr(Some(unhandled))
    }

    fn fork_instr<E2: Send + 'static>(self, handler: Option<UnhandledFn>) -> IO<E2, Fiber<E, A>>
    where
        E: Clone,
        A: Clone,
    {
        let forked = Instr::Fork(Box::new(self.instr), handler, exit_cloner::<E, A>());
        IO::wrap(Instr::FlatMap(
            Box::new(forked),
            Box::new(|v| match take_value::<FiberHandle>(v) {
                Ok(handle) => Instr::Pure(Box::new(Fiber::<E, A>::new(handle))),
                Err(t) => t,
            }),
        ))
    }

    /// Runs this description on a child fiber and produces its [`Exit`]
    /// instead of raising.
    pub fn run<E2: Send + 'static>(self) -> IO<E2, Exit<E, A>>
    where
        E: Clone,
        A: Clone,
    {
        let ran = Instr::RunToExit(Box::new(self.instr), exit_cloner::<E, A>());
        IO::wrap(Instr::FlatMap(
            Box::new(ran),
            Box::new(|v| match take_value::<RawExit>(v) {
                Ok(raw) => Instr::Pure(Box::new(exit_from_raw::<E, A>(raw))),
                Err(t) => t,
            }),
        ))
    }

    /// Races two descriptions; the first completer's value wins and the
    /// loser keeps running.
    pub fn race(self, other: IO<E, A>) -> IO<E, A>
    where
        E: Clone,
        A: Clone,
    {
        self.race_with(
            other,
            |a, _loser| IO::now(a),
            |a, _loser| IO::now(a),
        )
    }

    /// Races two descriptions with explicit finishers. Exactly one finisher
    /// runs, receiving the winning value and the losing fiber's handle; the
    /// loser is not interrupted automatically.
    pub fn race_with<B, C, Fl, Fr>(
        self,
        other: IO<E, B>,
        finish_left: Fl,
        finish_right: Fr,
    ) -> IO<E, C>
    where
        E: Clone,
        A: Clone,
        B: Clone + Send + 'static,
        C: Send + 'static,
        Fl: FnOnce(A, Fiber<E, B>) -> IO<E, C> + Send + 'static,
        Fr: FnOnce(B, Fiber<E, A>) -> IO<E, C> + Send + 'static,
    {
        let left_fin: FinisherFn = Box::new(move |v, loser| match take_value::<A>(v) {
            Ok(a) => finish_left(a, Fiber::<E, B>::new(loser)).instr,
            Err(t) => t,
        });
        let right_fin: FinisherFn = Box::new(move |v, loser| match take_value::<B>(v) {
            Ok(b) => finish_right(b, Fiber::<E, A>::new(loser)).instr,
            Err(t) => t,
        });
        IO::wrap(Instr::Race(Box::new(RaceSpec {
            left: self.instr,
            right: other.instr,
            finish_left: left_fin,
            finish_right: right_fin,
            cloner_left: exit_cloner::<E, A>(),
            cloner_right: exit_cloner::<E, B>(),
        })))
    }

    /// Runs this description after the duration elapses.
    #[must_use]
    pub fn delay(self, duration: Duration) -> Self {
        IO::<E, ()>::sleep(duration).flat_map(move |()| self)
    }

    /// Produces the current unhandled-defect handler.
    #[must_use]
    pub fn supervisor() -> IO<E, Handler> {
        IO::wrap(Instr::FlatMap(
            Box::new(Instr::Supervisor),
            Box::new(|v| match take_value::<UnhandledFn>(v) {
                Ok(inner) => Instr::Pure(Box::new(Handler { inner })),
                Err(t) => t,
            }),
        ))
    }
}

impl<E: Send + 'static> IO<E, ()> {
    /// The unit description.
    #[must_use]
    pub fn unit() -> Self {
        Self::now(())
    }

    /// Completes with unit after the duration elapses.
    #[must_use]
    pub fn sleep(duration: Duration) -> Self {
        Self::wrap(Instr::Sleep(duration))
    }
}

impl<A: Send + 'static> IO<Never, A> {
    /// Widens the error type of an infallible description.
    #[must_use]
    pub fn widen_err<E2: Send + 'static>(self) -> IO<E2, A> {
        IO::wrap(self.instr)
    }
}

fn err_render<E: Debug + Send + 'static>() -> ErrRender {
    Arc::new(|erased| match erased.downcast_ref::<E>() {
        Some(e) => format!("{e:?}"),
        None => "<opaque error>".to_string(),
    })
}

/// Builds the cloner used to fan a fiber's exit out to several joiners.
pub(crate) fn exit_cloner<E, A>() -> ExitCloner
where
    E: Clone + Send + 'static,
    A: Clone + Send + 'static,
{
    Arc::new(|raw: &RawExit| match raw {
        RawExit::Completed(v) => match v.downcast_ref::<A>() {
            Some(a) => RawExit::Completed(Box::new(a.clone())),
            None => RawExit::Terminated(Defect::value_confusion(std::any::type_name::<A>())),
        },
        RawExit::Failed(e, render) => match e.downcast_ref::<E>() {
            Some(e) => RawExit::Failed(Box::new(e.clone()), Arc::clone(render)),
            None => RawExit::Terminated(Defect::value_confusion(std::any::type_name::<E>())),
        },
        RawExit::Terminated(d) => RawExit::Terminated(d.clone()),
    })
}

pub(crate) fn exit_into_raw<E: Debug + Send + 'static, A: Send + 'static>(
    exit: Exit<E, A>,
) -> RawExit {
    match exit {
        Exit::Completed(a) => RawExit::Completed(Box::new(a)),
        Exit::Failed(e) => RawExit::Failed(Box::new(e), err_render::<E>()),
        Exit::Terminated(d) => RawExit::Terminated(d),
    }
}

pub(crate) fn exit_from_raw<E: Send + 'static, A: Send + 'static>(raw: RawExit) -> Exit<E, A> {
    match raw {
        RawExit::Completed(v) => match take_value::<A>(v) {
            Ok(a) => Exit::Completed(a),
            Err(_) => Exit::Terminated(Defect::value_confusion(std::any::type_name::<A>())),
        },
        RawExit::Failed(e, _) => match take_value::<E>(e) {
            Ok(e) => Exit::Failed(e),
            Err(_) => Exit::Terminated(Defect::value_confusion(std::any::type_name::<E>())),
        },
        RawExit::Terminated(d) => Exit::Terminated(d),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::instr::Tag;

    #[test]
    fn constructors_build_the_expected_nodes() {
        assert_eq!(IO::<Never, i32>::now(1).instr.tag(), Tag::Pure);
        assert_eq!(IO::<Never, i32>::point(|| 1).instr.tag(), Tag::Point);
        assert_eq!(IO::<Never, i32>::sync(|| 1).instr.tag(), Tag::Sync);
        assert_eq!(IO::<&str, i32>::fail("e").instr.tag(), Tag::Fail);
        assert_eq!(
            IO::<Never, i32>::terminate(Defect::new("boom")).instr.tag(),
            Tag::Terminate
        );
        assert_eq!(IO::<Never, ()>::sleep(Duration::ZERO).instr.tag(), Tag::Sleep);
        assert_eq!(IO::<Never, i32>::never().instr.tag(), Tag::AsyncEffect);
    }

    #[test]
    fn combinators_wrap_rather_than_evaluate() {
        let composed = IO::<Never, i32>::now(1)
            .flat_map(|n| IO::now(n + 1))
            .ensuring(IO::unit())
            .uninterruptible();
        assert_eq!(composed.instr.tag(), Tag::Uninterruptible);
    }

    #[test]
    fn exit_round_trips_through_raw() {
        let exit: Exit<&str, i32> = Exit::Completed(9);
        let raw = exit_into_raw(exit.clone());
        assert_eq!(exit_from_raw::<&str, i32>(raw), exit);

        let exit: Exit<&str, i32> = Exit::Failed("nope");
        let raw = exit_into_raw(exit.clone());
        assert_eq!(exit_from_raw::<&str, i32>(raw), exit);
    }

    #[test]
    fn cloner_preserves_every_variant() {
        let cloner = exit_cloner::<&str, i32>();
        let cloned = cloner(&RawExit::Completed(Box::new(5_i32)));
        assert_eq!(exit_from_raw::<&str, i32>(cloned), Exit::Completed(5));

        let cloned = cloner(&RawExit::Failed(Box::new("e"), err_render::<&str>()));
        assert_eq!(exit_from_raw::<&str, i32>(cloned), Exit::Failed("e"));

        let d = Defect::new("boom");
        let cloned = cloner(&RawExit::Terminated(d.clone()));
        assert_eq!(exit_from_raw::<&str, i32>(cloned), Exit::Terminated(d));
    }

    #[test]
    fn cloner_flags_type_confusion() {
        let cloner = exit_cloner::<&str, i32>();
        let cloned = cloner(&RawExit::Completed(Box::new("wrong".to_string())));
        assert!(matches!(cloned, RawExit::Terminated(_)));
    }
}
