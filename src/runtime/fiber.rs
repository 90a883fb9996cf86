//! Fiber contexts, the interpreter loop, and the public fiber handle.
//!
//! Each fiber owns an evaluation stack and walks its instruction tree until
//! it produces a value with an empty stack, fails without a handler, is
//! terminated, suspends in an async registration, or exhausts its yield
//! budget and resubmits itself to the pool. Interruption and resumption
//! coordinate through the state machine in [`status`](super::status): the
//! parked stack is the token of execution, and whoever takes it runs next.

use crate::io::instr::{
    BoxValue, Instr, RaceSpec, RawAsync, RawCallback, RawCanceler, RawExit, RegisterFn,
    RegisterIoFn, UnhandledFn, take_value,
};
use crate::io::{IO, exit_cloner};
use crate::observability::{self, LogLevel};
use crate::runtime::RtsShared;
use crate::runtime::race::{Arrival, RaceState};
use crate::runtime::stack::{ErrorUnwind, EvalStack, Frame, InterruptUnwind};
use crate::runtime::status::{
    DoneOutcome, FiberState, JoinerFn, KillOutcome, KillerFn, ParkOutcome, TryResume,
};
use crate::runtime::supervision::SupervisionScopes;
use crate::types::{Defect, Never};
use parking_lot::Mutex;
use std::marker::PhantomData;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

/// One step of the interpreter loop.
enum StepOutcome {
    /// Keep looping with the next instruction.
    Continue(Instr),
    /// The fiber completed, parked, or was handed off; this invocation is
    /// over.
    Finished,
}

/// The per-fiber mutable context shared between the interpreter, async
/// callbacks, and interruptors.
pub(crate) struct FiberContext {
    id: u64,
    /// Self-reference for handing the context to closures and callbacks.
    myself: Weak<FiberContext>,
    rts: Arc<RtsShared>,
    unhandled: UnhandledFn,
    cloner: crate::io::ExitCloner,
    /// Latched on the first interrupt request; never cleared.
    killed: AtomicBool,
    /// Nesting depth of uninterruptible regions. Written only by the thread
    /// interpreting the fiber; read by interruptors.
    no_interrupt: AtomicU32,
    state: Mutex<FiberState>,
    supervision: Mutex<SupervisionScopes<FiberContext>>,
}

impl std::fmt::Debug for FiberContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberContext").field("id", &self.id).finish()
    }
}

impl FiberContext {
    /// Creates a fiber context, ready for its first `evaluate`.
    pub(crate) fn new(
        rts: Arc<RtsShared>,
        unhandled: UnhandledFn,
        cloner: crate::io::ExitCloner,
    ) -> Arc<Self> {
        Arc::new_cyclic(|myself| Self {
            id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
            myself: myself.clone(),
            rts,
            unhandled,
            cloner,
            killed: AtomicBool::new(false),
            no_interrupt: AtomicU32::new(0),
            state: Mutex::new(FiberState::new()),
            supervision: Mutex::new(SupervisionScopes::new()),
        })
    }

    /// The owning `Arc`; infallible while any strong reference is alive,
    /// which a `&self` borrow guarantees.
    fn arc(&self) -> Arc<Self> {
        self.myself
            .upgrade()
            .expect("fiber context outlives its self-reference")
    }

    /// Creates a fiber and submits its evaluator to the pool.
    pub(crate) fn spawn(
        rts: &Arc<RtsShared>,
        instr: Instr,
        unhandled: UnhandledFn,
        cloner: crate::io::ExitCloner,
    ) -> Arc<Self> {
        let fiber = Self::new(Arc::clone(rts), unhandled, cloner);
        let job_fiber = Arc::clone(&fiber);
        rts.submit(Box::new(move || job_fiber.evaluate(instr)));
        fiber
    }

    pub(crate) fn fiber_id(&self) -> u64 {
        self.id
    }

    /// One evaluator invocation: takes the parked stack and interprets until
    /// the next suspension point.
    pub(crate) fn evaluate(&self, start: Instr) {
        match self.state.lock().take_stack() {
            Some(stack) => self.run_loop(stack, start),
            None => observability::log(
                LogLevel::Error,
                "fiber",
                format_args!("fiber {} scheduled while its stack is held elsewhere", self.id),
            ),
        }
    }

    /// Callback-side resumption entry point.
    pub(crate) fn resume_async(&self, exit: RawExit) {
        let decision = self.state.lock().try_resume(exit);
        match decision {
            TryResume::Run {
                stack,
                reentrancy,
                exit,
            } => {
                if reentrancy > self.rts.max_resumption_depth() {
                    let ctx = self.arc();
                    self.rts
                        .submit(Box::new(move || ctx.run_loop(stack, inject(exit))));
                } else {
                    self.run_loop(stack, inject(exit));
                }
            }
            TryResume::Stashed | TryResume::Discarded => {}
        }
    }

    fn run_loop(&self, stack: EvalStack, start: Instr) {
        let yield_max = self.rts.yield_max_op_count();
        let mut slot = Some(stack);
        let mut cur = start;
        let mut op_count: u32 = 0;
        loop {
            // A latched interrupt takes effect at the first interruptible
            // step; unwinding then runs under forced protection.
            if self.killed.load(Ordering::Acquire)
                && self.no_interrupt.load(Ordering::Acquire) == 0
            {
                if let Some(defect) = self.state.lock().take_terminating() {
                    self.no_interrupt.fetch_add(1, Ordering::AcqRel);
                    cur = Instr::Terminate(defect);
                }
            }

            op_count += 1;
            if op_count >= yield_max {
                if let Some(stack) = slot.take() {
                    self.state.lock().park_for_yield(stack);
                }
                let ctx = self.arc();
                self.rts.submit(Box::new(move || ctx.evaluate(cur)));
                return;
            }

            match catch_unwind(AssertUnwindSafe(|| self.step(&mut slot, cur))) {
                Ok(StepOutcome::Continue(next)) => cur = next,
                Ok(StepOutcome::Finished) => return,
                Err(payload) => {
                    if slot.is_none() {
                        // The stack was parked or handed off before the
                        // panic; nothing left to unwind here.
                        return;
                    }
                    self.no_interrupt.fetch_add(1, Ordering::AcqRel);
                    cur = Instr::Terminate(Defect::from_panic(payload));
                }
            }
        }
    }

    fn step(&self, slot: &mut Option<EvalStack>, cur: Instr) -> StepOutcome {
        match cur {
            Instr::Pure(value) => self.produce(slot, value),
            Instr::Point(thunk) | Instr::Sync(thunk) => self.produce(slot, thunk()),
            Instr::FlatMap(inner, k) => match *inner {
                // Fast path: compute value-shaped inner nodes inline
                // without touching the stack.
                Instr::Pure(value) => StepOutcome::Continue(k(value)),
                Instr::Point(thunk) | Instr::Sync(thunk) => StepOutcome::Continue(k(thunk())),
                other => {
                    if let Some(stack) = slot.as_mut() {
                        stack.push(Frame::Cont(k));
                    }
                    StepOutcome::Continue(other)
                }
            },
            Instr::Redeem(inner, err, ok) => {
                if let Some(stack) = slot.as_mut() {
                    stack.push(Frame::Redeem { err, ok });
                }
                StepOutcome::Continue(*inner)
            }
            Instr::Fail(error, render) => self.fail_step(slot, error, render),
            Instr::Terminate(defect) => self.terminate_step(slot, defect),
            Instr::AsyncEffect(register) => self.async_step(slot, register),
            Instr::AsyncIoEffect(register) => self.async_io_step(slot, register),
            Instr::Fork(inner, handler, cloner) => {
                let child = self.spawn_child(*inner, handler, cloner);
                self.produce(slot, Box::new(FiberHandle { ctx: child }))
            }
            Instr::RunToExit(inner, cloner) => {
                let child = self.spawn_child(*inner, None, cloner);
                StepOutcome::Continue(join_exit_instr(child))
            }
            Instr::Race(spec) => StepOutcome::Continue(self.race_step(*spec)),
            Instr::Suspend(thunk) => StepOutcome::Continue(thunk()),
            Instr::Uninterruptible(inner) => {
                self.no_interrupt.fetch_add(1, Ordering::AcqRel);
                let ctx = self.arc();
                let reenable = Instr::Sync(Box::new(move || {
                    ctx.exit_uninterruptible();
                    Box::new(()) as BoxValue
                }));
                StepOutcome::Continue(Instr::Ensuring(inner, Box::new(reenable)))
            }
            Instr::Sleep(duration) => StepOutcome::Continue(self.sleep_instr(duration)),
            Instr::Supervise(inner, cause) => {
                self.supervision.lock().enter();
                let finalizer = exit_supervision_instr(self.arc(), cause);
                StepOutcome::Continue(Instr::Ensuring(inner, Box::new(finalizer)))
            }
            Instr::Supervisor => self.produce(slot, Box::new(self.unhandled.clone())),
            Instr::Ensuring(inner, finalizer) => {
                if let Some(stack) = slot.as_mut() {
                    stack.push(Frame::Finalizer(*finalizer));
                }
                StepOutcome::Continue(*inner)
            }
            Instr::TryFin(inner) => {
                if let Some(stack) = slot.as_mut() {
                    stack.push(Frame::Fold);
                }
                StepOutcome::Continue(*inner)
            }
        }
    }

    /// Routes a produced value through the stack.
    fn produce(&self, slot: &mut Option<EvalStack>, value: BoxValue) -> StepOutcome {
        let Some(stack) = slot.as_mut() else {
            return StepOutcome::Finished;
        };
        let mut value = value;
        loop {
            match stack.pop() {
                None => {
                    self.finish(RawExit::Completed(value));
                    return StepOutcome::Finished;
                }
                Some(Frame::Cont(k)) => return StepOutcome::Continue(k(value)),
                Some(Frame::Redeem { ok, .. }) => return StepOutcome::Continue(ok(value)),
                Some(Frame::Fold) => value = Box::new(RawExit::Completed(value)),
                Some(Frame::Finalizer(finalizer)) => {
                    return StepOutcome::Continue(self.finalize_then_restore(finalizer, value));
                }
            }
        }
    }

    /// Runs a finalizer on the success path, reporting (not raising) its
    /// defects, then restores the value.
    fn finalize_then_restore(&self, finalizer: Instr, value: BoxValue) -> Instr {
        match finalizer {
            // Value-shaped finalizers run inline.
            Instr::Pure(_) => Instr::Pure(value),
            Instr::Sync(thunk) | Instr::Point(thunk) => {
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| {
                    thunk();
                })) {
                    self.report_defect(Defect::from_panic(payload));
                }
                Instr::Pure(value)
            }
            // Anything else runs isolated on a child fiber so its defects
            // cannot take this fiber down. The child carries a no-op
            // handler: its terminal defect is reported exactly once, here.
            finalizer => {
                let child = FiberContext::spawn(
                    &self.rts,
                    finalizer,
                    noop_unhandled(),
                    exit_cloner::<Never, ()>(),
                );
                let ctx = self.arc();
                Instr::FlatMap(
                    Box::new(join_exit_instr(child)),
                    Box::new(move |exit| match take_value::<RawExit>(exit) {
                        Ok(RawExit::Terminated(defect)) => {
                            ctx.report_defect(defect);
                            Instr::Pure(value)
                        }
                        Ok(_) => Instr::Pure(value),
                        Err(t) => t,
                    }),
                )
            }
        }
    }

    fn fail_step(
        &self,
        slot: &mut Option<EvalStack>,
        error: BoxValue,
        render: crate::io::ErrRender,
    ) -> StepOutcome {
        let Some(stack) = slot.as_mut() else {
            return StepOutcome::Finished;
        };
        match stack.unwind_error() {
            ErrorUnwind::Handler {
                handler,
                finalizers,
            } => {
                if finalizers.is_empty() {
                    StepOutcome::Continue(handler(error))
                } else {
                    let dispatch = self.enter_protected(self.finalizer_dispatch(finalizers));
                    StepOutcome::Continue(Instr::FlatMap(
                        Box::new(dispatch),
                        Box::new(move |_| handler(error)),
                    ))
                }
            }
            ErrorUnwind::Uncaught { finalizers } => {
                if finalizers.is_empty() {
                    self.report_defect(Defect::uncaught_failure(render(error.as_ref())));
                    self.finish(RawExit::Failed(error, render));
                    StepOutcome::Finished
                } else {
                    let dispatch = self.enter_protected(self.finalizer_dispatch(finalizers));
                    StepOutcome::Continue(Instr::FlatMap(
                        Box::new(dispatch),
                        Box::new(move |_| Instr::Fail(error, render)),
                    ))
                }
            }
        }
    }

    fn terminate_step(&self, slot: &mut Option<EvalStack>, defect: Defect) -> StepOutcome {
        let Some(stack) = slot.as_mut() else {
            return StepOutcome::Finished;
        };
        match stack.unwind_interrupt() {
            InterruptUnwind::Fold { finalizers } => {
                // The defect belongs to a nested finalizer evaluation:
                // deliver it as that evaluation's exit.
                let resume = Instr::Pure(Box::new(RawExit::Terminated(defect)) as BoxValue);
                if finalizers.is_empty() {
                    StepOutcome::Continue(resume)
                } else {
                    let dispatch = self.finalizer_dispatch(finalizers);
                    StepOutcome::Continue(Instr::FlatMap(
                        Box::new(dispatch),
                        Box::new(move |_| resume),
                    ))
                }
            }
            InterruptUnwind::Empty { finalizers } => {
                if finalizers.is_empty() {
                    self.report_defect(defect.clone());
                    self.finish(RawExit::Terminated(defect));
                    StepOutcome::Finished
                } else {
                    // Protection stays raised through the re-raise: the
                    // fiber is already dying of `defect`, and a competing
                    // interrupt must not replace that cause mid-unwind.
                    self.no_interrupt.fetch_add(1, Ordering::AcqRel);
                    let dispatch = self.finalizer_dispatch(finalizers);
                    StepOutcome::Continue(Instr::FlatMap(
                        Box::new(dispatch),
                        Box::new(move |_| Instr::Terminate(defect)),
                    ))
                }
            }
        }
    }

    /// Builds the dispatch of collected finalizers; its value is unit, and
    /// every defect the finalizers raised is reported in
    /// reverse-chronological order.
    ///
    /// Callers on a live fiber must already hold interrupt protection; the
    /// dispatch itself does not establish it.
    fn finalizer_dispatch(&self, finalizers: Vec<Instr>) -> Instr {
        let ctx = self.arc();
        let combined = combine_finalizers(finalizers.into_iter(), Vec::new());
        Instr::FlatMap(
            Box::new(combined),
            Box::new(move |defects| match take_value::<Vec<Defect>>(defects) {
                Ok(defects) => {
                    for defect in defects {
                        ctx.report_defect(defect);
                    }
                    Instr::Pure(Box::new(()))
                }
                Err(t) => t,
            }),
        )
    }

    /// Raises interrupt protection immediately and lowers it when `body`
    /// completes. Raising it here, not at dispatch, closes the window in
    /// which a latched interrupt could discard freshly-collected
    /// finalizers.
    fn enter_protected(&self, body: Instr) -> Instr {
        self.no_interrupt.fetch_add(1, Ordering::AcqRel);
        let ctx = self.arc();
        let reenable = Instr::Sync(Box::new(move || {
            ctx.exit_uninterruptible();
            Box::new(()) as BoxValue
        }));
        Instr::Ensuring(Box::new(body), Box::new(reenable))
    }

    fn async_step(
        &self,
        slot: &mut Option<EvalStack>,
        register: RegisterFn,
    ) -> StepOutcome {
        let id = self.state.lock().enter_async_start();
        let ctx = self.arc();
        let callback: RawCallback = Box::new(move |exit| ctx.resume_async(exit));
        match catch_unwind(AssertUnwindSafe(|| register(callback))) {
            Err(payload) => {
                self.state.lock().enter_async_end();
                self.no_interrupt.fetch_add(1, Ordering::AcqRel);
                StepOutcome::Continue(Instr::Terminate(Defect::from_panic(payload)))
            }
            Ok(RawAsync::Now(exit)) => {
                let next = {
                    let mut guard = self.state.lock();
                    let next = if guard.try_consume_resume() {
                        Some(exit)
                    } else {
                        // A synchronous callback consumed the resumption
                        // first; its exit takes precedence.
                        guard.pending_resume.take()
                    };
                    guard.enter_async_end();
                    next
                };
                match next {
                    Some(exit) => StepOutcome::Continue(inject(exit)),
                    None => StepOutcome::Continue(Instr::Terminate(Defect::new(
                        "async registration resolved twice",
                    ))),
                }
            }
            Ok(RawAsync::MaybeLater(canceler)) => self.park_step(slot, id, canceler),
            Ok(RawAsync::MaybeLaterIo(cancel_io)) => {
                let rts = Arc::clone(&self.rts);
                let unhandled = self.unhandled.clone();
                let canceler: RawCanceler = Box::new(move |defect| {
                    // Lift the effectful canceler onto a fresh top-level
                    // fiber.
                    let instr = cancel_io(defect);
                    let _ = FiberContext::spawn(&rts, instr, unhandled, exit_cloner::<Never, ()>());
                });
                self.park_step(slot, id, canceler)
            }
        }
    }

    fn async_io_step(
        &self,
        slot: &mut Option<EvalStack>,
        register: RegisterIoFn,
    ) -> StepOutcome {
        let id = self.state.lock().enter_async_start();
        let ctx = self.arc();
        let callback: RawCallback = Box::new(move |exit| ctx.resume_async(exit));
        match catch_unwind(AssertUnwindSafe(|| register(callback))) {
            Err(payload) => {
                self.state.lock().enter_async_end();
                self.no_interrupt.fetch_add(1, Ordering::AcqRel);
                StepOutcome::Continue(Instr::Terminate(Defect::from_panic(payload)))
            }
            Ok(registration) => {
                let _ = FiberContext::spawn(
                    &self.rts,
                    registration,
                    self.unhandled.clone(),
                    exit_cloner::<Never, ()>(),
                );
                self.park_step(slot, id, Box::new(|_| {}))
            }
        }
    }

    /// Parks at a suspension point, honoring stashed resumptions and due
    /// interrupts. Ends the async initiation either way.
    fn park_step(
        &self,
        slot: &mut Option<EvalStack>,
        id: u32,
        canceler: RawCanceler,
    ) -> StepOutcome {
        let Some(stack) = slot.take() else {
            return StepOutcome::Finished;
        };
        let interruptible = self.no_interrupt.load(Ordering::Acquire) == 0;
        let outcome = {
            let mut guard = self.state.lock();
            let outcome = guard.park(id, canceler, stack, interruptible);
            guard.enter_async_end();
            outcome
        };
        match outcome {
            ParkOutcome::Parked => StepOutcome::Finished,
            ParkOutcome::Stolen { stack, exit } => {
                *slot = Some(stack);
                StepOutcome::Continue(inject(exit))
            }
            ParkOutcome::Interrupted {
                stack,
                defect,
                canceler,
            } => {
                *slot = Some(stack);
                if let Some(cancel) = canceler {
                    let cause = defect.clone();
                    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| cancel(cause))) {
                        self.report_defect(Defect::from_panic(payload));
                    }
                }
                self.no_interrupt.fetch_add(1, Ordering::AcqRel);
                StepOutcome::Continue(Instr::Terminate(defect))
            }
        }
    }

    fn race_step(&self, spec: RaceSpec) -> Instr {
        let RaceSpec {
            left,
            right,
            finish_left,
            finish_right,
            cloner_left,
            cloner_right,
        } = spec;
        let left_child = self.spawn_child(left, None, cloner_left);
        let right_child = self.spawn_child(right, None, cloner_right);
        let race = Arc::new(RaceState::new());

        let left_loser = FiberHandle {
            ctx: Arc::clone(&left_child),
        };
        let right_loser = FiberHandle {
            ctx: Arc::clone(&right_child),
        };

        let register: RegisterFn = Box::new(move |cb| {
            race.install(cb);
            left_child.join_raw(race_arrival(Arc::clone(&race), finish_left, right_loser));
            right_child.join_raw(race_arrival(Arc::clone(&race), finish_right, left_loser));
            RawAsync::MaybeLater(Box::new(|_| {}))
        });

        // The winner resumes us with its finisher's description; flatten it.
        Instr::FlatMap(
            Box::new(Instr::AsyncEffect(register)),
            Box::new(|v| match take_value::<Instr>(v) {
                Ok(instr) => instr,
                Err(t) => t,
            }),
        )
    }

    fn sleep_instr(&self, duration: Duration) -> Instr {
        let rts = Arc::clone(&self.rts);
        Instr::AsyncEffect(Box::new(move |cb| {
            let key = rts.schedule(
                Box::new(move || cb(RawExit::completed_unit())),
                duration,
            );
            RawAsync::MaybeLater(Box::new(move |_| {
                let _ = key.cancel();
            }))
        }))
    }

    fn spawn_child(
        &self,
        instr: Instr,
        handler: Option<UnhandledFn>,
        cloner: crate::io::ExitCloner,
    ) -> Arc<FiberContext> {
        let unhandled = handler.unwrap_or_else(|| self.unhandled.clone());
        let child = FiberContext::new(Arc::clone(&self.rts), unhandled, cloner);
        self.supervision.lock().register(&child);
        let job_child = Arc::clone(&child);
        self.rts.submit(Box::new(move || job_child.evaluate(instr)));
        child
    }

    fn exit_uninterruptible(&self) {
        let _ = self
            .no_interrupt
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(1))
            });
    }

    /// Records the exit and fans out to killers, then joiners, each on a
    /// pool worker.
    fn finish(&self, exit: RawExit) {
        let outcome = self.state.lock().done(exit);
        if let DoneOutcome::Fanout { joiners, killers } = outcome {
            self.fanout_stored(joiners, killers);
        }
    }

    fn fanout_stored(&self, joiners: Vec<JoinerFn>, killers: Vec<KillerFn>) {
        let clones: Vec<RawExit> = {
            let guard = self.state.lock();
            match guard.done_exit() {
                Some(stored) => joiners.iter().map(|_| (self.cloner)(stored)).collect(),
                None => Vec::new(),
            }
        };
        for killer in killers {
            self.rts
                .submit(Box::new(move || killer(RawExit::completed_unit())));
        }
        for (joiner, exit) in joiners.into_iter().zip(clones) {
            self.rts.submit(Box::new(move || joiner(exit)));
        }
    }

    /// Registers a joiner; fires immediately if the fiber has resolved.
    pub(crate) fn join_raw(&self, cb: JoinerFn) {
        let immediate = {
            let mut guard = self.state.lock();
            match guard.register_joiner(cb) {
                Some((cb, exit)) => {
                    let clone = (self.cloner)(exit);
                    Some((cb, clone))
                }
                None => None,
            }
        };
        if let Some((cb, exit)) = immediate {
            cb(exit);
        }
    }

    /// Requests interruption with `defect`; `cb` fires once the fiber has
    /// fully stopped (finalizers included).
    pub(crate) fn kill_raw(&self, defect: Defect, cb: KillerFn) {
        self.killed.store(true, Ordering::Release);
        let interruptible = self.no_interrupt.load(Ordering::Acquire) == 0;
        let outcome = self
            .state
            .lock()
            .kill(defect.clone(), cb, interruptible);
        match outcome {
            KillOutcome::AlreadyDone(cb) => cb(RawExit::completed_unit()),
            KillOutcome::Deferred => {}
            KillOutcome::Interrupt {
                mut stack,
                canceler,
                joiners,
                killers,
            } => {
                observability::log(
                    LogLevel::Debug,
                    "fiber",
                    format_args!("fiber {} interrupted while suspended: {defect}", self.id),
                );
                if let Some(cancel) = canceler {
                    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| cancel(defect))) {
                        self.report_defect(Defect::from_panic(payload));
                    }
                }
                let finalizers = match stack.unwind_interrupt() {
                    InterruptUnwind::Empty { finalizers }
                    | InterruptUnwind::Fold { finalizers } => finalizers,
                };
                if finalizers.is_empty() {
                    self.fanout_stored(joiners, killers);
                } else {
                    // Run the finalizers on a fresh fiber; notify once it
                    // settles.
                    let dispatch = self.finalizer_dispatch(finalizers);
                    let child = FiberContext::spawn(
                        &self.rts,
                        dispatch,
                        self.unhandled.clone(),
                        exit_cloner::<Never, ()>(),
                    );
                    let ctx = self.arc();
                    child.join_raw(Box::new(move |_| ctx.fanout_stored(joiners, killers)));
                }
            }
        }
    }

    /// Dispatches a defect to the unhandled handler on a fresh fiber.
    ///
    /// The report fiber carries a no-op handler so a defective handler
    /// cannot recurse.
    pub(crate) fn report_defect(&self, defect: Defect) {
        let instr = (self.unhandled)(defect);
        let _ = FiberContext::spawn(
            &self.rts,
            instr,
            noop_unhandled(),
            exit_cloner::<Never, ()>(),
        );
    }
}

fn inject(exit: RawExit) -> Instr {
    match exit {
        RawExit::Completed(value) => Instr::Pure(value),
        RawExit::Failed(error, render) => Instr::Fail(error, render),
        RawExit::Terminated(defect) => Instr::Terminate(defect),
    }
}

/// Chains collected finalizers: each runs under a fold frame, its defect
/// (if any) appended; the chain's value is the reverse-chronological defect
/// list.
fn combine_finalizers(mut finalizers: std::vec::IntoIter<Instr>, mut defects: Vec<Defect>) -> Instr {
    match finalizers.next() {
        None => {
            defects.reverse();
            Instr::Pure(Box::new(defects))
        }
        Some(finalizer) => Instr::FlatMap(
            Box::new(Instr::TryFin(Box::new(finalizer))),
            Box::new(move |exit| match take_value::<RawExit>(exit) {
                Ok(RawExit::Terminated(defect)) => {
                    defects.push(defect);
                    combine_finalizers(finalizers, defects)
                }
                Ok(_) => combine_finalizers(finalizers, defects),
                Err(t) => t,
            }),
        ),
    }
}

/// An async node whose value is the target fiber's exit.
fn join_exit_instr(ctx: Arc<FiberContext>) -> Instr {
    Instr::AsyncEffect(Box::new(move |cb| {
        ctx.join_raw(Box::new(move |exit| {
            cb(RawExit::Completed(Box::new(exit)));
        }));
        RawAsync::MaybeLater(Box::new(|_| {}))
    }))
}

/// One race arrival: applies the protocol, and on a win resumes the racer
/// with the finisher applied to the winning value (or with the propagated
/// failure when both sides failed).
fn race_arrival(
    race: Arc<RaceState>,
    finisher: crate::io::instr::FinisherFn,
    loser: FiberHandle,
) -> JoinerFn {
    Box::new(move |exit: RawExit| {
        let completed = matches!(exit, RawExit::Completed(_));
        if race.arrive(completed) == Arrival::Win {
            if let Some(cb) = race.take_callback() {
                let outcome = match exit {
                    RawExit::Completed(value) => {
                        RawExit::Completed(Box::new(finisher(value, loser)) as BoxValue)
                    }
                    other => other,
                };
                cb(outcome);
            }
        }
    })
}

/// The finalizer of a supervision scope: pops the innermost child set and
/// sequentially interrupts every child still running.
fn exit_supervision_instr(ctx: Arc<FiberContext>, cause: Defect) -> Instr {
    Instr::Suspend(Box::new(move || {
        let children = ctx.supervision.lock().exit();
        let mut sequence = Instr::Pure(Box::new(()) as BoxValue);
        for child in children {
            let defect = cause.clone();
            sequence = Instr::FlatMap(
                Box::new(sequence),
                Box::new(move |_| interrupt_child_instr(child, defect)),
            );
        }
        sequence
    }))
}

fn interrupt_child_instr(child: Arc<FiberContext>, defect: Defect) -> Instr {
    Instr::AsyncEffect(Box::new(move |cb| {
        child.kill_raw(defect, Box::new(move |exit| cb(exit)));
        RawAsync::MaybeLater(Box::new(|_| {}))
    }))
}

pub(crate) fn noop_unhandled() -> UnhandledFn {
    Arc::new(|_| Instr::Pure(Box::new(()) as BoxValue))
}

/// An erased handle to a running fiber.
#[derive(Clone)]
pub(crate) struct FiberHandle {
    pub(crate) ctx: Arc<FiberContext>,
}

impl std::fmt::Debug for FiberHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FiberHandle({})", self.ctx.fiber_id())
    }
}

/// A typed handle to a forked fiber.
///
/// Join delivers the fiber's exit into the joining program: a completed
/// value resumes it, a failure re-raises, a termination terminates.
/// Interrupt resolves once the target has fully stopped.
pub struct Fiber<E, A> {
    handle: FiberHandle,
    _marker: PhantomData<fn() -> (E, A)>,
}

impl<E, A> Clone for Fiber<E, A> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            _marker: PhantomData,
        }
    }
}

impl<E, A> std::fmt::Debug for Fiber<E, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fiber({})", self.handle.ctx.fiber_id())
    }
}

impl<E: Send + 'static, A: Send + 'static> Fiber<E, A> {
    pub(crate) fn new(handle: FiberHandle) -> Self {
        Self {
            handle,
            _marker: PhantomData,
        }
    }

    /// Awaits the fiber's exit, re-raising its failure or termination.
    #[must_use]
    pub fn join(&self) -> IO<E, A> {
        let handle = self.handle.clone();
        IO::wrap(Instr::AsyncEffect(Box::new(move |cb| {
            handle.ctx.join_raw(Box::new(move |exit| cb(exit)));
            RawAsync::MaybeLater(Box::new(|_| {}))
        })))
    }

    /// Interrupts the fiber with `defect`; completes once the target has
    /// fully stopped, finalizers included.
    #[must_use]
    pub fn interrupt(&self, defect: Defect) -> IO<Never, ()> {
        let handle = self.handle.clone();
        IO::wrap(Instr::AsyncEffect(Box::new(move |cb| {
            handle.ctx.kill_raw(defect, Box::new(move |exit| cb(exit)));
            RawAsync::MaybeLater(Box::new(|_| {}))
        })))
    }
}
