//! The runtime host: worker pool, scheduled executor, and entry points.
//!
//! A [`Runtime`] owns the two pools every fiber runs on. Programs enter
//! through [`run`](Runtime::run) / [`run_exit`](Runtime::run_exit)
//! (blocking) or [`run_async`](Runtime::run_async) (callback), and the host
//! shuts both pools down with
//! [`shutdown_and_wait`](Runtime::shutdown_and_wait).

pub(crate) mod fiber;
pub(crate) mod pool;
pub(crate) mod race;
pub(crate) mod stack;
pub(crate) mod status;
pub(crate) mod supervision;
pub(crate) mod timer;

pub use self::fiber::Fiber;

use self::fiber::FiberContext;
use self::pool::{Job, ThreadPool};
use self::timer::{ScheduleKey, ScheduledExecutor};
use crate::io::instr::{BoxValue, Instr, RawExit, UnhandledFn};
use crate::io::{IO, exit_cloner, exit_from_raw};
use crate::observability::{self, LogLevel};
use crate::types::{Defect, Exit, FiberError, RtsConfig};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Everything fibers need from their host.
pub(crate) struct RtsShared {
    pool: Arc<ThreadPool>,
    timer: ScheduledExecutor,
    yield_max_op_count: u32,
    max_resumption_depth: u32,
    default_unhandled: UnhandledFn,
}

impl RtsShared {
    pub(crate) fn submit(&self, job: Job) {
        self.pool.submit(job);
    }

    pub(crate) fn schedule(&self, job: Job, delay: Duration) -> ScheduleKey {
        self.timer.schedule(job, delay, &self.pool)
    }

    pub(crate) fn yield_max_op_count(&self) -> u32 {
        self.yield_max_op_count
    }

    pub(crate) fn max_resumption_depth(&self) -> u32 {
        self.max_resumption_depth
    }

    pub(crate) fn default_unhandled(&self) -> UnhandledFn {
        Arc::clone(&self.default_unhandled)
    }
}

/// The fiber runtime: a worker pool, a timer thread, and the configuration
/// knobs fibers consult while running.
///
/// Cloning is cheap and shares the underlying pools. The runtime does not
/// shut down on drop; call
/// [`shutdown_and_wait`](Runtime::shutdown_and_wait) explicitly.
#[derive(Clone)]
pub struct Runtime {
    shared: Arc<RtsShared>,
}

impl Runtime {
    /// Creates a runtime with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RtsConfig::default())
    }

    /// Creates a runtime with explicit knobs.
    #[must_use]
    pub fn with_config(config: RtsConfig) -> Self {
        let pool = Arc::new(ThreadPool::new(config.thread_pool_size));
        let timer = ScheduledExecutor::new(Arc::clone(&pool));
        let default_unhandled = config.unhandled.unwrap_or_else(default_unhandled);
        observability::log(
            LogLevel::Debug,
            "rts",
            format_args!("runtime started with {} workers", pool.size()),
        );
        Self {
            shared: Arc::new(RtsShared {
                pool,
                timer,
                yield_max_op_count: config.yield_max_op_count,
                max_resumption_depth: config.max_resumption_depth,
                default_unhandled,
            }),
        }
    }

    /// Runs a program to completion, blocking the caller.
    ///
    /// Returns the value, or a [`FiberError`] wrapping the typed failure or
    /// the terminating defect.
    pub fn run<E, A>(&self, io: IO<E, A>) -> Result<A, FiberError<E>>
    where
        E: Clone + Send + 'static,
        A: Clone + Send + 'static,
    {
        self.run_exit(io).into_result()
    }

    /// Runs a program to completion, blocking the caller, and returns the
    /// raw [`Exit`].
    pub fn run_exit<E, A>(&self, io: IO<E, A>) -> Exit<E, A>
    where
        E: Clone + Send + 'static,
        A: Clone + Send + 'static,
    {
        let cell = Arc::new((Mutex::new(None::<RawExit>), Condvar::new()));
        let fiber = FiberContext::new(
            Arc::clone(&self.shared),
            self.shared.default_unhandled(),
            exit_cloner::<E, A>(),
        );
        let waiter = Arc::clone(&cell);
        fiber.join_raw(Box::new(move |exit| {
            let (slot, signal) = &*waiter;
            *slot.lock() = Some(exit);
            signal.notify_all();
        }));
        let instr = io.into_instr();
        let job_fiber = Arc::clone(&fiber);
        self.shared
            .submit(Box::new(move || job_fiber.evaluate(instr)));

        let (slot, signal) = &*cell;
        let mut guard = slot.lock();
        while guard.is_none() {
            signal.wait(&mut guard);
        }
        match guard.take() {
            Some(raw) => exit_from_raw::<E, A>(raw),
            None => Exit::Terminated(Defect::new("runtime wait lost its exit")),
        }
    }

    /// Starts a program without blocking; `k` receives the exit on a pool
    /// thread (or immediately if the fiber is already complete).
    pub fn run_async<E, A, K>(&self, io: IO<E, A>, k: K)
    where
        E: Clone + Send + 'static,
        A: Clone + Send + 'static,
        K: FnOnce(Exit<E, A>) + Send + 'static,
    {
        let fiber = FiberContext::new(
            Arc::clone(&self.shared),
            self.shared.default_unhandled(),
            exit_cloner::<E, A>(),
        );
        fiber.join_raw(Box::new(move |exit| k(exit_from_raw::<E, A>(exit))));
        let instr = io.into_instr();
        let job_fiber = Arc::clone(&fiber);
        self.shared
            .submit(Box::new(move || job_fiber.evaluate(instr)));
    }

    /// Shuts down the timer thread and the worker pool, waiting up to
    /// `timeout` in total. Returns true if both stopped in time.
    ///
    /// Fibers still queued or suspended are abandoned.
    pub fn shutdown_and_wait(&self, timeout: Duration) -> bool {
        let started = Instant::now();
        let timer_ok = self.shared.timer.shutdown_and_wait(timeout);
        let remaining = timeout.saturating_sub(started.elapsed());
        let pool_ok = self.shared.pool.shutdown_and_wait(remaining);
        timer_ok && pool_ok
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("workers", &self.shared.pool.size())
            .finish()
    }
}

fn default_unhandled() -> UnhandledFn {
    Arc::new(|defect: Defect| {
        Instr::Sync(Box::new(move || {
            observability::log(
                LogLevel::Error,
                "rts",
                format_args!("unhandled defect: {defect}"),
            );
            Box::new(()) as BoxValue
        }))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;
    use crate::types::Never;

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    fn small_runtime() -> Runtime {
        Runtime::with_config(RtsConfig::default().with_thread_pool_size(2))
    }

    #[test]
    fn run_returns_a_pure_value() {
        init_test("run_returns_a_pure_value");
        let rts = small_runtime();
        let value = rts.run(IO::<Never, i32>::now(42));
        crate::assert_with_log!(value == Ok(42), "pure value", Ok::<i32, Never>(42), value);
        rts.shutdown_and_wait(Duration::from_secs(5));
        crate::test_complete!("run_returns_a_pure_value");
    }

    #[test]
    fn run_surfaces_typed_failures() {
        init_test("run_surfaces_typed_failures");
        let rts = small_runtime();
        let result = rts.run(IO::<&str, i32>::fail("nope"));
        crate::assert_with_log!(
            result == Err(FiberError::Failed("nope")),
            "typed failure surfaces",
            Err::<i32, _>(FiberError::Failed("nope")),
            result
        );
        rts.shutdown_and_wait(Duration::from_secs(5));
        crate::test_complete!("run_surfaces_typed_failures");
    }

    #[test]
    fn run_exit_surfaces_terminations() {
        init_test("run_exit_surfaces_terminations");
        let rts = small_runtime();
        let defect = Defect::new("boom");
        let exit = rts.run_exit(IO::<Never, i32>::terminate(defect.clone()));
        crate::assert_with_log!(
            exit == Exit::Terminated(defect.clone()),
            "termination surfaces",
            Exit::<Never, i32>::Terminated(defect.clone()),
            exit
        );
        rts.shutdown_and_wait(Duration::from_secs(5));
        crate::test_complete!("run_exit_surfaces_terminations");
    }

    #[test]
    fn run_async_delivers_the_exit() {
        init_test("run_async_delivers_the_exit");
        let rts = small_runtime();
        let cell = Arc::new((Mutex::new(None), Condvar::new()));
        let waiter = Arc::clone(&cell);
        rts.run_async(IO::<Never, i32>::sync(|| 7), move |exit| {
            let (slot, signal) = &*waiter;
            *slot.lock() = Some(exit);
            signal.notify_all();
        });
        let (slot, signal) = &*cell;
        let mut guard = slot.lock();
        while guard.is_none() {
            signal.wait(&mut guard);
        }
        let exit = guard.take();
        crate::assert_with_log!(
            exit == Some(Exit::Completed(7)),
            "async exit delivered",
            Some(Exit::<Never, i32>::Completed(7)),
            exit
        );
        drop(guard);
        rts.shutdown_and_wait(Duration::from_secs(5));
        crate::test_complete!("run_async_delivers_the_exit");
    }
}
