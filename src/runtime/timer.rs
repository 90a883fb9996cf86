//! The scheduled executor: one-shot delayed submissions.
//!
//! A single timer thread holds a min-heap of `(deadline, generation, job)`
//! entries, sleeping until the earliest deadline and handing due jobs to the
//! worker pool. Generations break deadline ties in insertion order.
//! Cancellation marks the entry; marked entries are skipped when they
//! surface.

use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::observability::{self, LogLevel};
use crate::runtime::pool::{Job, ThreadPool};

/// Handle to a scheduled job; cancelling is idempotent and best-effort.
pub(crate) struct ScheduleKey {
    cancelled: Arc<AtomicBool>,
}

impl ScheduleKey {
    /// Marks the job cancelled. Returns true if it had not fired or been
    /// cancelled before.
    pub(crate) fn cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::AcqRel)
    }

    fn noop() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }
}

struct TimerEntry {
    deadline: Instant,
    generation: u64,
    cancelled: Arc<AtomicBool>,
    job: Option<Job>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.generation == other.generation
    }
}

impl Eq for TimerEntry {}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reverse ordering for a min-heap (earliest deadline first).
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.generation.cmp(&self.generation))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

struct TimerShared {
    heap: Mutex<BinaryHeap<TimerEntry>>,
    wakeup: Condvar,
    shutdown: AtomicBool,
    next_generation: AtomicU64,
}

/// The single-thread delayed-submission executor.
pub(crate) struct ScheduledExecutor {
    shared: Arc<TimerShared>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl ScheduledExecutor {
    /// Starts the timer thread, which submits due jobs to `pool`.
    pub(crate) fn new(pool: Arc<ThreadPool>) -> Self {
        let shared = Arc::new(TimerShared {
            heap: Mutex::new(BinaryHeap::new()),
            wakeup: Condvar::new(),
            shutdown: AtomicBool::new(false),
            next_generation: AtomicU64::new(0),
        });
        let thread_shared = Arc::clone(&shared);
        let builder = std::thread::Builder::new().name("filament-timer".to_string());
        let thread = match builder.spawn(move || timer_loop(&thread_shared, &pool)) {
            Ok(handle) => Some(handle),
            Err(err) => {
                observability::log(
                    LogLevel::Error,
                    "timer",
                    format_args!("failed to spawn timer thread: {err}"),
                );
                None
            }
        };
        Self {
            shared,
            thread: Mutex::new(thread),
        }
    }

    /// Schedules `job` to be submitted to the pool after `delay`.
    ///
    /// A zero delay degrades to an immediate submission.
    pub(crate) fn schedule(
        &self,
        job: Job,
        delay: Duration,
        pool: &ThreadPool,
    ) -> ScheduleKey {
        if delay.is_zero() {
            pool.submit(job);
            return ScheduleKey::noop();
        }
        let cancelled = Arc::new(AtomicBool::new(false));
        let entry = TimerEntry {
            deadline: Instant::now() + delay,
            generation: self.shared.next_generation.fetch_add(1, Ordering::Relaxed),
            cancelled: Arc::clone(&cancelled),
            job: Some(job),
        };
        {
            let mut heap = self.shared.heap.lock();
            heap.push(entry);
            self.shared.wakeup.notify_one();
        }
        ScheduleKey { cancelled }
    }

    /// Pending (non-fired) entries, including cancelled ones not yet reaped.
    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        self.shared.heap.lock().len()
    }

    /// Signals shutdown and waits up to `timeout` for the timer thread.
    pub(crate) fn shutdown_and_wait(&self, timeout: Duration) -> bool {
        self.shared.shutdown.store(true, Ordering::Release);
        {
            let _guard = self.shared.heap.lock();
            self.shared.wakeup.notify_all();
        }
        let Some(handle) = self.thread.lock().take() else {
            return true;
        };
        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        handle.join().is_ok()
    }
}

fn timer_loop(shared: &Arc<TimerShared>, pool: &Arc<ThreadPool>) {
    let mut heap = shared.heap.lock();
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        let now = Instant::now();
        let mut due: Vec<TimerEntry> = Vec::new();
        while heap.peek().is_some_and(|entry| entry.deadline <= now) {
            if let Some(entry) = heap.pop() {
                due.push(entry);
            }
        }
        if !due.is_empty() {
            // Fire outside the lock so submissions cannot deadlock against
            // new registrations.
            parking_lot::MutexGuard::unlocked(&mut heap, || {
                for mut entry in due {
                    if entry.cancelled.load(Ordering::Acquire) {
                        continue;
                    }
                    if let Some(job) = entry.job.take() {
                        pool.submit(job);
                    }
                }
            });
            continue;
        }
        match heap.peek().map(|entry| entry.deadline) {
            Some(deadline) => {
                let _ = shared.wakeup.wait_until(&mut heap, deadline);
            }
            None => shared.wakeup.wait(&mut heap),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn fixture() -> (Arc<ThreadPool>, ScheduledExecutor) {
        let pool = Arc::new(ThreadPool::new(1));
        let timer = ScheduledExecutor::new(Arc::clone(&pool));
        (pool, timer)
    }

    fn wait_for(counter: &AtomicU32, target: u32) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) < target {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }

    #[test]
    fn scheduled_job_fires_after_delay() {
        let (pool, timer) = fixture();
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);
        let started = Instant::now();
        let _key = timer.schedule(
            Box::new(move || {
                counter_clone.fetch_add(1, Ordering::SeqCst);
            }),
            Duration::from_millis(20),
            &pool,
        );
        assert!(wait_for(&counter, 1));
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert!(timer.shutdown_and_wait(Duration::from_secs(5)));
        assert!(pool.shutdown_and_wait(Duration::from_secs(5)));
    }

    #[test]
    fn zero_delay_degrades_to_submit() {
        let (pool, timer) = fixture();
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);
        let _key = timer.schedule(
            Box::new(move || {
                counter_clone.fetch_add(1, Ordering::SeqCst);
            }),
            Duration::ZERO,
            &pool,
        );
        assert!(wait_for(&counter, 1));
        assert_eq!(timer.pending_count(), 0);
        assert!(timer.shutdown_and_wait(Duration::from_secs(5)));
        assert!(pool.shutdown_and_wait(Duration::from_secs(5)));
    }

    #[test]
    fn cancelled_jobs_do_not_fire() {
        let (pool, timer) = fixture();
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);
        let key = timer.schedule(
            Box::new(move || {
                counter_clone.fetch_add(1, Ordering::SeqCst);
            }),
            Duration::from_millis(10),
            &pool,
        );
        assert!(key.cancel());
        assert!(!key.cancel());
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(timer.shutdown_and_wait(Duration::from_secs(5)));
        assert!(pool.shutdown_and_wait(Duration::from_secs(5)));
    }

    #[test]
    fn earlier_registrations_fire_first() {
        let (pool, timer) = fixture();
        let order = Arc::new(Mutex::new(Vec::new()));
        let counter = Arc::new(AtomicU32::new(0));
        for (label, delay_ms) in [(2_u32, 40_u64), (1, 15)] {
            let order = Arc::clone(&order);
            let counter = Arc::clone(&counter);
            let _ = timer.schedule(
                Box::new(move || {
                    order.lock().push(label);
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
                Duration::from_millis(delay_ms),
                &pool,
            );
        }
        assert!(wait_for(&counter, 2));
        assert_eq!(*order.lock(), vec![1, 2]);
        assert!(timer.shutdown_and_wait(Duration::from_secs(5)));
        assert!(pool.shutdown_and_wait(Duration::from_secs(5)));
    }
}
