//! The worker pool fibers are scheduled onto.
//!
//! A fixed set of worker threads drains a shared injection queue. Workers
//! park on a condvar when the queue runs dry and are woken per submission;
//! shutdown wakes everyone and joins with a deadline.

use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::observability::{self, LogLevel};

/// A unit of work for the pool.
pub(crate) type Job = Box<dyn FnOnce() + Send>;

struct PoolShared {
    queue: SegQueue<Job>,
    sleep_lock: Mutex<()>,
    wakeup: Condvar,
    shutdown: AtomicBool,
    live_workers: AtomicUsize,
    exit_lock: Mutex<()>,
    exited: Condvar,
}

/// A fixed-size worker thread pool with a FIFO-ish injection queue.
pub(crate) struct ThreadPool {
    shared: Arc<PoolShared>,
    size: usize,
}

impl ThreadPool {
    /// Spawns `size` workers (at least one).
    pub(crate) fn new(size: usize) -> Self {
        let size = size.max(1);
        let shared = Arc::new(PoolShared {
            queue: SegQueue::new(),
            sleep_lock: Mutex::new(()),
            wakeup: Condvar::new(),
            shutdown: AtomicBool::new(false),
            live_workers: AtomicUsize::new(size),
            exit_lock: Mutex::new(()),
            exited: Condvar::new(),
        });
        for index in 0..size {
            let worker_shared = Arc::clone(&shared);
            let builder = std::thread::Builder::new().name(format!("filament-worker-{index}"));
            if let Err(err) = builder.spawn(move || worker_loop(&worker_shared)) {
                shared.live_workers.fetch_sub(1, Ordering::SeqCst);
                observability::log(
                    LogLevel::Error,
                    "pool",
                    format_args!("failed to spawn worker {index}: {err}"),
                );
            }
        }
        Self { shared, size }
    }

    /// Schedules a job. Jobs submitted after shutdown are dropped.
    pub(crate) fn submit(&self, job: Job) {
        if self.shared.shutdown.load(Ordering::Acquire) {
            observability::log(
                LogLevel::Warn,
                "pool",
                format_args!("job dropped: pool is shut down"),
            );
            return;
        }
        self.shared.queue.push(job);
        let _guard = self.shared.sleep_lock.lock();
        self.shared.wakeup.notify_one();
    }

    /// Number of workers.
    pub(crate) fn size(&self) -> usize {
        self.size
    }

    /// Signals shutdown and waits up to `timeout` for workers to exit.
    /// Returns true if every worker exited in time.
    pub(crate) fn shutdown_and_wait(&self, timeout: Duration) -> bool {
        self.shared.shutdown.store(true, Ordering::Release);
        {
            let _guard = self.shared.sleep_lock.lock();
            self.shared.wakeup.notify_all();
        }
        let deadline = Instant::now() + timeout;
        let mut guard = self.shared.exit_lock.lock();
        while self.shared.live_workers.load(Ordering::Acquire) > 0 {
            if self
                .shared
                .exited
                .wait_until(&mut guard, deadline)
                .timed_out()
            {
                return self.shared.live_workers.load(Ordering::Acquire) == 0;
            }
        }
        true
    }
}

fn worker_loop(shared: &Arc<PoolShared>) {
    loop {
        if let Some(job) = shared.queue.pop() {
            job();
            continue;
        }
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        let mut guard = shared.sleep_lock.lock();
        // Re-check under the lock so a submission between the failed pop
        // and the wait cannot be missed.
        if shared.queue.is_empty() && !shared.shutdown.load(Ordering::Acquire) {
            shared.wakeup.wait(&mut guard);
        }
    }
    shared.live_workers.fetch_sub(1, Ordering::SeqCst);
    let _guard = shared.exit_lock.lock();
    shared.exited.notify_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn submitted_jobs_run() {
        let pool = ThreadPool::new(2);
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..16 {
            let counter = Arc::clone(&counter);
            pool.submit(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) < 16 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 16);
        assert!(pool.shutdown_and_wait(Duration::from_secs(5)));
    }

    #[test]
    fn shutdown_drops_late_submissions() {
        let pool = ThreadPool::new(1);
        assert!(pool.shutdown_and_wait(Duration::from_secs(5)));
        let ran = Arc::new(AtomicU32::new(0));
        let ran_clone = Arc::clone(&ran);
        pool.submit(Box::new(move || {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        }));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn pool_enforces_minimum_size() {
        let pool = ThreadPool::new(0);
        assert_eq!(pool.size(), 1);
        assert!(pool.shutdown_and_wait(Duration::from_secs(5)));
    }
}
