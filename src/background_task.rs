//! Single-worker pool for codec work that must stay off the controller loop.
//!
//! One worker drains the FIFO in batches, so jobs finish in submission
//! order. Audio ordering depends on that; do not add workers.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub const DEFAULT_WARN_THRESHOLD: usize = 30;

struct State {
    jobs: VecDeque<Job>,
    /// Queued plus running. Incremented before a job becomes visible.
    active: usize,
    stopping: bool,
}

struct Inner {
    state: Mutex<State>,
    /// Signalled when jobs arrive or when the pool drains.
    cond: Condvar,
    warn_threshold: usize,
}

pub struct BackgroundTask {
    inner: Arc<Inner>,
    worker: Option<JoinHandle<()>>,
}

impl BackgroundTask {
    pub fn new(warn_threshold: usize) -> anyhow::Result<Self> {
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                jobs: VecDeque::new(),
                active: 0,
                stopping: false,
            }),
            cond: Condvar::new(),
            warn_threshold,
        });

        let worker = {
            let inner = inner.clone();
            thread::Builder::new()
                .name("background-task".into())
                .spawn(move || worker_loop(&inner))?
        };

        Ok(Self {
            inner,
            worker: Some(worker),
        })
    }

    /// Never rejects work; logs once the backlog reaches the warning threshold.
    pub fn schedule<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.lock();
        if state.active >= self.inner.warn_threshold {
            log::warn!(
                "background_task: {} tasks pending, the device may be overloaded",
                state.active
            );
        }
        state.active += 1;
        state.jobs.push_back(Box::new(job));
        self.inner.cond.notify_all();
    }

    /// Block until the queue is empty and nothing is running.
    pub fn wait_for_completion(&self) {
        let state = self.lock();
        let _state = self
            .inner
            .cond
            .wait_while(state, |s| !s.jobs.is_empty() || s.active > 0)
            .unwrap_or_else(PoisonError::into_inner);
    }

    pub fn active(&self) -> usize {
        self.lock().active
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        {
            let mut state = self.lock();
            state.stopping = true;
            self.inner.cond.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn worker_loop(inner: &Inner) {
    loop {
        let batch = {
            let state = inner.state.lock().unwrap_or_else(PoisonError::into_inner);
            let mut state = inner
                .cond
                .wait_while(state, |s| s.jobs.is_empty() && !s.stopping)
                .unwrap_or_else(PoisonError::into_inner);
            if state.jobs.is_empty() {
                // stopping and drained
                return;
            }
            std::mem::take(&mut state.jobs)
        };

        for job in batch {
            if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                log::error!("background_task: job panicked");
            }
            let mut state = inner.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.active -= 1;
            if state.active == 0 {
                inner.cond.notify_all();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_jobs_run_in_submission_order() {
        let pool = BackgroundTask::new(DEFAULT_WARN_THRESHOLD).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..100 {
            let order = order.clone();
            pool.schedule(move || order.lock().unwrap().push(i));
        }
        pool.wait_for_completion();
        assert_eq!(*order.lock().unwrap(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_wait_covers_in_flight_job() {
        let pool = BackgroundTask::new(DEFAULT_WARN_THRESHOLD).unwrap();
        let started = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        {
            let started = started.clone();
            let finished = finished.clone();
            pool.schedule(move || {
                started.store(true, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(100));
                finished.store(true, Ordering::SeqCst);
            });
        }
        // make sure the job has left the queue and is executing
        while !started.load(Ordering::SeqCst) {
            thread::yield_now();
        }
        pool.wait_for_completion();
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(pool.active(), 0);
    }

    #[test]
    fn test_over_threshold_still_accepted() {
        let pool = BackgroundTask::new(2).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        {
            let gate = gate.clone();
            pool.schedule(move || {
                let (lock, cond) = &*gate;
                let open = lock.lock().unwrap();
                let _open = cond.wait_while(open, |o| !*o).unwrap();
            });
        }
        for _ in 0..10 {
            let count = count.clone();
            pool.schedule(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(pool.active(), 11);
        {
            let (lock, cond) = &*gate;
            *lock.lock().unwrap() = true;
            cond.notify_all();
        }
        pool.wait_for_completion();
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_panicking_job_does_not_wedge_barrier() {
        let pool = BackgroundTask::new(DEFAULT_WARN_THRESHOLD).unwrap();
        pool.schedule(|| panic!("boom"));
        let ran = Arc::new(AtomicBool::new(false));
        {
            let ran = ran.clone();
            pool.schedule(move || ran.store(true, Ordering::SeqCst));
        }
        pool.wait_for_completion();
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(pool.active(), 0);
    }

    #[test]
    fn test_drop_drains_queue() {
        let count = Arc::new(AtomicUsize::new(0));
        {
            let pool = BackgroundTask::new(DEFAULT_WARN_THRESHOLD).unwrap();
            for _ in 0..5 {
                let count = count.clone();
                pool.schedule(move || {
                    count.fetch_add(1, Ordering::SeqCst);
                });
            }
        }
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }
}
