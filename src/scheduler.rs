//! Multi-producer, single-consumer queue of deferred work for the controller
//! loop.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use crate::event_group::{EventGroup, SCHEDULE_EVENT};

pub struct TaskQueue<T> {
    pending: Mutex<VecDeque<T>>,
    events: Arc<EventGroup>,
}

impl<T> TaskQueue<T> {
    pub fn new(events: Arc<EventGroup>) -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            events,
        }
    }

    /// Safe from any thread. Returns immediately.
    pub fn schedule(&self, task: T) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(task);
        self.events.set(SCHEDULE_EVENT);
    }

    /// Swap out everything queued so far as one FIFO batch.
    pub fn take_batch(&self) -> VecDeque<T> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *pending)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_schedule_sets_event() {
        let events = Arc::new(EventGroup::new());
        let queue = TaskQueue::new(events.clone());
        queue.schedule(1u32);
        assert_eq!(events.peek() & SCHEDULE_EVENT, SCHEDULE_EVENT);
        assert_eq!(queue.take_batch(), VecDeque::from([1]));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_many_producers_each_task_once_in_thread_order() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 500;

        let events = Arc::new(EventGroup::new());
        let queue = Arc::new(TaskQueue::<(usize, usize)>::new(events.clone()));

        let producers: Vec<_> = (0..THREADS)
            .map(|t| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for i in 0..PER_THREAD {
                        queue.schedule((t, i));
                    }
                })
            })
            .collect();

        // Drain concurrently with the producers, the way the controller does.
        let mut seen = Vec::new();
        while seen.len() < THREADS * PER_THREAD {
            events.wait_timeout(SCHEDULE_EVENT, std::time::Duration::from_millis(50));
            seen.extend(queue.take_batch());
        }
        for p in producers {
            p.join().unwrap();
        }

        let mut next = vec![0usize; THREADS];
        for (t, i) in seen {
            assert_eq!(i, next[t], "thread {t} ran out of order");
            next[t] += 1;
        }
        assert!(next.iter().all(|&n| n == PER_THREAD));
    }
}
