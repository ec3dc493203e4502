//! Single-owner task scheduler driven by the caller's clock.
//!
//! Nothing here spawns threads or sleeps. The owner asks for the next
//! deadline with [`Worker::poll_timeout`] and drains due tasks with
//! [`Worker::pop_due`], so all scheduled work runs on the owner's thread.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Cancellation handle returned by the scheduling calls.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskHandle(u64);

struct ScheduledTask<T> {
    deadline: Instant,
    period: Option<Duration>,
    task: T,
}

pub struct Worker<T> {
    next_id: u64,
    tasks: HashMap<u64, ScheduledTask<T>>,
    queue: BinaryHeap<Reverse<(Instant, u64)>>,
}

impl<T> Default for Worker<T> {
    fn default() -> Self {
        Self {
            next_id: 0,
            tasks: HashMap::new(),
            queue: BinaryHeap::new(),
        }
    }
}

impl<T: Clone> Worker<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn schedule(&mut self, deadline: Instant, period: Option<Duration>, task: T) -> TaskHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.tasks.insert(
            id,
            ScheduledTask {
                deadline,
                period,
                task,
            },
        );
        self.queue.push(Reverse((deadline, id)));
        TaskHandle(id)
    }

    /// Runs `task` once, `delay` after `now`. A zero delay makes it due immediately.
    pub fn schedule_after(&mut self, now: Instant, delay: Duration, task: T) -> TaskHandle {
        self.schedule(now + delay, None, task)
    }

    /// Runs `task` every `period`, first at `now + period`, until cancelled.
    pub fn schedule_every(&mut self, now: Instant, period: Duration, task: T) -> TaskHandle {
        let period = period.max(MIN_PERIOD);
        self.schedule(now + period, Some(period), task)
    }

    /// Returns false if the task already ran (one-shot) or was cancelled.
    pub fn cancel(&mut self, handle: TaskHandle) -> bool {
        self.tasks.remove(&handle.0).is_some()
    }

    /// Cancels every task for which `keep` returns false.
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&T) -> bool,
    {
        self.tasks.retain(|_, scheduled| keep(&scheduled.task));
    }

    pub fn is_scheduled(&self, handle: TaskHandle) -> bool {
        self.tasks.contains_key(&handle.0)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Earliest pending deadline.
    pub fn poll_timeout(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, id))) = self.queue.peek().copied() {
            match self.tasks.get(&id) {
                Some(scheduled) if scheduled.deadline == deadline => return Some(deadline),
                _ => {
                    self.queue.pop();
                }
            }
        }
        None
    }

    /// Removes and returns the earliest task due at `now`.
    ///
    /// Repeating tasks are re-armed one period after their deadline, or one
    /// period after `now` if the owner fell behind. Callers that run tasks as
    /// they go should drain with this so a cancel issued by one task holds
    /// for the tasks behind it.
    pub fn pop_due(&mut self, now: Instant) -> Option<(TaskHandle, T)> {
        while let Some(Reverse((deadline, id))) = self.queue.peek().copied() {
            if deadline > now {
                return None;
            }
            self.queue.pop();

            let Some(scheduled) = self.tasks.get_mut(&id) else {
                continue;
            };
            if scheduled.deadline != deadline {
                continue;
            }

            match scheduled.period {
                Some(period) => {
                    let mut next = deadline + period;
                    if next <= now {
                        next = now + period;
                    }
                    scheduled.deadline = next;
                    self.queue.push(Reverse((next, id)));
                    return Some((TaskHandle(id), scheduled.task.clone()));
                }
                None => {
                    if let Some(scheduled) = self.tasks.remove(&id) {
                        return Some((TaskHandle(id), scheduled.task));
                    }
                }
            }
        }
        None
    }

    /// Removes and returns every task due at `now`, in deadline order.
    pub fn poll_due(&mut self, now: Instant) -> Vec<(TaskHandle, T)> {
        let mut due = vec![];
        while let Some(entry) = self.pop_due(now) {
            due.push(entry);
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_after_runs_once() {
        let mut worker = Worker::new();
        let now = Instant::now();
        let handle = worker.schedule_after(now, Duration::from_millis(10), "a");

        assert_eq!(worker.poll_timeout(), Some(now + Duration::from_millis(10)));
        assert!(worker.poll_due(now + Duration::from_millis(5)).is_empty());

        let due = worker.poll_due(now + Duration::from_millis(10));
        assert_eq!(due, vec![(handle, "a")]);
        assert!(!worker.is_scheduled(handle));
        assert!(worker.poll_due(now + Duration::from_millis(100)).is_empty());
        assert_eq!(worker.poll_timeout(), None);
    }

    #[test]
    fn test_schedule_immediate() {
        let mut worker = Worker::new();
        let now = Instant::now();
        worker.schedule_after(now, Duration::ZERO, 1u32);
        assert_eq!(worker.poll_due(now).len(), 1);
    }

    #[test]
    fn test_due_tasks_in_deadline_order() {
        let mut worker = Worker::new();
        let now = Instant::now();
        worker.schedule_after(now, Duration::from_millis(30), 3);
        worker.schedule_after(now, Duration::from_millis(10), 1);
        worker.schedule_after(now, Duration::from_millis(20), 2);

        let due: Vec<i32> = worker
            .poll_due(now + Duration::from_millis(30))
            .into_iter()
            .map(|(_, t)| t)
            .collect();
        assert_eq!(due, vec![1, 2, 3]);
    }

    #[test]
    fn test_schedule_every_repeats_until_cancelled() {
        let mut worker = Worker::new();
        let now = Instant::now();
        let period = Duration::from_millis(200);
        let handle = worker.schedule_every(now, period, "tick");

        assert!(worker.poll_due(now + Duration::from_millis(199)).is_empty());
        assert_eq!(worker.poll_due(now + period).len(), 1);
        assert_eq!(worker.poll_timeout(), Some(now + period * 2));
        assert_eq!(worker.poll_due(now + period * 2).len(), 1);

        // fell behind: fires once, re-armed relative to now
        let late = now + period * 10;
        assert_eq!(worker.poll_due(late).len(), 1);
        assert_eq!(worker.poll_timeout(), Some(late + period));

        assert!(worker.cancel(handle));
        assert!(!worker.cancel(handle));
        assert!(worker.poll_due(late + period * 5).is_empty());
        assert_eq!(worker.poll_timeout(), None);
    }

    #[test]
    fn test_cancel_before_due() {
        let mut worker = Worker::new();
        let now = Instant::now();
        let a = worker.schedule_after(now, Duration::from_millis(10), 'a');
        worker.schedule_after(now, Duration::from_millis(20), 'b');
        assert!(worker.cancel(a));
        assert_eq!(worker.poll_timeout(), Some(now + Duration::from_millis(20)));
        let due = worker.poll_due(now + Duration::from_millis(50));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].1, 'b');
    }

    #[test]
    fn test_retain_cancels_matching() {
        let mut worker = Worker::new();
        let now = Instant::now();
        worker.schedule_every(now, Duration::from_millis(10), (1, 0));
        worker.schedule_after(now, Duration::from_millis(10), (2, 0));
        worker.retain(|(owner, _)| *owner != 1);
        assert_eq!(worker.len(), 1);
        let due = worker.poll_due(now + Duration::from_millis(10));
        assert_eq!(due[0].1, (2, 0));
    }

    #[test]
    fn test_pop_due_observes_cancel_between_tasks() {
        let mut worker = Worker::new();
        let now = Instant::now();
        let delay = Duration::from_millis(10);
        worker.schedule_after(now, delay, 'a');
        let b = worker.schedule_after(now, delay, 'b');

        let (_, first) = worker.pop_due(now + delay).unwrap();
        assert_eq!(first, 'a');
        assert!(worker.cancel(b));
        assert_eq!(worker.pop_due(now + delay), None);
        assert!(worker.is_empty());
    }
}
