//! Task scheduler: a fixed pool of worker threads running short,
//! run-to-completion tasks.
//!
//! A [`Task`] is a named closure, optionally repeating at an interval. It is
//! scheduled by handle (`Arc<Task>`), so the same task object can be
//! re-armed, cancelled and re-armed again for the whole lifetime of the
//! connection that owns it.
//!
//! Rules:
//! - a task is never queued twice and never runs on two workers at once
//! - scheduling a running task makes it run once more after it returns
//! - cancelling a running task suppresses its next run (repeat or re-arm) but
//!   does not interrupt it
//! - a repeating task runs again at `max(start + interval, now)`
//!
//! Cancellation is lazy: the queue entry stays in the heap and is skipped when
//! it comes due, because its sequence number no longer matches the task.

use crate::error::{NetError, Result};
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace};

static NEXT_SEQ: AtomicU64 = AtomicU64::new(1);

fn next_seq() -> u64 {
    NEXT_SEQ.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Idle,
    Scheduled { seq: u64 },
    Running { again: Option<Instant>, cancelled: bool },
}

/// A unit of work the scheduler can run, re-run and cancel.
pub struct Task {
    name: &'static str,
    interval: Option<Duration>,
    run: Box<dyn Fn() + Send + Sync>,
    phase: Mutex<Phase>,
}

impl Task {
    /// One-shot task.
    pub fn new<F>(name: &'static str, f: F) -> Arc<Self>
    where
        F: Fn() + Send + Sync + 'static,
    {
        Arc::new(Self {
            name,
            interval: None,
            run: Box::new(f),
            phase: Mutex::new(Phase::Idle),
        })
    }

    /// Task that re-arms itself every `interval` once scheduled, until
    /// cancelled. `Duration::ZERO` means "as soon as a worker is free".
    pub fn repeating<F>(name: &'static str, interval: Duration, f: F) -> Arc<Self>
    where
        F: Fn() + Send + Sync + 'static,
    {
        Arc::new(Self {
            name,
            interval: Some(interval),
            run: Box::new(f),
            phase: Mutex::new(Phase::Idle),
        })
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn is_scheduled(&self) -> bool {
        matches!(*self.phase.lock(), Phase::Scheduled { .. })
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(*self.phase.lock(), Phase::Running { .. })
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        matches!(*self.phase.lock(), Phase::Idle)
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .field("phase", &*self.phase.lock())
            .finish()
    }
}

struct Entry {
    at: Instant,
    seq: u64,
    task: Arc<Task>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed: BinaryHeap is a max-heap, we want the earliest entry on top
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Inner {
    name: String,
    queue: Mutex<BinaryHeap<Entry>>,
    wakeup: Condvar,
    shutdown: AtomicBool,
}

impl Inner {
    fn push(&self, entry: Entry) {
        self.queue.lock().push(entry);
        self.wakeup.notify_one();
    }

    fn next_due(&self) -> Option<Entry> {
        let mut queue = self.queue.lock();
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return None;
            }
            let now = Instant::now();
            match queue.peek().map(|e| e.at) {
                Some(at) if at <= now => return queue.pop(),
                Some(at) => {
                    self.wakeup.wait_until(&mut queue, at);
                }
                None => self.wakeup.wait(&mut queue),
            }
        }
    }

    fn run_entry(&self, entry: Entry) {
        let Entry { seq, task, .. } = entry;
        {
            let mut phase = task.phase.lock();
            match *phase {
                Phase::Scheduled { seq: current } if current == seq => {
                    *phase = Phase::Running {
                        again: None,
                        cancelled: false,
                    };
                }
                // Cancelled or re-armed since this entry was queued
                _ => return,
            }
        }

        trace!("[Scheduler {}] Running task {}", self.name, task.name);
        let started = Instant::now();
        if catch_unwind(AssertUnwindSafe(|| (task.run)())).is_err() {
            error!("[Scheduler {}] Task {} panicked", self.name, task.name);
        }

        let next = {
            let mut phase = task.phase.lock();
            let at = match *phase {
                Phase::Running { cancelled: true, .. } => None,
                Phase::Running { again: Some(at), .. } => Some(at),
                _ => task
                    .interval
                    .map(|interval| (started + interval).max(Instant::now())),
            };
            match at {
                Some(at) => {
                    let seq = next_seq();
                    *phase = Phase::Scheduled { seq };
                    Some(Entry {
                        at,
                        seq,
                        task: Arc::clone(&task),
                    })
                }
                None => {
                    *phase = Phase::Idle;
                    None
                }
            }
        };
        if let Some(entry) = next {
            self.push(entry);
        }
    }
}

/// Cloneable handle used to schedule and cancel tasks.
#[derive(Clone)]
pub struct SchedulerHandle {
    inner: Arc<Inner>,
}

impl SchedulerHandle {
    /// Run `task` as soon as a worker is free.
    pub fn schedule(&self, task: &Arc<Task>) -> bool {
        self.schedule_at(task, Instant::now())
    }

    /// Run `task` after `delay`.
    pub fn schedule_after(&self, task: &Arc<Task>, delay: Duration) -> bool {
        self.schedule_at(task, Instant::now() + delay)
    }

    /// Run `task` at `at`.
    ///
    /// Returns false if the task is already queued (its existing deadline is
    /// kept). A running task is marked to run again at `at` once it returns.
    pub fn schedule_at(&self, task: &Arc<Task>, at: Instant) -> bool {
        let seq = {
            let mut phase = task.phase.lock();
            match &mut *phase {
                Phase::Idle => {
                    let seq = next_seq();
                    *phase = Phase::Scheduled { seq };
                    seq
                }
                Phase::Scheduled { .. } => return false,
                Phase::Running { again, cancelled } => {
                    *again = Some(at);
                    *cancelled = false;
                    return true;
                }
            }
        };
        self.inner.push(Entry {
            at,
            seq,
            task: Arc::clone(task),
        });
        true
    }

    /// Withdraw `task`.
    ///
    /// Returns true if a queued run was removed. A running task is left to
    /// finish but will not be re-armed afterwards.
    pub fn cancel(&self, task: &Arc<Task>) -> bool {
        let mut phase = task.phase.lock();
        match &mut *phase {
            Phase::Scheduled { .. } => {
                *phase = Phase::Idle;
                true
            }
            Phase::Running { again, cancelled } => {
                *again = None;
                *cancelled = true;
                false
            }
            Phase::Idle => false,
        }
    }

    /// Entries waiting in the queue, stale ones included.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.inner.queue.lock().len()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }
}

impl std::fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("name", &self.inner.name)
            .finish()
    }
}

/// Owner of the worker threads. Dropping it stops and joins them.
pub struct Scheduler {
    handle: SchedulerHandle,
    workers: Vec<JoinHandle<()>>,
    worker_ids: Vec<ThreadId>,
}

impl Scheduler {
    /// Start `workers` threads named `{name}-{index}`.
    pub fn new(name: &str, workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(NetError::invalid_config("scheduler needs at least one worker"));
        }
        let inner = Arc::new(Inner {
            name: name.to_owned(),
            queue: Mutex::new(BinaryHeap::new()),
            wakeup: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let worker = Arc::clone(&inner);
            let spawned = thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || {
                    while let Some(entry) = worker.next_due() {
                        worker.run_entry(entry);
                    }
                });
            match spawned {
                Ok(h) => handles.push(h),
                Err(e) => {
                    inner.shutdown.store(true, Ordering::Release);
                    inner.wakeup.notify_all();
                    for h in handles {
                        let _ = h.join();
                    }
                    return Err(NetError::Scheduler(format!(
                        "failed to spawn worker {index}: {e}"
                    )));
                }
            }
        }
        debug!("[Scheduler {}] Started {} workers", name, workers);

        let worker_ids = handles.iter().map(|h| h.thread().id()).collect();
        Ok(Self {
            handle: SchedulerHandle { inner },
            workers: handles,
            worker_ids,
        })
    }

    /// One worker per CPU, at least four so that blocking poll loops never
    /// starve notifications.
    pub fn with_default_workers(name: &str) -> Result<Self> {
        Self::new(name, num_cpus::get().max(4))
    }

    #[must_use]
    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

impl std::ops::Deref for Scheduler {
    type Target = SchedulerHandle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let inner = &self.handle.inner;
        inner.shutdown.store(true, Ordering::Release);
        {
            // Taking the lock orders the store before any waiter re-checks it
            let _queue = inner.queue.lock();
        }
        inner.wakeup.notify_all();

        let me = thread::current().id();
        let on_worker = self.worker_ids.contains(&me);
        for h in self.workers.drain(..) {
            if on_worker {
                continue;
            }
            let _ = h.join();
        }
        inner.queue.lock().clear();
        debug!("[Scheduler {}] Stopped", inner.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter_task(name: &'static str) -> (Arc<Task>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let task = Task::new(name, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (task, count)
    }

    fn wait_for(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    fn test_worker_count() {
        assert!(Scheduler::new("none", 0).is_err());
        assert_eq!(Scheduler::new("three", 3).unwrap().worker_count(), 3);
        assert!(Scheduler::with_default_workers("default").unwrap().worker_count() >= 4);
    }

    #[test]
    fn test_one_shot_runs_once() {
        let sched = Scheduler::new("once", 2).unwrap();
        let (task, count) = counter_task("once");
        assert!(sched.schedule(&task));
        assert!(wait_for(|| count.load(Ordering::SeqCst) == 1));
        assert!(wait_for(|| task.is_idle()));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_double_schedule_is_rejected() {
        let sched = Scheduler::new("double", 1).unwrap();
        let (task, count) = counter_task("double");
        assert!(sched.schedule_after(&task, Duration::from_millis(30)));
        assert!(!sched.schedule_after(&task, Duration::from_millis(30)));
        assert!(wait_for(|| count.load(Ordering::SeqCst) == 1));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_before_due() {
        let sched = Scheduler::new("cancel", 1).unwrap();
        let (task, count) = counter_task("cancel");
        sched.schedule_after(&task, Duration::from_millis(50));
        assert!(task.is_scheduled());
        assert!(sched.cancel(&task));
        assert!(task.is_idle());
        assert!(!sched.cancel(&task));
        thread::sleep(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        // Re-arming after cancel works
        assert!(sched.schedule(&task));
        assert!(wait_for(|| count.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn test_repeating_until_cancelled() {
        let sched = Scheduler::new("repeat", 2).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let task = Task::repeating("tick", Duration::from_millis(5), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        sched.schedule(&task);
        assert!(wait_for(|| count.load(Ordering::SeqCst) >= 3));

        sched.cancel(&task);
        assert!(wait_for(|| task.is_idle()));
        let seen = count.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::SeqCst), seen);
    }

    #[test]
    fn test_schedule_while_running_runs_again() {
        let sched = Scheduler::new("again", 2).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let (entered_tx, entered_rx) = flume::bounded::<()>(1);
        let (release_tx, release_rx) = flume::bounded::<()>(1);
        let c = Arc::clone(&count);
        let task = Task::new("again", move || {
            if c.fetch_add(1, Ordering::SeqCst) == 0 {
                let _ = entered_tx.send(());
                let _ = release_rx.recv_timeout(Duration::from_secs(2));
            }
        });

        sched.schedule(&task);
        entered_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(task.is_running());
        assert!(sched.schedule(&task));
        release_tx.send(()).unwrap();

        assert!(wait_for(|| count.load(Ordering::SeqCst) == 2));
        assert!(wait_for(|| task.is_idle()));
    }

    #[test]
    fn test_cancel_while_running_suppresses_repeat() {
        let sched = Scheduler::new("suppress", 2).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let (entered_tx, entered_rx) = flume::bounded::<()>(1);
        let (release_tx, release_rx) = flume::bounded::<()>(1);
        let c = Arc::clone(&count);
        let task = Task::repeating("suppress", Duration::ZERO, move || {
            if c.fetch_add(1, Ordering::SeqCst) == 0 {
                let _ = entered_tx.send(());
                let _ = release_rx.recv_timeout(Duration::from_secs(2));
            }
        });

        sched.schedule(&task);
        entered_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(!sched.cancel(&task));
        release_tx.send(()).unwrap();

        assert!(wait_for(|| task.is_idle()));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_earliest_deadline_first() {
        let sched = Scheduler::new("order", 1).unwrap();
        let (tx, rx) = flume::unbounded();
        let tx_late = tx.clone();
        let late = Task::new("late", move || {
            let _ = tx_late.send("late");
        });
        let early = Task::new("early", move || {
            let _ = tx.send("early");
        });
        sched.schedule_after(&late, Duration::from_millis(40));
        sched.schedule_after(&early, Duration::from_millis(10));

        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), "early");
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), "late");
    }

    #[test]
    fn test_panicking_task_does_not_kill_worker() {
        let sched = Scheduler::new("panic", 1).unwrap();
        let bad = Task::new("bad", || panic!("boom"));
        let (good, count) = counter_task("good");
        sched.schedule(&bad);
        sched.schedule_after(&good, Duration::from_millis(5));
        assert!(wait_for(|| count.load(Ordering::SeqCst) == 1));
        assert!(wait_for(|| bad.is_idle()));
    }
}
