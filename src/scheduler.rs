//! Shared timer service
//!
//! One tokio task drives every deadline in the process: notification TTLs,
//! the expiry sweep and award reconciliation. Callers get a [`TimerHandle`];
//! cancelling or dropping it removes the job, so a context that goes away
//! never leaves recurring work behind.
//!
//! Jobs are plain closures run on the scheduler task. Anything that needs to
//! await must `tokio::spawn` its own work.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

type Job = Box<dyn FnMut() + Send + 'static>;

struct Entry {
    /// Taken while the job runs.
    job: Option<Job>,
    period: Option<Duration>,
}

#[derive(Default)]
struct Queue {
    order: BTreeSet<(Instant, u64)>,
    entries: HashMap<u64, Entry>,
}

struct Inner {
    queue: Mutex<Queue>,
    wake: Notify,
    next_id: AtomicU64,
    stopped: AtomicBool,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Spawn the timer task on the current runtime.
    pub fn start() -> (Self, JoinHandle<()>) {
        let inner = Arc::new(Inner {
            queue: Mutex::new(Queue::default()),
            wake: Notify::new(),
            next_id: AtomicU64::new(1),
            stopped: AtomicBool::new(false),
        });
        let task = tokio::spawn(run(inner.clone()));
        info!("Timer service started");
        (Self { inner }, task)
    }

    pub fn schedule_at(&self, deadline: Instant, job: impl FnOnce() + Send + 'static) -> TimerHandle {
        let mut job = Some(job);
        self.insert(
            deadline,
            None,
            Box::new(move || {
                if let Some(job) = job.take() {
                    job();
                }
            }),
        )
    }

    pub fn schedule_in(&self, delay: Duration, job: impl FnOnce() + Send + 'static) -> TimerHandle {
        self.schedule_at(Instant::now() + delay, job)
    }

    /// Run `job` every `period`, first after one full period.
    pub fn every(&self, period: Duration, job: impl FnMut() + Send + 'static) -> TimerHandle {
        self.insert(Instant::now() + period, Some(period), Box::new(job))
    }

    /// Number of jobs still registered.
    pub fn pending(&self) -> usize {
        self.inner.queue.lock().entries.len()
    }

    /// Stop the timer task. Pending jobs never fire.
    pub fn shutdown(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.wake.notify_one();
    }

    fn insert(&self, deadline: Instant, period: Option<Duration>, job: Job) -> TimerHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut queue = self.inner.queue.lock();
            queue.order.insert((deadline, id));
            queue.entries.insert(
                id,
                Entry {
                    job: Some(job),
                    period,
                },
            );
        }
        self.inner.wake.notify_one();

        TimerHandle {
            id,
            scheduler: Arc::downgrade(&self.inner),
        }
    }
}

impl Inner {
    fn cancel(&self, id: u64) -> bool {
        let mut queue = self.queue.lock();
        queue.order.retain(|(_, entry_id)| *entry_id != id);
        queue.entries.remove(&id).is_some()
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.queue.lock().order.first().map(|(deadline, _)| *deadline)
    }

    fn fire_due(&self, now: Instant) {
        let mut due: Vec<(u64, Job, Option<Duration>)> = Vec::new();
        {
            let mut guard = self.queue.lock();
            let queue = &mut *guard;
            while let Some(&(deadline, id)) = queue.order.first() {
                if deadline > now {
                    break;
                }
                queue.order.remove(&(deadline, id));

                let Some(entry) = queue.entries.get_mut(&id) else {
                    continue;
                };
                let period = entry.period;
                if let Some(job) = entry.job.take() {
                    due.push((id, job, period));
                }
                if period.is_none() {
                    queue.entries.remove(&id);
                }
            }
        }

        for (id, mut job, period) in due {
            job();

            if let Some(period) = period {
                let mut queue = self.queue.lock();
                // Cancelled while running: the entry is gone, drop the job.
                if let Some(entry) = queue.entries.get_mut(&id) {
                    entry.job = Some(job);
                    queue.order.insert((now + period, id));
                }
            }
        }
    }
}

async fn run(inner: Arc<Inner>) {
    loop {
        if inner.stopped.load(Ordering::SeqCst) {
            debug!("Timer service stopped");
            break;
        }

        match inner.next_deadline() {
            None => inner.wake.notified().await,
            Some(deadline) if deadline > Instant::now() => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = inner.wake.notified() => {}
                }
            }
            Some(_) => inner.fire_due(Instant::now()),
        }
    }
}

/// Owning handle for a scheduled job. Dropping it cancels the job.
pub struct TimerHandle {
    id: u64,
    scheduler: Weak<Inner>,
}

impl TimerHandle {
    /// Returns `true` if the job was still pending.
    pub fn cancel(self) -> bool {
        self.cancel_inner()
    }

    fn cancel_inner(&self) -> bool {
        self.scheduler
            .upgrade()
            .map(|inner| inner.cancel(self.id))
            .unwrap_or(false)
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.cancel_inner();
    }
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHandle").field("id", &self.id).finish()
    }
}
