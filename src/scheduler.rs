/*!
 * Priority scheduling of outbound calls
 *
 * Jobs wait in a max-heap ordered by priority tier, FIFO within a tier. A
 * single drain task (at most one at a time, guarded by an atomic flag) takes
 * an admission permit, pops the highest job and spawns it. Taking the permit
 * before popping means the job chosen is the best one queued at the moment
 * capacity frees up.
 *
 * Shrinking below the number of running jobs leaves a permit debt; permits
 * returned by finishing jobs are forgotten until the debt is paid.
 */

use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::{ConduitError, Result};

/// Priority tier of a call
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = ConduitError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            other => Err(ConduitError::Config(format!("unknown priority '{}'", other))),
        }
    }
}

struct QueuedJob {
    priority: Priority,
    seq: u64,
    job: BoxFuture<'static, ()>,
}

impl QueuedJob {
    fn rank(&self) -> (Priority, Reverse<u64>) {
        (self.priority, Reverse(self.seq))
    }
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.rank() == other.rank()
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.rank().cmp(&other.rank())
    }
}

/// Scheduler statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub queued: usize,
    pub dispatched: u64,
    pub capacity: usize,
    /// Permits still to be retired after a shrink
    pub permit_debt: usize,
    pub available_permits: usize,
}

struct SchedulerInner {
    queue: Mutex<BinaryHeap<QueuedJob>>,
    seq: AtomicU64,
    draining: AtomicBool,
    closed: AtomicBool,
    permits: Arc<Semaphore>,
    capacity: AtomicUsize,
    /// Permits to retire as running jobs return them
    permit_debt: AtomicUsize,
    dispatched: AtomicU64,
}

impl SchedulerInner {
    fn queue(&self) -> MutexGuard<'_, BinaryHeap<QueuedJob>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take up to `max` from the debt, returning the amount taken
    fn pay_debt(&self, max: usize) -> usize {
        match self
            .permit_debt
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |debt| {
                (debt > 0 && max > 0).then(|| debt - debt.min(max))
            }) {
            Ok(debt) => debt.min(max),
            Err(_) => 0,
        }
    }

    /// Hand a permit back, or retire it while capacity is owed
    fn release(&self, permit: OwnedSemaphorePermit) {
        if self.pay_debt(1) == 1 {
            permit.forget();
        } else {
            drop(permit);
        }
    }
}

/// Priority queue in front of the execution path
#[derive(Clone)]
pub struct PriorityScheduler {
    inner: Arc<SchedulerInner>,
}

impl PriorityScheduler {
    /// Create a scheduler admitting `capacity` concurrent jobs
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(SchedulerInner {
                queue: Mutex::new(BinaryHeap::new()),
                seq: AtomicU64::new(0),
                draining: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                permits: Arc::new(Semaphore::new(capacity)),
                capacity: AtomicUsize::new(capacity),
                permit_debt: AtomicUsize::new(0),
                dispatched: AtomicU64::new(0),
            }),
        }
    }

    /// Queue `fut` at `priority`; the receiver yields its output
    ///
    /// The receiver errors if the scheduler is closed before the job runs.
    pub fn enqueue<F, R>(&self, priority: Priority, fut: F) -> oneshot::Receiver<R>
    where
        F: Future<Output = R> + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        if self.inner.closed.load(Ordering::Acquire) {
            return rx;
        }

        let job = async move {
            // The caller may have stopped waiting
            let _ = tx.send(fut.await);
        }
        .boxed();
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        self.inner.queue().push(QueuedJob { priority, seq, job });

        self.kick();
        rx
    }

    /// Queue `fut` and wait for its output
    pub async fn run<F, R>(&self, priority: Priority, fut: F) -> Result<R>
    where
        F: Future<Output = R> + Send + 'static,
        R: Send + 'static,
    {
        self.enqueue(priority, fut)
            .await
            .map_err(|_| ConduitError::ShutDown)
    }

    /// Change the number of concurrently admitted jobs
    pub fn resize(&self, capacity: usize) {
        let capacity = capacity.max(1);
        let previous = self.inner.capacity.swap(capacity, Ordering::AcqRel);
        if capacity > previous {
            let added = capacity - previous;
            let cancelled = self.inner.pay_debt(added);
            self.inner.permits.add_permits(added - cancelled);
        } else if capacity < previous {
            // Permits held by running jobs are retired when they come back
            let wanted = previous - capacity;
            let forgotten = self.inner.permits.forget_permits(wanted);
            if forgotten < wanted {
                self.inner
                    .permit_debt
                    .fetch_add(wanted - forgotten, Ordering::AcqRel);
            }
        }
        debug!(
            previous,
            capacity,
            permit_debt = self.inner.permit_debt.load(Ordering::Relaxed),
            "scheduler capacity changed"
        );
    }

    /// Stop dispatching; queued jobs are dropped and their receivers fail
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.permits.close();
        let dropped = std::mem::take(&mut *self.inner.queue());
        if !dropped.is_empty() {
            debug!(dropped = dropped.len(), "dropped queued jobs on close");
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            queued: self.inner.queue().len(),
            dispatched: self.inner.dispatched.load(Ordering::Relaxed),
            capacity: self.inner.capacity.load(Ordering::Relaxed),
            permit_debt: self.inner.permit_debt.load(Ordering::Relaxed),
            available_permits: self.inner.permits.available_permits(),
        }
    }

    fn kick(&self) {
        if self
            .inner
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tokio::spawn(drain(Arc::clone(&self.inner)));
        }
    }
}

async fn drain(inner: Arc<SchedulerInner>) {
    loop {
        loop {
            let permit = match Arc::clone(&inner.permits).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return, // closed
            };
            if inner.pay_debt(1) == 1 {
                permit.forget();
                continue;
            }
            let next = inner.queue().pop();
            match next {
                Some(queued) => {
                    inner.dispatched.fetch_add(1, Ordering::Relaxed);
                    let owner = Arc::clone(&inner);
                    tokio::spawn(async move {
                        queued.job.await;
                        owner.release(permit);
                    });
                }
                None => break,
            }
        }

        inner.draining.store(false, Ordering::Release);
        // An enqueue that saw the flag still set relies on this re-check
        if inner.queue().is_empty() {
            return;
        }
        if inner
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
    }
}
