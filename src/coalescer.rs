/*!
 * Request coalescing: at most one in-flight execution per key
 *
 * The first caller for a key spawns the execution and registers a shared
 * handle to its outcome; concurrent callers with the same key attach to that
 * handle instead of executing again. The spawned task removes its own entry
 * when it finishes, so the key is free again as soon as the outcome exists,
 * even if every waiter has gone away.
 */

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::error::{ConduitError, Result};

type SharedOutcome<T> = Shared<BoxFuture<'static, Result<T>>>;

struct Flight<T> {
    id: u64,
    outcome: SharedOutcome<T>,
}

/// Counters describing coalescer behaviour
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoalescerStats {
    /// Executions actually started
    pub executions: u64,
    /// Calls that attached to an execution already in flight
    pub coalesced: u64,
    /// Keys currently in flight
    pub in_flight: usize,
}

/// Deduplicates concurrent executions by key
pub struct Coalescer<T> {
    flights: Arc<DashMap<String, Flight<T>>>,
    next_id: AtomicU64,
    executions: AtomicU64,
    coalesced: AtomicU64,
}

impl<T> Default for Coalescer<T> {
    fn default() -> Self {
        Self {
            flights: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
            executions: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Coalescer<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `executor` for `key` unless an execution is already in flight,
    /// in which case wait for that one's outcome
    ///
    /// `executor` is only invoked by the caller that starts the execution.
    /// Must be called from within a tokio runtime.
    pub async fn execute_deduped<F, Fut>(&self, key: &str, executor: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let outcome = match self.flights.entry(key.to_string()) {
            Entry::Occupied(flight) => {
                self.coalesced.fetch_add(1, Ordering::Relaxed);
                debug!(key, "attached to in-flight request");
                flight.get().outcome.clone()
            }
            Entry::Vacant(slot) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let flights = Arc::clone(&self.flights);
                let cleanup_key = key.to_string();
                let work = executor();

                // The task cannot remove the entry before it is inserted: the
                // vacant entry holds the shard lock until this arm ends.
                let task = tokio::spawn(async move {
                    let result = work.await;
                    flights.remove_if(&cleanup_key, |_, flight| flight.id == id);
                    result
                });

                let outcome = async move {
                    match task.await {
                        Ok(result) => result,
                        Err(e) => Err(ConduitError::Transport(format!(
                            "request execution aborted: {}",
                            e
                        ))),
                    }
                }
                .boxed()
                .shared();

                slot.insert(Flight {
                    id,
                    outcome: outcome.clone(),
                });
                self.executions.fetch_add(1, Ordering::Relaxed);
                outcome
            }
        };

        outcome.await
    }

    pub fn stats(&self) -> CoalescerStats {
        CoalescerStats {
            executions: self.executions.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            in_flight: self.flights.len(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_identical_calls_execute_once() {
        let coalescer = Arc::new(Coalescer::<u64>::new());
        let executions = Arc::new(AtomicUsize::new(0));

        let calls = (0..10).map(|_| {
            let coalescer = Arc::clone(&coalescer);
            let executions = Arc::clone(&executions);
            async move {
                coalescer
                    .execute_deduped("getSlot:[]", || async move {
                        executions.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(42)
                    })
                    .await
            }
        });
        let results = join_all(calls).await;

        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| r == &Ok(42)));
        let stats = coalescer.stats();
        assert_eq!(stats.executions, 1);
        assert_eq!(stats.coalesced, 9);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_is_shared_by_all_waiters() {
        let coalescer = Coalescer::<u64>::new();
        let err = ConduitError::Transport("reset".into());

        let (a, b) = tokio::join!(
            coalescer.execute_deduped("k", || {
                let err = err.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Err(err)
                }
            }),
            coalescer.execute_deduped("k", || async { Ok(1) }),
        );

        assert_eq!(a, Err(err.clone()));
        assert_eq!(b, Err(err));
    }

    #[tokio::test]
    async fn test_key_is_released_after_completion() {
        let coalescer = Coalescer::<u64>::new();
        let executions = Arc::new(AtomicUsize::new(0));

        for expected in 1..=2 {
            let counter = Arc::clone(&executions);
            let value = coalescer
                .execute_deduped("k", || async move {
                    Ok(counter.fetch_add(1, Ordering::SeqCst) as u64 + 1)
                })
                .await
                .unwrap();
            assert_eq!(value, expected);
        }
        assert_eq!(executions.load(Ordering::SeqCst), 2);
        assert_eq!(coalescer.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_keys_run_independently() {
        let coalescer = Coalescer::<&'static str>::new();
        let (a, b) = tokio::join!(
            coalescer.execute_deduped("a", || async { Ok("a") }),
            coalescer.execute_deduped("b", || async { Ok("b") }),
        );
        assert_eq!(a.unwrap(), "a");
        assert_eq!(b.unwrap(), "b");
        assert_eq!(coalescer.stats().executions, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_leader_does_not_strand_key() {
        let coalescer = Coalescer::<u64>::new();
        let leader = coalescer.execute_deduped("k", || async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(7)
        });
        // Dropped after starting but before completion
        let _ = tokio::time::timeout(Duration::from_millis(5), leader).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(coalescer.in_flight(), 0);
    }
}
