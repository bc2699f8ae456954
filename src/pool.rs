//! Scraping Pool (C5): the central engine. Bounded concurrency, single-flight
//! coalescing, an explicit per-operation state machine.
//!
//! The original's `ScrapingPool.fetch` never got past a `# TODO: Check if
//! we already have an instance fetching this parcel.` — coalescing is
//! finished here as an explicit result instead of an exception:
//! [`PoolOutcome::Admitted`] for the caller that actually runs the scrape,
//! [`PoolOutcome::Joined`] for every caller that piggybacks on an
//! already-running one.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::carriers;
use crate::error::{OpenParcelError, Result};
use crate::model::{HistorySnapshot, Parcel};

#[derive(Debug, Clone)]
pub struct ParcelKey {
    pub carrier_id: String,
    pub tracking_code: String,
    pub slug: Option<String>,
}

impl ParcelKey {
    fn is_similar(&self, other: &ParcelKey) -> bool {
        carriers::is_similar(
            self.slug.as_deref(),
            (&self.carrier_id, &self.tracking_code),
            other.slug.as_deref(),
            (&other.carrier_id, &other.tracking_code),
        )
    }
}

/// Mirrors spec.md §4.5's SETUP → FETCHING → FETCHED → SCRAPED → DONE;
/// strictly monotonic, enforced by [`ScrapeOperation::advance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OperationState {
    Setup,
    Fetching,
    Fetched,
    Scraped,
    Done,
}

#[derive(Debug, Clone)]
pub struct ScrapeOutcome {
    pub history: Value,
}

impl From<crate::carriers::ScrapeResult> for ScrapeOutcome {
    fn from(result: crate::carriers::ScrapeResult) -> Self {
        Self {
            history: result.history,
        }
    }
}

/// What a joined waiter ultimately reads (spec.md §4.5 merge semantics):
/// the persisted parcel row plus the snapshot the admitting caller wrote.
/// Sourcing this from the now-committed store row, rather than copying
/// fields off the in-memory adapter as the original does, means a waiter
/// never observes a half-written parcel.
#[derive(Debug, Clone)]
pub struct PersistedOutcome {
    pub parcel: Parcel,
    pub snapshot: HistorySnapshot,
}

pub struct ScrapeOperation {
    pub key: ParcelKey,
    state: Mutex<OperationState>,
    outcome: Mutex<Option<std::result::Result<ScrapeOutcome, OpenParcelError>>>,
    persisted: Mutex<Option<std::result::Result<PersistedOutcome, OpenParcelError>>>,
    notify: Notify,
}

impl ScrapeOperation {
    fn new(key: ParcelKey) -> Self {
        Self {
            key,
            state: Mutex::new(OperationState::Setup),
            outcome: Mutex::new(None),
            persisted: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    pub fn state(&self) -> OperationState {
        *self.state.lock()
    }

    /// Moves the state forward; never backward (spec.md §4.5: "monotonically
    /// non-decreasing").
    fn advance(&self, next: OperationState) {
        let mut guard = self.state.lock();
        debug_assert!(next >= *guard, "operation state must not move backward");
        *guard = next;
    }

    fn complete(&self, result: std::result::Result<ScrapeOutcome, OpenParcelError>) {
        *self.outcome.lock() = Some(result);
        self.advance(OperationState::Fetched);
        self.notify.notify_waiters();
    }

    /// Blocks until the worker has finished, returning a result each waiter
    /// owns independently (errors are re-derived via [`OpenParcelError::for_waiter`]
    /// since the original may wrap a non-`Clone` value).
    pub async fn wait_fetched(&self) -> std::result::Result<ScrapeOutcome, OpenParcelError> {
        loop {
            {
                let guard = self.outcome.lock();
                if let Some(result) = guard.as_ref() {
                    return match result {
                        Ok(outcome) => Ok(outcome.clone()),
                        Err(err) => Err(err.for_waiter()),
                    };
                }
            }
            self.notify.notified().await;
        }
    }

    /// Called by the admitting caller once the merged history has been
    /// copied out; set after the waiter that triggered the run has "joined".
    pub fn mark_scraped(&self) {
        self.advance(OperationState::Scraped);
    }

    /// Called by the admitting caller once the result has been persisted.
    /// Moves the operation to `DONE` and wakes every waiter blocked in
    /// [`Self::wait_done`] — this is the point at which a joined waiter may
    /// safely read the base parcel (spec.md §4.5: "Waiters poll state ≥ DONE
    /// before reading the base_parcel").
    pub fn finish(&self, result: std::result::Result<PersistedOutcome, OpenParcelError>) {
        *self.persisted.lock() = Some(result);
        self.advance(OperationState::Done);
        self.notify.notify_waiters();
    }

    pub fn is_done(&self) -> bool {
        self.state() >= OperationState::Done
    }

    /// Blocks until the admitting caller has persisted the result, returning
    /// the merged parcel + snapshot a joined waiter copies its response from.
    pub async fn wait_done(&self) -> std::result::Result<PersistedOutcome, OpenParcelError> {
        loop {
            {
                let guard = self.persisted.lock();
                if let Some(result) = guard.as_ref() {
                    return match result {
                        Ok(outcome) => Ok(outcome.clone()),
                        Err(err) => Err(err.for_waiter()),
                    };
                }
            }
            self.notify.notified().await;
        }
    }
}

pub enum PoolOutcome {
    /// This caller's request was the one that actually ran the scrape.
    Admitted(Arc<ScrapeOperation>),
    /// This caller coalesced onto an already-running (or just-finished)
    /// operation for a similar parcel identity.
    Joined(Arc<ScrapeOperation>),
}

/// Bounded-concurrency, single-flight scraping pool (spec.md §4.5).
pub struct ScrapingPool {
    max_instances: usize,
    operations: Mutex<Vec<Arc<ScrapeOperation>>>,
}

const ADMISSION_POLL_INTERVAL: Duration = Duration::from_millis(100);

impl ScrapingPool {
    pub fn new(max_instances: usize) -> Self {
        Self {
            max_instances,
            operations: Mutex::new(Vec::new()),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.operations.lock().len()
    }

    fn find_similar(&self, key: &ParcelKey) -> Option<Arc<ScrapeOperation>> {
        self.operations
            .lock()
            .iter()
            .find(|op| op.key.is_similar(key))
            .cloned()
    }

    /// Runs `work` for `key`, coalescing against any in-flight or
    /// just-finished operation for a similar parcel identity. `work` is
    /// spawned onto its own task so that it keeps running to completion
    /// even if this call's admission deadline fires — any coalesced peer
    /// still benefits from it (spec.md §4.5 Cancellation).
    pub async fn fetch<F, Fut>(
        &self,
        key: ParcelKey,
        admission_timeout: Duration,
        work: F,
    ) -> Result<PoolOutcome>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<ScrapeOutcome>> + Send + 'static,
    {
        if let Some(op) = self.find_similar(&key) {
            return Ok(PoolOutcome::Joined(op));
        }

        let op = self.admit(admission_timeout, key).await?;
        op.advance(OperationState::Fetching);

        let worker_op = op.clone();
        let handle = tokio::spawn(async move {
            let result = work().await;
            worker_op.complete(result);
        });
        // The request's own orchestration context awaits this, but the
        // spawned task is independent: dropping this future (e.g. the HTTP
        // handler's own deadline firing) does not abort it.
        let _ = handle.await;

        {
            let mut ops = self.operations.lock();
            ops.retain(|o| !Arc::ptr_eq(o, &op));
        }

        Ok(PoolOutcome::Admitted(op))
    }

    async fn admit(&self, timeout: Duration, key: ParcelKey) -> Result<Arc<ScrapeOperation>> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut ops = self.operations.lock();
                // Re-check coalescing: another caller may have been
                // admitted for a similar key while we were polling.
                if let Some(existing) = ops.iter().find(|op| op.key.is_similar(&key)) {
                    return Ok(existing.clone());
                }
                if ops.len() < self.max_instances {
                    let op = Arc::new(ScrapeOperation::new(key));
                    ops.push(op.clone());
                    return Ok(op);
                }
            }
            if Instant::now() >= deadline {
                return Err(OpenParcelError::ServerOverwhelmed);
            }
            tokio::time::sleep(ADMISSION_POLL_INTERVAL.min(deadline - Instant::now())).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(carrier: &str, code: &str) -> ParcelKey {
        ParcelKey {
            carrier_id: carrier.to_string(),
            tracking_code: code.to_string(),
            slug: None,
        }
    }

    #[tokio::test]
    async fn admits_and_completes_a_single_request() {
        let pool = ScrapingPool::new(2);
        let outcome = pool
            .fetch(key("ctt", "A"), Duration::from_secs(1), || async {
                Ok(ScrapeOutcome {
                    history: serde_json::json!([{"status": "delivered"}]),
                })
            })
            .await
            .unwrap();
        match outcome {
            PoolOutcome::Admitted(op) => {
                let result = op.wait_fetched().await.unwrap();
                assert_eq!(result.history[0]["status"], "delivered");
            }
            PoolOutcome::Joined(_) => panic!("first caller should be admitted"),
        }
    }

    #[tokio::test]
    async fn coalesces_concurrent_requests_for_the_same_parcel() {
        let pool = Arc::new(ScrapingPool::new(5));
        let calls = Arc::new(AtomicUsize::new(0));

        let pool_a = pool.clone();
        let calls_a = calls.clone();
        let first = tokio::spawn(async move {
            pool_a
                .fetch(key("dhl", "JD1"), Duration::from_secs(2), move || {
                    let calls = calls_a.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(150)).await;
                        Ok(ScrapeOutcome {
                            history: serde_json::json!([]),
                        })
                    }
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = pool
            .fetch(key("dhl", "JD1"), Duration::from_secs(2), || async {
                panic!("joined waiter must not run its own work closure")
            })
            .await
            .unwrap();
        assert!(matches!(second, PoolOutcome::Joined(_)));

        let first_outcome = first.await.unwrap().unwrap();
        assert!(matches!(first_outcome, PoolOutcome::Admitted(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn saturated_pool_rejects_with_server_overwhelmed() {
        let pool = Arc::new(ScrapingPool::new(1));
        let pool_a = pool.clone();
        let first = tokio::spawn(async move {
            pool_a
                .fetch(key("ctt", "A"), Duration::from_secs(2), || async {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    Ok(ScrapeOutcome {
                        history: serde_json::json!([]),
                    })
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = pool
            .fetch(key("dpd-pt", "B"), Duration::from_millis(50), || async {
                Ok(ScrapeOutcome {
                    history: serde_json::json!([]),
                })
            })
            .await;
        assert!(matches!(second, Err(OpenParcelError::ServerOverwhelmed)));

        first.await.unwrap().unwrap();
    }
}
