//! # Async Ledger Runtime
//!
//! Optional tokio layer over [`Ledger`] for async producers.
//!
//! The ledger core is synchronous: a sync-path emit hashes and writes on the
//! caller's thread, and readiness waits park the thread. This layer moves
//! those calls onto tokio's blocking pool so they never stall an executor
//! thread:
//!
//! ```text
//! async task ──► AsyncLedger ──spawn_blocking──► Ledger ──► ChainBuilder / IngestionQueue
//!                                                   │
//!                                                   └─► TraceProcessor (own thread)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use cra_ledger::runtime::AsyncLedger;
//!
//! let ledger = AsyncLedger::new(Arc::new(Ledger::started(storage, config)?));
//! ledger.emit(RawEvent::new("sess-1", "action.executed", json!({}))).await?;
//! ledger.await_ready("sess-1", Duration::from_secs(1)).await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use crate::error::{LedgerError, Result};
use crate::trace::{ChainVerification, Emitted, Ledger, RawEvent, TraceEvent};

/// Cloneable async handle to a shared [`Ledger`]
#[derive(Clone)]
pub struct AsyncLedger {
    inner: Arc<Ledger>,
}

impl AsyncLedger {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self { inner: ledger }
    }

    /// The wrapped ledger, for cheap non-blocking calls like `is_ready`
    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.inner
    }

    pub async fn emit(&self, event: RawEvent) -> Result<Emitted> {
        self.blocking(move |ledger| ledger.emit(event)).await
    }

    /// Emit in order, stopping at the first error
    pub async fn emit_all(&self, events: Vec<RawEvent>) -> Result<Vec<Emitted>> {
        self.blocking(move |ledger| events.into_iter().map(|e| ledger.emit(e)).collect())
            .await
    }

    pub async fn flush(&self, timeout: Duration) -> Result<()> {
        self.blocking(move |ledger| ledger.flush(timeout)).await
    }

    pub async fn await_ready(&self, session_id: &str, timeout: Duration) -> Result<()> {
        let session_id = session_id.to_string();
        self.blocking(move |ledger| ledger.await_ready(&session_id, timeout))
            .await
    }

    pub async fn read_ready(&self, session_id: &str, timeout: Duration) -> Result<Vec<TraceEvent>> {
        let session_id = session_id.to_string();
        self.blocking(move |ledger| ledger.read_ready(&session_id, timeout))
            .await
    }

    pub async fn verify(&self, session_id: &str) -> Result<ChainVerification> {
        let session_id = session_id.to_string();
        self.blocking(move |ledger| ledger.verify(&session_id)).await
    }

    pub async fn retry_failed(&self, session_id: &str) -> Result<usize> {
        let session_id = session_id.to_string();
        self.blocking(move |ledger| ledger.retry_failed(&session_id))
            .await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.blocking(|ledger| ledger.shutdown()).await
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Ledger) -> Result<T> + Send + 'static,
    {
        let ledger = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&ledger))
            .await
            .map_err(|e| LedgerError::InternalError {
                reason: format!("Task join error: {}", e),
            })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LedgerConfig, OverflowPolicy, TraceMode};
    use crate::storage::InMemoryStorage;
    use serde_json::json;

    fn async_ledger(mode: TraceMode) -> AsyncLedger {
        let config = LedgerConfig::new(mode, OverflowPolicy::Reject, ["session.ended"]);
        let ledger = Ledger::started(Arc::new(InMemoryStorage::new()), config).unwrap();
        AsyncLedger::new(Arc::new(ledger))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_async_producers() {
        let ledger = async_ledger(TraceMode::Deferred);

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let ledger = ledger.clone();
                tokio::spawn(async move {
                    let session = format!("agent-{}", i);
                    for n in 0..10 {
                        let raw =
                            RawEvent::new(session.as_str(), "action.executed", json!({"n": n}));
                        ledger.emit(raw).await?;
                    }
                    ledger.await_ready(&session, Duration::from_secs(5)).await?;
                    ledger.read_ready(&session, Duration::from_secs(5)).await
                })
            })
            .collect();

        for task in tasks {
            let events = task.await.unwrap().unwrap();
            let order: Vec<_> = events.iter().map(|e| e.payload["n"].clone()).collect();
            assert_eq!(order, (0..10).map(|n| json!(n)).collect::<Vec<_>>());
        }

        for i in 0..8 {
            assert!(ledger.verify(&format!("agent-{}", i)).await.unwrap().valid);
        }
        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_sync_override_commits_before_returning() {
        let ledger = async_ledger(TraceMode::Deferred);

        let emitted = ledger
            .emit_all(vec![
                RawEvent::new("s", "session.started", json!({})),
                RawEvent::new("s", "session.ended", json!({"reason": "done"})),
            ])
            .await
            .unwrap();

        assert_eq!(emitted[0], Emitted::Queued);
        let ended = emitted[1].committed().unwrap();
        assert_eq!(ended.sequence_number, 1);
        assert!(ledger.ledger().is_ready("s"));
    }
}
