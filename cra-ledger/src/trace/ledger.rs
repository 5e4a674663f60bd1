//! Ledger facade
//!
//! [`Ledger`] is the owned handle producers emit through. It owns the queue,
//! the chain builder and the processor, and routes every emission:
//!
//! ```text
//! emit(raw) ─► validate ─┬─ immediate mode / sync override ─► commit inline ─► Committed(event)
//!                        │
//!                        └─ deferred ─► queue.push ─┬─ ok ─────────────────────► Queued
//!                                                   └─ full ─┬─ sync_fallback ─► commit inline
//!                                                            └─ reject/block ──► Err(QueueFull)
//! ```
//!
//! An inline commit for a session that still has queued entries first waits
//! for them, so a session's chain order always equals its emission order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::config::{LedgerConfig, OverflowPolicy, SyncOverrides, TraceMode};
use crate::error::{LedgerError, Result};
use crate::storage::StorageBackend;

use super::chain::{ChainBuilder, ChainHead};
use super::event::{RawEvent, TraceEvent};
use super::processor::{FailedBatch, FlushRequest, ProcessorHandle, ProcessorStats, TraceProcessor};
use super::queue::{IngestionQueue, QueueStats};
use super::verify::{self, ChainVerification};

/// Outcome of [`Ledger::emit`]
#[derive(Debug, Clone, PartialEq)]
pub enum Emitted {
    /// Accepted on the deferred path; committed by the processor later
    Queued,
    /// Hashed and persisted before `emit` returned
    Committed(TraceEvent),
}

impl Emitted {
    pub fn is_committed(&self) -> bool {
        matches!(self, Emitted::Committed(_))
    }

    pub fn committed(&self) -> Option<&TraceEvent> {
        match self {
            Emitted::Committed(event) => Some(event),
            Emitted::Queued => None,
        }
    }
}

/// Ledger statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerStats {
    pub queue: QueueStats,
    pub processor: ProcessorStats,
    /// Events committed inline (immediate mode, sync overrides, fallbacks)
    pub sync_commits: u64,
    /// Inline commits caused by a full queue
    pub sync_fallbacks: u64,
}

/// Hash-chained audit ledger
pub struct Ledger {
    config: LedgerConfig,
    sync_overrides: SyncOverrides,
    chain: Arc<ChainBuilder>,
    queue: Arc<IngestionQueue>,
    processor: Arc<TraceProcessor>,
    handle: Mutex<Option<ProcessorHandle>>,
    sync_commits: AtomicU64,
    sync_fallbacks: AtomicU64,
}

impl Ledger {
    pub fn new(storage: Arc<dyn StorageBackend>, config: LedgerConfig) -> Result<Self> {
        config.validate()?;
        let sync_overrides = SyncOverrides::new(&config.sync_event_types)?;
        let queue = Arc::new(IngestionQueue::new(config.queue.max_size, config.overflow_policy));
        let chain = Arc::new(ChainBuilder::new(storage));
        let processor = Arc::new(TraceProcessor::new(
            Arc::clone(&queue),
            Arc::clone(&chain),
            config.processor.clone(),
        ));

        Ok(Self {
            config,
            sync_overrides,
            chain,
            queue,
            processor,
            handle: Mutex::new(None),
            sync_commits: AtomicU64::new(0),
            sync_fallbacks: AtomicU64::new(0),
        })
    }

    /// Create and start the background processor
    pub fn started(storage: Arc<dyn StorageBackend>, config: LedgerConfig) -> Result<Self> {
        let ledger = Self::new(storage, config)?;
        ledger.start()?;
        Ok(ledger)
    }

    /// Start the background processor. No-op if it is already running.
    ///
    /// Without a running processor, deferred entries are committed by
    /// `flush`, `await_ready` and inline commits on the caller's thread.
    pub fn start(&self) -> Result<()> {
        let mut handle = self.handle.lock();
        if handle.as_ref().map_or(false, |h| h.is_running()) {
            return Ok(());
        }
        *handle = Some(self.processor.start()?);
        Ok(())
    }

    /// Stop the processor, waiting for its final drain
    pub fn shutdown(&self) -> Result<()> {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            handle.join().map_err(|_| LedgerError::InternalError {
                reason: "trace processor thread panicked".to_string(),
            })?;
        }
        Ok(())
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        self.chain.storage()
    }

    pub fn is_running(&self) -> bool {
        self.processor.is_running()
    }

    /// Record an event
    ///
    /// Content is checked for a canonical encoding before anything else;
    /// unencodable events fail with `Serialization` and never enter a chain.
    pub fn emit(&self, raw: RawEvent) -> Result<Emitted> {
        raw.validate()?;

        let inline = self.config.mode_for(&raw.session_id) == TraceMode::Immediate
            || self.sync_overrides.matches(&raw.event_type);
        if inline {
            return self.commit_inline(raw).map(Emitted::Committed);
        }

        let session_id = raw.session_id.clone();
        let progress = self.processor.progress();
        progress.enqueued(&session_id);

        match self.queue.push(raw) {
            Ok(()) => {
                self.processor.notify_pushed();
                Ok(Emitted::Queued)
            }
            Err(full) => {
                progress.withdrawn(&session_id);
                match full.policy {
                    OverflowPolicy::SyncFallback => {
                        self.sync_fallbacks.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            session_id = %session_id,
                            capacity = full.capacity,
                            event_type = %full.event.event_type,
                            "trace queue full, committing inline"
                        );
                        self.commit_inline(full.event).map(Emitted::Committed)
                    }
                    OverflowPolicy::Reject | OverflowPolicy::Block { .. } => Err(full.into()),
                }
            }
        }
    }

    /// Hash and persist one event on the caller's thread
    fn commit_inline(&self, raw: RawEvent) -> Result<TraceEvent> {
        let session_id = raw.session_id.clone();
        let progress = self.processor.progress();
        let halted = || LedgerError::SessionHalted {
            session_id: session_id.clone(),
        };

        if progress.is_halted(&session_id) {
            return Err(halted());
        }
        if progress.queued(&session_id) > 0 {
            self.drain_session(&session_id, Duration::from_millis(self.config.sync_wait_timeout_ms))
                .map_err(|err| match err {
                    LedgerError::StorageWriteFailure { .. } => halted(),
                    other => other,
                })?;
        }

        let writer = self.processor.writer();
        let mut events = self
            .chain
            .append_batch(&session_id, vec![raw], |events| {
                // Checked again under the session lock
                if progress.is_halted(&session_id) {
                    return Err(halted());
                }
                writer.write(events)
            })
            .map_err(LedgerError::from)?;

        let event = events.pop().ok_or_else(|| LedgerError::InternalError {
            reason: "inline commit produced no event".to_string(),
        })?;
        progress.committed(&session_id, event.sequence_number, 0);
        self.sync_commits.fetch_add(1, Ordering::Relaxed);
        Ok(event)
    }

    /// Get a session's queued entries committed, on the worker if it runs
    fn drain_session(&self, session_id: &str, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        if self.processor.is_running() {
            match self.processor.request_flush().wait(timeout) {
                // Stopped between the check and the request
                Err(LedgerError::ProcessorStopped { .. }) => {
                    self.processor.process_pending();
                }
                other => other?,
            }
        } else {
            self.processor.process_pending();
        }
        self.processor
            .await_ready(session_id, deadline.saturating_duration_since(Instant::now()))
    }

    /// Drain everything queued so far
    pub fn flush(&self, timeout: Duration) -> Result<()> {
        if self.processor.is_running() {
            self.processor.request_flush().wait(timeout)
        } else {
            self.processor.process_pending();
            Ok(())
        }
    }

    /// Ask the running processor for a drain without waiting
    pub fn request_flush(&self) -> FlushRequest {
        self.processor.request_flush()
    }

    /// True when the session has no accepted-but-uncommitted entries
    pub fn is_ready(&self, session_id: &str) -> bool {
        self.processor.is_ready(session_id)
    }

    /// Wait until every accepted entry of the session is committed
    ///
    /// Fails with `Timeout` at the deadline and with `StorageWriteFailure`
    /// when the session is halted.
    pub fn await_ready(&self, session_id: &str, timeout: Duration) -> Result<()> {
        if !self.processor.is_running() {
            self.processor.process_pending();
        }
        self.processor.await_ready(session_id, timeout)
    }

    /// Make sure a finished session is fully committed, then release its
    /// in-process state
    ///
    /// A later emission for the session reloads its head from storage.
    /// `committed_sequence` reports `None` until the session commits again.
    pub fn end_session(&self, session_id: &str, timeout: Duration) -> Result<()> {
        self.drain_session(session_id, timeout)?;
        let released = self.processor.progress().forget(session_id) && self.chain.evict(session_id);
        debug!(session_id = %session_id, released, "trace session ended");
        Ok(())
    }

    /// Sessions with a chain head held in this process
    pub fn session_count(&self) -> usize {
        self.chain.session_count()
    }

    pub fn committed_sequence(&self, session_id: &str) -> Option<u64> {
        self.processor.committed_sequence(session_id)
    }

    pub fn head(&self, session_id: &str) -> Result<ChainHead> {
        self.chain.head(session_id)
    }

    /// Events persisted so far; queued entries are not included
    pub fn read_committed(&self, session_id: &str) -> Result<Vec<TraceEvent>> {
        self.storage().read_all(session_id)
    }

    /// Wait for readiness, then read the whole session
    pub fn read_ready(&self, session_id: &str, timeout: Duration) -> Result<Vec<TraceEvent>> {
        self.await_ready(session_id, timeout)?;
        self.read_committed(session_id)
    }

    /// Verify a session's full stored chain. O(n), one hash per event.
    pub fn verify(&self, session_id: &str) -> Result<ChainVerification> {
        verify::verify(self.storage().as_ref(), session_id, 0, u64::MAX)
    }

    /// Verify `from..=to` of a session's stored chain
    pub fn verify_range(&self, session_id: &str, from: u64, to: u64) -> Result<ChainVerification> {
        verify::verify(self.storage().as_ref(), session_id, from, to)
    }

    pub fn failed_batches(&self) -> Vec<FailedBatch> {
        self.processor.failed_batches()
    }

    pub fn retry_failed(&self, session_id: &str) -> Result<usize> {
        self.processor.retry_failed(session_id)
    }

    pub fn stats(&self) -> LedgerStats {
        LedgerStats {
            queue: self.queue.stats(),
            processor: self.processor.stats(),
            sync_commits: self.sync_commits.load(Ordering::Relaxed),
            sync_fallbacks: self.sync_fallbacks.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Ledger {
    fn drop(&mut self) {
        match self.handle.get_mut().take() {
            Some(handle) => {
                if handle.join().is_err() {
                    error!("trace processor thread panicked during shutdown");
                }
            }
            None if self.config.processor.flush_on_shutdown && !self.queue.is_empty() => {
                self.processor.process_pending();
            }
            None => {}
        }

        let stats = self.processor.stats();
        let queued = self.queue.len();
        if queued > 0 || stats.failed_batches > 0 {
            error!(
                queued,
                failed_batches = stats.failed_batches,
                parked_events = stats.parked_events,
                "ledger dropped with uncommitted trace events"
            );
        }
    }
}
