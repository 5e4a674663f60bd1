//! Background trace processor
//!
//! The TraceProcessor drains the ingestion queue on one dedicated thread,
//! seals each session's entries through the chain builder and writes them
//! as one batch per session. A cycle starts when:
//!
//! - the queue holds at least `batch_size` entries (drains one batch)
//! - `flush_interval_ms` elapsed with entries pending (drains everything)
//! - a flush was requested (drains everything queued when the cycle starts)
//! - the processor shuts down with `flush_on_shutdown`
//!
//! Only one cycle runs at a time, whether on the worker or on a caller
//! thread via [`TraceProcessor::process_pending`]. The next cycle only
//! starts after the previous batch was written, so a slow backend slows the
//! drain and the queue fills up until producers see `QueueFull`.
//!
//! ## Write failures
//!
//! A failed write is retried with exponential backoff. When the retries are
//! exhausted the sealed batch is kept as a [`FailedBatch`] and the session
//! is halted: its chain head does not move, later entries for it are parked
//! in order, and readiness queries report `StorageWriteFailure`.
//! [`TraceProcessor::retry_failed`] commits the kept batch and the parked
//! entries and resumes the session.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{LedgerError, Result};
use crate::storage::StorageBackend;

use super::chain::{BatchFailure, ChainBuilder};
use super::event::{RawEvent, TraceEvent};
use super::queue::IngestionQueue;

/// Default batch size for processing
const DEFAULT_BATCH_SIZE: usize = 100;

/// Default flush interval
const DEFAULT_FLUSH_INTERVAL_MS: u64 = 5000;

/// Default poll interval when the queue is quiet
const DEFAULT_POLL_INTERVAL_MS: u64 = 10;

/// Configuration for the trace processor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Queue length that triggers a cycle, and the size of that cycle's drain
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Longest the worker sleeps between trigger checks
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Retries after the first failed write of a batch
    #[serde(default = "default_max_write_retries")]
    pub max_write_retries: u32,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    #[serde(default = "default_max_retry_backoff_ms")]
    pub max_retry_backoff_ms: u64,

    #[serde(default = "default_true")]
    pub flush_on_shutdown: bool,
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}
fn default_flush_interval_ms() -> u64 {
    DEFAULT_FLUSH_INTERVAL_MS
}
fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}
fn default_max_write_retries() -> u32 {
    5
}
fn default_retry_backoff_ms() -> u64 {
    50
}
fn default_max_retry_backoff_ms() -> u64 {
    2000
}
fn default_true() -> bool {
    true
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            max_write_retries: default_max_write_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_retry_backoff_ms: default_max_retry_backoff_ms(),
            flush_on_shutdown: true,
        }
    }
}

impl ProcessorConfig {
    /// Set batch size
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Set flush interval
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set poll interval
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set write retry bounds
    pub fn write_retries(
        mut self,
        max_retries: u32,
        backoff: Duration,
        max_backoff: Duration,
    ) -> Self {
        self.max_write_retries = max_retries;
        self.retry_backoff_ms = backoff.as_millis() as u64;
        self.max_retry_backoff_ms = max_backoff.as_millis() as u64;
        self
    }

    pub fn flush_on_shutdown(mut self, flush: bool) -> Self {
        self.flush_on_shutdown = flush;
        self
    }
}

/// Writes batches to storage with bounded exponential backoff
pub(crate) struct BatchWriter {
    storage: Arc<dyn StorageBackend>,
    max_retries: u32,
    backoff: Duration,
    max_backoff: Duration,
}

impl BatchWriter {
    pub(crate) fn new(storage: Arc<dyn StorageBackend>, config: &ProcessorConfig) -> Self {
        Self {
            storage,
            max_retries: config.max_write_retries,
            backoff: Duration::from_millis(config.retry_backoff_ms),
            max_backoff: Duration::from_millis(config.max_retry_backoff_ms),
        }
    }

    /// Append `events` as a whole, retrying until success or exhaustion
    pub(crate) fn write(&self, events: &[TraceEvent]) -> Result<()> {
        let session_id = events.first().map_or("", |e| e.session_id.as_str());
        let mut delay = self.backoff;
        let mut attempt: u32 = 1;

        loop {
            let err = match self.storage.append(events) {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };

            if attempt > self.max_retries {
                error!(
                    session_id = %session_id,
                    backend = self.storage.name(),
                    attempts = attempt,
                    events = events.len(),
                    error = %err,
                    "trace batch write failed, retries exhausted"
                );
                return Err(LedgerError::StorageWriteFailure {
                    session_id: session_id.to_string(),
                    attempts: attempt,
                    reason: err.to_string(),
                });
            }

            warn!(
                session_id = %session_id,
                backend = self.storage.name(),
                attempt,
                backoff_ms = delay.as_millis() as u64,
                error = %err,
                "trace batch write failed, retrying"
            );
            thread::sleep(delay);
            delay = (delay * 2).min(self.max_backoff);
            attempt += 1;
        }
    }
}

#[derive(Debug, Clone)]
struct Halt {
    attempts: u32,
    reason: String,
}

#[derive(Debug, Default)]
struct SessionProgress {
    /// Accepted on the deferred path, not yet committed
    queued: u64,
    committed: Option<u64>,
    halt: Option<Halt>,
}

/// Per-session readiness bookkeeping
#[derive(Default)]
pub struct ProgressTracker {
    sessions: Mutex<HashMap<String, SessionProgress>>,
    changed: Condvar,
}

impl ProgressTracker {
    pub(crate) fn enqueued(&self, session_id: &str) {
        self.sessions
            .lock()
            .entry(session_id.to_string())
            .or_default()
            .queued += 1;
    }

    /// An `enqueued` entry never made it into the queue
    pub(crate) fn withdrawn(&self, session_id: &str) {
        if let Some(progress) = self.sessions.lock().get_mut(session_id) {
            progress.queued = progress.queued.saturating_sub(1);
        }
        self.changed.notify_all();
    }

    /// `dequeued` queued entries were committed, the last at `sequence`
    pub(crate) fn committed(&self, session_id: &str, sequence: u64, dequeued: u64) {
        {
            let mut sessions = self.sessions.lock();
            let progress = sessions.entry(session_id.to_string()).or_default();
            progress.queued = progress.queued.saturating_sub(dequeued);
            progress.committed = Some(progress.committed.map_or(sequence, |c| c.max(sequence)));
        }
        self.changed.notify_all();
    }

    pub(crate) fn halt(&self, session_id: &str, error: &LedgerError) {
        let halt = match error {
            LedgerError::StorageWriteFailure { attempts, reason, .. } => Halt {
                attempts: *attempts,
                reason: reason.clone(),
            },
            other => Halt {
                attempts: 1,
                reason: other.to_string(),
            },
        };
        self.sessions
            .lock()
            .entry(session_id.to_string())
            .or_default()
            .halt = Some(halt);
        self.changed.notify_all();
    }

    pub(crate) fn resume(&self, session_id: &str) {
        if let Some(progress) = self.sessions.lock().get_mut(session_id) {
            progress.halt = None;
        }
        self.changed.notify_all();
    }

    pub fn is_halted(&self, session_id: &str) -> bool {
        self.sessions
            .lock()
            .get(session_id)
            .map_or(false, |p| p.halt.is_some())
    }

    /// Entries accepted for a session and not yet committed
    pub fn queued(&self, session_id: &str) -> u64 {
        self.sessions.lock().get(session_id).map_or(0, |p| p.queued)
    }

    pub fn committed_sequence(&self, session_id: &str) -> Option<u64> {
        self.sessions.lock().get(session_id).and_then(|p| p.committed)
    }

    pub fn is_ready(&self, session_id: &str) -> bool {
        self.sessions
            .lock()
            .get(session_id)
            .map_or(true, |p| p.queued == 0 && p.halt.is_none())
    }

    /// Drop a session's entry once it has nothing pending and is not halted
    pub(crate) fn forget(&self, session_id: &str) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.get(session_id) {
            Some(p) if p.queued == 0 && p.halt.is_none() => {
                sessions.remove(session_id);
                true
            }
            Some(_) => false,
            None => true,
        }
    }

    /// Sessions tracked in this process
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn halted_sessions(&self) -> usize {
        self.sessions.lock().values().filter(|p| p.halt.is_some()).count()
    }

    /// Block until the session has nothing pending, it halts, or `timeout`
    pub fn wait_ready(&self, session_id: &str, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut sessions = self.sessions.lock();
        loop {
            if let Some(progress) = sessions.get(session_id) {
                if let Some(halt) = &progress.halt {
                    return Err(LedgerError::StorageWriteFailure {
                        session_id: session_id.to_string(),
                        attempts: halt.attempts,
                        reason: halt.reason.clone(),
                    });
                }
                if progress.queued == 0 {
                    return Ok(());
                }
            } else {
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(LedgerError::Timeout {
                    operation: format!("session '{}' to become ready", session_id),
                    waited_ms: timeout.as_millis() as u64,
                });
            }
            self.changed.wait_until(&mut sessions, deadline);
        }
    }
}

/// A sealed batch whose write failed after every retry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedBatch {
    pub session_id: String,
    /// Sealed events, in order, ready to be committed again
    pub events: Vec<TraceEvent>,
    pub attempts: u32,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

struct HaltedSession {
    batch: FailedBatch,
    /// Entries drained after the failure, not sealed
    parked: Vec<RawEvent>,
}

#[derive(Debug, Default)]
struct Control {
    shutdown: bool,
    stopped: bool,
    next_ticket: u64,
    pending: std::collections::BTreeSet<u64>,
    /// Highest ticket whose cycle has begun
    begun_through: u64,
    /// Highest ticket whose cycle has finished
    completed_through: u64,
}

/// Processor statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorStats {
    pub running: bool,
    pub cycles: u64,
    pub events_committed: u64,
    pub batches_committed: u64,
    pub write_failures: u64,
    pub failed_batches: usize,
    pub halted_sessions: usize,
    pub parked_events: usize,
}

/// Background trace processor
///
/// Drains the queue, chains events, and forwards them to storage.
pub struct TraceProcessor {
    queue: Arc<IngestionQueue>,
    chain: Arc<ChainBuilder>,
    writer: BatchWriter,
    progress: ProgressTracker,
    config: ProcessorConfig,

    control: Mutex<Control>,
    /// Wakes the worker
    wake: Condvar,
    /// Signals finished cycles to flush waiters
    flushed: Condvar,

    /// Held for the duration of a cycle or a recovery
    drain_lock: Mutex<()>,
    halted: Mutex<BTreeMap<String, HaltedSession>>,

    running: AtomicBool,
    cycles: AtomicU64,
    events_committed: AtomicU64,
    batches_committed: AtomicU64,
    write_failures: AtomicU64,
}

impl TraceProcessor {
    pub fn new(
        queue: Arc<IngestionQueue>,
        chain: Arc<ChainBuilder>,
        config: ProcessorConfig,
    ) -> Self {
        let writer = BatchWriter::new(Arc::clone(chain.storage()), &config);
        Self {
            queue,
            chain,
            writer,
            progress: ProgressTracker::default(),
            config,
            control: Mutex::new(Control {
                next_ticket: 1,
                ..Control::default()
            }),
            wake: Condvar::new(),
            flushed: Condvar::new(),
            drain_lock: Mutex::new(()),
            halted: Mutex::new(BTreeMap::new()),
            running: AtomicBool::new(false),
            cycles: AtomicU64::new(0),
            events_committed: AtomicU64::new(0),
            batches_committed: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    pub(crate) fn writer(&self) -> &BatchWriter {
        &self.writer
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Start the worker thread
    pub fn start(self: &Arc<Self>) -> Result<ProcessorHandle> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(LedgerError::InternalError {
                reason: "trace processor already running".to_string(),
            });
        }
        {
            let mut control = self.control.lock();
            control.shutdown = false;
            control.stopped = false;
        }

        let processor = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("cra-trace-processor".to_string())
            .spawn(move || processor.run_loop())
            .map_err(|e| {
                self.running.store(false, Ordering::Release);
                LedgerError::IoError {
                    message: format!("Failed to spawn trace processor: {}", e),
                }
            })?;

        Ok(ProcessorHandle {
            processor: Arc::clone(self),
            handle: Some(handle),
        })
    }

    /// Nudge the worker if the batch threshold was reached
    pub(crate) fn notify_pushed(&self) {
        if self.queue.len() >= self.config.batch_size {
            self.wake.notify_one();
        }
    }

    fn signal_shutdown(&self) {
        self.control.lock().shutdown = true;
        self.wake.notify_all();
    }

    fn run_loop(&self) {
        info!(
            batch_size = self.config.batch_size,
            flush_interval_ms = self.config.flush_interval_ms,
            capacity = self.queue.capacity(),
            "trace processor started"
        );

        let flush_interval = Duration::from_millis(self.config.flush_interval_ms);
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let mut last_flush = Instant::now();

        loop {
            let (shutdown, flush_requested) = {
                let mut control = self.control.lock();
                let idle = !control.shutdown
                    && control.pending.is_empty()
                    && self.queue.len() < self.config.batch_size
                    && (self.queue.is_empty() || last_flush.elapsed() < flush_interval);
                if idle {
                    self.wake.wait_for(&mut control, poll_interval);
                }
                (control.shutdown, !control.pending.is_empty())
            };

            if shutdown {
                break;
            }

            let interval_due = !self.queue.is_empty() && last_flush.elapsed() >= flush_interval;
            if flush_requested || interval_due {
                self.run_cycle(true);
                last_flush = Instant::now();
            } else if self.queue.len() >= self.config.batch_size {
                self.run_cycle(false);
            }
        }

        if self.config.flush_on_shutdown {
            self.run_cycle(true);
        }

        {
            let mut control = self.control.lock();
            control.stopped = true;
            control.pending.clear();
        }
        self.flushed.notify_all();
        self.running.store(false, Ordering::Release);

        info!(
            remaining = self.queue.len(),
            events_committed = self.events_committed.load(Ordering::Relaxed),
            "trace processor stopped"
        );
    }

    /// Run one full drain cycle on the calling thread
    ///
    /// Returns the number of entries drained.
    pub fn process_pending(&self) -> usize {
        self.run_cycle(true)
    }

    fn run_cycle(&self, flush: bool) -> usize {
        let _drain = self.drain_lock.lock();

        let (through, flush) = {
            let mut control = self.control.lock();
            let requested = !control.pending.is_empty();
            control.pending.clear();
            control.begun_through = control.next_ticket - 1;
            (control.begun_through, flush || requested)
        };

        let max = if flush {
            self.queue.len()
        } else {
            self.config.batch_size
        };
        let drained = self.queue.drain(max);
        let count = drained.len();

        for (session_id, batch) in group_by_session(drained) {
            self.commit_group(&session_id, batch);
        }

        if count > 0 {
            self.cycles.fetch_add(1, Ordering::Relaxed);
        }

        {
            let mut control = self.control.lock();
            control.completed_through = control.completed_through.max(through);
        }
        self.flushed.notify_all();
        count
    }

    /// Persist through the writer; a final failure halts the session while
    /// its chain lock is still held
    fn write_or_halt(&self, session_id: &str, events: &[TraceEvent]) -> Result<()> {
        self.writer.write(events).map_err(|err| {
            self.write_failures.fetch_add(1, Ordering::Relaxed);
            self.progress.halt(session_id, &err);
            err
        })
    }

    fn commit_group(&self, session_id: &str, batch: Vec<RawEvent>) {
        if let Some(halted) = self.halted.lock().get_mut(session_id) {
            debug!(
                session_id = %session_id,
                parked = batch.len(),
                "session halted, parking entries"
            );
            halted.parked.extend(batch);
            return;
        }

        let count = batch.len() as u64;
        match self
            .chain
            .append_batch(session_id, batch, |events| self.write_or_halt(session_id, events))
        {
            Ok(events) => self.record_commit(session_id, &events, count),
            Err(failure) => self.record_failure(session_id, failure, Vec::new()),
        }
    }

    fn record_commit(&self, session_id: &str, events: &[TraceEvent], dequeued: u64) {
        if let Some(last) = events.last() {
            self.progress.committed(session_id, last.sequence_number, dequeued);
            self.events_committed
                .fetch_add(events.len() as u64, Ordering::Relaxed);
            self.batches_committed.fetch_add(1, Ordering::Relaxed);
            debug!(
                session_id = %session_id,
                events = events.len(),
                last_sequence = last.sequence_number,
                "committed trace batch"
            );
        }
    }

    fn record_failure(&self, session_id: &str, failure: BatchFailure, parked: Vec<RawEvent>) {
        // Covers failures raised before the writer ran
        self.progress.halt(session_id, &failure.error);

        let attempts = match &failure.error {
            LedgerError::StorageWriteFailure { attempts, .. } => *attempts,
            _ => 1,
        };
        error!(
            session_id = %session_id,
            events = failure.events.len(),
            parked = parked.len(),
            error = %failure.error,
            "trace batch failed, session halted until retry_failed"
        );

        self.halted.lock().insert(
            session_id.to_string(),
            HaltedSession {
                batch: FailedBatch {
                    session_id: session_id.to_string(),
                    events: failure.events,
                    attempts,
                    error: failure.error.to_string(),
                    failed_at: Utc::now(),
                },
                parked,
            },
        );
    }

    /// Commit a halted session's failed batch, then its parked entries
    ///
    /// Returns the number of events committed. On failure the session stays
    /// halted with the batch kept.
    pub fn retry_failed(&self, session_id: &str) -> Result<usize> {
        let _drain = self.drain_lock.lock();

        let HaltedSession { batch, parked } = match self.halted.lock().remove(session_id) {
            Some(halted) => halted,
            None => return Ok(0),
        };

        let sealed_count = batch.events.len() as u64;
        let mut committed = 0;
        let persist = |events: &[TraceEvent]| self.write_or_halt(session_id, events);
        match self.chain.commit_sealed(session_id, batch.events, persist) {
            Ok(events) => {
                self.record_commit(session_id, &events, sealed_count);
                committed += events.len();
            }
            Err(failure) => {
                let error = LedgerError::StorageWriteFailure {
                    session_id: session_id.to_string(),
                    attempts: batch.attempts,
                    reason: failure.error.to_string(),
                };
                self.record_failure(session_id, failure, parked);
                return Err(error);
            }
        }

        if !parked.is_empty() {
            let count = parked.len() as u64;
            match self
                .chain
                .append_batch(session_id, parked, |events| self.write_or_halt(session_id, events))
            {
                Ok(events) => {
                    self.record_commit(session_id, &events, count);
                    committed += events.len();
                }
                Err(failure) => {
                    let error = LedgerError::StorageWriteFailure {
                        session_id: session_id.to_string(),
                        attempts: self.config.max_write_retries + 1,
                        reason: failure.error.to_string(),
                    };
                    self.record_failure(session_id, failure, Vec::new());
                    return Err(error);
                }
            }
        }

        self.progress.resume(session_id);
        info!(session_id = %session_id, events = committed, "halted session recovered");
        Ok(committed)
    }

    /// Batches kept after exhausted retries
    pub fn failed_batches(&self) -> Vec<FailedBatch> {
        self.halted.lock().values().map(|h| h.batch.clone()).collect()
    }

    /// Ask the running worker for a full drain
    pub fn request_flush(self: &Arc<Self>) -> FlushRequest {
        let ticket = {
            let mut control = self.control.lock();
            let ticket = control.next_ticket;
            control.next_ticket += 1;
            control.pending.insert(ticket);
            ticket
        };
        self.wake.notify_one();
        FlushRequest {
            ticket,
            processor: Arc::clone(self),
        }
    }

    pub fn is_ready(&self, session_id: &str) -> bool {
        self.progress.is_ready(session_id)
    }

    pub fn await_ready(&self, session_id: &str, timeout: Duration) -> Result<()> {
        self.progress.wait_ready(session_id, timeout)
    }

    pub fn committed_sequence(&self, session_id: &str) -> Option<u64> {
        self.progress.committed_sequence(session_id)
    }

    pub fn stats(&self) -> ProcessorStats {
        let halted = self.halted.lock();
        ProcessorStats {
            running: self.is_running(),
            cycles: self.cycles.load(Ordering::Relaxed),
            events_committed: self.events_committed.load(Ordering::Relaxed),
            batches_committed: self.batches_committed.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            failed_batches: halted.len(),
            halted_sessions: self.progress.halted_sessions(),
            parked_events: halted.values().map(|h| h.parked.len()).sum(),
        }
    }
}

/// Group entries by session, keeping push order within each session
fn group_by_session(events: Vec<RawEvent>) -> Vec<(String, Vec<RawEvent>)> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<(String, Vec<RawEvent>)> = Vec::new();
    for event in events {
        match index.get(&event.session_id) {
            Some(&i) => groups[i].1.push(event),
            None => {
                index.insert(event.session_id.clone(), groups.len());
                groups.push((event.session_id.clone(), vec![event]));
            }
        }
    }
    groups
}

/// A pending flush
///
/// Can be cancelled until the cycle that serves it begins.
pub struct FlushRequest {
    ticket: u64,
    processor: Arc<TraceProcessor>,
}

impl FlushRequest {
    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    pub fn is_complete(&self) -> bool {
        self.processor.control.lock().completed_through >= self.ticket
    }

    /// Wait for the serving cycle to finish
    pub fn wait(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut control = self.processor.control.lock();
        loop {
            if control.completed_through >= self.ticket {
                return Ok(());
            }
            if control.stopped {
                return Err(LedgerError::ProcessorStopped {
                    reason: "stopped before the flush was served".to_string(),
                });
            }
            if Instant::now() >= deadline {
                warn!(
                    ticket = self.ticket,
                    timeout_ms = timeout.as_millis() as u64,
                    queued = self.processor.queue.len(),
                    "trace flush timed out"
                );
                return Err(LedgerError::Timeout {
                    operation: "flush".to_string(),
                    waited_ms: timeout.as_millis() as u64,
                });
            }
            self.processor.flushed.wait_until(&mut control, deadline);
        }
    }

    /// Withdraw the request; false once its cycle has begun
    pub fn cancel(self) -> bool {
        let mut control = self.processor.control.lock();
        self.ticket > control.begun_through && control.pending.remove(&self.ticket)
    }
}

/// Handle to control the running processor
pub struct ProcessorHandle {
    processor: Arc<TraceProcessor>,
    handle: Option<JoinHandle<()>>,
}

impl ProcessorHandle {
    /// Signal the processor to shut down
    pub fn shutdown(&self) {
        self.processor.signal_shutdown();
    }

    /// Shut down and wait for the final drain to finish
    pub fn join(mut self) -> thread::Result<()> {
        self.shutdown();
        match self.handle.take() {
            Some(handle) => handle.join(),
            None => Ok(()),
        }
    }

    /// Check if the processor is still running
    pub fn is_running(&self) -> bool {
        self.processor.is_running()
    }
}

impl Drop for ProcessorHandle {
    fn drop(&mut self) {
        // Signal shutdown on drop; never block here
        if self.handle.is_some() {
            self.processor.signal_shutdown();
        }
    }
}
