//! TRACE/1.0 ledger core
//!
//! An append-only, hash-chained record of what an agent session did.
//!
//! ## Core Principle
//!
//! > If it wasn't emitted by the runtime, it didn't happen.
//!
//! ## Key Properties
//!
//! - **Append-Only**: Events are sealed once and never updated
//! - **Hash Chain**: Each event hashes its canonical content together with
//!   the previous event's hash
//! - **Tamper-Evident**: Any stored mutation is reported by verification at
//!   the first broken sequence
//! - **Replayable**: Recorded sessions are checked against golden manifests
//! - **Diffable**: Two traces are compared to find where behavior changed
//!
//! ## Architecture
//!
//! ```text
//! Producers                Ingestion              Background
//! ─────────                ─────────              ──────────
//! Ledger::emit ─┬─ sync ──────────────────────► ChainBuilder ──► StorageBackend
//!               │                                    ▲
//!               └─ deferred ─► IngestionQueue ─► TraceProcessor
//!                               (bounded,         (one thread, batches
//!                                lock-free)        per session)
//! ```
//!
//! The sync path hashes and persists before `emit` returns. The deferred
//! path returns once the event is queued; `await_ready` and flush requests
//! report when it has been committed.

pub mod canonical;
pub mod chain;
mod event;
mod ledger;
mod processor;
mod queue;
mod replay;
pub mod verify;

pub use chain::{genesis, BatchFailure, ChainBuilder, ChainHead};
pub use event::{
    compute_event_hash, event_types, Actor, ActorType, Artifact, EventContent, RawEvent, Severity,
    TraceEvent,
};
pub use ledger::{Emitted, Ledger, LedgerStats};
pub use processor::{
    FailedBatch, FlushRequest, ProcessorConfig, ProcessorHandle, ProcessorStats, ProgressTracker,
    TraceProcessor,
};
pub use queue::{IngestionQueue, QueueFull, QueueStats};
pub use replay::{
    replay, DiffResult, EventComparison, EventDifference, EventStatus, EventSummary, ExpectedEvent,
    FieldDiff, GoldenManifest, NondeterminismRule, ReplayEngine, ReplaySummary, RuleKind,
    TraceDiff, TraceDiffSummary, MANIFEST_VERSION,
};
pub use verify::{ChainErrorType, ChainVerification};

/// TRACE protocol version
pub const VERSION: &str = "1.0";
