//! # CRA Ledger - TRACE audit engine
//!
//! The ledger is the tamper-evident memory of the CRA governance layer. Every
//! event the runtime emits about an agent session is sealed into a per-session
//! SHA-256 hash chain and persisted append-only:
//!
//! - **Chain**: `event_hash = sha256(canonical(content) ‖ previous_event_hash)`,
//!   rooted at a per-session genesis hash
//! - **Ingestion**: events commit inline (immediate mode, sync overrides) or
//!   through a bounded queue drained by one background processor
//! - **Verification**: stored chains are re-hashed to find the first break
//! - **Replay**: recorded sessions are compared against golden manifests
//!
//! ## Core Principle
//!
//! > If it wasn't emitted by the runtime, it didn't happen.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use cra_ledger::{InMemoryStorage, Ledger, LedgerConfig, OverflowPolicy, RawEvent, TraceMode};
//! use serde_json::json;
//!
//! let config = LedgerConfig::new(TraceMode::Deferred, OverflowPolicy::Reject, ["session.ended"]);
//! let ledger = Ledger::started(Arc::new(InMemoryStorage::new()), config).unwrap();
//!
//! ledger
//!     .emit(RawEvent::new("sess-1", "action.executed", json!({"action_id": "ticket.get"})))
//!     .unwrap();
//! let ended = ledger
//!     .emit(RawEvent::new("sess-1", "session.ended", json!({"reason": "completed"})))
//!     .unwrap();
//!
//! // session.ended is a sync override: committed before emit returned
//! assert_eq!(ended.committed().unwrap().sequence_number, 1);
//!
//! ledger.await_ready("sess-1", Duration::from_secs(1)).unwrap();
//! assert!(ledger.verify("sess-1").unwrap().valid);
//! ledger.shutdown().unwrap();
//! ```

pub mod config;
pub mod error;
pub mod storage;
pub mod trace;

#[cfg(feature = "async-runtime")]
pub mod runtime;

// Re-export main types
pub use config::{
    LedgerConfig, OverflowPolicy, QueueConfig, RetentionPolicy, RetentionRule, SyncOverrides,
    TraceMode,
};
pub use error::{ErrorCategory, ErrorDetail, ErrorResponse, LedgerError, Result};
pub use storage::{FileStorage, InMemoryStorage, StorageBackend};
pub use trace::{
    compute_event_hash, genesis, Actor, ActorType, Artifact, ChainBuilder, ChainErrorType,
    ChainHead, ChainVerification, DiffResult, Emitted, EventStatus, ExpectedEvent, FieldDiff,
    FlushRequest, GoldenManifest, Ledger, LedgerStats, ProcessorConfig, RawEvent, ReplayEngine,
    RuleKind, Severity, TraceEvent,
};

/// Protocol version constant
pub const TRACE_VERSION: &str = trace::VERSION;
