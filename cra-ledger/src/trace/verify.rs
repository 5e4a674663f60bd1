//! TRACE hash chain verification
//!
//! Recomputes every event hash from stored content and the stored previous
//! hash, and compares it with the persisted hash.
//!
//! # Cost
//!
//! Verification is O(n) in the number of events in the requested range:
//! one storage range read plus one SHA-256 over each event's canonical
//! encoding. There is no cached or sampled fast path. Verifying a range
//! costs the same per event as verifying the whole chain.
//!
//! Breaks are reported, never repaired.

use serde::{Deserialize, Serialize};

use super::chain::genesis;
use super::event::TraceEvent;
use crate::error::{LedgerError, Result};
use crate::storage::StorageBackend;

/// Result of verifying a hash chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerification {
    /// Whether the chain is valid
    pub valid: bool,

    /// Session that was verified
    pub session_id: String,

    /// Number of events examined
    pub event_count: usize,

    /// Sequence number of the first broken event (if any)
    pub first_break: Option<u64>,

    /// Type of error if chain is invalid
    pub error_type: Option<ChainErrorType>,

    /// Human-readable error message
    pub message: Option<String>,

    /// Hash of the last event that verified, or the anchor
    pub last_valid_hash: Option<String>,
}

impl ChainVerification {
    fn ok(session_id: &str, event_count: usize, last_hash: String) -> Self {
        Self {
            valid: true,
            session_id: session_id.to_string(),
            event_count,
            first_break: None,
            error_type: None,
            message: None,
            last_valid_hash: Some(last_hash),
        }
    }

    fn broken(
        session_id: &str,
        event_count: usize,
        sequence: u64,
        error_type: ChainErrorType,
        message: String,
        last_valid_hash: String,
    ) -> Self {
        Self {
            valid: false,
            session_id: session_id.to_string(),
            event_count,
            first_break: Some(sequence),
            error_type: Some(error_type),
            message: Some(message),
            last_valid_hash: Some(last_valid_hash),
        }
    }

    /// Turn a break into a `ChainBreak` error
    pub fn into_result(self) -> Result<Self> {
        match self.first_break {
            Some(sequence) if !self.valid => Err(LedgerError::ChainBreak {
                session_id: self.session_id,
                sequence,
                reason: self.message.unwrap_or_else(|| "chain broken".to_string()),
            }),
            _ => Ok(self),
        }
    }
}

/// Types of chain errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainErrorType {
    /// Event's computed hash doesn't match stored hash
    HashMismatch,
    /// Event's previous_event_hash doesn't link to prior event
    ChainBroken,
    /// Sequence numbers are not contiguous
    SequenceGap,
    /// First event doesn't link to the genesis hash
    InvalidGenesis,
}

impl std::fmt::Display for ChainErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainErrorType::HashMismatch => write!(f, "hash_mismatch"),
            ChainErrorType::ChainBroken => write!(f, "chain_broken"),
            ChainErrorType::SequenceGap => write!(f, "sequence_gap"),
            ChainErrorType::InvalidGenesis => write!(f, "invalid_genesis"),
        }
    }
}

/// Verify `from..=to` of a stored session chain
///
/// The anchor is the genesis hash when `from == 0`, otherwise the stored
/// hash of event `from - 1`. If that event is no longer stored (e.g. it was
/// removed by retention) the first event's recorded previous hash is trusted
/// as the anchor.
pub fn verify(
    storage: &dyn StorageBackend,
    session_id: &str,
    from: u64,
    to: u64,
) -> Result<ChainVerification> {
    if from > to {
        return Ok(ChainVerification::ok(session_id, 0, String::new()));
    }

    let read_from = from.saturating_sub(1);
    let mut events = storage.read_range(session_id, read_from, to)?;

    let anchor = if from == 0 {
        Anchor::Genesis(genesis(session_id)?)
    } else if events.first().map(|e| e.sequence_number) == Some(from - 1) {
        let predecessor = events.remove(0);
        Anchor::Stored {
            next: predecessor.sequence_number + 1,
            hash: predecessor.event_hash,
        }
    } else {
        Anchor::FirstEvent
    };

    Ok(verify_anchored(session_id, &events, from, anchor))
}

/// Verify every stored session
pub fn verify_all(storage: &dyn StorageBackend) -> Result<Vec<ChainVerification>> {
    storage
        .session_ids()?
        .iter()
        .map(|session_id| verify(storage, session_id, 0, u64::MAX))
        .collect()
}

/// Where the first examined event must link to
enum Anchor {
    Genesis(String),
    Stored { next: u64, hash: String },
    FirstEvent,
}

/// Verify a chain held in memory
///
/// The first event must link to `anchor`; pass `None` to verify a complete
/// chain from its genesis.
pub fn verify_events(events: &[TraceEvent], anchor: Option<&str>) -> Result<ChainVerification> {
    let session_id = match events.first() {
        Some(first) => first.session_id.clone(),
        None => return Ok(ChainVerification::ok("", 0, anchor.unwrap_or_default().to_string())),
    };

    let (from, anchor) = match anchor {
        Some(hash) => {
            let next = events[0].sequence_number;
            (
                next,
                Anchor::Stored {
                    next,
                    hash: hash.to_string(),
                },
            )
        }
        None => (0, Anchor::Genesis(genesis(&session_id)?)),
    };
    Ok(verify_anchored(&session_id, events, from, anchor))
}

fn verify_anchored(
    session_id: &str,
    events: &[TraceEvent],
    from: u64,
    anchor: Anchor,
) -> ChainVerification {
    let count = events.len();
    let first = match events.first() {
        Some(first) => first,
        None => {
            let hash = match anchor {
                Anchor::Genesis(hash) | Anchor::Stored { hash, .. } => hash,
                Anchor::FirstEvent => String::new(),
            };
            return ChainVerification::ok(session_id, 0, hash);
        }
    };

    let (mut last_hash, mut expected_sequence) = match anchor {
        Anchor::Genesis(hash) => {
            if first.sequence_number != 0 {
                return ChainVerification::broken(
                    session_id,
                    count,
                    0,
                    ChainErrorType::SequenceGap,
                    format!("first event has sequence {}, expected 0", first.sequence_number),
                    hash,
                );
            }
            if first.previous_event_hash != hash {
                return ChainVerification::broken(
                    session_id,
                    count,
                    0,
                    ChainErrorType::InvalidGenesis,
                    format!(
                        "first event links to {}, expected genesis {}",
                        first.previous_event_hash, hash
                    ),
                    hash,
                );
            }
            (hash, 0)
        }
        Anchor::Stored { next, hash } => (hash, next),
        Anchor::FirstEvent => (first.previous_event_hash.clone(), from.max(first.sequence_number)),
    };

    for event in events {
        if event.sequence_number != expected_sequence {
            return ChainVerification::broken(
                session_id,
                count,
                expected_sequence.min(event.sequence_number),
                ChainErrorType::SequenceGap,
                format!(
                    "expected sequence {}, found {}",
                    expected_sequence, event.sequence_number
                ),
                last_hash,
            );
        }

        if event.previous_event_hash != last_hash {
            return ChainVerification::broken(
                session_id,
                count,
                event.sequence_number,
                ChainErrorType::ChainBroken,
                format!(
                    "event {} links to {}, previous hash is {}",
                    event.sequence_number, event.previous_event_hash, last_hash
                ),
                last_hash,
            );
        }

        match event.compute_hash() {
            Ok(computed) if computed == event.event_hash => {}
            Ok(computed) => {
                return ChainVerification::broken(
                    session_id,
                    count,
                    event.sequence_number,
                    ChainErrorType::HashMismatch,
                    format!(
                        "event {} hash mismatch: stored {}, computed {}",
                        event.sequence_number, event.event_hash, computed
                    ),
                    last_hash,
                );
            }
            Err(err) => {
                return ChainVerification::broken(
                    session_id,
                    count,
                    event.sequence_number,
                    ChainErrorType::HashMismatch,
                    format!("event {} cannot be re-encoded: {}", event.sequence_number, err),
                    last_hash,
                );
            }
        }

        last_hash = event.event_hash.clone();
        expected_sequence += 1;
    }

    ChainVerification::ok(session_id, count, last_hash)
}

/// Verify that one chain is an extension of another
///
/// Returns true if `extension` starts where `base` ends.
pub fn verify_extension(base: &[TraceEvent], extension: &[TraceEvent]) -> bool {
    match (base.last(), extension.first()) {
        (Some(last), Some(first)) => {
            first.session_id == last.session_id
                && first.previous_event_hash == last.event_hash
                && first.sequence_number == last.sequence_number + 1
        }
        _ => false,
    }
}

/// Find the point where two chains diverge
///
/// Returns the index of the first differing event, or None if chains are identical.
pub fn find_divergence(chain_a: &[TraceEvent], chain_b: &[TraceEvent]) -> Option<usize> {
    let min_len = chain_a.len().min(chain_b.len());

    if let Some(i) = (0..min_len).find(|&i| chain_a[i].event_hash != chain_b[i].event_hash) {
        return Some(i);
    }

    if chain_a.len() != chain_b.len() {
        Some(min_len)
    } else {
        None
    }
}
