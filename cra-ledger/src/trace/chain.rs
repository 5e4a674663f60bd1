//! Per-session hash chains
//!
//! The [`ChainBuilder`] owns the head of every session chain: the next
//! sequence number and the hash the next event links to. Heads are guarded
//! by one mutex per session, held across sealing *and* persisting, so two
//! writers can never seal against the same stale head. Different sessions
//! never contend.
//!
//! A head only moves after the storage write succeeded. If the write fails
//! the sealed events are handed back in a [`BatchFailure`] and the head stays
//! where it was, so the same sealed batch can be committed later with
//! [`ChainBuilder::commit_sealed`].

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::event::{RawEvent, TraceEvent};
use super::{canonical, VERSION};
use crate::error::{LedgerError, Result};
use crate::storage::StorageBackend;

#[derive(Serialize)]
struct GenesisSeed<'a> {
    genesis: &'a str,
    trace_version: &'a str,
}

/// Genesis hash of a session: the implicit previous hash of event 0
///
/// `sha256(canonical({"genesis": session_id, "trace_version": "1.0"}))`
pub fn genesis(session_id: &str) -> Result<String> {
    let bytes = canonical::to_vec(&GenesisSeed {
        genesis: session_id,
        trace_version: VERSION,
    })?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Where the next event of a session attaches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainHead {
    pub next_sequence: u64,
    pub head_hash: String,
}

impl ChainHead {
    fn fresh(session_id: &str) -> Result<Self> {
        Ok(Self {
            next_sequence: 0,
            head_hash: genesis(session_id)?,
        })
    }
}

/// A batch whose write failed, with the events already sealed for it
#[derive(Debug)]
pub struct BatchFailure {
    pub events: Vec<TraceEvent>,
    pub error: LedgerError,
}

impl From<BatchFailure> for LedgerError {
    fn from(failure: BatchFailure) -> Self {
        failure.error
    }
}

type HeadSlot = Arc<Mutex<Option<ChainHead>>>;

/// Builds and advances session chains
pub struct ChainBuilder {
    storage: Arc<dyn StorageBackend>,
    heads: RwLock<HashMap<String, HeadSlot>>,
}

impl ChainBuilder {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            storage,
            heads: RwLock::new(HashMap::new()),
        }
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    fn slot(&self, session_id: &str) -> HeadSlot {
        if let Some(slot) = self.heads.read().get(session_id) {
            return Arc::clone(slot);
        }
        Arc::clone(self.heads.write().entry(session_id.to_string()).or_default())
    }

    /// Load a head the first time a session is touched in this process
    fn ensure_loaded<'a>(
        &self,
        session_id: &str,
        head: &'a mut Option<ChainHead>,
    ) -> Result<&'a mut ChainHead> {
        if head.is_none() {
            let loaded = match self.storage.last_event(session_id)? {
                Some(last) => ChainHead {
                    next_sequence: last.sequence_number + 1,
                    head_hash: last.event_hash,
                },
                None => ChainHead::fresh(session_id)?,
            };
            *head = Some(loaded);
        }
        head.as_mut().ok_or_else(|| LedgerError::InternalError {
            reason: "chain head missing after load".to_string(),
        })
    }

    /// Current head of a session
    pub fn head(&self, session_id: &str) -> Result<ChainHead> {
        let slot = self.slot(session_id);
        let mut guard = slot.lock();
        Ok(self.ensure_loaded(session_id, &mut guard)?.clone())
    }

    /// Seal, persist and link a single event
    pub fn append(&self, raw: RawEvent) -> Result<TraceEvent> {
        let session_id = raw.session_id.clone();
        let storage = Arc::clone(&self.storage);
        let mut events =
            self.append_batch(&session_id, vec![raw], |events| storage.append(events))?;
        events.pop().ok_or_else(|| LedgerError::InternalError {
            reason: "append produced no event".to_string(),
        })
    }

    /// Seal a batch of one session's events and persist it with `persist`
    ///
    /// `persist` is called exactly once, under the session lock. The head
    /// advances only if it returns `Ok`.
    pub fn append_batch<F>(
        &self,
        session_id: &str,
        raws: Vec<RawEvent>,
        persist: F,
    ) -> std::result::Result<Vec<TraceEvent>, BatchFailure>
    where
        F: FnOnce(&[TraceEvent]) -> Result<()>,
    {
        let failed = |error| BatchFailure {
            events: Vec::new(),
            error,
        };

        if let Some(stray) = raws.iter().find(|r| r.session_id != session_id) {
            return Err(failed(LedgerError::InternalError {
                reason: format!(
                    "event for session '{}' in batch for '{}'",
                    stray.session_id, session_id
                ),
            }));
        }

        let slot = self.slot(session_id);
        let mut guard = slot.lock();
        let head = self.ensure_loaded(session_id, &mut guard).map_err(failed)?;

        let persisted_at = Utc::now();
        let mut sealed = Vec::with_capacity(raws.len());
        let mut previous = head.head_hash.clone();
        let mut sequence = head.next_sequence;
        for raw in raws {
            let event = TraceEvent::seal(raw, sequence, previous, persisted_at).map_err(failed)?;
            previous = event.event_hash.clone();
            sequence += 1;
            sealed.push(event);
        }

        if sealed.is_empty() {
            return Ok(sealed);
        }

        match persist(&sealed) {
            Ok(()) => {
                head.next_sequence = sequence;
                head.head_hash = previous;
                Ok(sealed)
            }
            Err(error) => Err(BatchFailure {
                events: sealed,
                error,
            }),
        }
    }

    /// Persist a batch sealed by an earlier, failed `append_batch`
    ///
    /// The batch must still attach to the current head.
    pub fn commit_sealed<F>(
        &self,
        session_id: &str,
        events: Vec<TraceEvent>,
        persist: F,
    ) -> std::result::Result<Vec<TraceEvent>, BatchFailure>
    where
        F: FnOnce(&[TraceEvent]) -> Result<()>,
    {
        let slot = self.slot(session_id);
        let mut guard = slot.lock();
        let head = match self.ensure_loaded(session_id, &mut guard) {
            Ok(head) => head,
            Err(error) => return Err(BatchFailure { events, error }),
        };

        if events.is_empty() {
            return Ok(events);
        }
        let first = &events[0];
        let last = &events[events.len() - 1];

        if first.sequence_number != head.next_sequence
            || first.previous_event_hash != head.head_hash
        {
            let error = LedgerError::ChainBreak {
                session_id: session_id.to_string(),
                sequence: first.sequence_number,
                reason: format!(
                    "sealed batch does not attach to head (next sequence {})",
                    head.next_sequence
                ),
            };
            return Err(BatchFailure { events, error });
        }

        let next_sequence = last.sequence_number + 1;
        let head_hash = last.event_hash.clone();
        match persist(&events) {
            Ok(()) => {
                head.next_sequence = next_sequence;
                head.head_hash = head_hash;
                Ok(events)
            }
            Err(error) => Err(BatchFailure { events, error }),
        }
    }

    /// Drop a session's cached head; the next append reloads it from storage
    ///
    /// Returns false while another thread holds the slot.
    pub fn evict(&self, session_id: &str) -> bool {
        let mut heads = self.heads.write();
        match heads.get(session_id) {
            Some(slot) if Arc::strong_count(slot) == 1 => {
                heads.remove(session_id);
                true
            }
            Some(_) => false,
            None => true,
        }
    }

    /// Number of sessions with a head in this process
    pub fn session_count(&self) -> usize {
        self.heads.read().len()
    }
}
