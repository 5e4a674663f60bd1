//! Bounded ingestion queue
//!
//! Producers push [`RawEvent`]s here on the deferred path; the background
//! processor is the only drainer. The queue does no hashing and no I/O.
//! `push` below capacity is one lock-free CAS on a `crossbeam` array queue.
//!
//! Overflow is never silent: a full queue hands the event back inside
//! [`QueueFull`] and bumps the `rejected` counter. What happens next is the
//! configured [`OverflowPolicy`]:
//!
//! | Policy          | `push` at capacity                                   |
//! |-----------------|------------------------------------------------------|
//! | `reject`        | returns `QueueFull` immediately                      |
//! | `block`         | backs off until space frees up or `timeout_ms` passes |
//! | `sync_fallback` | returns `QueueFull`; the ledger commits inline        |

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::queue::ArrayQueue;
use crossbeam::utils::Backoff;
use serde::{Deserialize, Serialize};

use super::event::RawEvent;
use crate::config::OverflowPolicy;
use crate::error::LedgerError;

/// Queue was at capacity; the event is handed back untouched
#[derive(Debug)]
pub struct QueueFull {
    pub event: RawEvent,
    pub capacity: usize,
    pub policy: OverflowPolicy,
}

impl fmt::Display for QueueFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "trace queue full (capacity {}, policy {})",
            self.capacity,
            self.policy.name()
        )
    }
}

impl std::error::Error for QueueFull {}

impl From<QueueFull> for LedgerError {
    fn from(full: QueueFull) -> Self {
        LedgerError::QueueFull {
            capacity: full.capacity,
            policy: full.policy.name().to_string(),
        }
    }
}

/// Queue statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub len: usize,
    pub capacity: usize,
    /// `len / capacity`
    pub pressure: f64,
    pub total_pushed: u64,
    pub total_drained: u64,
    /// Pushes that ended in `QueueFull`
    pub rejected: u64,
}

/// Bounded MPSC buffer of not-yet-hashed events
pub struct IngestionQueue {
    entries: ArrayQueue<RawEvent>,
    policy: OverflowPolicy,
    total_pushed: AtomicU64,
    total_drained: AtomicU64,
    rejected: AtomicU64,
}

impl IngestionQueue {
    /// # Panics
    ///
    /// Panics if `capacity` is zero. `LedgerConfig::validate` rejects that.
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            entries: ArrayQueue::new(capacity),
            policy,
            total_pushed: AtomicU64::new(0),
            total_drained: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Push an event, applying the overflow policy at capacity
    pub fn push(&self, event: RawEvent) -> Result<(), QueueFull> {
        let event = match self.entries.push(event) {
            Ok(()) => {
                self.total_pushed.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            Err(event) => event,
        };

        let event = match self.policy {
            OverflowPolicy::Block { timeout_ms } => {
                match self.push_until(event, Instant::now() + Duration::from_millis(timeout_ms)) {
                    Ok(()) => return Ok(()),
                    Err(event) => event,
                }
            }
            OverflowPolicy::Reject | OverflowPolicy::SyncFallback => event,
        };

        self.rejected.fetch_add(1, Ordering::Relaxed);
        Err(QueueFull {
            event,
            capacity: self.entries.capacity(),
            policy: self.policy,
        })
    }

    fn push_until(&self, mut event: RawEvent, deadline: Instant) -> Result<(), RawEvent> {
        let backoff = Backoff::new();
        loop {
            match self.entries.push(event) {
                Ok(()) => {
                    self.total_pushed.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(back) => event = back,
            }
            if Instant::now() >= deadline {
                return Err(event);
            }
            if backoff.is_completed() {
                thread::sleep(Duration::from_micros(200));
            } else {
                backoff.snooze();
            }
        }
    }

    /// Remove up to `max_batch` of the oldest entries, in push order
    pub fn drain(&self, max_batch: usize) -> Vec<RawEvent> {
        let mut batch = Vec::with_capacity(max_batch.min(self.entries.len()));
        while batch.len() < max_batch {
            match self.entries.pop() {
                Some(event) => batch.push(event),
                None => break,
            }
        }
        self.total_drained
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        batch
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.capacity()
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub fn stats(&self) -> QueueStats {
        let len = self.entries.len();
        let capacity = self.entries.capacity();
        QueueStats {
            len,
            capacity,
            pressure: len as f64 / capacity as f64,
            total_pushed: self.total_pushed.load(Ordering::Relaxed),
            total_drained: self.total_drained.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn event(session: &str, n: usize) -> RawEvent {
        RawEvent::new(session, "action.executed", json!({"n": n}))
    }

    #[test]
    fn test_reject_at_capacity() {
        let queue = IngestionQueue::new(4096, OverflowPolicy::Reject);

        let mut ok = 0;
        let mut full = 0;
        for i in 0..5000 {
            match queue.push(event("s", i)) {
                Ok(()) => ok += 1,
                Err(QueueFull { event, .. }) => {
                    assert_eq!(event.payload["n"], json!(i));
                    full += 1;
                }
            }
        }

        assert_eq!(ok, 4096);
        assert_eq!(full, 904);

        let stats = queue.stats();
        assert_eq!(stats.len, 4096);
        assert_eq!(stats.rejected, 904);
        assert_eq!(stats.total_pushed, 4096);
        assert!((stats.pressure - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_drain_is_fifo() {
        let queue = IngestionQueue::new(16, OverflowPolicy::Reject);
        for i in 0..10 {
            queue.push(event(if i % 2 == 0 { "a" } else { "b" }, i)).unwrap();
        }

        let first = queue.drain(4);
        let rest = queue.drain(100);
        let order: Vec<_> = first
            .iter()
            .chain(rest.iter())
            .map(|e| e.payload["n"].clone())
            .collect();

        assert_eq!(order, (0..10).map(|i| json!(i)).collect::<Vec<_>>());
        assert!(queue.is_empty());
        assert_eq!(queue.stats().total_drained, 10);
    }

    #[test]
    fn test_block_times_out() {
        let queue = IngestionQueue::new(1, OverflowPolicy::Block { timeout_ms: 20 });
        queue.push(event("s", 0)).unwrap();

        let started = Instant::now();
        let full = queue.push(event("s", 1)).unwrap_err();
        assert!(started.elapsed() >= Duration::from_millis(20));

        let err: LedgerError = full.into();
        assert_eq!(err.error_code(), "QUEUE_FULL");
        assert!(err.to_string().contains("block"));
    }

    #[test]
    fn test_block_succeeds_when_space_frees() {
        let queue = Arc::new(IngestionQueue::new(1, OverflowPolicy::Block { timeout_ms: 5000 }));
        queue.push(event("s", 0)).unwrap();

        let drainer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                queue.drain(1)
            })
        };

        queue.push(event("s", 1)).unwrap();
        assert_eq!(drainer.join().unwrap().len(), 1);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.stats().rejected, 0);
    }

    #[test]
    fn test_sync_fallback_hands_event_back() {
        let queue = IngestionQueue::new(1, OverflowPolicy::SyncFallback);
        queue.push(event("s", 0)).unwrap();

        let full = queue.push(event("s", 1)).unwrap_err();
        assert_eq!(full.policy, OverflowPolicy::SyncFallback);
        assert_eq!(full.event.payload["n"], json!(1));
        assert_eq!(queue.stats().rejected, 1);
    }
}
