//! Configuration for the ledger
//!
//! `mode`, `overflow_policy` and `sync_event_types` have no defaults: the
//! consistency trade-off is a deployment decision and has to be stated.
//!
//! ```toml
//! mode = "deferred"
//! sync_event_types = ["session.ended", "policy.violated", "action.destructive.*"]
//! overflow_policy = { policy = "block", timeout_ms = 250 }
//!
//! [session_modes]
//! "audit-critical" = "immediate"
//!
//! [queue]
//! max_size = 4096
//!
//! [processor]
//! batch_size = 100
//! flush_interval_ms = 5000
//!
//! [[retention]]
//! event_type_prefix = "context"
//! retain_seconds = 86400
//! ```

use std::collections::{HashMap, HashSet};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, Result};
use crate::trace::{ProcessorConfig, TraceEvent};

/// When events are hashed and persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceMode {
    /// Hash and persist inline; `emit` returns the committed event
    Immediate,
    /// Queue for the background processor; `emit` returns at once
    Deferred,
}

/// What `emit` does when the ingestion queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Fail immediately with `QueueFull`
    Reject,
    /// Wait for space up to `timeout_ms`, then fail with `QueueFull`
    Block { timeout_ms: u64 },
    /// Commit the event inline instead of queueing it
    SyncFallback,
}

impl OverflowPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            OverflowPolicy::Reject => "reject",
            OverflowPolicy::Block { .. } => "block",
            OverflowPolicy::SyncFallback => "sync_fallback",
        }
    }
}

/// Ingestion queue configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Fixed queue capacity
    #[serde(default = "default_max_size")]
    pub max_size: usize,
}

fn default_max_size() -> usize {
    4096
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
        }
    }
}

/// Retention window for one event-type prefix
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionRule {
    pub event_type_prefix: String,
    pub retain_seconds: u64,
}

/// Main ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Global mode
    pub mode: TraceMode,

    /// Per-session overrides of `mode`
    #[serde(default)]
    pub session_modes: HashMap<String, TraceMode>,

    pub overflow_policy: OverflowPolicy,

    /// Event types (exact or glob) committed inline regardless of mode
    pub sync_event_types: Vec<String>,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub processor: ProcessorConfig,

    /// How long an inline commit waits for the session's queued entries
    #[serde(default = "default_sync_wait_timeout_ms")]
    pub sync_wait_timeout_ms: u64,

    #[serde(default)]
    pub retention: Vec<RetentionRule>,
}

fn default_sync_wait_timeout_ms() -> u64 {
    5000
}

impl LedgerConfig {
    pub fn new<I, S>(mode: TraceMode, overflow_policy: OverflowPolicy, sync_event_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            mode,
            session_modes: HashMap::new(),
            overflow_policy,
            sync_event_types: sync_event_types.into_iter().map(Into::into).collect(),
            queue: QueueConfig::default(),
            processor: ProcessorConfig::default(),
            sync_wait_timeout_ms: default_sync_wait_timeout_ms(),
            retention: Vec::new(),
        }
    }

    pub fn with_session_mode(mut self, session_id: impl Into<String>, mode: TraceMode) -> Self {
        self.session_modes.insert(session_id.into(), mode);
        self
    }

    pub fn with_queue_size(mut self, max_size: usize) -> Self {
        self.queue.max_size = max_size;
        self
    }

    pub fn with_processor(mut self, processor: ProcessorConfig) -> Self {
        self.processor = processor;
        self
    }

    pub fn with_sync_wait_timeout(mut self, ms: u64) -> Self {
        self.sync_wait_timeout_ms = ms;
        self
    }

    pub fn with_retention(
        mut self,
        event_type_prefix: impl Into<String>,
        retain_seconds: u64,
    ) -> Self {
        self.retention.push(RetentionRule {
            event_type_prefix: event_type_prefix.into(),
            retain_seconds,
        });
        self
    }

    /// Effective mode for a session
    pub fn mode_for(&self, session_id: &str) -> TraceMode {
        self.session_modes.get(session_id).copied().unwrap_or(self.mode)
    }

    pub fn from_json_str(input: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(input).map_err(|e| LedgerError::InvalidConfig {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input).map_err(|e| LedgerError::InvalidConfig {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.toml` or `.json` file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| LedgerError::IoError {
            message: format!("Failed to read {}: {}", path.display(), e),
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&content),
            Some("json") => Self::from_json_str(&content),
            other => Err(LedgerError::InvalidConfig {
                reason: format!("unsupported config extension {:?}", other),
            }),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| {
            Err(LedgerError::InvalidConfig {
                reason: reason.to_string(),
            })
        };

        if self.queue.max_size == 0 {
            return invalid("queue.max_size must be greater than 0");
        }
        if self.processor.batch_size == 0 {
            return invalid("processor.batch_size must be greater than 0");
        }
        if self.processor.poll_interval_ms == 0 {
            return invalid("processor.poll_interval_ms must be greater than 0");
        }
        if self.processor.retry_backoff_ms > self.processor.max_retry_backoff_ms {
            return invalid("processor.retry_backoff_ms exceeds max_retry_backoff_ms");
        }
        if self.retention.iter().any(|r| r.event_type_prefix.is_empty()) {
            return invalid("retention.event_type_prefix must not be empty");
        }
        SyncOverrides::new(&self.sync_event_types)?;
        Ok(())
    }
}

/// Compiled sync override list
#[derive(Debug, Clone, Default)]
pub struct SyncOverrides {
    exact: HashSet<String>,
    patterns: Vec<glob::Pattern>,
}

impl SyncOverrides {
    pub fn new<S: AsRef<str>>(entries: &[S]) -> Result<Self> {
        let mut overrides = Self::default();
        for entry in entries {
            let entry = entry.as_ref();
            if entry.contains(['*', '?', '[']) {
                let pattern = glob::Pattern::new(entry).map_err(|e| LedgerError::InvalidConfig {
                    reason: format!("sync_event_types pattern '{}': {}", entry, e),
                })?;
                overrides.patterns.push(pattern);
            } else {
                overrides.exact.insert(entry.to_string());
            }
        }
        Ok(overrides)
    }

    pub fn matches(&self, event_type: &str) -> bool {
        self.exact.contains(event_type) || self.patterns.iter().any(|p| p.matches(event_type))
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.patterns.is_empty()
    }
}

/// Retention eligibility by event-type prefix
///
/// Only computes eligibility. Deleting is the storage operator's job, and
/// only a contiguous prefix of a chain can be removed without breaking
/// range verification (see [`RetentionPolicy::deletable_prefix`]).
#[derive(Debug, Clone, Default)]
pub struct RetentionPolicy {
    rules: Vec<RetentionRule>,
}

impl RetentionPolicy {
    pub fn new(rules: Vec<RetentionRule>) -> Self {
        Self { rules }
    }

    /// Retention window of the longest matching prefix; `None` keeps forever
    pub fn retention_for(&self, event_type: &str) -> Option<u64> {
        self.rules
            .iter()
            .filter(|r| prefix_matches(&r.event_type_prefix, event_type))
            .max_by_key(|r| r.event_type_prefix.len())
            .map(|r| r.retain_seconds)
    }

    pub fn is_expired(&self, event: &TraceEvent, now: DateTime<Utc>) -> bool {
        match self.retention_for(&event.event_type) {
            Some(seconds) => {
                let retain = i64::try_from(seconds).unwrap_or(i64::MAX);
                (now - event.persisted_at).num_seconds() >= retain
            }
            None => false,
        }
    }

    /// Sequence numbers whose retention window has passed
    pub fn expired_sequences(&self, events: &[TraceEvent], now: DateTime<Utc>) -> Vec<u64> {
        events
            .iter()
            .filter(|e| self.is_expired(e, now))
            .map(|e| e.sequence_number)
            .collect()
    }

    /// Last sequence of the leading run of expired events
    pub fn deletable_prefix(&self, events: &[TraceEvent], now: DateTime<Utc>) -> Option<u64> {
        events
            .iter()
            .take_while(|e| self.is_expired(e, now))
            .last()
            .map(|e| e.sequence_number)
    }
}

/// `action` covers `action` and `action.*`, not `actions.x`
fn prefix_matches(prefix: &str, event_type: &str) -> bool {
    match event_type.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || prefix.ends_with('.') || rest.starts_with('.'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::RawEvent;
    use serde_json::json;

    #[test]
    fn test_parse_json_config() {
        let config = LedgerConfig::from_json_str(
            r#"{
                "mode": "deferred",
                "overflow_policy": {"policy": "reject"},
                "sync_event_types": ["session.ended", "action.destructive.*"],
                "session_modes": {"sess-critical": "immediate"},
                "queue": {"max_size": 128}
            }"#,
        )
        .unwrap();

        assert_eq!(config.mode, TraceMode::Deferred);
        assert_eq!(config.overflow_policy, OverflowPolicy::Reject);
        assert_eq!(config.queue.max_size, 128);
        assert_eq!(config.mode_for("sess-critical"), TraceMode::Immediate);
        assert_eq!(config.mode_for("other"), TraceMode::Deferred);
        assert_eq!(config.processor.batch_size, 100);
        assert_eq!(config.sync_wait_timeout_ms, 5000);
    }

    #[test]
    fn test_parse_toml_config() {
        let config = LedgerConfig::from_toml_str(
            r#"
            mode = "immediate"
            sync_event_types = []
            overflow_policy = { policy = "block", timeout_ms = 250 }

            [processor]
            batch_size = 10
            flush_interval_ms = 1000

            [[retention]]
            event_type_prefix = "context"
            retain_seconds = 60
            "#,
        )
        .unwrap();

        assert_eq!(config.overflow_policy, OverflowPolicy::Block { timeout_ms: 250 });
        assert_eq!(config.processor.batch_size, 10);
        assert_eq!(config.processor.flush_interval_ms, 1000);
        assert_eq!(config.processor.max_write_retries, 5);
        assert_eq!(config.queue.max_size, 4096);
        assert_eq!(config.retention.len(), 1);
    }

    #[test]
    fn test_required_fields_have_no_default() {
        let missing_policy = r#"{"mode": "deferred", "sync_event_types": []}"#;
        let err = LedgerConfig::from_json_str(missing_policy).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_CONFIG");

        let missing_sync = r#"{"mode": "deferred", "overflow_policy": {"policy": "reject"}}"#;
        assert!(LedgerConfig::from_json_str(missing_sync).is_err());

        let missing_mode = r#"{"overflow_policy": {"policy": "reject"}, "sync_event_types": []}"#;
        assert!(LedgerConfig::from_json_str(missing_mode).is_err());
    }

    #[test]
    fn test_validation() {
        let config = LedgerConfig::new(TraceMode::Deferred, OverflowPolicy::Reject, ["a"])
            .with_queue_size(0);
        assert!(config.validate().is_err());

        let config =
            LedgerConfig::new(TraceMode::Deferred, OverflowPolicy::Reject, ["action.[bad"]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sync_overrides() {
        let overrides = SyncOverrides::new(&["session.ended", "action.destructive.*"]).unwrap();

        assert!(overrides.matches("session.ended"));
        assert!(overrides.matches("action.destructive.delete"));
        assert!(!overrides.matches("action.executed"));
        assert!(!overrides.matches("session.started"));
        assert!(SyncOverrides::new::<&str>(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_retention_longest_prefix() {
        let policy = RetentionPolicy::new(vec![
            RetentionRule {
                event_type_prefix: "action".to_string(),
                retain_seconds: 3600,
            },
            RetentionRule {
                event_type_prefix: "action.executed".to_string(),
                retain_seconds: 60,
            },
        ]);

        assert_eq!(policy.retention_for("action.executed"), Some(60));
        assert_eq!(policy.retention_for("action.denied"), Some(3600));
        assert_eq!(policy.retention_for("actions.other"), None);
        assert_eq!(policy.retention_for("session.ended"), None);
    }

    #[test]
    fn test_retention_eligibility() {
        let policy = RetentionPolicy::new(vec![RetentionRule {
            event_type_prefix: "context".to_string(),
            retain_seconds: 10,
        }]);

        let storage = std::sync::Arc::new(crate::storage::InMemoryStorage::new());
        let builder = crate::trace::ChainBuilder::new(storage);
        let types = ["context.injected", "context.stale", "session.ended", "context.injected"];
        let events: Vec<_> = types
            .iter()
            .map(|t| builder.append(RawEvent::new("s", *t, json!({}))).unwrap())
            .collect();

        let now = events[0].persisted_at;
        assert!(policy.expired_sequences(&events, now).is_empty());

        let later = now + chrono::Duration::seconds(11);
        assert_eq!(policy.expired_sequences(&events, later), vec![0, 1, 3]);
        assert_eq!(policy.deletable_prefix(&events, later), Some(1));
    }
}
