//! TRACE event types
//!
//! `RawEvent` is what producers emit: complete content, no sequence number,
//! no hashes. `TraceEvent` is the committed form, produced only by sealing a
//! raw event against a chain head.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::{canonical, VERSION};
use crate::error::Result;

/// Well-known event type names
///
/// Event types are open namespaced strings; these are the ones the
/// governance runtime emits.
pub mod event_types {
    pub const SESSION_STARTED: &str = "session.started";
    pub const SESSION_ENDED: &str = "session.ended";

    pub const CARP_REQUEST_RECEIVED: &str = "carp.request.received";
    pub const CARP_RESOLUTION_COMPLETED: &str = "carp.resolution.completed";

    pub const ACTION_REQUESTED: &str = "action.requested";
    pub const ACTION_APPROVED: &str = "action.approved";
    pub const ACTION_DENIED: &str = "action.denied";
    pub const ACTION_EXECUTED: &str = "action.executed";
    pub const ACTION_FAILED: &str = "action.failed";

    pub const POLICY_EVALUATED: &str = "policy.evaluated";
    pub const POLICY_VIOLATED: &str = "policy.violated";

    pub const CONTEXT_INJECTED: &str = "context.injected";
    pub const CONTEXT_REDACTED: &str = "context.redacted";
    pub const CONTEXT_STALE: &str = "context.stale";

    pub const ERROR_OCCURRED: &str = "error.occurred";

    /// Sync overrides suitable for most deployments: session end, policy
    /// denial and anything tagged destructive.
    pub const RECOMMENDED_SYNC_EVENT_TYPES: &[&str] = &[
        SESSION_ENDED,
        POLICY_VIOLATED,
        ACTION_DENIED,
        "action.destructive.*",
    ];

    /// Namespace of an event type (`"action"` for `"action.executed"`)
    pub fn namespace(event_type: &str) -> &str {
        event_type.split('.').next().unwrap_or(event_type)
    }
}

/// Kind of actor that caused an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    Agent,
    Runtime,
    User,
    System,
}

/// Who caused an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    #[serde(rename = "type")]
    pub actor_type: ActorType,
    pub id: String,
}

impl Actor {
    pub fn new(actor_type: ActorType, id: impl Into<String>) -> Self {
        Self {
            actor_type,
            id: id.into(),
        }
    }

    pub fn agent(id: impl Into<String>) -> Self {
        Self::new(ActorType::Agent, id)
    }

    pub fn runtime(id: impl Into<String>) -> Self {
        Self::new(ActorType::Runtime, id)
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self::new(ActorType::User, id)
    }

    pub fn system(id: impl Into<String>) -> Self {
        Self::new(ActorType::System, id)
    }
}

impl Default for Actor {
    fn default() -> Self {
        Self::runtime("cra-runtime")
    }
}

/// Event severity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

/// Immutable content referenced by an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub uri: String,
    /// SHA-256 hex digest of the artifact content
    pub content_hash: String,
    pub content_type: String,
}

impl Artifact {
    /// Describe an artifact, hashing its content
    pub fn from_bytes(
        name: impl Into<String>,
        uri: impl Into<String>,
        content_type: impl Into<String>,
        content: &[u8],
    ) -> Self {
        Self {
            name: name.into(),
            uri: uri.into(),
            content_hash: hex::encode(Sha256::digest(content)),
            content_type: content_type.into(),
        }
    }

    /// Check retrieved content against the recorded hash
    pub fn matches(&self, content: &[u8]) -> bool {
        hex::encode(Sha256::digest(content)) == self.content_hash
    }
}

/// Event as emitted by a producer, before sequencing and hashing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    /// Session this event belongs to
    pub session_id: String,

    /// Trace ID grouping related events
    pub trace_id: String,

    /// Span ID for this operation
    pub span_id: String,

    /// Parent span ID for nested operations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,

    /// Unique identifier for this event
    pub event_id: String,

    /// Namespaced event type, e.g. `action.executed`
    pub event_type: String,

    pub actor: Actor,

    #[serde(default)]
    pub severity: Severity,

    /// Event-specific payload data
    pub payload: Value,

    #[serde(default)]
    pub artifacts: Vec<Artifact>,

    /// When the producer created this event
    pub timestamp: DateTime<Utc>,
}

impl RawEvent {
    /// Create a new raw event with fresh trace, span and event ids
    pub fn new(
        session_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            trace_id: Uuid::new_v4().to_string(),
            span_id: Uuid::new_v4().to_string(),
            parent_span_id: None,
            event_id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            actor: Actor::default(),
            severity: Severity::default(),
            payload,
            artifacts: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Replace the payload with a typed value
    ///
    /// Conversion is strict: content without a canonical encoding (NaN,
    /// infinities, non-string keys) is rejected instead of coerced.
    pub fn with_payload<T: Serialize + ?Sized>(mut self, payload: &T) -> Result<Self> {
        self.payload = canonical::to_value(payload)?;
        Ok(self)
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    pub fn with_span_id(mut self, span_id: impl Into<String>) -> Self {
        self.span_id = span_id.into();
        self
    }

    pub fn with_parent_span(mut self, parent_span_id: impl Into<String>) -> Self {
        self.parent_span_id = Some(parent_span_id.into());
        self
    }

    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = event_id.into();
        self
    }

    pub fn with_actor(mut self, actor: Actor) -> Self {
        self.actor = actor;
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifacts.push(artifact);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Check that the whole event is canonically encodable
    pub fn validate(&self) -> Result<()> {
        canonical::validate(self)
    }
}

/// A committed TRACE event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    /// TRACE protocol version (always "1.0")
    pub trace_version: String,

    pub session_id: String,
    pub trace_id: String,
    pub span_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,

    pub event_id: String,
    pub event_type: String,
    pub actor: Actor,
    pub severity: Severity,
    pub payload: Value,

    #[serde(default)]
    pub artifacts: Vec<Artifact>,

    /// Producer timestamp
    pub timestamp: DateTime<Utc>,

    /// Position in the session chain, starting at 0
    pub sequence_number: u64,

    /// Hash of the preceding event, or the session genesis hash
    pub previous_event_hash: String,

    /// SHA-256 over the canonical content and `previous_event_hash`
    pub event_hash: String,

    /// When the event was sealed into the chain
    pub persisted_at: DateTime<Utc>,
}

/// Hashed content of an event: every committed field except the two hashes
#[derive(Debug, Serialize)]
pub struct EventContent<'a> {
    trace_version: &'a str,
    session_id: &'a str,
    trace_id: &'a str,
    span_id: &'a str,
    parent_span_id: Option<&'a str>,
    event_id: &'a str,
    event_type: &'a str,
    actor: &'a Actor,
    severity: Severity,
    payload: &'a Value,
    artifacts: &'a [Artifact],
    timestamp: &'a DateTime<Utc>,
    sequence_number: u64,
    persisted_at: &'a DateTime<Utc>,
}

impl<'a> EventContent<'a> {
    fn sealing(raw: &'a RawEvent, sequence_number: u64, persisted_at: &'a DateTime<Utc>) -> Self {
        Self {
            trace_version: VERSION,
            session_id: &raw.session_id,
            trace_id: &raw.trace_id,
            span_id: &raw.span_id,
            parent_span_id: raw.parent_span_id.as_deref(),
            event_id: &raw.event_id,
            event_type: &raw.event_type,
            actor: &raw.actor,
            severity: raw.severity,
            payload: &raw.payload,
            artifacts: &raw.artifacts,
            timestamp: &raw.timestamp,
            sequence_number,
            persisted_at,
        }
    }

    /// Canonical bytes of this content
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        canonical::to_vec(self)
    }
}

/// Compute an event hash
///
/// `sha256(canonical(content) || previous_hash)`, lowercase hex.
pub fn compute_event_hash(content: &EventContent<'_>, previous_hash: &str) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(content.canonical_bytes()?);
    hasher.update(previous_hash.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

impl TraceEvent {
    /// Seal a raw event at a chain position
    pub(crate) fn seal(
        raw: RawEvent,
        sequence_number: u64,
        previous_event_hash: String,
        persisted_at: DateTime<Utc>,
    ) -> Result<Self> {
        let event_hash = compute_event_hash(
            &EventContent::sealing(&raw, sequence_number, &persisted_at),
            &previous_event_hash,
        )?;

        Ok(Self {
            trace_version: VERSION.to_string(),
            session_id: raw.session_id,
            trace_id: raw.trace_id,
            span_id: raw.span_id,
            parent_span_id: raw.parent_span_id,
            event_id: raw.event_id,
            event_type: raw.event_type,
            actor: raw.actor,
            severity: raw.severity,
            payload: raw.payload,
            artifacts: raw.artifacts,
            timestamp: raw.timestamp,
            sequence_number,
            previous_event_hash,
            event_hash,
            persisted_at,
        })
    }

    /// Borrowed view of the hashed content
    pub fn content(&self) -> EventContent<'_> {
        EventContent {
            trace_version: &self.trace_version,
            session_id: &self.session_id,
            trace_id: &self.trace_id,
            span_id: &self.span_id,
            parent_span_id: self.parent_span_id.as_deref(),
            event_id: &self.event_id,
            event_type: &self.event_type,
            actor: &self.actor,
            severity: self.severity,
            payload: &self.payload,
            artifacts: &self.artifacts,
            timestamp: &self.timestamp,
            sequence_number: self.sequence_number,
            persisted_at: &self.persisted_at,
        }
    }

    /// Recompute this event's hash from its content and recorded previous hash
    pub fn compute_hash(&self) -> Result<String> {
        compute_event_hash(&self.content(), &self.previous_event_hash)
    }

    /// Check the recorded hash. Unencodable content never verifies.
    pub fn verify_hash(&self) -> bool {
        matches!(self.compute_hash(), Ok(hash) if hash == self.event_hash)
    }

    /// Strip chain metadata, yielding the event as it was emitted
    pub fn to_raw(&self) -> RawEvent {
        RawEvent {
            session_id: self.session_id.clone(),
            trace_id: self.trace_id.clone(),
            span_id: self.span_id.clone(),
            parent_span_id: self.parent_span_id.clone(),
            event_id: self.event_id.clone(),
            event_type: self.event_type.clone(),
            actor: self.actor.clone(),
            severity: self.severity,
            payload: self.payload.clone(),
            artifacts: self.artifacts.clone(),
            timestamp: self.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sealed(payload: Value) -> TraceEvent {
        let raw = RawEvent::new("session-1", event_types::ACTION_EXECUTED, payload)
            .with_trace_id("trace-1")
            .with_span_id("span-1")
            .with_event_id("event-1")
            .with_timestamp(DateTime::from_timestamp(1_700_000_000, 0).unwrap());
        let at = DateTime::from_timestamp(1_700_000_001, 0).unwrap();
        TraceEvent::seal(raw, 0, "00".repeat(32), at).unwrap()
    }

    #[test]
    fn test_seal_and_verify() {
        let event = sealed(json!({"action_id": "ticket.create"}));

        assert_eq!(event.trace_version, "1.0");
        assert_eq!(event.event_hash.len(), 64);
        assert!(event.event_hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert!(event.verify_hash());
    }

    #[test]
    fn test_hash_ignores_payload_key_order() {
        let a: Value =
            serde_json::from_str(r#"{"b": [1, 2], "a": {"y": true, "x": null}}"#).unwrap();
        let b: Value =
            serde_json::from_str(r#"{"a": {"x": null, "y": true}, "b": [1, 2]}"#).unwrap();

        assert_eq!(sealed(a).event_hash, sealed(b).event_hash);
    }

    #[test]
    fn test_hash_changes_with_content_and_previous_hash() {
        let base = sealed(json!({"n": 1}));
        let other = sealed(json!({"n": 2}));
        assert_ne!(base.event_hash, other.event_hash);

        let relinked = compute_event_hash(&base.content(), &"11".repeat(32)).unwrap();
        assert_ne!(base.event_hash, relinked);
    }

    #[test]
    fn test_tampered_event_fails_verification() {
        let mut event = sealed(json!({"amount": 10}));
        event.payload = json!({"amount": 1000});
        assert!(!event.verify_hash());

        let mut event = sealed(json!({"amount": 10}));
        event.severity = Severity::Critical;
        assert!(!event.verify_hash());
    }

    #[test]
    fn test_hash_survives_json_round_trip() {
        let event = sealed(json!({"ratio": 0.1, "count": 3, "name": "é"}));
        let json = serde_json::to_string(&event).unwrap();
        let parsed: TraceEvent = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed, event);
        assert!(parsed.verify_hash());
    }

    #[test]
    fn test_with_payload_rejects_non_finite() {
        #[derive(Serialize)]
        struct Metrics {
            latency_ms: f64,
        }

        let ok = RawEvent::new("s", "metrics.sampled", Value::Null)
            .with_payload(&Metrics { latency_ms: 12.5 })
            .unwrap();
        assert_eq!(ok.payload, json!({"latency_ms": 12.5}));

        let err = RawEvent::new("s", "metrics.sampled", Value::Null)
            .with_payload(&Metrics { latency_ms: f64::NAN })
            .unwrap_err();
        assert_eq!(err.error_code(), "SERIALIZATION_ERROR");
    }

    #[test]
    fn test_artifact_hash() {
        let artifact =
            Artifact::from_bytes("report", "file:///tmp/report.txt", "text/plain", b"hello");
        assert_eq!(
            artifact.content_hash,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert!(artifact.matches(b"hello"));
        assert!(!artifact.matches(b"hello!"));
    }

    #[test]
    fn test_actor_serialization() {
        let actor = Actor::agent("agent-7");
        assert_eq!(
            serde_json::to_value(&actor).unwrap(),
            json!({"type": "agent", "id": "agent-7"})
        );
    }

    #[test]
    fn test_to_raw_preserves_content() {
        let event = sealed(json!({"k": "v"}));
        let raw = event.to_raw();
        assert_eq!(raw.event_id, "event-1");
        assert_eq!(raw.payload, json!({"k": "v"}));
        assert_eq!(event_types::namespace(&raw.event_type), "action");
    }
}
