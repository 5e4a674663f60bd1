//! TRACE Replay Engine
//!
//! Compares recorded events against a golden manifest, and two recorded
//! traces against each other.
//!
//! A manifest lists the events a scenario is expected to produce. Each
//! expected event names an `event_type` plus any number of field
//! predicates keyed by dotted path into the committed event:
//!
//! ```json
//! {
//!   "manifest_version": "1.0",
//!   "name": "refund-flow",
//!   "description": "agent issues a refund after policy check",
//!   "input": {"goal": "refund order 42"},
//!   "expected_events": [
//!     {"event_type": "session.started", "actor.type": "agent"},
//!     {"event_type": "policy.evaluated", "payload": {"result": "allow"}},
//!     {"event_type": "action.executed", "payload.ticket_id": {"$regex": "^T-\\d+$"}},
//!     {"event_type": "context.injected", "optional": true}
//!   ],
//!   "nondeterminism": [
//!     {"field": "*.span_id", "rule": "normalize"},
//!     {"field": "payload.elapsed_ms", "rule": "ignore"}
//!   ]
//! }
//! ```
//!
//! Object literals match as subsets, keyed by exact child key.
//! `{"$exists": bool}`, `{"$regex": "..."}` and `{"$eq": value}` (exact
//! equality, for values that would otherwise read as operators) are the
//! only operators. Rule paths are glob
//! patterns over dotted paths; a leading `*.` also matches a top-level
//! field. Replay never mutates its inputs.

use std::fs;
use std::path::Path;

use glob::Pattern;
use jsonschema::JSONSchema;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

use super::event::TraceEvent;
use super::verify::find_divergence;
use crate::error::{LedgerError, Result};

/// Supported manifest format version
pub const MANIFEST_VERSION: &str = "1.0";

const MANIFEST_SCHEMA: &str = r#"{
  "$schema": "http://json-schema.org/draft-07/schema#",
  "type": "object",
  "required": ["manifest_version", "name", "expected_events"],
  "properties": {
    "manifest_version": {"type": "string"},
    "name": {"type": "string", "minLength": 1},
    "description": {"type": "string"},
    "input": true,
    "expected_events": {
      "type": "array",
      "items": {
        "type": "object",
        "required": ["event_type"],
        "properties": {
          "event_type": {"type": "string", "minLength": 1},
          "optional": {"type": "boolean"}
        }
      }
    },
    "nondeterminism": {
      "type": "array",
      "items": {
        "type": "object",
        "required": ["field", "rule"],
        "properties": {
          "field": {"type": "string", "minLength": 1},
          "rule": {"enum": ["ignore", "normalize"]}
        },
        "additionalProperties": false
      }
    },
    "correlation_key": {"type": "string", "minLength": 1}
  }
}"#;

/// Recorded baseline of the events a scenario should produce
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoldenManifest {
    pub manifest_version: String,
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Scenario input fixture; opaque to the engine
    #[serde(default)]
    pub input: Value,

    pub expected_events: Vec<ExpectedEvent>,

    #[serde(default)]
    pub nondeterminism: Vec<NondeterminismRule>,

    /// Field path pairing expected with actual events instead of position
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_key: Option<String>,
}

impl GoldenManifest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            manifest_version: MANIFEST_VERSION.to_string(),
            name: name.into(),
            description: String::new(),
            input: Value::Null,
            expected_events: Vec::new(),
            nondeterminism: Vec::new(),
            correlation_key: None,
        }
    }

    /// Parse and schema-check a manifest document
    pub fn from_json_str(input: &str) -> Result<Self> {
        let document: Value = serde_json::from_str(input).map_err(|e| LedgerError::InvalidManifest {
            reason: format!("not valid JSON: {}", e),
        })?;
        Self::from_value(document)
    }

    pub fn from_value(document: Value) -> Result<Self> {
        validate_schema(&document)?;

        let manifest: GoldenManifest =
            serde_json::from_value(document).map_err(|e| LedgerError::InvalidManifest {
                reason: e.to_string(),
            })?;

        if manifest.manifest_version != MANIFEST_VERSION {
            return Err(LedgerError::InvalidManifest {
                reason: format!(
                    "unsupported manifest_version {} (expected {})",
                    manifest.manifest_version, MANIFEST_VERSION
                ),
            });
        }
        Ok(manifest)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&content)
    }

    /// Derive a manifest from a recorded session
    ///
    /// Each event contributes its type, actor, severity, payload and
    /// artifacts. Identifiers and timestamps are left out; add
    /// nondeterminism rules for payload fields that vary between runs.
    pub fn from_events(name: impl Into<String>, events: &[TraceEvent]) -> Result<Self> {
        let mut manifest = Self::new(name);
        if let Some(first) = events.first() {
            manifest.description = format!("derived from session {}", first.session_id);
        }

        for event in events {
            let mut fields = Map::new();
            fields.insert("actor".to_string(), serde_json::to_value(&event.actor)?);
            fields.insert("severity".to_string(), serde_json::to_value(&event.severity)?);
            fields.insert("payload".to_string(), self_predicate(&event.payload));
            if !event.artifacts.is_empty() {
                fields.insert("artifacts".to_string(), serde_json::to_value(&event.artifacts)?);
            }
            manifest.expected_events.push(ExpectedEvent {
                event_type: event.event_type.clone(),
                optional: false,
                fields,
            });
        }
        Ok(manifest)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_event(mut self, event: ExpectedEvent) -> Self {
        self.expected_events.push(event);
        self
    }

    pub fn with_rule(mut self, field: impl Into<String>, rule: RuleKind) -> Self {
        self.nondeterminism.push(NondeterminismRule {
            field: field.into(),
            rule,
        });
        self
    }

    pub fn with_correlation_key(mut self, key: impl Into<String>) -> Self {
        self.correlation_key = Some(key.into());
        self
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

fn validate_schema(document: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(MANIFEST_SCHEMA)?;
    let compiled = JSONSchema::compile(&schema).map_err(|e| LedgerError::InternalError {
        reason: format!("manifest schema does not compile: {}", e),
    })?;

    if let Err(errors) = compiled.validate(document) {
        let reasons: Vec<String> = errors
            .map(|e| format!("{}: {}", e.instance_path, e))
            .collect();
        return Err(LedgerError::InvalidManifest {
            reason: reasons.join("; "),
        });
    }
    Ok(())
}

/// One expected event with its field predicates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpectedEvent {
    pub event_type: String,

    /// May be absent from the actual trace
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub optional: bool,

    /// Predicates keyed by dotted path (`payload.ticket_id`)
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl ExpectedEvent {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            optional: false,
            fields: Map::new(),
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn with_field(mut self, path: impl Into<String>, predicate: Value) -> Self {
        self.fields.insert(path.into(), predicate);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NondeterminismRule {
    /// Dotted path or glob over dotted paths
    pub field: String,
    pub rule: RuleKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    /// Drop the field and its descendants from comparison
    Ignore,
    /// Replace identifiers and numbers with placeholders before comparing
    Normalize,
}

/// Outcome for one expected or actual event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Passed,
    Failed,
    /// Expected, required, and absent
    Missing,
    /// Present but not expected
    Unexpected,
    /// Optional and absent
    Skipped,
}

impl EventStatus {
    pub fn is_failure(&self) -> bool {
        matches!(self, EventStatus::Failed | EventStatus::Missing | EventStatus::Unexpected)
    }
}

/// A single field that did not match
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDiff {
    pub path: String,
    pub expected: Value,
    /// `None` when the field is absent
    pub actual: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventComparison {
    /// Index into `expected_events`
    pub expected_index: Option<usize>,
    /// Index into the actual events
    pub actual_index: Option<usize>,
    pub event_type: String,
    pub actual_sequence: Option<u64>,
    pub status: EventStatus,
    pub diffs: Vec<FieldDiff>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplaySummary {
    pub expected_events: usize,
    pub actual_events: usize,
    pub passed: usize,
    pub failed: usize,
    pub missing: usize,
    pub unexpected: usize,
    pub skipped: usize,
}

impl ReplaySummary {
    pub fn failures(&self) -> usize {
        self.failed + self.missing + self.unexpected
    }
}

/// Result of replaying a trace against a manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffResult {
    pub passed: bool,
    pub manifest: String,
    pub events: Vec<EventComparison>,
    pub summary: ReplaySummary,
}

impl DiffResult {
    pub fn failures(&self) -> impl Iterator<Item = &EventComparison> {
        self.events.iter().filter(|e| e.status.is_failure())
    }

    /// Turn a failed replay into `ManifestMismatch`
    pub fn into_result(self) -> Result<Self> {
        if self.passed {
            Ok(self)
        } else {
            Err(LedgerError::ManifestMismatch {
                manifest: self.manifest,
                failures: self.summary.failures(),
            })
        }
    }
}

/// Compiled field predicate
#[derive(Debug)]
enum Matcher {
    Literal(Value),
    Exists(bool),
    Regex(Regex),
    /// Subset match over the listed keys
    Object(Vec<(String, Matcher)>),
}

impl Matcher {
    fn compile(path: &str, value: &Value) -> Result<Self> {
        let object = match value {
            Value::Object(object) => object,
            other => return Ok(Matcher::Literal(other.clone())),
        };

        if let Some(operator) = object.keys().find(|k| k.starts_with('$')) {
            if object.len() != 1 {
                return Err(invalid(path, "an operator must be the only key of its object"));
            }
            return match (operator.as_str(), &object[operator]) {
                ("$exists", Value::Bool(b)) => Ok(Matcher::Exists(*b)),
                ("$exists", _) => Err(invalid(path, "$exists takes a boolean")),
                ("$regex", Value::String(pattern)) => Regex::new(pattern)
                    .map(Matcher::Regex)
                    .map_err(|e| invalid(path, &format!("bad $regex: {}", e))),
                ("$regex", _) => Err(invalid(path, "$regex takes a string")),
                ("$eq", literal) => Ok(Matcher::Literal(literal.clone())),
                (other, _) => Err(invalid(path, &format!("unknown operator {}", other))),
            };
        }

        object
            .iter()
            .map(|(key, child)| Ok((key.clone(), Matcher::compile(&join(path, key), child)?)))
            .collect::<Result<Vec<_>>>()
            .map(Matcher::Object)
    }

    fn to_value(&self) -> Value {
        match self {
            Matcher::Literal(v) if has_operator_key(v) => json!({ "$eq": v }),
            Matcher::Literal(v) => v.clone(),
            Matcher::Exists(b) => json!({ "$exists": b }),
            Matcher::Regex(r) => json!({ "$regex": r.as_str() }),
            Matcher::Object(children) => Value::Object(
                children
                    .iter()
                    .map(|(k, m)| (k.clone(), m.to_value()))
                    .collect(),
            ),
        }
    }
}

fn has_operator_key(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|map| map.keys().any(|k| k.starts_with('$')))
}

/// A predicate matching `value` itself: objects with `$` keys become `$eq`
fn self_predicate(value: &Value) -> Value {
    match value {
        Value::Object(_) if has_operator_key(value) => json!({ "$eq": value }),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), self_predicate(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn invalid(path: &str, reason: &str) -> LedgerError {
    LedgerError::InvalidManifest {
        reason: format!("predicate at {}: {}", path, reason),
    }
}

#[derive(Debug)]
struct Expectation {
    event_type: String,
    optional: bool,
    matchers: Vec<(String, Matcher)>,
}

impl Expectation {
    /// Literal the expectation declares at `key`, for correlation
    fn literal_at(&self, key: &str) -> Option<&Value> {
        fn find<'m>(matchers: &'m [(String, Matcher)], key: &str) -> Option<&'m Value> {
            matchers.iter().find_map(|(path, matcher)| match matcher {
                Matcher::Literal(v) if path == key => Some(v),
                Matcher::Object(children) => key
                    .strip_prefix(path.as_str())
                    .and_then(|rest| rest.strip_prefix('.'))
                    .and_then(|rest| find(children, rest)),
                _ => None,
            })
        }
        find(&self.matchers, key)
    }
}

#[derive(Debug)]
struct PathRule {
    pattern: Pattern,
    /// `*.x` also matches top-level `x`
    top_level: Option<Pattern>,
}

impl PathRule {
    fn compile(field: &str) -> Result<Self> {
        let compile = |p: &str| {
            Pattern::new(p).map_err(|e| LedgerError::InvalidManifest {
                reason: format!("bad rule path {}: {}", field, e),
            })
        };
        Ok(Self {
            pattern: compile(field)?,
            top_level: field.strip_prefix("*.").map(|p| compile(p)).transpose()?,
        })
    }

    fn matches(&self, path: &str) -> bool {
        self.pattern.matches(path) || self.top_level.as_ref().is_some_and(|p| p.matches(path))
    }
}

/// `a.b.c` yields `a`, `a.b`, `a.b.c`
fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    path.match_indices('.')
        .map(move |(i, _)| &path[..i])
        .chain(std::iter::once(path))
}

fn join(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", parent, key)
    }
}

fn lookup<'v>(document: &'v Value, path: &str) -> Option<&'v Value> {
    path.split('.').try_fold(document, |value, segment| match value {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

struct Normalizer {
    timestamp: Regex,
    uuid: Regex,
    digest: Regex,
    token: Regex,
}

impl Normalizer {
    fn new() -> Result<Self> {
        let compile = |p: &str| {
            Regex::new(p).map_err(|e| LedgerError::InternalError {
                reason: format!("normalizer pattern: {}", e),
            })
        };
        Ok(Self {
            timestamp: compile(
                r"\d{4}-\d{2}-\d{2}[Tt ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:[Zz]|[+-]\d{2}:\d{2})",
            )?,
            uuid: compile(
                r"\b[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}\b",
            )?,
            digest: compile(r"\b[0-9a-fA-F]{32,}\b")?,
            token: compile(r"^\S+$")?,
        })
    }

    fn normalize(&self, value: &Value) -> Value {
        match value {
            Value::Number(_) => Value::String("<number>".to_string()),
            Value::String(original) => {
                let s = self.timestamp.replace_all(original, "<timestamp>");
                let s = self.uuid.replace_all(&s, "<uuid>");
                let s = self.digest.replace_all(&s, "<hash>");
                // Any other single-token string is an identifier of some other form
                if s == original.as_str() && self.token.is_match(original) {
                    return Value::String("<id>".to_string());
                }
                Value::String(s.into_owned())
            }
            Value::Array(items) => Value::Array(items.iter().map(|v| self.normalize(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.normalize(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

/// Manifest compiled for repeated replays
pub struct ReplayEngine {
    manifest: String,
    expected: Vec<Expectation>,
    ignore: Vec<PathRule>,
    normalize: Vec<PathRule>,
    correlation_key: Option<String>,
    normalizer: Normalizer,
}

impl std::fmt::Debug for ReplayEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayEngine")
            .field("manifest", &self.manifest)
            .field("expected", &self.expected.len())
            .field("correlation_key", &self.correlation_key)
            .finish()
    }
}

impl ReplayEngine {
    /// Compile predicates and rules; malformed ones fail with `InvalidManifest`
    pub fn new(manifest: &GoldenManifest) -> Result<Self> {
        let expected = manifest
            .expected_events
            .iter()
            .map(|event| {
                let matchers = event
                    .fields
                    .iter()
                    .map(|(path, value)| Ok((path.clone(), Matcher::compile(path, value)?)))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Expectation {
                    event_type: event.event_type.clone(),
                    optional: event.optional,
                    matchers,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut ignore = Vec::new();
        let mut normalize = Vec::new();
        for rule in &manifest.nondeterminism {
            let compiled = PathRule::compile(&rule.field)?;
            match rule.rule {
                RuleKind::Ignore => ignore.push(compiled),
                RuleKind::Normalize => normalize.push(compiled),
            }
        }

        Ok(Self {
            manifest: manifest.name.clone(),
            expected,
            ignore,
            normalize,
            correlation_key: manifest.correlation_key.clone(),
            normalizer: Normalizer::new()?,
        })
    }

    /// Compare `actual` against the manifest
    pub fn replay(&self, actual: &[TraceEvent]) -> DiffResult {
        // TraceEvent has string keys and a JSON payload, so this cannot fail
        let documents: Vec<Value> = actual
            .iter()
            .map(|e| serde_json::to_value(e).unwrap_or(Value::Null))
            .collect();

        let pairs = match &self.correlation_key {
            Some(key) => self.align_by_key(&documents, key),
            None => self.align_by_position(&documents),
        };

        let mut summary = ReplaySummary {
            expected_events: self.expected.len(),
            actual_events: actual.len(),
            ..ReplaySummary::default()
        };

        let events: Vec<EventComparison> = pairs
            .into_iter()
            .map(|(expected_index, actual_index)| {
                let comparison = self.compare(expected_index, actual_index, &documents, actual);
                match comparison.status {
                    EventStatus::Passed => summary.passed += 1,
                    EventStatus::Failed => summary.failed += 1,
                    EventStatus::Missing => summary.missing += 1,
                    EventStatus::Unexpected => summary.unexpected += 1,
                    EventStatus::Skipped => summary.skipped += 1,
                }
                comparison
            })
            .collect();

        let passed = summary.failures() == 0;
        debug!(
            manifest = %self.manifest,
            passed,
            failures = summary.failures(),
            "replay finished"
        );

        DiffResult {
            passed,
            manifest: self.manifest.clone(),
            events,
            summary,
        }
    }

    fn align_by_position(&self, documents: &[Value]) -> Vec<(Option<usize>, Option<usize>)> {
        let mut pairs = Vec::with_capacity(self.expected.len().max(documents.len()));
        let mut next = 0;

        for (i, expected) in self.expected.iter().enumerate() {
            match documents.get(next) {
                Some(doc) if !expected.optional || event_type(doc) == expected.event_type => {
                    pairs.push((Some(i), Some(next)));
                    next += 1;
                }
                _ => pairs.push((Some(i), None)),
            }
        }
        pairs.extend((next..documents.len()).map(|j| (None, Some(j))));
        pairs
    }

    /// Expectations without a literal at `key` pair with the first unused
    /// event of the same type
    fn align_by_key(&self, documents: &[Value], key: &str) -> Vec<(Option<usize>, Option<usize>)> {
        let mut used = vec![false; documents.len()];
        let mut pairs = Vec::with_capacity(self.expected.len().max(documents.len()));

        for (i, expected) in self.expected.iter().enumerate() {
            let wanted = expected.literal_at(key);
            let found = (0..documents.len()).find(|&j| {
                !used[j]
                    && match wanted {
                        Some(value) => lookup(&documents[j], key) == Some(value),
                        None => event_type(&documents[j]) == expected.event_type,
                    }
            });
            if let Some(j) = found {
                used[j] = true;
            }
            pairs.push((Some(i), found));
        }

        pairs.extend(
            used.iter()
                .enumerate()
                .filter(|(_, used)| !**used)
                .map(|(j, _)| (None, Some(j))),
        );
        pairs
    }

    fn compare(
        &self,
        expected_index: Option<usize>,
        actual_index: Option<usize>,
        documents: &[Value],
        actual: &[TraceEvent],
    ) -> EventComparison {
        let expected = expected_index.map(|i| &self.expected[i]);
        let event = actual_index.map(|j| &actual[j]);

        let mut comparison = EventComparison {
            expected_index,
            actual_index,
            event_type: expected
                .map(|e| e.event_type.clone())
                .or_else(|| event.map(|e| e.event_type.clone()))
                .unwrap_or_default(),
            actual_sequence: event.map(|e| e.sequence_number),
            status: EventStatus::Passed,
            diffs: Vec::new(),
        };

        let (expected, document) = match (expected, actual_index) {
            (Some(expected), Some(j)) => (expected, &documents[j]),
            (Some(expected), None) => {
                comparison.status = if expected.optional {
                    EventStatus::Skipped
                } else {
                    EventStatus::Missing
                };
                return comparison;
            }
            (None, _) => {
                comparison.status = EventStatus::Unexpected;
                return comparison;
            }
        };

        if !self.is_ignored("event_type") && event_type(document) != expected.event_type {
            comparison.diffs.push(FieldDiff {
                path: "event_type".to_string(),
                expected: Value::String(expected.event_type.clone()),
                actual: document.get("event_type").cloned(),
            });
        }
        for (path, matcher) in &expected.matchers {
            self.check(path, matcher, lookup(document, path), &mut comparison.diffs);
        }

        if !comparison.diffs.is_empty() {
            comparison.status = EventStatus::Failed;
        }
        comparison
    }

    fn check(
        &self,
        path: &str,
        matcher: &Matcher,
        actual: Option<&Value>,
        diffs: &mut Vec<FieldDiff>,
    ) {
        if self.is_ignored(path) {
            return;
        }

        let matched = match (matcher, actual) {
            (Matcher::Exists(wanted), actual) => actual.is_some() == *wanted,
            (Matcher::Regex(re), Some(Value::String(s))) => re.is_match(s),
            (Matcher::Regex(_), _) => false,
            (Matcher::Object(children), Some(Value::Object(map))) => {
                for (key, child) in children {
                    self.check(&join(path, key), child, map.get(key), diffs);
                }
                true
            }
            (Matcher::Object(_), _) => false,
            (Matcher::Literal(expected), Some(actual)) => {
                if self.is_normalized(path) {
                    self.normalizer.normalize(expected) == self.normalizer.normalize(actual)
                } else {
                    expected == actual
                }
            }
            (Matcher::Literal(_), None) => false,
        };

        if !matched {
            diffs.push(FieldDiff {
                path: path.to_string(),
                expected: matcher.to_value(),
                actual: actual.cloned(),
            });
        }
    }

    fn is_ignored(&self, path: &str) -> bool {
        ancestors(path).any(|p| self.ignore.iter().any(|rule| rule.matches(p)))
    }

    fn is_normalized(&self, path: &str) -> bool {
        ancestors(path).any(|p| self.normalize.iter().any(|rule| rule.matches(p)))
    }

    /// Compare two recorded traces
    pub fn diff(first: &[TraceEvent], second: &[TraceEvent]) -> TraceDiff {
        let divergence = find_divergence(first, second);
        let common_prefix_length = divergence.unwrap_or(first.len());

        let mut differences = Vec::new();
        let mut split = common_prefix_length;
        while split < first.len().min(second.len())
            && first[split].event_type == second[split].event_type
        {
            let (a, b) = (&first[split], &second[split]);
            if a.payload != b.payload {
                differences.push(EventDifference {
                    index: split,
                    event_type: a.event_type.clone(),
                    field: "payload".to_string(),
                    first_value: a.payload.clone(),
                    second_value: b.payload.clone(),
                });
            }
            if a.actor != b.actor {
                differences.push(EventDifference {
                    index: split,
                    event_type: a.event_type.clone(),
                    field: "actor".to_string(),
                    first_value: serde_json::to_value(&a.actor).unwrap_or(Value::Null),
                    second_value: serde_json::to_value(&b.actor).unwrap_or(Value::Null),
                });
            }
            split += 1;
        }

        let summarize = |events: &[TraceEvent]| -> Vec<EventSummary> {
            events
                .iter()
                .enumerate()
                .skip(split)
                .map(|(index, e)| EventSummary {
                    index,
                    event_type: e.event_type.clone(),
                    event_hash: e.event_hash.clone(),
                })
                .collect()
        };

        TraceDiff {
            identical: divergence.is_none(),
            only_in_first: summarize(first),
            only_in_second: summarize(second),
            differences,
            summary: TraceDiffSummary {
                first_count: first.len(),
                second_count: second.len(),
                common_prefix_length,
                divergence_point: divergence,
            },
        }
    }
}

/// Compile `manifest` and replay `actual` against it
pub fn replay(manifest: &GoldenManifest, actual: &[TraceEvent]) -> Result<DiffResult> {
    Ok(ReplayEngine::new(manifest)?.replay(actual))
}

fn event_type(document: &Value) -> &str {
    document.get("event_type").and_then(Value::as_str).unwrap_or_default()
}

/// Difference between two traces
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceDiff {
    /// Whether the traces are identical
    pub identical: bool,

    /// Events only in the first trace
    pub only_in_first: Vec<EventSummary>,

    /// Events only in the second trace
    pub only_in_second: Vec<EventSummary>,

    /// Same-type events whose content differs
    pub differences: Vec<EventDifference>,

    pub summary: TraceDiffSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSummary {
    pub index: usize,
    pub event_type: String,
    pub event_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDifference {
    pub index: usize,
    pub event_type: String,
    pub field: String,
    pub first_value: Value,
    pub second_value: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceDiffSummary {
    pub first_count: usize,
    pub second_count: usize,
    /// Events with identical hashes at the start of both traces
    pub common_prefix_length: usize,
    pub divergence_point: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;
    use crate::trace::{event_types, Actor, ChainBuilder, RawEvent};
    use std::sync::Arc;
    use uuid::Uuid;

    fn record(session: &str, events: Vec<RawEvent>) -> Vec<TraceEvent> {
        let chain = ChainBuilder::new(Arc::new(InMemoryStorage::new()));
        events
            .into_iter()
            .map(|raw| {
                let raw = RawEvent { session_id: session.to_string(), ..raw };
                chain.append(raw).unwrap()
            })
            .collect()
    }

    fn refund_run(session: &str) -> Vec<TraceEvent> {
        record(
            session,
            vec![
                RawEvent::new("", event_types::SESSION_STARTED, json!({"goal": "refund"}))
                    .with_actor(Actor::agent("agent-7")),
                RawEvent::new(
                    "",
                    event_types::POLICY_EVALUATED,
                    json!({
                        "policy_id": "refunds",
                        "result": "allow",
                        "request_id": Uuid::new_v4().to_string()
                    }),
                ),
                RawEvent::new(
                    "",
                    event_types::ACTION_EXECUTED,
                    json!({"action_id": "refund.issue", "ticket_id": "T-1042", "elapsed_ms": 12}),
                ),
                RawEvent::new("", event_types::SESSION_ENDED, json!({"reason": "completed"})),
            ],
        )
    }

    fn expect_span(event: &TraceEvent) -> ExpectedEvent {
        ExpectedEvent::new(event.event_type.clone()).with_field("span_id", json!(event.span_id))
    }

    #[test]
    fn test_span_id_normalization() {
        let first = refund_run("run-a");
        let second = refund_run("run-b");
        assert_ne!(first[0].span_id, second[0].span_id);

        let mut manifest = GoldenManifest::new("span-ids");
        for event in &first {
            manifest = manifest.with_event(expect_span(event));
        }

        let strict = replay(&manifest, &second).unwrap();
        assert!(!strict.passed);
        assert_eq!(strict.summary.failed, 4);
        assert_eq!(strict.events[0].diffs[0].path, "span_id");

        let manifest = manifest.with_rule("*.span_id", RuleKind::Normalize);
        let engine = ReplayEngine::new(&manifest).unwrap();
        assert!(engine.replay(&first).passed);
        assert!(engine.replay(&second).passed);
    }

    #[test]
    fn test_self_replay_with_normalized_payload() {
        let first = refund_run("run-a");
        let manifest = GoldenManifest::from_events("refund", &first).unwrap();
        assert!(replay(&manifest, &first).unwrap().passed);

        let second = refund_run("run-b");
        let result = replay(&manifest, &second).unwrap();
        assert!(!result.passed);
        let diff = &result.events[1].diffs[0];
        assert_eq!(diff.path, "payload.request_id");

        let manifest = manifest.with_rule("payload.request_id", RuleKind::Normalize);
        let result = replay(&manifest, &second).unwrap();
        assert!(result.passed, "{:?}", result.failures().collect::<Vec<_>>());
        assert_eq!(result.summary.passed, 4);
    }

    #[test]
    fn test_subset_and_operators() {
        let events = refund_run("s");
        let manifest = GoldenManifest::new("ops")
            .with_event(
                ExpectedEvent::new("session.started").with_field("actor.type", json!("agent")),
            )
            .with_event(
                ExpectedEvent::new("policy.evaluated")
                    .with_field("payload", json!({"result": "allow"})),
            )
            .with_event(
                ExpectedEvent::new("action.executed")
                    .with_field("payload.ticket_id", json!({"$regex": "^T-\\d+$"}))
                    .with_field("payload.refund_amount", json!({"$exists": false})),
            )
            .with_event(
                ExpectedEvent::new("session.ended")
                    .with_field("payload.reason", json!({"$exists": true})),
            );

        assert!(replay(&manifest, &events).unwrap().passed);

        let failing = GoldenManifest::new("ops")
            .with_event(ExpectedEvent::new("session.started"))
            .with_event(
                ExpectedEvent::new("policy.evaluated")
                    .with_field("payload", json!({"result": "deny"})),
            )
            .with_event(ExpectedEvent::new("action.executed"))
            .with_event(ExpectedEvent::new("session.ended"));
        let result = replay(&failing, &events).unwrap();
        assert_eq!(result.summary.failed, 1);
        assert_eq!(
            result.events[1].diffs,
            vec![FieldDiff {
                path: "payload.result".to_string(),
                expected: json!("deny"),
                actual: Some(json!("allow")),
            }]
        );
    }

    #[test]
    fn test_ignore_rule_covers_descendants() {
        let events = refund_run("s");
        let manifest = GoldenManifest::new("ignore")
            .with_event(ExpectedEvent::new("session.started"))
            .with_event(ExpectedEvent::new("policy.evaluated"))
            .with_event(
                ExpectedEvent::new("action.executed")
                    .with_field("payload", json!({"elapsed_ms": 999, "nested": {"x": 1}})),
            )
            .with_event(ExpectedEvent::new("session.ended"));

        assert!(!replay(&manifest, &events).unwrap().passed);

        let manifest = manifest
            .with_rule("payload.elapsed_ms", RuleKind::Ignore)
            .with_rule("payload.nested", RuleKind::Ignore);
        assert!(replay(&manifest, &events).unwrap().passed);
    }

    #[test]
    fn test_count_mismatch_and_optional() {
        let events = refund_run("s");
        let mut manifest = GoldenManifest::new("counts")
            .with_event(ExpectedEvent::new("session.started"))
            .with_event(ExpectedEvent::new("context.injected").optional())
            .with_event(ExpectedEvent::new("policy.evaluated"))
            .with_event(ExpectedEvent::new("action.executed"))
            .with_event(ExpectedEvent::new("session.ended"));

        let result = replay(&manifest, &events).unwrap();
        assert!(result.passed);
        assert_eq!(result.summary.skipped, 1);
        assert_eq!(result.events[1].status, EventStatus::Skipped);

        manifest.expected_events.push(ExpectedEvent::new("session.ended"));
        let result = replay(&manifest, &events).unwrap();
        assert!(!result.passed);
        assert_eq!(result.summary.missing, 1);

        manifest.expected_events.truncate(3);
        let result = replay(&manifest, &events).unwrap();
        assert_eq!(result.summary.unexpected, 2);
        let err = result.into_result().unwrap_err();
        assert_eq!(err.error_code(), "MANIFEST_MISMATCH");
    }

    #[test]
    fn test_correlation_key_alignment() {
        let events = record(
            "s",
            vec![
                RawEvent::new("", "action.executed", json!({"step": "b", "ok": true})),
                RawEvent::new("", "action.executed", json!({"step": "a", "ok": false})),
            ],
        );
        let manifest = GoldenManifest::new("corr")
            .with_correlation_key("payload.step")
            .with_event(
                ExpectedEvent::new("action.executed")
                    .with_field("payload", json!({"step": "a", "ok": false})),
            )
            .with_event(
                ExpectedEvent::new("action.executed").with_field("payload.step", json!("b")),
            );

        let result = replay(&manifest, &events).unwrap();
        assert!(result.passed);
        assert_eq!(result.events[0].actual_sequence, Some(1));
        assert_eq!(result.events[1].actual_sequence, Some(0));
    }

    #[test]
    fn test_normalizer_placeholders() {
        let normalizer = Normalizer::new().unwrap();
        let value = json!({
            "at": "2026-10-14T09:30:00.123Z",
            "id": "550e8400-e29b-41d4-a716-446655440000",
            "digest": "a".repeat(64),
            "note": "retry 3",
            "span": "00f067aa0ba902b7",
            "ref": "span-123",
            "count": 7,
            "flag": true
        });
        assert_eq!(
            normalizer.normalize(&value),
            json!({
                "at": "<timestamp>",
                "id": "<uuid>",
                "digest": "<hash>",
                "note": "retry 3",
                "span": "<id>",
                "ref": "<id>",
                "count": "<number>",
                "flag": true
            })
        );
    }

    #[test]
    fn test_manifest_schema_validation() {
        let manifest = GoldenManifest::from_json_str(
            r#"{
                "manifest_version": "1.0",
                "name": "n",
                "expected_events": [{"event_type": "session.started", "payload.goal": "x"}],
                "nondeterminism": [{"field": "*.span_id", "rule": "normalize"}]
            }"#,
        )
        .unwrap();
        assert_eq!(manifest.expected_events[0].fields["payload.goal"], json!("x"));
        assert_eq!(manifest.nondeterminism[0].rule, RuleKind::Normalize);

        for bad in [
            r#"{"name": "n", "expected_events": []}"#,
            r#"{"manifest_version": "1.0", "name": "n", "expected_events": [{}]}"#,
            r#"{"manifest_version": "1.0", "name": "n", "expected_events": [], "nondeterminism": [{"field": "x", "rule": "drop"}]}"#,
            r#"{"manifest_version": "2.0", "name": "n", "expected_events": []}"#,
            "not json",
        ] {
            let err = GoldenManifest::from_json_str(bad).unwrap_err();
            assert_eq!(err.error_code(), "INVALID_MANIFEST", "{}", bad);
        }
    }

    #[test]
    fn test_short_span_ids_normalize() {
        let run = |span_id: &str| {
            let mut events = refund_run("s");
            for event in &mut events {
                event.span_id = span_id.to_string();
            }
            events
        };
        let first = run("00f067aa0ba902b7");
        let second = run("53995c3f42cd8ad8");

        let mut manifest =
            GoldenManifest::new("w3c-spans").with_rule("*.span_id", RuleKind::Normalize);
        for event in &first {
            manifest = manifest.with_event(expect_span(event));
        }

        let engine = ReplayEngine::new(&manifest).unwrap();
        assert!(engine.replay(&first).passed);
        assert!(engine.replay(&second).passed);
        assert!(engine.replay(&run("span-123")).passed);
    }

    #[test]
    fn test_self_replay_with_dotted_and_dollar_keys() {
        let events = record(
            "s",
            vec![
                RawEvent::new(
                    "",
                    "tool.called",
                    json!({"tool.name": "search", "args": {"q.text": "refunds"}}),
                ),
                RawEvent::new(
                    "",
                    "context.injected",
                    json!({"$schema": "x", "k": 1, "nested": {"$ref": "#/a"}}),
                ),
            ],
        );

        let manifest = GoldenManifest::from_events("keys", &events).unwrap();
        let engine = ReplayEngine::new(&manifest).unwrap();
        let result = engine.replay(&events);
        assert!(result.passed, "{:?}", result.failures().collect::<Vec<_>>());

        let mut changed = events.clone();
        changed[0].payload["tool.name"] = json!("browse");
        changed[1].payload["k"] = json!(2);
        let result = engine.replay(&changed);
        assert_eq!(result.summary.failed, 2);
        assert_eq!(result.events[0].diffs[0].path, "payload.tool.name");
        assert_eq!(result.events[1].diffs[0].path, "payload");
        assert_eq!(result.events[1].diffs[0].expected, json!({"$eq": events[1].payload}));
    }

    #[test]
    fn test_eq_operator_is_exact() {
        let events = refund_run("s");
        let exact = |payload: Value| {
            GoldenManifest::new("eq")
                .with_event(
                    ExpectedEvent::new("session.started")
                        .with_field("payload", json!({"$eq": payload})),
                )
                .with_event(ExpectedEvent::new("policy.evaluated"))
                .with_event(ExpectedEvent::new("action.executed"))
                .with_event(ExpectedEvent::new("session.ended"))
        };

        assert!(replay(&exact(json!({"goal": "refund"})), &events).unwrap().passed);
        assert!(!replay(&exact(json!({})), &events).unwrap().passed);
    }

    #[test]
    fn test_bad_predicates_rejected() {
        for predicate in [json!({"$regex": "("}), json!({"$exists": "yes"}), json!({"$gt": 1})] {
            let manifest = GoldenManifest::new("bad")
                .with_event(ExpectedEvent::new("x").with_field("payload.v", predicate));
            let err = ReplayEngine::new(&manifest).unwrap_err();
            assert_eq!(err.error_code(), "INVALID_MANIFEST");
        }
    }

    #[test]
    fn test_diff_identical() {
        let trace = refund_run("s");
        let diff = ReplayEngine::diff(&trace, &trace);

        assert!(diff.identical);
        assert!(diff.only_in_first.is_empty());
        assert!(diff.only_in_second.is_empty());
        assert!(diff.differences.is_empty());
    }

    #[test]
    fn test_diff_different() {
        let trace1 = refund_run("s");
        let mut trace2 = trace1.clone();
        trace2[2].payload = json!({"action_id": "refund.deny"});
        trace2[2].event_hash = trace2[2].compute_hash().unwrap();
        trace2.pop();

        let diff = ReplayEngine::diff(&trace1, &trace2);

        assert!(!diff.identical);
        assert_eq!(diff.summary.divergence_point, Some(2));
        assert_eq!(diff.differences.len(), 1);
        assert_eq!(diff.differences[0].field, "payload");
        assert_eq!(diff.only_in_first.len(), 1);
        assert_eq!(diff.only_in_first[0].event_type, "session.ended");
        assert!(diff.only_in_second.is_empty());
    }
}
