//! Span and trace record types.
//!
//! A [`Span`] is the sealed, immutable form of one execution unit. The
//! mutable runtime form lives in the engine's tracer and is converted into a
//! `Span` exactly once when the span is finished.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ParseEnumError;

/// Schema version stamped onto spans that do not set one explicitly.
pub const SCHEMA_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    Success,
    Failed,
    Aborted,
}

impl SpanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanStatus::Success => "success",
            SpanStatus::Failed => "failed",
            SpanStatus::Aborted => "aborted",
        }
    }

    /// Failed and aborted spans both terminate with an `abort` event.
    pub fn is_failure(&self) -> bool {
        !matches!(self, SpanStatus::Success)
    }
}

impl std::fmt::Display for SpanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SpanStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(SpanStatus::Success),
            "failed" => Ok(SpanStatus::Failed),
            "aborted" => Ok(SpanStatus::Aborted),
            _ => Err(ParseEnumError::new("span status", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanEventType {
    Start,
    CacheHit,
    Retry,
    Abort,
    Fallback,
    EmitPartial,
    Success,
}

impl std::fmt::Display for SpanEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SpanEventType::Start => "start",
            SpanEventType::CacheHit => "cache_hit",
            SpanEventType::Retry => "retry",
            SpanEventType::Abort => "abort",
            SpanEventType::Fallback => "fallback",
            SpanEventType::EmitPartial => "emit_partial",
            SpanEventType::Success => "success",
        };
        f.write_str(s)
    }
}

/// Budget declared for a span. Recorded for observability only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanSlo {
    pub max_duration_ms: u64,
    pub max_retries: u32,
    #[serde(default = "default_isolation")]
    pub failure_isolation_required: bool,
}

fn default_isolation() -> bool {
    true
}

impl SpanSlo {
    pub fn new(max_duration_ms: u64, max_retries: u32) -> Self {
        Self {
            max_duration_ms,
            max_retries,
            failure_isolation_required: true,
        }
    }

    /// Combined budget of a group of spans: durations and retries add up,
    /// isolation is required if any member requires it.
    pub fn total(slos: &[SpanSlo]) -> Self {
        Self {
            max_duration_ms: slos.iter().map(|s| s.max_duration_ms).sum(),
            max_retries: slos.iter().map(|s| s.max_retries).sum(),
            failure_isolation_required: slos.iter().any(|s| s.failure_isolation_required),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanMetrics {
    pub duration_ms: u64,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows_in: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows_out: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_category: Option<String>,
    pub failure_isolation_ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanEvent {
    pub event_type: SpanEventType,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub span_id: String,
    #[serde(default)]
    pub parent_span_id: Option<String>,
    pub operation: String,
    pub agent_name: String,
    pub status: SpanStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub slo: SpanSlo,
    pub metrics: SpanMetrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset_hash: Option<String>,
    pub schema_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sse_seq: Option<u64>,
    #[serde(default)]
    pub events: Vec<SpanEvent>,
}

impl Span {
    /// Check the structural invariants of a sealed span.
    pub fn validate(&self) -> Result<(), String> {
        if !is_dotted_operation(&self.operation) {
            return Err(format!(
                "span {}: operation '{}' has no category separator",
                self.span_id, self.operation
            ));
        }
        if self.completed_at < self.started_at {
            return Err(format!("span {}: completed before it started", self.span_id));
        }
        if let Some(event) = self.events.iter().find(|e| e.timestamp < self.started_at) {
            return Err(format!(
                "span {}: {} event precedes span start",
                self.span_id, event.event_type
            ));
        }
        Ok(())
    }

    pub fn is_root(&self) -> bool {
        self.parent_span_id.is_none()
    }
}

/// An operation name is `category.verb`: a dot with text on both sides.
pub fn is_dotted_operation(operation: &str) -> bool {
    match operation.split_once('.') {
        Some((category, verb)) => !category.is_empty() && !verb.is_empty(),
        None => false,
    }
}

/// Ordered spans produced by one task run, in execution order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub trace_id: String,
    pub task_id: String,
    pub dataset_id: String,
    pub created_at: DateTime<Utc>,
    pub spans: Vec<Span>,
}

impl TraceRecord {
    pub fn validate(&self) -> Result<(), String> {
        if self.spans.is_empty() {
            return Err(format!("trace {} has no spans", self.trace_id));
        }
        self.spans.iter().try_for_each(Span::validate)
    }

    /// The first span started without a parent.
    pub fn root_span(&self) -> Option<&Span> {
        self.spans.iter().find(|s| s.is_root())
    }

    pub fn span(&self, span_id: &str) -> Option<&Span> {
        self.spans.iter().find(|s| s.span_id == span_id)
    }

    /// Append a span recorded after the run, e.g. a chart edit.
    pub fn append_span(&mut self, span: Span) {
        self.spans.push(span);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample_span(id: &str, parent: Option<&str>) -> Span {
        let started = Utc::now();
        Span {
            span_id: id.to_string(),
            parent_span_id: parent.map(str::to_string),
            operation: "data.scan".into(),
            agent_name: "scanner".into(),
            status: SpanStatus::Success,
            started_at: started,
            completed_at: started + Duration::milliseconds(5),
            slo: SpanSlo::new(1000, 0),
            metrics: SpanMetrics {
                duration_ms: 5,
                retry_count: 0,
                rows_in: None,
                rows_out: None,
                failure_category: None,
                failure_isolation_ratio: 1.0,
            },
            model_name: None,
            prompt_version: None,
            dataset_hash: None,
            schema_version: SCHEMA_VERSION.into(),
            abort_reason: None,
            error_class: None,
            fallback_path: None,
            sse_seq: None,
            events: vec![SpanEvent {
                event_type: SpanEventType::Start,
                timestamp: started,
                detail: None,
            }],
        }
    }

    #[test]
    fn test_status_parses_known_values_only() {
        assert_eq!("failed".parse::<SpanStatus>().unwrap(), SpanStatus::Failed);
        let err = "done".parse::<SpanStatus>().unwrap_err();
        assert!(err.to_string().contains("done"));
    }

    #[test]
    fn test_event_type_serializes_snake_case() {
        let json = serde_json::to_string(&SpanEventType::EmitPartial).unwrap();
        assert_eq!(json, "\"emit_partial\"");
        assert_eq!(SpanEventType::CacheHit.to_string(), "cache_hit");
    }

    #[test]
    fn test_slo_total_sums_children() {
        let total = SpanSlo::total(&[SpanSlo::new(800, 0), SpanSlo::new(1500, 1)]);
        assert_eq!(total.max_duration_ms, 2300);
        assert_eq!(total.max_retries, 1);
        assert!(total.failure_isolation_required);
    }

    #[test]
    fn test_dotted_operation() {
        assert!(is_dotted_operation("orchestrate.run"));
        assert!(!is_dotted_operation("orchestrate"));
        assert!(!is_dotted_operation(".run"));
        assert!(!is_dotted_operation("run."));
    }

    #[test]
    fn test_span_validate_rejects_event_before_start() {
        let mut span = sample_span("a", None);
        span.events[0].timestamp = span.started_at - Duration::seconds(1);
        assert!(span.validate().is_err());
    }

    #[test]
    fn test_trace_requires_spans() {
        let mut trace = TraceRecord {
            trace_id: "t".into(),
            task_id: "task".into(),
            dataset_id: "ds".into(),
            created_at: Utc::now(),
            spans: vec![],
        };
        assert!(trace.validate().is_err());

        trace.spans.push(sample_span("root", None));
        trace.append_span(sample_span("child", Some("root")));
        assert!(trace.validate().is_ok());
        assert_eq!(trace.root_span().map(|s| s.span_id.as_str()), Some("root"));
        assert!(trace.span("child").is_some());
    }
}
