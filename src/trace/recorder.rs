//! Task-scoped span tracer.
//!
//! A span lives in the tracer's runtime index from `start_span` until
//! `finish_span`, which seals it into an immutable [`Span`] and drops the
//! runtime entry. Every mutating call after that fails with
//! [`TraceError::SpanNotFound`], so finishing twice is detected instead of
//! silently returning a second copy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use uuid::Uuid;
use vizflow_common::trace::is_dotted_operation;
use vizflow_common::{
    SCHEMA_VERSION, Span, SpanEvent, SpanEventType, SpanMetrics, SpanSlo, SpanStatus, TraceRecord,
};

use crate::clock::Clock;
use crate::errors::TraceError;
use crate::util::canonical_json;

/// Serialize an event detail so identical inputs give identical bytes.
///
/// Strings are stored verbatim. Everything else is compact JSON with sorted keys.
pub fn canonical_detail(detail: &Value) -> String {
    match detail {
        Value::String(s) => s.clone(),
        other => canonical_json(other),
    }
}

/// Arguments for opening a span.
#[derive(Debug, Clone)]
pub struct SpanRequest {
    pub operation: String,
    pub agent_name: String,
    pub slo: SpanSlo,
    pub parent_span_id: Option<String>,
    pub model_name: Option<String>,
    pub prompt_version: Option<String>,
    pub start_detail: Option<Value>,
}

impl SpanRequest {
    pub fn new(operation: impl Into<String>, agent_name: impl Into<String>, slo: SpanSlo) -> Self {
        Self {
            operation: operation.into(),
            agent_name: agent_name.into(),
            slo,
            parent_span_id: None,
            model_name: None,
            prompt_version: None,
            start_detail: None,
        }
    }

    pub fn with_parent(mut self, parent_span_id: Option<&str>) -> Self {
        self.parent_span_id = parent_span_id.map(str::to_string);
        self
    }

    pub fn with_model(mut self, model_name: &str, prompt_version: &str) -> Self {
        self.model_name = Some(model_name.to_string());
        self.prompt_version = Some(prompt_version.to_string());
        self
    }

    pub fn with_start_detail(mut self, detail: Value) -> Self {
        self.start_detail = Some(detail);
        self
    }
}

/// Partial update of a running span. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct SpanUpdate {
    pub rows_in: Option<u64>,
    pub rows_out: Option<u64>,
    pub dataset_hash: Option<String>,
    pub schema_version: Option<String>,
    pub fallback_path: Option<String>,
    pub abort_reason: Option<String>,
    pub sse_seq: Option<u64>,
}

/// How a span ends.
#[derive(Debug, Clone)]
pub struct SpanFinish {
    pub status: SpanStatus,
    pub failure_category: Option<String>,
    pub failure_isolation_ratio: f64,
    pub status_detail: Option<Value>,
}

impl SpanFinish {
    pub fn success() -> Self {
        Self::with_status(SpanStatus::Success)
    }

    pub fn failed(failure_category: impl Into<String>) -> Self {
        let mut finish = Self::with_status(SpanStatus::Failed);
        finish.failure_category = Some(failure_category.into());
        finish
    }

    pub fn with_status(status: SpanStatus) -> Self {
        Self {
            status,
            failure_category: None,
            failure_isolation_ratio: 1.0,
            status_detail: None,
        }
    }

    /// Build from an untyped status string, as received from outside the process.
    pub fn from_status_str(status: &str) -> Result<Self, TraceError> {
        let status = status
            .parse::<SpanStatus>()
            .map_err(|e| TraceError::InvalidArgument(e.to_string()))?;
        Ok(Self::with_status(status))
    }

    pub fn with_category(mut self, failure_category: Option<&str>) -> Self {
        self.failure_category = failure_category.map(str::to_string);
        self
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.status_detail = Some(detail);
        self
    }

    pub fn with_isolation_ratio(mut self, ratio: f64) -> Self {
        self.failure_isolation_ratio = ratio;
        self
    }
}

#[derive(Debug)]
struct RuntimeSpan {
    span_id: String,
    parent_span_id: Option<String>,
    operation: String,
    agent_name: String,
    slo: SpanSlo,
    started_at: DateTime<Utc>,
    model_name: Option<String>,
    prompt_version: Option<String>,
    retry_count: u32,
    rows_in: Option<u64>,
    rows_out: Option<u64>,
    dataset_hash: Option<String>,
    schema_version: Option<String>,
    fallback_path: Option<String>,
    abort_reason: Option<String>,
    sse_seq: Option<u64>,
    events: Vec<SpanEvent>,
}

impl RuntimeSpan {
    fn push_event(&mut self, event_type: SpanEventType, at: DateTime<Utc>, detail: Option<&Value>) {
        self.events.push(SpanEvent {
            event_type,
            timestamp: at.max(self.started_at),
            detail: detail.map(canonical_detail),
        });
    }
}

#[derive(Debug, Default)]
struct TracerState {
    spans: HashMap<String, RuntimeSpan>,
    root_span_id: Option<String>,
}

/// Records the spans of one task run. Shared by reference across its stages.
pub struct SpanTracer {
    clock: Arc<dyn Clock>,
    state: Mutex<TracerState>,
}

impl SpanTracer {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(TracerState::default()),
        }
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    fn lock(&self) -> MutexGuard<'_, TracerState> {
        // Runtime spans stay consistent even if a panicking stage poisoned the lock.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn start_span(&self, request: SpanRequest) -> Result<String, TraceError> {
        if !is_dotted_operation(&request.operation) {
            return Err(TraceError::InvalidArgument(format!(
                "operation '{}' must be category.verb",
                request.operation
            )));
        }

        let span_id = Uuid::new_v4().to_string();
        let started_at = self.clock.now();
        let mut runtime = RuntimeSpan {
            span_id: span_id.clone(),
            parent_span_id: request.parent_span_id,
            operation: request.operation,
            agent_name: request.agent_name,
            slo: request.slo,
            started_at,
            model_name: request.model_name,
            prompt_version: request.prompt_version,
            retry_count: 0,
            rows_in: None,
            rows_out: None,
            dataset_hash: None,
            schema_version: None,
            fallback_path: None,
            abort_reason: None,
            sse_seq: None,
            events: Vec::new(),
        };
        runtime.push_event(SpanEventType::Start, started_at, request.start_detail.as_ref());

        tracing::debug!(
            span_id = %span_id,
            operation = %runtime.operation,
            agent = %runtime.agent_name,
            "span started"
        );

        let mut state = self.lock();
        if runtime.parent_span_id.is_none() && state.root_span_id.is_none() {
            state.root_span_id = Some(span_id.clone());
        }
        state.spans.insert(span_id.clone(), runtime);
        Ok(span_id)
    }

    pub fn record_event(
        &self,
        span_id: &str,
        event_type: SpanEventType,
        detail: Option<Value>,
    ) -> Result<(), TraceError> {
        let at = self.clock.now();
        let mut state = self.lock();
        let runtime = running(&mut state, span_id)?;
        runtime.push_event(event_type, at, detail.as_ref());
        tracing::debug!(span_id, event = %event_type, "span event");
        Ok(())
    }

    pub fn update_span(&self, span_id: &str, update: SpanUpdate) -> Result<(), TraceError> {
        let mut state = self.lock();
        let runtime = running(&mut state, span_id)?;
        if let Some(rows_in) = update.rows_in {
            runtime.rows_in = Some(rows_in);
        }
        if let Some(rows_out) = update.rows_out {
            runtime.rows_out = Some(rows_out);
        }
        if update.dataset_hash.is_some() {
            runtime.dataset_hash = update.dataset_hash;
        }
        if update.schema_version.is_some() {
            runtime.schema_version = update.schema_version;
        }
        if update.fallback_path.is_some() {
            runtime.fallback_path = update.fallback_path;
        }
        if update.abort_reason.is_some() {
            runtime.abort_reason = update.abort_reason;
        }
        if let Some(seq) = update.sse_seq {
            runtime.sse_seq = Some(seq);
        }
        Ok(())
    }

    /// Count a retry performed by the caller. Returns the new count.
    pub fn register_retry(&self, span_id: &str) -> Result<u32, TraceError> {
        let at = self.clock.now();
        let mut state = self.lock();
        let runtime = running(&mut state, span_id)?;
        runtime.retry_count += 1;
        let count = runtime.retry_count;
        runtime.push_event(SpanEventType::Retry, at, Some(&json!({ "retry_count": count })));
        tracing::info!(span_id, retry_count = count, "span retry registered");
        Ok(count)
    }

    /// Seal a span. The runtime entry is removed, so a second call fails.
    pub fn finish_span(&self, span_id: &str, finish: SpanFinish) -> Result<Span, TraceError> {
        if !(0.0..=1.0).contains(&finish.failure_isolation_ratio) {
            return Err(TraceError::InvalidArgument(format!(
                "failure isolation ratio {} outside [0, 1]",
                finish.failure_isolation_ratio
            )));
        }

        let completed_at = self.clock.now();
        let mut runtime = {
            let mut state = self.lock();
            state
                .spans
                .remove(span_id)
                .ok_or_else(|| TraceError::SpanNotFound {
                    span_id: span_id.to_string(),
                })?
        };
        let completed_at = completed_at.max(runtime.started_at);
        let duration_ms = (completed_at - runtime.started_at).num_milliseconds().max(0) as u64;

        let mut error_class = None;
        if finish.status.is_failure() {
            error_class = finish.failure_category.clone();
            runtime.abort_reason = finish
                .failure_category
                .clone()
                .or(runtime.abort_reason.take());
            let mut detail = json!({
                "abort_reason": runtime.abort_reason,
                "error_class": error_class,
            });
            if let Some(meta) = &finish.status_detail {
                detail["meta"] = meta.clone();
            }
            runtime.push_event(SpanEventType::Abort, completed_at, Some(&detail));
        } else {
            runtime.push_event(
                SpanEventType::Success,
                completed_at,
                finish.status_detail.as_ref(),
            );
        }

        tracing::info!(
            span_id,
            operation = %runtime.operation,
            status = %finish.status,
            duration_ms,
            "span finished"
        );

        Ok(Span {
            span_id: runtime.span_id,
            parent_span_id: runtime.parent_span_id,
            operation: runtime.operation,
            agent_name: runtime.agent_name,
            status: finish.status,
            started_at: runtime.started_at,
            completed_at,
            slo: runtime.slo,
            metrics: SpanMetrics {
                duration_ms,
                retry_count: runtime.retry_count,
                rows_in: runtime.rows_in,
                rows_out: runtime.rows_out,
                failure_category: finish.failure_category,
                failure_isolation_ratio: finish.failure_isolation_ratio,
            },
            model_name: runtime.model_name,
            prompt_version: runtime.prompt_version,
            dataset_hash: runtime.dataset_hash,
            schema_version: runtime
                .schema_version
                .unwrap_or_else(|| SCHEMA_VERSION.to_string()),
            abort_reason: runtime.abort_reason,
            error_class,
            fallback_path: runtime.fallback_path,
            sse_seq: runtime.sse_seq,
            events: runtime.events,
        })
    }

    /// The first span opened without a parent.
    pub fn root_span_id(&self) -> Option<String> {
        self.lock().root_span_id.clone()
    }

    /// Spans started but not yet finished.
    pub fn open_spans(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().spans.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn build_trace(
        &self,
        task_id: &str,
        dataset_id: &str,
        spans: Vec<Span>,
    ) -> Result<TraceRecord, TraceError> {
        if spans.is_empty() {
            return Err(TraceError::InvalidArgument(format!(
                "trace for task {} has no spans",
                task_id
            )));
        }
        Ok(TraceRecord {
            trace_id: Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            dataset_id: dataset_id.to_string(),
            created_at: self.clock.now(),
            spans,
        })
    }
}

fn running<'a>(state: &'a mut TracerState, span_id: &str) -> Result<&'a mut RuntimeSpan, TraceError> {
    state
        .spans
        .get_mut(span_id)
        .ok_or_else(|| TraceError::SpanNotFound {
            span_id: span_id.to_string(),
        })
}
