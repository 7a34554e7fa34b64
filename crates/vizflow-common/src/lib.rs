//! Shared domain types for vizflow.
//!
//! Everything here is plain serde data: spans and traces, task progress
//! events, chart patches, and the artifacts passed between pipeline stages.
//! Behavior that needs a clock, a store, or a runtime lives in the engine
//! crate.

pub mod artifacts;
pub mod patch;
pub mod task;
pub mod trace;

pub use artifacts::{
    ChannelMapping, ChartPlan, ChartSpec, DatasetProfile, Explanation, FieldKind, FieldProfile,
    OutputTable,
};
pub use patch::{Patch, PatchOp, PatchOpType};
pub use task::{TaskEvent, TaskFailure, TaskStatus};
pub use trace::{
    SCHEMA_VERSION, Span, SpanEvent, SpanEventType, SpanMetrics, SpanSlo, SpanStatus, TraceRecord,
};

/// A string did not name a variant of a closed enum.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind} '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    pub fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}
