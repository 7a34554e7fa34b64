//! Typed error hierarchy for vizflow.
//!
//! One enum per subsystem:
//! - `TraceError`: span bookkeeping in the tracer
//! - `PatchError`: structural patch application
//! - `StageError`: a single pipeline stage
//! - `PipelineError`: the orchestrator around the stages
//! - `StoreError`: artifact and trace stores
//! - `TaskError`: the task runner
//! - `EditError`: chart edits recorded into a stored trace

use thiserror::Error;
use vizflow_common::{Span, TaskFailure};

/// Errors from the span tracer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TraceError {
    #[error("Span {span_id} not found or already finished")]
    SpanNotFound { span_id: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Errors from applying a patch. No variant leaves a partially patched document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    #[error("Invalid patch: {0}")]
    InvalidArgument(String),

    #[error("Path /{path} not found")]
    NotFound { path: String },

    #[error("Type mismatch at /{path}: {message}")]
    TypeMismatch { path: String, message: String },

    #[error("Patch targets chart {expected} but the document is chart {actual}")]
    TargetMismatch { expected: String, actual: String },

    #[error("Chart state hash {actual} does not match expected {expected}")]
    StaleState { expected: String, actual: String },
}

impl PatchError {
    /// Short class name recorded as a span's `error_class`.
    pub fn error_class(&self) -> &'static str {
        match self {
            PatchError::InvalidArgument(_) => "InvalidArgument",
            PatchError::NotFound { .. } => "NotFound",
            PatchError::TypeMismatch { .. } => "TypeMismatch",
            PatchError::TargetMismatch { .. } => "TargetMismatch",
            PatchError::StaleState { .. } => "StaleState",
        }
    }
}

/// Errors raised by a pipeline stage or its payload builder.
#[derive(Debug, Error)]
pub enum StageError {
    /// A failure with a caller-chosen type name, surfaced verbatim to task snapshots.
    #[error("{message}")]
    Raised { error_type: String, message: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Stage output '{0}' is missing")]
    MissingOutput(String),

    #[error("Stage output '{name}' is {actual}, expected {expected}")]
    OutputType {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Failed to read {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Trace(#[from] TraceError),
}

impl StageError {
    pub fn raised(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        StageError::Raised {
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    pub fn error_type(&self) -> &str {
        match self {
            StageError::Raised { error_type, .. } => error_type,
            StageError::InvalidInput(_) => "InvalidInput",
            StageError::MissingOutput(_) => "MissingOutput",
            StageError::OutputType { .. } => "OutputType",
            StageError::Io { .. } => "IoError",
            StageError::Trace(_) => "TraceError",
        }
    }

    pub fn message(&self) -> String {
        match self {
            StageError::Raised { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

/// Errors from the orchestrator.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// `spans` holds the failed parent span followed by the spans of the
    /// stages that completed before the failure.
    #[error("Stage '{node}' failed: {source}")]
    Stage {
        node: String,
        #[source]
        source: StageError,
        spans: Vec<Span>,
    },

    #[error("Orchestrator cannot run from state {state}")]
    AlreadyRun { state: String },

    #[error(transparent)]
    Trace(#[from] TraceError),
}

impl PipelineError {
    /// Spans recorded before the run failed, parent first.
    pub fn spans(&self) -> &[Span] {
        match self {
            PipelineError::Stage { spans, .. } => spans,
            _ => &[],
        }
    }

    /// The public failure payload for a task that ended with this error.
    pub fn to_failure(&self) -> TaskFailure {
        let (error_type, error_message) = match self {
            PipelineError::Stage { source, .. } => {
                (source.error_type().to_string(), source.message())
            }
            PipelineError::AlreadyRun { .. } => ("AlreadyRun".to_string(), self.to_string()),
            PipelineError::Trace(e) => ("TraceError".to_string(), e.to_string()),
        };
        TaskFailure {
            error_type,
            error_message,
        }
    }
}

/// Errors from artifact and trace stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("No {kind} stored under '{key}'")]
    NotFound { kind: &'static str, key: String },

    #[error("Invalid store key '{key}': expected [A-Za-z0-9_-]+")]
    InvalidKey { key: String },

    #[error("Store I/O error at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from the task runner.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Task {task_id} not found")]
    NotFound { task_id: String },

    #[error("Task {task_id} already exists")]
    Duplicate { task_id: String },

    #[error("Invalid task id '{task_id}': expected [A-Za-z0-9_-]+")]
    InvalidId { task_id: String },

    #[error("Task runner is shut down")]
    RunnerClosed,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from recording a chart edit.
#[derive(Debug, Error)]
pub enum EditError {
    #[error(transparent)]
    Patch(#[from] PatchError),

    #[error(transparent)]
    Trace(#[from] TraceError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
