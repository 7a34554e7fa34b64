//! Task lifecycle and progress events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::trace::Span;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Running)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Public failure payload: error type and message only, never a backtrace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub error_type: String,
    pub error_message: String,
}

/// One entry in a task's append-only event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    Started {
        task_id: String,
        timestamp: DateTime<Utc>,
    },
    NodeCompleted {
        task_id: String,
        node: String,
        span: Box<Span>,
    },
    Completed {
        task_id: String,
        chart_id: String,
        plan_id: String,
        rows_out: u64,
    },
    Failed {
        task_id: String,
        error_type: String,
        error_message: String,
    },
}

impl TaskEvent {
    pub fn task_id(&self) -> &str {
        match self {
            TaskEvent::Started { task_id, .. }
            | TaskEvent::NodeCompleted { task_id, .. }
            | TaskEvent::Completed { task_id, .. }
            | TaskEvent::Failed { task_id, .. } => task_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TaskEvent::Started { .. } => "started",
            TaskEvent::NodeCompleted { .. } => "node_completed",
            TaskEvent::Completed { .. } => "completed",
            TaskEvent::Failed { .. } => "failed",
        }
    }

    /// Terminal events freeze the log.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskEvent::Completed { .. } | TaskEvent::Failed { .. })
    }
}
