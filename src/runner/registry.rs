//! Per-task state owned by the runner's event loop.
//!
//! Nothing here is shared: the loop holds the only `TaskRegistry`, so append
//! and broadcast happen together and a subscriber registered between two
//! events sees the full history followed by every later event exactly once.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use vizflow_common::{
    ChartPlan, ChartSpec, DatasetProfile, Explanation, OutputTable, TaskEvent, TaskFailure,
    TaskStatus,
};

use crate::errors::TaskError;
use crate::patch::ChartState;

/// Item delivered to a subscriber channel.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Event(TaskEvent),
    End,
}

/// Artifacts of a completed task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskResult {
    pub profile: DatasetProfile,
    pub plan: ChartPlan,
    pub table: OutputTable,
    pub chart: ChartSpec,
    /// The recommended chart with its initial patch applied.
    pub chart_state: ChartState,
    pub chart_hash: String,
    pub explanation: Explanation,
}

/// Point-in-time view of a task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub status: TaskStatus,
    pub events: usize,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<TaskFailure>,
}

struct TaskEntry {
    status: TaskStatus,
    history: Vec<TaskEvent>,
    subscribers: Vec<mpsc::UnboundedSender<StreamItem>>,
    result: Option<TaskResult>,
    failure: Option<TaskFailure>,
    created_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, TaskEntry>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.tasks.contains_key(task_id)
    }

    /// Register a new running task and log its `started` event.
    pub fn start(&mut self, task_id: &str, now: DateTime<Utc>) -> Result<(), TaskError> {
        if self.tasks.contains_key(task_id) {
            return Err(TaskError::Duplicate {
                task_id: task_id.to_string(),
            });
        }
        self.tasks.insert(
            task_id.to_string(),
            TaskEntry {
                status: TaskStatus::Running,
                history: Vec::new(),
                subscribers: Vec::new(),
                result: None,
                failure: None,
                created_at: now,
                finished_at: None,
            },
        );
        self.emit(
            task_id,
            TaskEvent::Started {
                task_id: task_id.to_string(),
                timestamp: now,
            },
            now,
        )
    }

    /// Append `event` and deliver it to every live subscriber.
    ///
    /// A terminal event moves the task out of `running`, sends `End` to every
    /// subscriber and drops them. Events for a task that already ended are
    /// discarded.
    pub fn emit(&mut self, task_id: &str, event: TaskEvent, now: DateTime<Utc>) -> Result<(), TaskError> {
        let entry = self.entry_mut(task_id)?;
        if entry.status.is_terminal() {
            tracing::warn!(task_id, kind = event.kind(), "event after terminal state discarded");
            return Ok(());
        }

        entry.history.push(event.clone());
        let terminal = match &event {
            TaskEvent::Completed { .. } => Some(TaskStatus::Completed),
            TaskEvent::Failed { .. } => Some(TaskStatus::Failed),
            _ => None,
        };
        entry
            .subscribers
            .retain(|tx| tx.send(StreamItem::Event(event.clone())).is_ok());

        if let Some(status) = terminal {
            entry.status = status;
            entry.finished_at = Some(now);
            for tx in entry.subscribers.drain(..) {
                let _ = tx.send(StreamItem::End);
            }
        }
        tracing::debug!(task_id, kind = event.kind(), "task event emitted");
        Ok(())
    }

    pub fn complete(&mut self, task_id: &str, result: TaskResult, now: DateTime<Utc>) -> Result<(), TaskError> {
        let event = TaskEvent::Completed {
            task_id: task_id.to_string(),
            chart_id: result.chart.chart_id.clone(),
            plan_id: result.plan.plan_id.clone(),
            rows_out: result.table.row_count(),
        };
        let entry = self.entry_mut(task_id)?;
        if !entry.status.is_terminal() {
            entry.result = Some(result);
        }
        self.emit(task_id, event, now)
    }

    pub fn fail(&mut self, task_id: &str, failure: TaskFailure, now: DateTime<Utc>) -> Result<(), TaskError> {
        let event = TaskEvent::Failed {
            task_id: task_id.to_string(),
            error_type: failure.error_type.clone(),
            error_message: failure.error_message.clone(),
        };
        let entry = self.entry_mut(task_id)?;
        if !entry.status.is_terminal() {
            entry.failure = Some(failure);
        }
        self.emit(task_id, event, now)
    }

    /// Open a channel that yields the task's history and then, for a running
    /// task, every later event. A finished task's channel already holds `End`.
    pub fn subscribe(&mut self, task_id: &str) -> Result<mpsc::UnboundedReceiver<StreamItem>, TaskError> {
        let entry = self.entry_mut(task_id)?;
        let (tx, rx) = mpsc::unbounded_channel();
        for event in &entry.history {
            let _ = tx.send(StreamItem::Event(event.clone()));
        }
        if entry.status.is_terminal() {
            let _ = tx.send(StreamItem::End);
        } else {
            entry.subscribers.push(tx);
        }
        Ok(rx)
    }

    pub fn snapshot(&self, task_id: &str) -> Result<TaskSnapshot, TaskError> {
        let entry = self.tasks.get(task_id).ok_or_else(|| TaskError::NotFound {
            task_id: task_id.to_string(),
        })?;
        Ok(TaskSnapshot {
            task_id: task_id.to_string(),
            status: entry.status,
            events: entry.history.len(),
            created_at: entry.created_at,
            finished_at: entry.finished_at,
            result: entry.result.clone(),
            failure: entry.failure.clone(),
        })
    }

    /// Drop finished tasks whose `finished_at` is at least `retention` old.
    /// Running tasks are never evicted.
    pub fn evict_expired(&mut self, now: DateTime<Utc>, retention: Duration) -> Vec<String> {
        let expired: Vec<String> = self
            .tasks
            .iter()
            .filter(|(_, entry)| matches!(entry.finished_at, Some(at) if now - at >= retention))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.tasks.remove(id);
        }
        expired
    }

    fn entry_mut(&mut self, task_id: &str) -> Result<&mut TaskEntry, TaskError> {
        self.tasks.get_mut(task_id).ok_or_else(|| TaskError::NotFound {
            task_id: task_id.to_string(),
        })
    }
}
