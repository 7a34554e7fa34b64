//! Asynchronous task runner.
//!
//! One event loop owns the [`TaskRegistry`]; everything else talks to it
//! through [`Command`]s on an unbounded channel. Pipeline runs execute on the
//! blocking pool and report back on the same channel, so `started`,
//! `node_completed`, and the terminal event share a single ordered log per
//! task regardless of where they originate.
//!
//! | Command     | Sent by          | Effect                                  |
//! |-------------|------------------|-----------------------------------------|
//! | `Submit`    | handle           | register task, log `started`, spawn run |
//! | `Emit`      | worker           | append + broadcast a progress event     |
//! | `Complete`  | worker           | store result, log `completed`           |
//! | `Fail`      | worker / monitor | store failure, log `failed`             |
//! | `Subscribe` | handle           | replay history, then attach live        |
//! | `Snapshot`  | handle           | copy status, result and failure         |
//! | `Sweep`     | timer / handle   | evict expired finished tasks            |
//! | `Shutdown`  | handle           | stop the loop                           |

pub mod registry;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;
use vizflow_common::{TaskEvent, TaskFailure, TraceRecord};

use crate::clock::Clock;
use crate::errors::TaskError;
use crate::patch::{ChartEditor, ChartState, PatchEngine};
use crate::pipeline::{
    Orchestrator, PipelineConfig, PipelineOutcome, StageContext, StageOutcome, build_orchestrator,
    failure_trace, run_pipeline,
};
use crate::store::{ArtifactStore, ProfileStore, TraceStore};
use crate::trace::SpanTracer;
use crate::util::is_valid_task_id;

pub use registry::{StreamItem, TaskRegistry, TaskResult, TaskSnapshot};

/// Builds a fresh orchestrator for each run.
pub type PipelineFactory = Arc<dyn Fn() -> Orchestrator + Send + Sync>;

/// Collaborators shared by every run.
#[derive(Clone)]
pub struct RunnerDeps {
    pub profiles: Arc<ProfileStore>,
    pub traces: Arc<TraceStore>,
    pub clock: Arc<dyn Clock>,
    /// Defaults to the built-in pipeline.
    pub pipeline: PipelineFactory,
}

impl RunnerDeps {
    pub fn new(profiles: Arc<ProfileStore>, traces: Arc<TraceStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            profiles,
            traces,
            clock,
            pipeline: Arc::new(build_orchestrator),
        }
    }

    /// Run `factory`'s stages instead of the built-in ones. A run only
    /// completes when its nodes produce the built-in artifact names.
    pub fn with_pipeline<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Orchestrator + Send + Sync + 'static,
    {
        self.pipeline = Arc::new(factory);
        self
    }
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// How long a finished task stays queryable.
    pub retention: Duration,
    pub sweep_interval: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, TaskError>>;

enum Command {
    Submit {
        config: PipelineConfig,
        reply: Reply<String>,
    },
    Emit {
        task_id: String,
        event: TaskEvent,
    },
    Complete {
        task_id: String,
        result: Box<TaskResult>,
    },
    Fail {
        task_id: String,
        failure: TaskFailure,
    },
    Subscribe {
        task_id: String,
        reply: Reply<mpsc::UnboundedReceiver<StreamItem>>,
    },
    Snapshot {
        task_id: String,
        reply: Reply<TaskSnapshot>,
    },
    Sweep {
        reply: Option<oneshot::Sender<usize>>,
    },
    Shutdown,
}

/// Live view of one task's events.
pub struct TaskStream {
    rx: mpsc::UnboundedReceiver<StreamItem>,
    ended: bool,
}

impl TaskStream {
    /// Next event, or `None` once the task has ended.
    pub async fn next(&mut self) -> Option<TaskEvent> {
        if self.ended {
            return None;
        }
        match self.rx.recv().await {
            Some(StreamItem::Event(event)) => Some(event),
            Some(StreamItem::End) | None => {
                self.ended = true;
                None
            }
        }
    }

    /// Drain the stream to its end.
    pub async fn collect(mut self) -> Vec<TaskEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }
}

/// Cloneable handle to the runner's event loop.
#[derive(Clone)]
pub struct TaskRunner {
    tx: mpsc::UnboundedSender<Command>,
    deps: RunnerDeps,
    editor: Arc<ChartEditor>,
}

impl TaskRunner {
    /// Start the event loop on the current tokio runtime.
    pub fn spawn(deps: RunnerDeps, config: RunnerConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let editor = Arc::new(ChartEditor::new(deps.traces.clone(), deps.clock.clone()));
        let event_loop = EventLoop {
            registry: TaskRegistry::new(),
            deps: deps.clone(),
            editor: editor.clone(),
            tx: tx.clone(),
            retention: chrono::Duration::from_std(config.retention)
                .unwrap_or(chrono::Duration::MAX),
        };
        tokio::spawn(event_loop.run(rx, config.sweep_interval));
        Self { tx, deps, editor }
    }

    /// Register and start a task. Returns as soon as it is running.
    pub async fn submit(&self, config: PipelineConfig) -> Result<String, TaskError> {
        self.request(|reply| Command::Submit { config, reply }).await
    }

    pub async fn subscribe(&self, task_id: &str) -> Result<TaskStream, TaskError> {
        let task_id = task_id.to_string();
        let rx = self
            .request(|reply| Command::Subscribe { task_id, reply })
            .await?;
        Ok(TaskStream { rx, ended: false })
    }

    pub async fn snapshot(&self, task_id: &str) -> Result<TaskSnapshot, TaskError> {
        let task_id = task_id.to_string();
        self.request(|reply| Command::Snapshot { task_id, reply }).await
    }

    /// The stored trace of a finished task.
    pub fn trace(&self, task_id: &str) -> Result<TraceRecord, TaskError> {
        Ok(self.deps.traces.require(task_id)?)
    }

    pub fn traces(&self) -> &Arc<TraceStore> {
        &self.deps.traces
    }

    pub fn profiles(&self) -> &Arc<ProfileStore> {
        &self.deps.profiles
    }

    /// Chart editor whose heads the runner commits when a task completes.
    pub fn editor(&self) -> &Arc<ChartEditor> {
        &self.editor
    }

    /// Run an eviction pass now. Returns how many tasks were dropped.
    pub async fn sweep(&self) -> Result<usize, TaskError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Sweep { reply: Some(reply) })
            .map_err(|_| TaskError::RunnerClosed)?;
        rx.await.map_err(|_| TaskError::RunnerClosed)
    }

    /// Stop the event loop. Later calls fail with `RunnerClosed`.
    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, TaskError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).map_err(|_| TaskError::RunnerClosed)?;
        rx.await.map_err(|_| TaskError::RunnerClosed)?
    }
}

struct EventLoop {
    registry: TaskRegistry,
    deps: RunnerDeps,
    editor: Arc<ChartEditor>,
    tx: mpsc::UnboundedSender<Command>,
    retention: chrono::Duration,
}

impl EventLoop {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>, sweep_interval: Duration) {
        let mut sweep = tokio::time::interval(sweep_interval.max(Duration::from_millis(1)));
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!("task runner started");

        loop {
            tokio::select! {
                command = rx.recv() => {
                    match command {
                        Some(Command::Shutdown) | None => break,
                        Some(command) => self.handle(command),
                    }
                }
                _ = sweep.tick() => {
                    self.sweep();
                }
            }
        }
        tracing::info!(tasks = self.registry.len(), "task runner stopped");
    }

    fn handle(&mut self, command: Command) {
        let now = self.deps.clock.now();
        match command {
            Command::Submit { config, reply } => {
                let _ = reply.send(self.submit(config));
            }
            Command::Emit { task_id, event } => {
                if let Err(e) = self.registry.emit(&task_id, event, now) {
                    tracing::warn!(task_id = %task_id, error = %e, "dropping event");
                }
            }
            Command::Complete { task_id, result } => {
                if let Err(e) = self.registry.complete(&task_id, *result, now) {
                    tracing::warn!(task_id = %task_id, error = %e, "dropping completion");
                } else {
                    tracing::info!(task_id = %task_id, "task completed");
                }
            }
            Command::Fail { task_id, failure } => {
                tracing::warn!(
                    task_id = %task_id,
                    error_type = %failure.error_type,
                    error = %failure.error_message,
                    "task failed"
                );
                if let Err(e) = self.registry.fail(&task_id, failure, now) {
                    tracing::warn!(task_id = %task_id, error = %e, "dropping failure");
                }
            }
            Command::Subscribe { task_id, reply } => {
                let _ = reply.send(self.registry.subscribe(&task_id));
            }
            Command::Snapshot { task_id, reply } => {
                let _ = reply.send(self.registry.snapshot(&task_id));
            }
            Command::Sweep { reply } => {
                let evicted = self.sweep();
                if let Some(reply) = reply {
                    let _ = reply.send(evicted);
                }
            }
            Command::Shutdown => {}
        }
    }

    fn submit(&mut self, mut config: PipelineConfig) -> Result<String, TaskError> {
        if let Some(task_id) = &config.task_id
            && !is_valid_task_id(task_id)
        {
            return Err(TaskError::InvalidId {
                task_id: task_id.clone(),
            });
        }
        let task_id = config
            .task_id
            .clone()
            .unwrap_or_else(|| format!("task_{}", Uuid::new_v4().simple()));
        self.registry.start(&task_id, self.deps.clock.now())?;
        config.task_id = Some(task_id.clone());
        tracing::info!(task_id = %task_id, dataset_id = %config.dataset_id, "task submitted");

        let worker = {
            let task_id = task_id.clone();
            let deps = self.deps.clone();
            let editor = self.editor.clone();
            let tx = self.tx.clone();
            tokio::task::spawn_blocking(move || run_task(&task_id, &config, &deps, &editor, &tx))
        };

        // a panicking run still ends its task
        let tx = self.tx.clone();
        let monitored = task_id.clone();
        tokio::spawn(async move {
            if let Err(e) = worker.await {
                let _ = tx.send(Command::Fail {
                    task_id: monitored,
                    failure: TaskFailure {
                        error_type: "Panic".to_string(),
                        error_message: e.to_string(),
                    },
                });
            }
        });
        Ok(task_id)
    }

    fn sweep(&mut self) -> usize {
        let evicted = self
            .registry
            .evict_expired(self.deps.clock.now(), self.retention);
        if !evicted.is_empty() {
            tracing::info!(count = evicted.len(), "evicted finished tasks");
        }
        evicted.len()
    }
}

/// Body of one pipeline run on the blocking pool.
fn run_task(
    task_id: &str,
    config: &PipelineConfig,
    deps: &RunnerDeps,
    editor: &ChartEditor,
    tx: &mpsc::UnboundedSender<Command>,
) {
    let tracer = SpanTracer::new(deps.clock.clone());
    let ctx = StageContext::new(task_id, &config.dataset_id, &tracer);

    let mut progress = |node: &str, outcome: &StageOutcome| {
        let _ = tx.send(Command::Emit {
            task_id: task_id.to_string(),
            event: TaskEvent::NodeCompleted {
                task_id: task_id.to_string(),
                node: node.to_string(),
                span: Box::new(outcome.span.clone()),
            },
        });
    };

    let orchestrator = (deps.pipeline)();
    let command = match run_pipeline(orchestrator, config, &ctx, Some(&mut progress)) {
        Ok(outcome) => match finish(task_id, outcome, deps) {
            Ok(result) => {
                editor.commit(task_id, result.chart_hash.clone());
                Command::Complete {
                    task_id: task_id.to_string(),
                    result: Box::new(result),
                }
            }
            Err(failure) => Command::Fail {
                task_id: task_id.to_string(),
                failure,
            },
        },
        Err(err) => {
            if let Some(trace) = failure_trace(&tracer, task_id, &config.dataset_id, &err)
                && let Err(e) = deps.traces.save(task_id, trace)
            {
                tracing::warn!(task_id, error = %e, "failed to store failure trace");
            }
            Command::Fail {
                task_id: task_id.to_string(),
                failure: err.to_failure(),
            }
        }
    };
    let _ = tx.send(command);
}

/// Apply the initial patch to a successful run's chart, then persist the
/// run. Nothing is stored when the patch fails.
fn finish(task_id: &str, outcome: PipelineOutcome, deps: &RunnerDeps) -> Result<TaskResult, TaskFailure> {
    let engine = PatchEngine::new();
    let document = outcome.chart.to_document().map_err(|e| TaskFailure {
        error_type: "SerializationError".to_string(),
        error_message: e.to_string(),
    })?;
    let chart_state = ChartState::new(document)
        .apply(&engine, outcome.initial_patch)
        .map_err(|e| TaskFailure {
            error_type: e.error_class().to_string(),
            error_message: e.to_string(),
        })?;
    let chart_hash = chart_state.hash(&engine);

    let store_failure = |e: crate::errors::StoreError| TaskFailure {
        error_type: "StoreError".to_string(),
        error_message: e.to_string(),
    };
    deps.profiles
        .save(&outcome.profile.dataset_id, outcome.profile.clone())
        .map_err(store_failure)?;
    deps.traces
        .save(task_id, outcome.trace)
        .map_err(store_failure)?;

    Ok(TaskResult {
        profile: outcome.profile,
        plan: outcome.plan,
        table: outcome.table,
        chart: outcome.chart,
        chart_state,
        chart_hash,
        explanation: outcome.explanation,
    })
}
