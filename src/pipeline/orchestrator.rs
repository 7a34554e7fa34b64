//! Sequential stage orchestrator.
//!
//! Runs an ordered list of named stages under one `orchestrate.run` parent
//! span. Each stage's payload is built from the shared inputs plus every
//! earlier stage's output. The first failing stage fails the parent span and
//! ends the run; no partial outputs are returned.

use std::fmt;

use serde_json::{Value, json};
use vizflow_common::{Span, SpanSlo};

use super::stage::{SharedInputs, Stage, StageContext, StageOutcome, StageOutputs, StagePayload};
use crate::errors::{PipelineError, StageError};
use crate::trace::{SpanFinish, SpanRequest};

pub const RUN_OPERATION: &str = "orchestrate.run";
pub const ORCHESTRATOR_AGENT: &str = "orchestrator";
pub const POLICY: &str = "best_effort";

/// Builds a stage's payload from shared inputs and the outputs so far.
pub type PayloadBuilder =
    Box<dyn Fn(&SharedInputs, &StageOutputs) -> Result<StagePayload, StageError> + Send + Sync>;

/// Called after each stage completes, with the stage name and its outcome.
pub type ProgressFn<'a> = &'a mut dyn FnMut(&str, &StageOutcome);

/// A named stage and the builder for its payload.
pub struct StageNode {
    name: String,
    stage: Box<dyn Stage>,
    build: PayloadBuilder,
}

impl StageNode {
    pub fn new<S, F>(name: impl Into<String>, stage: S, build: F) -> Self
    where
        S: Stage + 'static,
        F: Fn(&SharedInputs, &StageOutputs) -> Result<StagePayload, StageError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            stage: Box::new(stage),
            build: Box::new(build),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Idle,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrchestratorState::Idle => "idle",
            OrchestratorState::Running => "running",
            OrchestratorState::Completed => "completed",
            OrchestratorState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Outputs of a successful run. `spans[0]` is the parent span.
#[derive(Debug, Clone)]
pub struct OrchestratorResult {
    pub outputs: StageOutputs,
    pub spans: Vec<Span>,
    pub parent_span_id: String,
}

/// Runs its stages once, in order.
pub struct Orchestrator {
    nodes: Vec<StageNode>,
    state: OrchestratorState,
}

impl Orchestrator {
    pub fn new(nodes: Vec<StageNode>) -> Self {
        Self {
            nodes,
            state: OrchestratorState::Idle,
        }
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    pub fn node_names(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.name.clone()).collect()
    }

    /// Execute every stage. Only valid from `Idle`.
    pub fn run(
        &mut self,
        ctx: &StageContext<'_>,
        shared: &SharedInputs,
        mut progress: Option<ProgressFn<'_>>,
    ) -> Result<OrchestratorResult, PipelineError> {
        if self.state != OrchestratorState::Idle {
            return Err(PipelineError::AlreadyRun {
                state: self.state.to_string(),
            });
        }
        self.state = OrchestratorState::Running;

        let names = self.node_names();
        let slos: Vec<SpanSlo> = self.nodes.iter().map(|n| n.stage.slo()).collect();
        let request = SpanRequest::new(RUN_OPERATION, ORCHESTRATOR_AGENT, SpanSlo::total(&slos))
            .with_parent(ctx.parent_span_id)
            .with_start_detail(json!({ "nodes": names, "policy": POLICY }));
        let parent_span_id = match ctx.tracer.start_span(request) {
            Ok(id) => id,
            Err(e) => {
                self.state = OrchestratorState::Failed;
                return Err(e.into());
            }
        };
        tracing::info!(
            task_id = ctx.task_id,
            span_id = %parent_span_id,
            nodes = names.len(),
            "orchestrator run started"
        );

        let child_ctx = ctx.with_parent(&parent_span_id);
        let mut outputs = StageOutputs::new();
        let mut spans = Vec::with_capacity(self.nodes.len() + 1);

        for node in &self.nodes {
            let result = (node.build)(shared, &outputs)
                .and_then(|payload| node.stage.execute(&child_ctx, payload));
            match result {
                Ok(outcome) => {
                    if let Some(progress) = progress.as_deref_mut() {
                        progress(&node.name, &outcome);
                    }
                    spans.push(outcome.span);
                    outputs.insert(&node.name, outcome.output);
                }
                Err(source) => {
                    self.state = OrchestratorState::Failed;
                    let detail = run_detail(&names, Some((&node.name, &source)));
                    let parent = ctx.tracer.finish_span(
                        &parent_span_id,
                        SpanFinish::failed(source.error_type()).with_detail(detail),
                    )?;
                    tracing::warn!(
                        task_id = ctx.task_id,
                        node = %node.name,
                        error = %source,
                        "orchestrator run failed"
                    );
                    spans.insert(0, parent);
                    return Err(PipelineError::Stage {
                        node: node.name.clone(),
                        source,
                        spans,
                    });
                }
            }
        }

        let still_open = ctx.tracer.open_spans();
        if still_open.len() > 1 {
            tracing::warn!(
                task_id = ctx.task_id,
                open = still_open.len() - 1,
                "stages left spans open"
            );
        }

        let parent = match ctx.tracer.finish_span(
            &parent_span_id,
            SpanFinish::success().with_detail(run_detail(&names, None)),
        ) {
            Ok(span) => span,
            Err(e) => {
                self.state = OrchestratorState::Failed;
                return Err(e.into());
            }
        };
        spans.insert(0, parent);
        self.state = OrchestratorState::Completed;
        tracing::info!(task_id = ctx.task_id, spans = spans.len(), "orchestrator run completed");

        Ok(OrchestratorResult {
            outputs,
            spans,
            parent_span_id,
        })
    }
}

fn run_detail(names: &[String], failed: Option<(&str, &StageError)>) -> Value {
    let mut detail = json!({ "nodes": names, "policy": POLICY });
    if let Some((node, err)) = failed {
        detail["failed_node"] = json!(node);
        detail["message"] = json!(err.message());
    }
    detail
}
