//! The built-in `scan → plan → transform → chart → explain` pipeline.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::json;
use vizflow_common::{
    ChartPlan, ChartSpec, DatasetProfile, Explanation, OutputTable, Patch, PatchOp, Span,
    TraceRecord,
};

use super::orchestrator::{Orchestrator, ProgressFn, StageNode};
use super::stage::{SharedInputs, StageContext, StageOutputs, StagePayload};
use crate::agents::{
    ChartRecommender, ChartRequest, DatasetScanner, ExplainRequest, ExplanationAgent, PlanRefiner,
    PlanRequest, ScanRequest, TransformExecutor, TransformRequest,
};
use crate::errors::{PipelineError, StageError};
use crate::trace::SpanTracer;

pub const NODES: [&str; 5] = ["scan", "plan", "transform", "chart", "explain"];

fn default_sample_limit() -> usize {
    500
}

fn default_version() -> String {
    "1".to_string()
}

/// Everything needed to run the pipeline over one dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Generated by the runner when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub dataset_id: String,
    #[serde(default)]
    pub dataset_name: String,
    #[serde(default = "default_version")]
    pub dataset_version: String,
    pub dataset_path: PathBuf,
    #[serde(default = "default_sample_limit")]
    pub sample_limit: usize,
    pub user_goal: String,
}

impl PipelineConfig {
    pub fn new(dataset_path: impl Into<PathBuf>, user_goal: impl Into<String>) -> Self {
        let dataset_path = dataset_path.into();
        let dataset_id = dataset_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "dataset".to_string());
        Self {
            task_id: None,
            dataset_name: dataset_id.clone(),
            dataset_id,
            dataset_version: default_version(),
            dataset_path,
            sample_limit: default_sample_limit(),
            user_goal: user_goal.into(),
        }
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_sample_limit(mut self, sample_limit: usize) -> Self {
        self.sample_limit = sample_limit;
        self
    }

    fn shared_inputs(&self) -> SharedInputs {
        SharedInputs::new()
            .with("dataset_id", json!(self.dataset_id))
            .with("dataset_name", json!(self.dataset_name))
            .with("dataset_version", json!(self.dataset_version))
            .with("dataset_path", json!(self.dataset_path.to_string_lossy()))
            .with("sample_limit", json!(self.sample_limit))
            .with("user_goal", json!(self.user_goal))
    }
}

/// Typed artifacts of a successful run plus its trace.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub profile: DatasetProfile,
    pub plan: ChartPlan,
    pub table: OutputTable,
    pub chart: ChartSpec,
    pub explanation: Explanation,
    pub trace: TraceRecord,
    /// First edit applied to the recommended chart.
    pub initial_patch: Patch,
}

/// Wire up the built-in stages.
pub fn build_orchestrator() -> Orchestrator {
    Orchestrator::new(builtin_nodes())
}

/// The built-in nodes in run order, named as in [`NODES`].
pub fn builtin_nodes() -> Vec<StageNode> {
    vec![
        StageNode::new("scan", DatasetScanner, |shared, _| {
            Ok(StagePayload::Scan(ScanRequest {
                dataset_id: shared.str("dataset_id")?.to_string(),
                dataset_name: shared.str("dataset_name")?.to_string(),
                dataset_version: shared.str("dataset_version")?.to_string(),
                path: PathBuf::from(shared.str("dataset_path")?),
            }))
        }),
        StageNode::new("plan", PlanRefiner, |shared, outputs| {
            Ok(StagePayload::Plan(PlanRequest {
                profile: outputs.profile("scan")?.clone(),
                user_goal: shared.str("user_goal")?.to_string(),
            }))
        }),
        StageNode::new("transform", TransformExecutor, |shared, outputs| {
            Ok(StagePayload::Transform(TransformRequest {
                plan: outputs.plan("plan")?.clone(),
                dataset_path: PathBuf::from(shared.str("dataset_path")?),
                sample_limit: shared.u64("sample_limit")? as usize,
            }))
        }),
        StageNode::new("chart", ChartRecommender, |_, outputs| {
            Ok(StagePayload::Chart(ChartRequest {
                plan: outputs.plan("plan")?.clone(),
                table_id: "transform".to_string(),
                row_count: outputs.table("transform")?.row_count(),
            }))
        }),
        StageNode::new("explain", ExplanationAgent, |_, outputs| {
            Ok(StagePayload::Explain(ExplainRequest {
                profile: outputs.profile("scan")?.clone(),
                plan: outputs.plan("plan")?.clone(),
                chart_id: outputs.chart("chart")?.chart_id.clone(),
                transform_preview: outputs.table("transform")?.clone(),
            }))
        }),
    ]
}

/// Run the built-in pipeline for `config` under `ctx`.
pub fn execute_pipeline(
    config: &PipelineConfig,
    ctx: &StageContext<'_>,
    progress: Option<ProgressFn<'_>>,
) -> Result<PipelineOutcome, PipelineError> {
    run_pipeline(build_orchestrator(), config, ctx, progress)
}

/// Run `orchestrator` and collect the artifacts of a successful run. The
/// nodes must leave their outputs under the names in [`NODES`]; a missing
/// one fails the run with `MissingOutput`.
pub fn run_pipeline(
    mut orchestrator: Orchestrator,
    config: &PipelineConfig,
    ctx: &StageContext<'_>,
    progress: Option<ProgressFn<'_>>,
) -> Result<PipelineOutcome, PipelineError> {
    let result = orchestrator.run(ctx, &config.shared_inputs(), progress)?;

    let outputs = result.outputs;
    let artifacts = collect(&outputs).map_err(|(node, source)| PipelineError::Stage {
        node: node.to_string(),
        source,
        spans: result.spans.clone(),
    })?;
    let (profile, plan, table, chart, explanation) = artifacts;

    let trace = ctx
        .tracer
        .build_trace(ctx.task_id, &config.dataset_id, result.spans)?;
    let initial_patch = initial_patch(&chart, &config.user_goal);

    Ok(PipelineOutcome {
        profile,
        plan,
        table,
        chart,
        explanation,
        trace,
        initial_patch,
    })
}

type Artifacts = (DatasetProfile, ChartPlan, OutputTable, ChartSpec, Explanation);

fn collect(outputs: &StageOutputs) -> Result<Artifacts, (&'static str, StageError)> {
    let profile = outputs.profile("scan").map_err(|e| ("scan", e))?;
    let plan = outputs.plan("plan").map_err(|e| ("plan", e))?;
    let table = outputs.table("transform").map_err(|e| ("transform", e))?;
    let chart = outputs.chart("chart").map_err(|e| ("chart", e))?;
    let explanation = outputs.explanation("explain").map_err(|e| ("explain", e))?;
    Ok((
        profile.clone(),
        plan.clone(),
        table.clone(),
        chart.clone(),
        explanation.clone(),
    ))
}

fn initial_patch(chart: &ChartSpec, user_goal: &str) -> Patch {
    Patch::new(
        chart.chart_id.clone(),
        vec![PatchOp::add(
            &["parameters", "notes"],
            json!(format!("initial render for {}", user_goal)),
        )],
    )
    .with_rationale("initial render")
}

/// Trace for a failed run: the failed parent span followed by the spans of
/// the stages that completed. `None` when the run failed before any span.
pub fn failure_trace(
    tracer: &SpanTracer,
    task_id: &str,
    dataset_id: &str,
    err: &PipelineError,
) -> Option<TraceRecord> {
    let spans: Vec<Span> = err.spans().to_vec();
    tracer.build_trace(task_id, dataset_id, spans).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::fixtures;
    use crate::clock::SteppingClock;
    use crate::patch::{ChartState, PatchEngine};
    use chrono::Utc;
    use std::sync::Arc;
    use vizflow_common::SpanStatus;

    fn tracer() -> SpanTracer {
        SpanTracer::new(Arc::new(SteppingClock::new(Utc::now(), 3)))
    }

    #[test]
    fn test_pipeline_produces_all_artifacts() {
        let (_dir, path) = fixtures::dataset(fixtures::SALES);
        let config = PipelineConfig::new(&path, "revenue over time").with_task_id("task_1");
        let tracer = tracer();
        let ctx = StageContext::new("task_1", &config.dataset_id, &tracer);

        let mut completed = Vec::new();
        let mut progress = |node: &str, _: &crate::pipeline::StageOutcome| completed.push(node.to_string());
        let outcome = execute_pipeline(&config, &ctx, Some(&mut progress)).unwrap();
        assert_eq!(completed, NODES);

        assert_eq!(outcome.profile.dataset_id, "dataset");
        assert_eq!(outcome.profile.row_count, 4);
        assert_eq!(outcome.plan.template_id, "line_basic");
        assert_eq!(outcome.table.row_count(), 3);
        assert_eq!(outcome.explanation.chart_id, outcome.chart.chart_id);

        let trace = &outcome.trace;
        assert_eq!(trace.task_id, "task_1");
        assert_eq!(trace.spans.len(), NODES.len() + 1);
        assert!(trace.validate().is_ok());
        let ops: Vec<_> = trace.spans.iter().map(|s| s.operation.as_str()).collect();
        assert_eq!(
            ops,
            vec![
                "orchestrate.run",
                "data.scan",
                "plan.refine",
                "transform.execute",
                "chart.recommend",
                "explain.summarize"
            ]
        );
    }

    #[test]
    fn test_initial_patch_applies_to_chart() {
        let (_dir, path) = fixtures::dataset(fixtures::REGIONS);
        let config = PipelineConfig::new(&path, "units by region");
        let tracer = tracer();
        let ctx = StageContext::new("task_2", &config.dataset_id, &tracer);
        let outcome = execute_pipeline(&config, &ctx, None).unwrap();

        assert_eq!(outcome.initial_patch.target_chart_id, outcome.chart.chart_id);
        let state = ChartState::new(outcome.chart.to_document().unwrap())
            .apply(&PatchEngine::new(), outcome.initial_patch.clone())
            .unwrap();
        assert_eq!(state.chart["parameters"]["notes"], "initial render for units by region");
    }

    #[test]
    fn test_missing_dataset_fails_in_scan() {
        let config = PipelineConfig::new("/nonexistent/sales.json", "goal");
        let tracer = tracer();
        let ctx = StageContext::new("task_3", &config.dataset_id, &tracer);
        let err = execute_pipeline(&config, &ctx, None).unwrap_err();

        let failure = err.to_failure();
        assert_eq!(failure.error_type, "IoError");
        let trace = failure_trace(&tracer, "task_3", "sales", &err).unwrap();
        assert_eq!(trace.spans.len(), 1);
        assert_eq!(trace.spans[0].status, SpanStatus::Failed);
        assert_eq!(trace.spans[0].abort_reason.as_deref(), Some("IoError"));
    }

    #[test]
    fn test_config_defaults_from_json() {
        let config: PipelineConfig = serde_json::from_value(json!({
            "dataset_id": "sales",
            "dataset_path": "data/sales.json",
            "user_goal": "compare"
        }))
        .unwrap();
        assert_eq!(config.sample_limit, 500);
        assert_eq!(config.dataset_version, "1");
        assert!(config.task_id.is_none());
    }
}
