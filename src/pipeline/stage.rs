//! Stage contract and the typed accumulator stages read their inputs from.

use std::collections::BTreeMap;

use serde_json::{Value, json};
use vizflow_common::{ChartPlan, ChartSpec, DatasetProfile, Explanation, OutputTable, Span, SpanSlo};

use crate::agents::{ChartRequest, ExplainRequest, PlanRequest, ScanRequest, TransformRequest};
use crate::clock::Clock;
use crate::errors::StageError;
use crate::trace::{SpanFinish, SpanRequest, SpanTracer, SpanUpdate};

/// Per-run context handed to every stage.
#[derive(Clone, Copy)]
pub struct StageContext<'a> {
    pub task_id: &'a str,
    pub dataset_id: &'a str,
    pub tracer: &'a SpanTracer,
    pub clock: &'a dyn Clock,
    pub parent_span_id: Option<&'a str>,
}

impl<'a> StageContext<'a> {
    pub fn new(task_id: &'a str, dataset_id: &'a str, tracer: &'a SpanTracer) -> Self {
        Self {
            task_id,
            dataset_id,
            tracer,
            clock: tracer.clock(),
            parent_span_id: None,
        }
    }

    pub fn with_parent(self, parent_span_id: &'a str) -> Self {
        Self {
            parent_span_id: Some(parent_span_id),
            ..self
        }
    }
}

/// Output of one stage.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutput {
    Profile(DatasetProfile),
    Plan(ChartPlan),
    Table(OutputTable),
    Chart(ChartSpec),
    Explanation(Explanation),
    Value(Value),
}

impl StageOutput {
    pub fn kind(&self) -> &'static str {
        match self {
            StageOutput::Profile(_) => "profile",
            StageOutput::Plan(_) => "plan",
            StageOutput::Table(_) => "table",
            StageOutput::Chart(_) => "chart",
            StageOutput::Explanation(_) => "explanation",
            StageOutput::Value(_) => "value",
        }
    }
}

/// Input of one stage, built from shared inputs and earlier outputs.
#[derive(Debug, Clone)]
pub enum StagePayload {
    Scan(ScanRequest),
    Plan(PlanRequest),
    Transform(TransformRequest),
    Chart(ChartRequest),
    Explain(ExplainRequest),
    Value(Value),
}

impl StagePayload {
    fn kind(&self) -> &'static str {
        match self {
            StagePayload::Scan(_) => "scan",
            StagePayload::Plan(_) => "plan",
            StagePayload::Transform(_) => "transform",
            StagePayload::Chart(_) => "chart",
            StagePayload::Explain(_) => "explain",
            StagePayload::Value(_) => "value",
        }
    }

    fn mismatch(&self, expected: &str) -> StageError {
        StageError::InvalidInput(format!("expected a {} payload, got {}", expected, self.kind()))
    }

    pub fn into_scan(self) -> Result<ScanRequest, StageError> {
        match self {
            StagePayload::Scan(r) => Ok(r),
            other => Err(other.mismatch("scan")),
        }
    }

    pub fn into_plan(self) -> Result<PlanRequest, StageError> {
        match self {
            StagePayload::Plan(r) => Ok(r),
            other => Err(other.mismatch("plan")),
        }
    }

    pub fn into_transform(self) -> Result<TransformRequest, StageError> {
        match self {
            StagePayload::Transform(r) => Ok(r),
            other => Err(other.mismatch("transform")),
        }
    }

    pub fn into_chart(self) -> Result<ChartRequest, StageError> {
        match self {
            StagePayload::Chart(r) => Ok(r),
            other => Err(other.mismatch("chart")),
        }
    }

    pub fn into_explain(self) -> Result<ExplainRequest, StageError> {
        match self {
            StagePayload::Explain(r) => Ok(r),
            other => Err(other.mismatch("explain")),
        }
    }

    pub fn into_value(self) -> Result<Value, StageError> {
        match self {
            StagePayload::Value(v) => Ok(v),
            other => Err(other.mismatch("value")),
        }
    }
}

/// Outputs of the stages run so far, in run order, keyed by stage name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageOutputs {
    entries: Vec<(String, StageOutput)>,
}

macro_rules! typed_accessor {
    ($fn_name:ident, $variant:ident, $ty:ty, $expected:literal) => {
        pub fn $fn_name(&self, name: &str) -> Result<&$ty, StageError> {
            match self.require(name)? {
                StageOutput::$variant(inner) => Ok(inner),
                other => Err(StageError::OutputType {
                    name: name.to_string(),
                    expected: $expected,
                    actual: other.kind(),
                }),
            }
        }
    };
}

impl StageOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a stage's output. A repeated name replaces the earlier output.
    pub fn insert(&mut self, name: &str, output: StageOutput) {
        match self.entries.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = output,
            None => self.entries.push((name.to_string(), output)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&StageOutput> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, o)| o)
    }

    pub fn require(&self, name: &str) -> Result<&StageOutput, StageError> {
        self.get(name)
            .ok_or_else(|| StageError::MissingOutput(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    typed_accessor!(profile, Profile, DatasetProfile, "profile");
    typed_accessor!(plan, Plan, ChartPlan, "plan");
    typed_accessor!(table, Table, OutputTable, "table");
    typed_accessor!(chart, Chart, ChartSpec, "chart");
    typed_accessor!(explanation, Explanation, Explanation, "explanation");
    typed_accessor!(value, Value, Value, "value");
}

/// External inputs available to every payload builder.
#[derive(Debug, Clone, Default)]
pub struct SharedInputs {
    values: BTreeMap<String, Value>,
}

impl SharedInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.values.insert(key.to_string(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn str(&self, key: &str) -> Result<&str, StageError> {
        self.get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| StageError::InvalidInput(format!("shared input '{}' must be a string", key)))
    }

    pub fn u64(&self, key: &str) -> Result<u64, StageError> {
        self.get(key)
            .and_then(Value::as_u64)
            .ok_or_else(|| StageError::InvalidInput(format!("shared input '{}' must be an integer", key)))
    }
}

/// What a stage returns: its output plus the span it recorded.
#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub output: StageOutput,
    pub span_id: String,
    pub span: Span,
}

/// One step of a pipeline.
///
/// A stage opens and finishes its own span through `ctx.tracer`, parented to
/// `ctx.parent_span_id`, and must not leave it open on either path.
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    fn slo(&self) -> SpanSlo;

    fn execute(&self, ctx: &StageContext<'_>, payload: StagePayload) -> Result<StageOutcome, StageError>;
}

/// Result of the traced body of a stage.
pub struct TracedOutput {
    pub output: StageOutput,
    pub update: SpanUpdate,
    pub detail: Option<Value>,
}

impl TracedOutput {
    pub fn new(output: StageOutput) -> Self {
        Self {
            output,
            update: SpanUpdate::default(),
            detail: None,
        }
    }

    pub fn with_update(mut self, update: SpanUpdate) -> Self {
        self.update = update;
        self
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

/// Run `body` inside a span opened from `request` under the context's parent.
///
/// The span is finished on both paths. On error it is marked failed with the
/// error's type as failure category and the error is returned unchanged.
pub fn traced<F>(
    ctx: &StageContext<'_>,
    request: SpanRequest,
    body: F,
) -> Result<StageOutcome, StageError>
where
    F: FnOnce(&str) -> Result<TracedOutput, StageError>,
{
    let tracer = ctx.tracer;
    let operation = request.operation.clone();
    let span_id = tracer.start_span(request.with_parent(ctx.parent_span_id))?;

    match body(&span_id) {
        Ok(done) => {
            tracer.update_span(&span_id, done.update)?;
            let mut finish = SpanFinish::success();
            if let Some(detail) = done.detail {
                finish = finish.with_detail(detail);
            }
            let span = tracer.finish_span(&span_id, finish)?;
            tracing::debug!(task_id = ctx.task_id, operation = %operation, "stage finished");
            Ok(StageOutcome {
                output: done.output,
                span_id,
                span,
            })
        }
        Err(err) => {
            tracer.finish_span(
                &span_id,
                SpanFinish::failed(err.error_type())
                    .with_detail(json!({ "message": err.message() })),
            )?;
            tracing::warn!(task_id = ctx.task_id, operation = %operation, error = %err, "stage failed");
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SteppingClock;
    use chrono::Utc;
    use std::sync::Arc;
    use vizflow_common::SpanStatus;

    fn tracer() -> SpanTracer {
        SpanTracer::new(Arc::new(SteppingClock::new(Utc::now(), 1)))
    }

    #[test]
    fn test_outputs_typed_access() {
        let mut outputs = StageOutputs::new();
        outputs.insert("notes", StageOutput::Value(json!({"n": 1})));
        assert_eq!(outputs.value("notes").unwrap()["n"], 1);

        match outputs.plan("notes") {
            Err(StageError::OutputType {
                expected, actual, ..
            }) => {
                assert_eq!(expected, "plan");
                assert_eq!(actual, "value");
            }
            other => panic!("Expected OutputType, got {:?}", other.map(|p| p.plan_id.clone())),
        }
        assert!(matches!(
            outputs.profile("scan"),
            Err(StageError::MissingOutput(name)) if name == "scan"
        ));
    }

    #[test]
    fn test_outputs_keep_run_order() {
        let mut outputs = StageOutputs::new();
        outputs.insert("b", StageOutput::Value(json!(1)));
        outputs.insert("a", StageOutput::Value(json!(2)));
        outputs.insert("b", StageOutput::Value(json!(3)));
        assert_eq!(outputs.names(), vec!["b", "a"]);
        assert_eq!(outputs.value("b").unwrap(), &json!(3));
        assert_eq!(outputs.len(), 2);
    }

    #[test]
    fn test_shared_inputs_accessors() {
        let shared = SharedInputs::new()
            .with("goal", json!("compare regions"))
            .with("limit", json!(10));
        assert_eq!(shared.str("goal").unwrap(), "compare regions");
        assert_eq!(shared.u64("limit").unwrap(), 10);
        assert!(matches!(shared.str("limit"), Err(StageError::InvalidInput(_))));
    }

    #[test]
    fn test_payload_mismatch_is_invalid_input() {
        let err = StagePayload::Value(json!(1)).into_scan().unwrap_err();
        assert_eq!(err.error_type(), "InvalidInput");
        assert!(err.to_string().contains("scan"));
    }

    #[test]
    fn test_traced_finishes_span_on_success() {
        let tracer = tracer();
        let ctx = StageContext::new("task", "ds", &tracer).with_parent("root");
        let outcome = traced(&ctx, SpanRequest::new("data.echo", "echo", SpanSlo::new(10, 0)), |_| {
            Ok(TracedOutput::new(StageOutput::Value(json!("ok"))).with_update(SpanUpdate {
                rows_out: Some(3),
                ..Default::default()
            }))
        })
        .unwrap();
        assert_eq!(outcome.span.parent_span_id.as_deref(), Some("root"));
        assert_eq!(outcome.span.metrics.rows_out, Some(3));
        assert_eq!(outcome.span_id, outcome.span.span_id);
        assert!(tracer.open_spans().is_empty());
    }

    #[test]
    fn test_traced_finishes_span_on_error() {
        let tracer = tracer();
        let ctx = StageContext::new("task", "ds", &tracer);
        let err = traced(&ctx, SpanRequest::new("data.echo", "echo", SpanSlo::new(10, 0)), |_| {
            Err(StageError::raised("ValueError", "bad input"))
        })
        .unwrap_err();
        assert_eq!(err.error_type(), "ValueError");
        assert!(tracer.open_spans().is_empty());
        // the root span was sealed as failed, so it cannot be finished again
        let root = tracer.root_span_id().unwrap();
        assert!(tracer.finish_span(&root, SpanFinish::with_status(SpanStatus::Failed)).is_err());
    }
}
