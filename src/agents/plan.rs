use serde_json::json;
use uuid::Uuid;
use vizflow_common::{ChartPlan, DatasetProfile, FieldKind, SpanSlo};

use crate::errors::StageError;
use crate::pipeline::stage::{
    Stage, StageContext, StageOutcome, StageOutput, StagePayload, TracedOutput, traced,
};
use crate::trace::{SpanRequest, SpanUpdate};

#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub profile: DatasetProfile,
    pub user_goal: String,
}

/// Picks the fields to plot and a chart template.
///
/// A temporal field is preferred and gives a line chart; otherwise the first
/// dimension is compared with a bar chart. Without a measure rows are counted.
pub struct PlanRefiner;

const PLANNER_MODEL: &str = "rule-based";
const PLANNER_PROMPT_VERSION: &str = "v1";

impl Stage for PlanRefiner {
    fn name(&self) -> &str {
        "plan_refiner"
    }

    fn slo(&self) -> SpanSlo {
        SpanSlo::new(2000, 1)
    }

    fn execute(&self, ctx: &StageContext<'_>, payload: StagePayload) -> Result<StageOutcome, StageError> {
        let request = payload.into_plan()?;
        let span = SpanRequest::new("plan.refine", self.name(), self.slo())
            .with_model(PLANNER_MODEL, PLANNER_PROMPT_VERSION);
        traced(ctx, span, |_| {
            let plan = build_plan(&request)?;
            tracing::info!(
                task_id = ctx.task_id,
                template = %plan.template_id,
                dimension = %plan.dimension,
                "plan refined"
            );
            let detail = json!({
                "template_id": plan.template_id,
                "dimension": plan.dimension,
                "measure": plan.measure,
            });
            Ok(TracedOutput::new(StageOutput::Plan(plan))
                .with_update(SpanUpdate {
                    dataset_hash: Some(request.profile.dataset_hash.clone()),
                    ..Default::default()
                })
                .with_detail(detail))
        })
    }
}

fn build_plan(request: &PlanRequest) -> Result<ChartPlan, StageError> {
    let profile = &request.profile;
    let first = |kind| profile.fields_of(kind).next().map(|f| f.name.clone());
    let measure = first(FieldKind::Measure);
    let temporal = first(FieldKind::Temporal);

    let (template_id, dimension) = match (temporal, first(FieldKind::Dimension)) {
        (Some(t), _) => ("line_basic", t),
        (None, Some(d)) => ("bar_basic", d),
        (None, None) => {
            return Err(StageError::InvalidInput(format!(
                "dataset {} has no dimension or temporal field to group by",
                profile.dataset_id
            )));
        }
    };

    Ok(ChartPlan {
        plan_id: Uuid::new_v4().to_string(),
        dataset_id: profile.dataset_id.clone(),
        user_goal: request.user_goal.clone(),
        template_id: template_id.to_string(),
        dimension,
        aggregation: if measure.is_some() { "sum" } else { "count" }.to_string(),
        measure,
    })
}
