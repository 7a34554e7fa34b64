use serde_json::{Map, Value, json};
use uuid::Uuid;
use vizflow_common::{ChannelMapping, ChartPlan, ChartSpec, SpanSlo};

use super::transform::value_column;
use crate::errors::StageError;
use crate::pipeline::stage::{
    Stage, StageContext, StageOutcome, StageOutput, StagePayload, TracedOutput, traced,
};
use crate::trace::{SpanRequest, SpanUpdate};

const CHART_ENGINE: &str = "vega-lite";

#[derive(Debug, Clone)]
pub struct ChartRequest {
    pub plan: ChartPlan,
    /// Name of the output that holds the chart's data.
    pub table_id: String,
    pub row_count: u64,
}

/// Binds a plan to a renderable chart spec.
pub struct ChartRecommender;

impl Stage for ChartRecommender {
    fn name(&self) -> &str {
        "chart_recommender"
    }

    fn slo(&self) -> SpanSlo {
        SpanSlo::new(1000, 0)
    }

    fn execute(&self, ctx: &StageContext<'_>, payload: StagePayload) -> Result<StageOutcome, StageError> {
        let request = payload.into_chart()?;
        traced(ctx, SpanRequest::new("chart.recommend", self.name(), self.slo()), |_| {
            let chart = recommend(&request);
            tracing::info!(
                task_id = ctx.task_id,
                chart_id = %chart.chart_id,
                template = %chart.template_id,
                "chart recommended"
            );
            let detail = json!({
                "chart_id": chart.chart_id,
                "template_id": chart.template_id,
                "engine": chart.engine,
            });
            Ok(TracedOutput::new(StageOutput::Chart(chart))
                .with_update(SpanUpdate {
                    rows_in: Some(request.row_count),
                    rows_out: Some(request.row_count),
                    ..Default::default()
                })
                .with_detail(detail))
        })
    }
}

fn recommend(request: &ChartRequest) -> ChartSpec {
    let plan = &request.plan;
    let mut parameters = Map::new();
    parameters.insert("title".into(), Value::String(plan.user_goal.clone()));
    parameters.insert("row_count".into(), json!(request.row_count));

    ChartSpec {
        chart_id: Uuid::new_v4().to_string(),
        template_id: plan.template_id.clone(),
        engine: CHART_ENGINE.to_string(),
        encoding: vec![
            ChannelMapping {
                channel: "x".into(),
                field_name: plan.dimension.clone(),
                aggregation: None,
            },
            ChannelMapping {
                channel: "y".into(),
                field_name: value_column(plan),
                aggregation: Some(plan.aggregation.clone()),
            },
        ],
        data_source: request.table_id.clone(),
        parameters,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SteppingClock;
    use crate::trace::SpanTracer;
    use chrono::Utc;
    use std::sync::Arc;

    fn request(measure: Option<&str>) -> ChartRequest {
        ChartRequest {
            plan: ChartPlan {
                plan_id: "plan_1".into(),
                dataset_id: "sales".into(),
                user_goal: "revenue by region".into(),
                template_id: "bar_basic".into(),
                dimension: "region".into(),
                measure: measure.map(str::to_string),
                aggregation: if measure.is_some() { "sum" } else { "count" }.into(),
            },
            table_id: "transform".into(),
            row_count: 3,
        }
    }

    #[test]
    fn test_encodings_follow_plan() {
        let chart = recommend(&request(Some("revenue")));
        assert_eq!(chart.engine, "vega-lite");
        assert_eq!(chart.template_id, "bar_basic");
        assert_eq!(chart.encoding[0].channel, "x");
        assert_eq!(chart.encoding[0].field_name, "region");
        assert_eq!(chart.encoding[1].field_name, "revenue");
        assert_eq!(chart.encoding[1].aggregation.as_deref(), Some("sum"));
        assert_eq!(chart.data_source, "transform");
        assert_eq!(chart.parameters["title"], "revenue by region");
        assert_eq!(chart.parameters["row_count"], 3);
    }

    #[test]
    fn test_count_plan_plots_count_column() {
        let chart = recommend(&request(None));
        assert_eq!(chart.encoding[1].field_name, "count");
        assert_eq!(chart.encoding[1].aggregation.as_deref(), Some("count"));
    }

    #[test]
    fn test_chart_ids_are_unique() {
        assert_ne!(recommend(&request(None)).chart_id, recommend(&request(None)).chart_id);
    }

    #[test]
    fn test_stage_span() {
        let tracer = SpanTracer::new(Arc::new(SteppingClock::new(Utc::now(), 1)));
        let ctx = StageContext::new("task", "sales", &tracer);
        let outcome = ChartRecommender
            .execute(&ctx, StagePayload::Chart(request(Some("revenue"))))
            .unwrap();
        assert_eq!(outcome.span.operation, "chart.recommend");
        assert_eq!(outcome.span.agent_name, "chart_recommender");
        assert!(matches!(outcome.output, StageOutput::Chart(_)));
    }
}
