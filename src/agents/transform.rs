use std::collections::BTreeMap;
use std::path::PathBuf;

use serde_json::{Map, Value, json};
use vizflow_common::{ChartPlan, OutputTable, SpanSlo};

use super::{Row, cell_key, load_rows};
use crate::errors::StageError;
use crate::pipeline::stage::{
    Stage, StageContext, StageOutcome, StageOutput, StagePayload, TracedOutput, traced,
};
use crate::trace::{SpanRequest, SpanUpdate};

#[derive(Debug, Clone)]
pub struct TransformRequest {
    pub plan: ChartPlan,
    pub dataset_path: PathBuf,
    pub sample_limit: usize,
}

/// Groups rows by the plan's dimension and aggregates the measure.
pub struct TransformExecutor;

impl Stage for TransformExecutor {
    fn name(&self) -> &str {
        "transform_executor"
    }

    fn slo(&self) -> SpanSlo {
        SpanSlo::new(4000, 0)
    }

    fn execute(&self, ctx: &StageContext<'_>, payload: StagePayload) -> Result<StageOutcome, StageError> {
        let request = payload.into_transform()?;
        traced(ctx, SpanRequest::new("transform.execute", self.name(), self.slo()), |_| {
            if request.sample_limit == 0 {
                return Err(StageError::InvalidInput("sample_limit must be positive".into()));
            }
            let (rows, _) = load_rows(&request.dataset_path)?;
            let table = aggregate(&rows, &request.plan, request.sample_limit);
            tracing::info!(
                task_id = ctx.task_id,
                rows_in = rows.len(),
                rows_out = table.rows.len(),
                "transform executed"
            );
            let update = SpanUpdate {
                rows_in: Some(rows.len() as u64),
                rows_out: Some(table.row_count()),
                ..Default::default()
            };
            let detail = json!({
                "dimension": request.plan.dimension,
                "aggregation": request.plan.aggregation,
                "sample_limit": request.sample_limit,
            });
            Ok(TracedOutput::new(StageOutput::Table(table))
                .with_update(update)
                .with_detail(detail))
        })
    }
}

/// Name of the aggregated column for a plan.
pub fn value_column(plan: &ChartPlan) -> String {
    plan.measure.clone().unwrap_or_else(|| "count".to_string())
}

fn aggregate(rows: &[Row], plan: &ChartPlan, sample_limit: usize) -> OutputTable {
    let value_col = value_column(plan);
    let mut groups: BTreeMap<String, f64> = BTreeMap::new();
    for row in rows {
        let slot = groups.entry(cell_key(row.get(&plan.dimension))).or_insert(0.0);
        match &plan.measure {
            Some(measure) => *slot += row.get(measure).and_then(Value::as_f64).unwrap_or(0.0),
            None => *slot += 1.0,
        }
    }

    let mut grouped: Vec<(String, f64)> = groups.into_iter().collect();
    // line charts read left to right along the key, bars biggest first
    if plan.template_id != "line_basic" {
        grouped.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    }
    grouped.truncate(sample_limit);

    let rows = grouped
        .into_iter()
        .map(|(key, total)| {
            let mut row = Map::new();
            row.insert(plan.dimension.clone(), Value::String(key));
            let value = if plan.measure.is_some() {
                json!(total)
            } else {
                json!(total as u64)
            };
            row.insert(value_col.clone(), value);
            row
        })
        .collect();

    OutputTable {
        columns: vec![plan.dimension.clone(), value_col],
        rows,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::fixtures;
    use crate::clock::SteppingClock;
    use crate::trace::SpanTracer;
    use chrono::Utc;
    use std::sync::Arc;

    fn plan(template: &str, dimension: &str, measure: Option<&str>) -> ChartPlan {
        ChartPlan {
            plan_id: "plan_1".into(),
            dataset_id: "sales".into(),
            user_goal: "goal".into(),
            template_id: template.into(),
            dimension: dimension.into(),
            measure: measure.map(str::to_string),
            aggregation: if measure.is_some() { "sum" } else { "count" }.into(),
        }
    }

    fn rows(content: &str) -> Vec<Row> {
        match serde_json::from_str::<Value>(content).unwrap() {
            Value::Array(items) => items
                .into_iter()
                .map(|v| v.as_object().unwrap().clone())
                .collect(),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_sum_by_dimension_sorted_by_value() {
        let table = aggregate(
            &rows(fixtures::SALES),
            &plan("bar_basic", "region", Some("revenue")),
            10,
        );
        assert_eq!(table.columns, vec!["region", "revenue"]);
        assert_eq!(table.rows.len(), 3);
        assert_eq!(table.rows[0]["region"], "north");
        assert_eq!(table.rows[0]["revenue"], 160.5);
        assert_eq!(table.rows[1]["region"], "south");
        // a null measure contributes nothing
        assert_eq!(table.rows[2]["region"], "east");
        assert_eq!(table.rows[2]["revenue"], 0.0);
    }

    #[test]
    fn test_temporal_groups_keep_key_order() {
        let table = aggregate(
            &rows(fixtures::SALES),
            &plan("line_basic", "order_date", Some("revenue")),
            10,
        );
        let keys: Vec<_> = table.rows.iter().map(|r| r["order_date"].clone()).collect();
        assert_eq!(keys, vec![json!("2024-01-01"), json!("2024-01-02"), json!("2024-01-03")]);
        assert_eq!(table.rows[1]["revenue"], 120.0);
    }

    #[test]
    fn test_count_without_measure_and_limit() {
        let table = aggregate(&rows(fixtures::REGIONS), &plan("bar_basic", "region", None), 1);
        assert_eq!(table.columns, vec!["region", "count"]);
        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.rows[0]["region"], "north");
        assert_eq!(table.rows[0]["count"], 2);
    }

    #[test]
    fn test_stage_records_row_counts() {
        let (_dir, path) = fixtures::dataset(fixtures::SALES);
        let tracer = SpanTracer::new(Arc::new(SteppingClock::new(Utc::now(), 1)));
        let ctx = StageContext::new("task", "sales", &tracer);
        let outcome = TransformExecutor
            .execute(
                &ctx,
                StagePayload::Transform(TransformRequest {
                    plan: plan("bar_basic", "region", Some("revenue")),
                    dataset_path: path,
                    sample_limit: 2,
                }),
            )
            .unwrap();
        assert_eq!(outcome.span.operation, "transform.execute");
        assert_eq!(outcome.span.metrics.rows_in, Some(4));
        assert_eq!(outcome.span.metrics.rows_out, Some(2));
    }

    #[test]
    fn test_zero_sample_limit_is_rejected() {
        let tracer = SpanTracer::new(Arc::new(SteppingClock::new(Utc::now(), 1)));
        let ctx = StageContext::new("task", "sales", &tracer);
        let err = TransformExecutor
            .execute(
                &ctx,
                StagePayload::Transform(TransformRequest {
                    plan: plan("bar_basic", "region", None),
                    dataset_path: PathBuf::from("unused.json"),
                    sample_limit: 0,
                }),
            )
            .unwrap_err();
        assert_eq!(err.error_type(), "InvalidInput");
    }
}
