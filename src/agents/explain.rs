use std::fmt::Write as _;

use serde_json::json;
use vizflow_common::{ChartPlan, DatasetProfile, Explanation, OutputTable, SpanSlo};

use super::cell_key;
use super::transform::value_column;
use crate::errors::StageError;
use crate::pipeline::stage::{
    Stage, StageContext, StageOutcome, StageOutput, StagePayload, TracedOutput, traced,
};
use crate::trace::SpanRequest;

/// Rows of the transform output quoted in the summary.
const PREVIEW_ROWS: usize = 3;

#[derive(Debug, Clone)]
pub struct ExplainRequest {
    pub profile: DatasetProfile,
    pub plan: ChartPlan,
    pub chart_id: String,
    pub transform_preview: OutputTable,
}

/// Writes a short Markdown summary of what the chart shows.
pub struct ExplanationAgent;

impl Stage for ExplanationAgent {
    fn name(&self) -> &str {
        "explanation_agent"
    }

    fn slo(&self) -> SpanSlo {
        SpanSlo::new(1500, 1)
    }

    fn execute(&self, ctx: &StageContext<'_>, payload: StagePayload) -> Result<StageOutcome, StageError> {
        let request = payload.into_explain()?;
        let span = SpanRequest::new("explain.summarize", self.name(), self.slo())
            .with_model("template", "v1");
        traced(ctx, span, |_| {
            let markdown = summarize(&request);
            let detail = json!({ "chart_id": request.chart_id, "chars": markdown.len() });
            Ok(TracedOutput::new(StageOutput::Explanation(Explanation {
                chart_id: request.chart_id.clone(),
                markdown,
            }))
            .with_detail(detail))
        })
    }
}

fn summarize(request: &ExplainRequest) -> String {
    let profile = &request.profile;
    let plan = &request.plan;
    let value_col = value_column(plan);

    let mut md = String::new();
    let _ = writeln!(md, "## {}", plan.user_goal);
    let _ = writeln!(md);
    let _ = writeln!(
        md,
        "Dataset **{}** (version {}) has {} rows across {} fields.",
        profile.name,
        profile.version,
        profile.row_count,
        profile.fields.len()
    );
    let measure = match &plan.measure {
        Some(m) => format!("the {} of `{}`", plan.aggregation, m),
        None => "the number of rows".to_string(),
    };
    let _ = writeln!(
        md,
        "The `{}` chart shows {} for each `{}`.",
        plan.template_id, measure, plan.dimension
    );

    let preview = &request.transform_preview;
    if !preview.rows.is_empty() {
        let _ = writeln!(md);
        let _ = writeln!(md, "| {} | {} |", plan.dimension, value_col);
        let _ = writeln!(md, "|---|---|");
        for row in preview.rows.iter().take(PREVIEW_ROWS) {
            let _ = writeln!(
                md,
                "| {} | {} |",
                cell_key(row.get(&plan.dimension)),
                cell_key(row.get(&value_col))
            );
        }
        if preview.rows.len() > PREVIEW_ROWS {
            let _ = writeln!(md, "\n{} more groups not shown.", preview.rows.len() - PREVIEW_ROWS);
        }
    }
    md
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, Value};

    fn row(region: &str, revenue: f64) -> Map<String, Value> {
        let mut row = Map::new();
        row.insert("region".into(), json!(region));
        row.insert("revenue".into(), json!(revenue));
        row
    }

    fn request(rows: Vec<Map<String, Value>>) -> ExplainRequest {
        ExplainRequest {
            profile: DatasetProfile {
                dataset_id: "sales".into(),
                name: "Sales".into(),
                version: "2".into(),
                row_count: 4,
                dataset_hash: "abc".into(),
                fields: vec![],
            },
            plan: ChartPlan {
                plan_id: "plan_1".into(),
                dataset_id: "sales".into(),
                user_goal: "Revenue by region".into(),
                template_id: "bar_basic".into(),
                dimension: "region".into(),
                measure: Some("revenue".into()),
                aggregation: "sum".into(),
            },
            chart_id: "chart_1".into(),
            transform_preview: OutputTable {
                columns: vec!["region".into(), "revenue".into()],
                rows,
            },
        }
    }

    #[test]
    fn test_summary_mentions_dataset_and_plan() {
        let md = summarize(&request(vec![row("north", 160.5)]));
        assert!(md.starts_with("## Revenue by region"));
        assert!(md.contains("**Sales** (version 2) has 4 rows"));
        assert!(md.contains("the sum of `revenue` for each `region`"));
        assert!(md.contains("| north | 160.5 |"));
    }

    #[test]
    fn test_long_previews_are_cut() {
        let rows = (0..5).map(|i| row(&format!("r{}", i), i as f64)).collect();
        let md = summarize(&request(rows));
        assert!(md.contains("| r2 |"));
        assert!(!md.contains("| r3 |"));
        assert!(md.contains("2 more groups not shown."));
    }

    #[test]
    fn test_empty_preview_has_no_table() {
        let md = summarize(&request(vec![]));
        assert!(!md.contains("|---|"));
    }
}
