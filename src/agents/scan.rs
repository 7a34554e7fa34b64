use std::collections::HashSet;
use std::path::PathBuf;

use chrono::{DateTime, NaiveDate};
use serde_json::{Value, json};
use vizflow_common::{DatasetProfile, FieldKind, FieldProfile, SpanSlo};

use super::{Row, cell_key, load_rows};
use crate::errors::StageError;
use crate::pipeline::stage::{
    Stage, StageContext, StageOutcome, StageOutput, StagePayload, TracedOutput, traced,
};
use crate::trace::{SpanRequest, SpanUpdate};
use crate::util::sha256_hex;

#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub dataset_id: String,
    pub dataset_name: String,
    pub dataset_version: String,
    pub path: PathBuf,
}

/// Profiles a dataset: row count, content hash, and a kind per field.
pub struct DatasetScanner;

impl Stage for DatasetScanner {
    fn name(&self) -> &str {
        "dataset_scanner"
    }

    fn slo(&self) -> SpanSlo {
        SpanSlo::new(5000, 0)
    }

    fn execute(&self, ctx: &StageContext<'_>, payload: StagePayload) -> Result<StageOutcome, StageError> {
        let request = payload.into_scan()?;
        traced(ctx, SpanRequest::new("data.scan", self.name(), self.slo()), |_| {
            let (rows, bytes) = load_rows(&request.path)?;
            if rows.is_empty() {
                return Err(StageError::InvalidInput(format!(
                    "dataset {} has no records",
                    request.dataset_id
                )));
            }
            let dataset_hash = sha256_hex(&bytes);
            let fields = profile_fields(&rows);
            let row_count = rows.len() as u64;
            tracing::info!(
                task_id = ctx.task_id,
                dataset_id = %request.dataset_id,
                rows = row_count,
                fields = fields.len(),
                "dataset scanned"
            );

            let profile = DatasetProfile {
                dataset_id: request.dataset_id.clone(),
                name: request.dataset_name.clone(),
                version: request.dataset_version.clone(),
                row_count,
                dataset_hash: dataset_hash.clone(),
                fields,
            };
            Ok(TracedOutput::new(StageOutput::Profile(profile))
                .with_update(SpanUpdate {
                    rows_in: Some(row_count),
                    rows_out: Some(row_count),
                    dataset_hash: Some(dataset_hash),
                    ..Default::default()
                })
                .with_detail(json!({ "path": request.path.display().to_string() })))
        })
    }
}

/// Field names in first-seen order across all rows.
fn field_names(rows: &[Row]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut names = Vec::new();
    for row in rows {
        for key in row.keys() {
            if seen.insert(key.as_str()) {
                names.push(key.clone());
            }
        }
    }
    names
}

fn profile_fields(rows: &[Row]) -> Vec<FieldProfile> {
    field_names(rows)
        .into_iter()
        .map(|name| {
            let values: Vec<&Value> = rows
                .iter()
                .filter_map(|r| r.get(&name))
                .filter(|v| !v.is_null())
                .collect();
            let null_count = (rows.len() - values.len()) as u64;
            let distinct: HashSet<String> = values.iter().map(|v| cell_key(Some(v))).collect();
            FieldProfile {
                kind: infer_kind(&name, &values),
                name,
                distinct_count: distinct.len() as u64,
                null_count,
            }
        })
        .collect()
}

fn infer_kind(name: &str, values: &[&Value]) -> FieldKind {
    let lowered = name.to_lowercase();
    let named_like_id = lowered == "id" || lowered.ends_with("_id") || name.ends_with("Id");
    let named_like_time =
        lowered.contains("date") || lowered.contains("time") || lowered.ends_with("_at");

    if named_like_id {
        return FieldKind::Identifier;
    }
    if !values.is_empty() && values.iter().all(|v| v.as_str().is_some_and(looks_temporal)) {
        return FieldKind::Temporal;
    }
    if named_like_time {
        return FieldKind::Temporal;
    }
    if !values.is_empty() && values.iter().all(|v| v.is_number()) {
        return FieldKind::Measure;
    }
    FieldKind::Dimension
}

fn looks_temporal(s: &str) -> bool {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok() || DateTime::parse_from_rfc3339(s).is_ok()
}
