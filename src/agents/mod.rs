//! Built-in pipeline stages.
//!
//! | Node        | Agent                | Operation           | Output        |
//! |-------------|----------------------|---------------------|---------------|
//! | `scan`      | `dataset_scanner`    | `data.scan`         | `Profile`     |
//! | `plan`      | `plan_refiner`       | `plan.refine`       | `Plan`        |
//! | `transform` | `transform_executor` | `transform.execute` | `Table`       |
//! | `chart`     | `chart_recommender`  | `chart.recommend`   | `Chart`       |
//! | `explain`   | `explanation_agent`  | `explain.summarize` | `Explanation` |
//!
//! Datasets are JSON arrays of flat objects. The stage logic is deliberately
//! simple and deterministic.

pub mod chart;
pub mod explain;
pub mod plan;
pub mod scan;
pub mod transform;

use std::path::Path;

use serde_json::{Map, Value};

use crate::errors::StageError;

pub use chart::{ChartRecommender, ChartRequest};
pub use explain::{ExplainRequest, ExplanationAgent};
pub use plan::{PlanRefiner, PlanRequest};
pub use scan::{DatasetScanner, ScanRequest};
pub use transform::{TransformExecutor, TransformRequest};

pub type Row = Map<String, Value>;

/// Read a dataset file. Returns the rows and the raw bytes they came from.
pub(crate) fn load_rows(path: &Path) -> Result<(Vec<Row>, Vec<u8>), StageError> {
    let bytes = std::fs::read(path).map_err(|source| StageError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let value: Value = serde_json::from_slice(&bytes).map_err(|e| {
        StageError::InvalidInput(format!("{} is not valid JSON: {}", path.display(), e))
    })?;
    let Value::Array(items) = value else {
        return Err(StageError::InvalidInput(format!(
            "{} must contain a JSON array of records",
            path.display()
        )));
    };
    let rows = items
        .into_iter()
        .enumerate()
        .map(|(i, item)| match item {
            Value::Object(row) => Ok(row),
            _ => Err(StageError::InvalidInput(format!("record {} is not an object", i))),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok((rows, bytes))
}

/// Text form of a cell used for grouping and distinct counts.
pub(crate) fn cell_key(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "(null)".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::path::PathBuf;

    use tempfile::TempDir;

    pub const SALES: &str = r#"[
        {"order_id": 1, "region": "north", "order_date": "2024-01-01", "revenue": 120.5},
        {"order_id": 2, "region": "south", "order_date": "2024-01-02", "revenue": 80.0},
        {"order_id": 3, "region": "north", "order_date": "2024-01-02", "revenue": 40.0},
        {"order_id": 4, "region": "east", "order_date": "2024-01-03", "revenue": null}
    ]"#;

    pub const REGIONS: &str = r#"[
        {"region": "north", "units": 3},
        {"region": "south", "units": 5},
        {"region": "north", "units": 2}
    ]"#;

    /// Write `content` to a dataset file inside a fresh temp dir.
    pub fn dataset(content: &str) -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dataset.json");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }
}
