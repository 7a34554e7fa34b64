//! Artifacts handed from one pipeline stage to the next.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Measure,
    Temporal,
    Identifier,
    Dimension,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldProfile {
    pub name: String,
    pub kind: FieldKind,
    pub distinct_count: u64,
    pub null_count: u64,
}

/// Summary of a scanned dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetProfile {
    pub dataset_id: String,
    pub name: String,
    pub version: String,
    pub row_count: u64,
    pub dataset_hash: String,
    pub fields: Vec<FieldProfile>,
}

impl DatasetProfile {
    pub fn fields_of(&self, kind: FieldKind) -> impl Iterator<Item = &FieldProfile> {
        self.fields.iter().filter(move |f| f.kind == kind)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartPlan {
    pub plan_id: String,
    pub dataset_id: String,
    pub user_goal: String,
    pub template_id: String,
    pub dimension: String,
    pub measure: Option<String>,
    pub aggregation: String,
}

/// Aggregated rows ready to be bound to a chart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputTable {
    pub columns: Vec<String>,
    pub rows: Vec<Map<String, Value>>,
}

impl OutputTable {
    pub fn row_count(&self) -> u64 {
        self.rows.len() as u64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMapping {
    pub channel: String,
    pub field_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartSpec {
    pub chart_id: String,
    pub template_id: String,
    pub engine: String,
    pub encoding: Vec<ChannelMapping>,
    pub data_source: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl ChartSpec {
    /// The chart as a structural document, the form patches operate on.
    pub fn to_document(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Explanation {
    pub chart_id: String,
    pub markdown: String,
}
