//! Structural edit operations against a chart document.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchOpType {
    Add,
    Replace,
    Remove,
}

impl std::fmt::Display for PatchOpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PatchOpType::Add => write!(f, "add"),
            PatchOpType::Replace => write!(f, "replace"),
            PatchOpType::Remove => write!(f, "remove"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchOp {
    pub op_type: PatchOpType,
    pub path: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl PatchOp {
    pub fn add(path: &[&str], value: Value) -> Self {
        Self::with_value(PatchOpType::Add, path, Some(value))
    }

    pub fn replace(path: &[&str], value: Value) -> Self {
        Self::with_value(PatchOpType::Replace, path, Some(value))
    }

    pub fn remove(path: &[&str]) -> Self {
        Self::with_value(PatchOpType::Remove, path, None)
    }

    fn with_value(op_type: PatchOpType, path: &[&str], value: Option<Value>) -> Self {
        Self {
            op_type,
            path: path.iter().map(|s| s.to_string()).collect(),
            value,
        }
    }

    /// add/replace carry a value, remove does not, and the path is never empty.
    pub fn validate(&self) -> Result<(), String> {
        if self.path.is_empty() {
            return Err(format!("{} operation has an empty path", self.op_type));
        }
        match (self.op_type, &self.value) {
            (PatchOpType::Add | PatchOpType::Replace, None) => Err(format!(
                "{} operation at /{} requires a value",
                self.op_type,
                self.path.join("/")
            )),
            (PatchOpType::Remove, Some(_)) => Err(format!(
                "remove operation at /{} must not carry a value",
                self.path.join("/")
            )),
            _ => Ok(()),
        }
    }
}

/// An ordered group of operations applied atomically to one chart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub target_chart_id: String,
    pub ops: Vec<PatchOp>,
    #[serde(default)]
    pub rationale: String,
}

impl Patch {
    pub fn new(target_chart_id: impl Into<String>, ops: Vec<PatchOp>) -> Self {
        Self {
            target_chart_id: target_chart_id.into(),
            ops,
            rationale: String::new(),
        }
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = rationale.into();
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.ops.is_empty() {
            return Err("patch has no operations".to_string());
        }
        self.ops.iter().try_for_each(PatchOp::validate)
    }
}
