//! Patch engine for nested map/list documents.
//!
//! Paths are lists of segments. Every segment but the last walks down to the
//! parent container; the last one addresses the target inside it. Against a
//! list a segment must be a decimal index.
//!
//! | op        | map parent               | list parent                   |
//! |-----------|--------------------------|-------------------------------|
//! | `add`     | key must be absent       | index must equal `len` (tail) |
//! | `replace` | key must exist           | index in `[0, len)`           |
//! | `remove`  | key must exist           | index in `[0, len)`, shifts   |
//!
//! `add` creates missing intermediate maps. Each application works on one
//! deep copy, so a failing operation leaves the input document untouched.
//!
//! ```
//! use serde_json::json;
//! use vizflow::patch::PatchEngine;
//! use vizflow_common::{Patch, PatchOp};
//!
//! let engine = PatchEngine::new();
//! let base = json!({"channel": "x", "field": "date"});
//! let patch = Patch::new("chart", vec![PatchOp::replace(&["field"], json!("revenue"))]);
//! let next = engine.apply_patch(&base, &patch).unwrap();
//! assert_eq!(next, json!({"channel": "x", "field": "revenue"}));
//! ```

use serde_json::{Map, Value};
use vizflow_common::{Patch, PatchOp, PatchOpType};

use crate::errors::PatchError;
use crate::util::{canonical_json, sha256_hex};

/// Stateless: callers own the documents.
#[derive(Debug, Default, Clone, Copy)]
pub struct PatchEngine;

impl PatchEngine {
    pub const fn new() -> Self {
        Self
    }

    /// Apply `ops` in order to a copy of `document`.
    pub fn apply_ops(&self, document: &Value, ops: &[PatchOp]) -> Result<Value, PatchError> {
        let mut working = document.clone();
        for op in ops {
            op.validate().map_err(PatchError::InvalidArgument)?;
            apply_op(&mut working, op)?;
        }
        Ok(working)
    }

    /// Apply a whole patch. A document carrying a `chart_id` must match the
    /// patch's target.
    pub fn apply_patch(&self, chart: &Value, patch: &Patch) -> Result<Value, PatchError> {
        patch.validate().map_err(PatchError::InvalidArgument)?;
        if let Some(actual) = chart.get("chart_id").and_then(Value::as_str)
            && actual != patch.target_chart_id
        {
            return Err(PatchError::TargetMismatch {
                expected: patch.target_chart_id.clone(),
                actual: actual.to_string(),
            });
        }
        self.apply_ops(chart, &patch.ops)
    }

    /// Fold `patches` over `base`. Reverting N steps is replaying all but the last N.
    pub fn replay_patch_history(&self, base: &Value, patches: &[Patch]) -> Result<Value, PatchError> {
        patches
            .iter()
            .try_fold(base.clone(), |doc, patch| self.apply_patch(&doc, patch))
    }

    /// SHA-256 of the canonical (sorted-key, compact) JSON form.
    pub fn compute_structural_hash(&self, document: &Value) -> String {
        sha256_hex(canonical_json(document).as_bytes())
    }
}

fn apply_op(document: &mut Value, op: &PatchOp) -> Result<(), PatchError> {
    let Some((last, parents)) = op.path.split_last() else {
        return Err(PatchError::InvalidArgument("patch path is empty".into()));
    };
    let path = op.path.join("/");
    let parent = resolve_parent(document, parents, op.op_type == PatchOpType::Add, &path)?;
    // validated: add/replace always carry a value
    let value = op.value.clone().unwrap_or(Value::Null);

    match parent {
        Value::Object(map) => apply_to_map(map, op.op_type, last, value, &path),
        Value::Array(items) => {
            let index = parse_index(last, &path)?;
            apply_to_list(items, op.op_type, index, value, &path)
        }
        other => Err(PatchError::TypeMismatch {
            path,
            message: format!("parent is {}, not a container", kind_of(other)),
        }),
    }
}

fn apply_to_map(
    map: &mut Map<String, Value>,
    op_type: PatchOpType,
    key: &str,
    value: Value,
    path: &str,
) -> Result<(), PatchError> {
    match op_type {
        PatchOpType::Add => {
            if map.contains_key(key) {
                return Err(PatchError::InvalidArgument(format!(
                    "/{} already exists; use replace",
                    path
                )));
            }
            map.insert(key.to_string(), value);
        }
        PatchOpType::Replace => {
            let slot = map.get_mut(key).ok_or_else(|| PatchError::NotFound {
                path: path.to_string(),
            })?;
            *slot = value;
        }
        PatchOpType::Remove => {
            map.remove(key).ok_or_else(|| PatchError::NotFound {
                path: path.to_string(),
            })?;
        }
    }
    Ok(())
}

fn apply_to_list(
    items: &mut Vec<Value>,
    op_type: PatchOpType,
    index: usize,
    value: Value,
    path: &str,
) -> Result<(), PatchError> {
    match op_type {
        PatchOpType::Add => {
            if index != items.len() {
                return Err(PatchError::InvalidArgument(format!(
                    "/{}: list add only appends at index {}",
                    path,
                    items.len()
                )));
            }
            items.push(value);
        }
        PatchOpType::Replace => {
            check_in_range(index, items.len(), path)?;
            items[index] = value;
        }
        PatchOpType::Remove => {
            check_in_range(index, items.len(), path)?;
            items.remove(index);
        }
    }
    Ok(())
}

fn resolve_parent<'a>(
    document: &'a mut Value,
    segments: &[String],
    create_missing: bool,
    path: &str,
) -> Result<&'a mut Value, PatchError> {
    let mut current = document;
    for segment in segments {
        current = match current {
            Value::Object(map) => {
                if !map.contains_key(segment) {
                    if !create_missing {
                        return Err(PatchError::NotFound {
                            path: path.to_string(),
                        });
                    }
                    map.insert(segment.clone(), Value::Object(Map::new()));
                }
                map.get_mut(segment).ok_or_else(|| PatchError::NotFound {
                    path: path.to_string(),
                })?
            }
            Value::Array(items) => {
                let index = parse_index(segment, path)?;
                check_in_range(index, items.len(), path)?;
                &mut items[index]
            }
            other => {
                return Err(PatchError::TypeMismatch {
                    path: path.to_string(),
                    message: format!("cannot descend into {} at '{}'", kind_of(other), segment),
                });
            }
        };
    }
    Ok(current)
}

fn parse_index(segment: &str, path: &str) -> Result<usize, PatchError> {
    if segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_digit()) {
        return Err(PatchError::TypeMismatch {
            path: path.to_string(),
            message: format!("'{}' is not a list index", segment),
        });
    }
    segment
        .parse::<usize>()
        .map_err(|e| PatchError::InvalidArgument(format!("/{}: {}", path, e)))
}

fn check_in_range(index: usize, len: usize, path: &str) -> Result<(), PatchError> {
    if index >= len {
        return Err(PatchError::InvalidArgument(format!(
            "/{}: index {} out of range [0, {})",
            path, index, len
        )));
    }
    Ok(())
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "a map",
    }
}
