//! Chart state with patch history, and the editor that records each edit
//! as a span on the task's stored trace.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use vizflow_common::{Patch, Span, SpanEventType, SpanSlo, SpanStatus, TraceRecord};

use super::engine::PatchEngine;
use crate::clock::Clock;
use crate::errors::{EditError, PatchError};
use crate::store::{ArtifactStore, TraceStore};
use crate::trace::{SpanFinish, SpanRequest, SpanTracer};

/// A chart document plus the patches that produced it from `base_chart`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartState {
    pub base_chart: Value,
    pub chart: Value,
    #[serde(default)]
    pub patch_history: Vec<Patch>,
}

impl ChartState {
    pub fn new(base_chart: Value) -> Self {
        Self {
            chart: base_chart.clone(),
            base_chart,
            patch_history: Vec::new(),
        }
    }

    pub fn apply(&self, engine: &PatchEngine, patch: Patch) -> Result<ChartState, PatchError> {
        let chart = engine.apply_patch(&self.chart, &patch)?;
        let mut patch_history = self.patch_history.clone();
        patch_history.push(patch);
        Ok(ChartState {
            base_chart: self.base_chart.clone(),
            chart,
            patch_history,
        })
    }

    /// Drop the last `steps` patches and replay the rest from the base chart.
    pub fn revert(&self, engine: &PatchEngine, steps: usize) -> Result<ChartState, PatchError> {
        if steps == 0 || steps > self.patch_history.len() {
            return Err(PatchError::InvalidArgument(format!(
                "cannot revert {} steps with {} patches in history",
                steps,
                self.patch_history.len()
            )));
        }
        let keep = self.patch_history.len() - steps;
        let patch_history = self.patch_history[..keep].to_vec();
        let chart = engine.replay_patch_history(&self.base_chart, &patch_history)?;
        Ok(ChartState {
            base_chart: self.base_chart.clone(),
            chart,
            patch_history,
        })
    }

    pub fn hash(&self, engine: &PatchEngine) -> String {
        engine.compute_structural_hash(&self.chart)
    }
}

/// Result of a recorded edit.
#[derive(Debug, Clone, Serialize)]
pub struct ChartEdit {
    pub state: ChartState,
    pub hash: String,
    pub span: Span,
}

const EDITOR_AGENT: &str = "chart_editor";

/// Applies and reverts patches for a task and appends one span per call
/// to that task's stored trace, whether the edit succeeds or not.
///
/// The editor keeps the hash of each task's committed chart, its head. A
/// submitted state must match the head, and so must `expected_hash` when
/// given. The runner commits the initial render; after a restart the head
/// is recovered from the last successful edit span in the stored trace.
/// With no head known the submitted state itself is taken as current.
pub struct ChartEditor {
    engine: PatchEngine,
    traces: Arc<TraceStore>,
    clock: Arc<dyn Clock>,
    slo: SpanSlo,
    heads: DashMap<String, Option<String>>,
}

impl ChartEditor {
    pub fn new(traces: Arc<TraceStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            engine: PatchEngine::new(),
            traces,
            clock,
            slo: SpanSlo::new(800, 0),
            heads: DashMap::new(),
        }
    }

    /// Record `hash` as the committed chart of `task_id`.
    pub fn commit(&self, task_id: &str, hash: impl Into<String>) {
        self.heads.insert(task_id.to_string(), Some(hash.into()));
    }

    /// Hash of the committed chart, if one is known.
    pub fn head(&self, task_id: &str) -> Option<String> {
        self.heads.get(task_id).and_then(|head| head.value().clone())
    }

    /// Apply `patch` on top of the committed chart.
    pub fn apply(
        &self,
        task_id: &str,
        state: &ChartState,
        patch: Patch,
        expected_hash: Option<&str>,
    ) -> Result<ChartEdit, EditError> {
        let start_detail = json!({
            "target_chart_id": patch.target_chart_id,
            "ops": patch.ops.len(),
            "rationale": patch.rationale,
        });
        self.record(task_id, "chart.replace", start_detail, |head| {
            self.check_current(state, head, expected_hash)?;
            state.apply(&self.engine, patch)
        })
    }

    pub fn revert(&self, task_id: &str, state: &ChartState, steps: usize) -> Result<ChartEdit, EditError> {
        self.record(task_id, "chart.revert", json!({ "steps": steps }), |head| {
            self.check_current(state, head, None)?;
            state.revert(&self.engine, steps)
        })
    }

    fn check_current(
        &self,
        state: &ChartState,
        head: Option<&str>,
        expected_hash: Option<&str>,
    ) -> Result<(), PatchError> {
        let submitted = state.hash(&self.engine);
        let current = head.unwrap_or(submitted.as_str());
        if let Some(expected) = expected_hash
            && expected != current
        {
            return Err(PatchError::StaleState {
                expected: expected.to_string(),
                actual: current.to_string(),
            });
        }
        if submitted != current {
            return Err(PatchError::StaleState {
                expected: current.to_string(),
                actual: submitted,
            });
        }
        Ok(())
    }

    fn record<F>(
        &self,
        task_id: &str,
        operation: &str,
        start_detail: Value,
        edit: F,
    ) -> Result<ChartEdit, EditError>
    where
        F: FnOnce(Option<&str>) -> Result<ChartState, PatchError>,
    {
        let trace = self.traces.require(task_id)?;
        let parent = trace.root_span().map(|s| s.span_id.clone());
        // held until the edit is recorded, so edits to one task serialize
        let mut head = self
            .heads
            .entry(task_id.to_string())
            .or_insert_with(|| recorded_head(&trace));

        let tracer = SpanTracer::new(self.clock.clone());
        let span_id = tracer.start_span(
            SpanRequest::new(operation, EDITOR_AGENT, self.slo)
                .with_parent(parent.as_deref())
                .with_start_detail(start_detail),
        )?;

        match edit(head.as_deref()) {
            Ok(next) => {
                let hash = next.hash(&self.engine);
                let span = tracer.finish_span(
                    &span_id,
                    SpanFinish::success().with_detail(json!({
                        "hash": hash,
                        "history_len": next.patch_history.len(),
                    })),
                )?;
                self.traces.append_span(task_id, span.clone())?;
                *head = Some(hash.clone());
                tracing::info!(task_id, operation, hash = %hash, "chart edit recorded");
                Ok(ChartEdit {
                    state: next,
                    hash,
                    span,
                })
            }
            Err(err) => {
                let span = tracer.finish_span(
                    &span_id,
                    SpanFinish::failed(err.error_class())
                        .with_detail(json!({ "message": err.to_string() })),
                )?;
                self.traces.append_span(task_id, span)?;
                tracing::warn!(task_id, operation, error = %err, "chart edit rejected");
                Err(err.into())
            }
        }
    }
}

/// Hash left by the last successful edit span of `trace`.
fn recorded_head(trace: &TraceRecord) -> Option<String> {
    trace
        .spans
        .iter()
        .rev()
        .filter(|span| span.agent_name == EDITOR_AGENT && span.status == SpanStatus::Success)
        .find_map(|span| {
            let event = span
                .events
                .iter()
                .rev()
                .find(|e| e.event_type == SpanEventType::Success)?;
            let detail: Value = serde_json::from_str(event.detail.as_deref()?).ok()?;
            detail.get("hash")?.as_str().map(str::to_string)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SteppingClock;
    use chrono::Utc;
    use vizflow_common::PatchOp;

    fn base() -> Value {
        json!({"chart_id": "chart_1", "channel": "x", "field": "date"})
    }

    fn field_patch(value: &str) -> Patch {
        Patch::new("chart_1", vec![PatchOp::replace(&["field"], json!(value))])
    }

    fn editor_with_trace(task_id: &str) -> (ChartEditor, Arc<TraceStore>) {
        let clock: Arc<dyn Clock> = Arc::new(SteppingClock::new(Utc::now(), 1));
        let traces = Arc::new(TraceStore::in_memory());
        let tracer = SpanTracer::new(clock.clone());
        let root = tracer
            .start_span(SpanRequest::new("orchestrate.run", "orchestrator", SpanSlo::new(1, 0)))
            .unwrap();
        let root = tracer.finish_span(&root, SpanFinish::success()).unwrap();
        let trace: TraceRecord = tracer.build_trace(task_id, "ds", vec![root]).unwrap();
        traces.save(task_id, trace).unwrap();
        (ChartEditor::new(traces.clone(), clock), traces)
    }

    #[test]
    fn test_apply_then_revert_restores_base() {
        let engine = PatchEngine::new();
        let s0 = ChartState::new(base());
        let s1 = s0.apply(&engine, field_patch("revenue")).unwrap();
        let s2 = s1.apply(&engine, field_patch("profit")).unwrap();
        assert_eq!(s2.chart["field"], "profit");
        assert_eq!(s2.patch_history.len(), 2);

        assert_eq!(s2.revert(&engine, 1).unwrap(), s1);
        assert_eq!(s2.revert(&engine, 2).unwrap(), s0);
        assert_eq!(s2.base_chart, base());
    }

    #[test]
    fn test_revert_step_bounds() {
        let engine = PatchEngine::new();
        let s1 = ChartState::new(base()).apply(&engine, field_patch("revenue")).unwrap();
        assert!(s1.revert(&engine, 0).is_err());
        assert!(s1.revert(&engine, 2).is_err());
    }

    #[test]
    fn test_failed_apply_keeps_history() {
        let engine = PatchEngine::new();
        let s0 = ChartState::new(base());
        let bad = Patch::new("chart_1", vec![PatchOp::add(&["field"], json!("x"))]);
        assert!(s0.apply(&engine, bad).is_err());
        assert!(s0.patch_history.is_empty());
    }

    #[test]
    fn test_editor_appends_span_to_trace() {
        let (editor, traces) = editor_with_trace("task_1");
        let state = ChartState::new(base());
        let edit = editor
            .apply("task_1", &state, field_patch("revenue"), None)
            .unwrap();
        assert_eq!(edit.state.chart["field"], "revenue");
        assert_eq!(edit.span.operation, "chart.replace");
        assert_eq!(edit.span.status, SpanStatus::Success);

        let reverted = editor.revert("task_1", &edit.state, 1).unwrap();
        assert_eq!(reverted.state.chart, base());
        assert_eq!(reverted.span.operation, "chart.revert");

        let trace = traces.require("task_1").unwrap();
        assert_eq!(trace.spans.len(), 3);
        let root_id = trace.spans[0].span_id.clone();
        assert!(
            trace.spans[1..]
                .iter()
                .all(|s| s.parent_span_id.as_deref() == Some(root_id.as_str()))
        );
    }

    #[test]
    fn test_editor_rejects_stale_hash_and_records_failure() {
        let (editor, traces) = editor_with_trace("task_1");
        let state = ChartState::new(base());
        let err = editor
            .apply("task_1", &state, field_patch("revenue"), Some("deadbeef"))
            .unwrap_err();
        assert!(matches!(err, EditError::Patch(PatchError::StaleState { .. })));

        let trace = traces.require("task_1").unwrap();
        let last = trace.spans.last().unwrap();
        assert_eq!(last.status, SpanStatus::Failed);
        assert_eq!(last.error_class.as_deref(), Some("StaleState"));

        let current = state.hash(&PatchEngine::new());
        assert!(
            editor
                .apply("task_1", &state, field_patch("revenue"), Some(&current))
                .is_ok()
        );
    }

    #[test]
    fn test_editor_requires_stored_trace() {
        let (editor, _) = editor_with_trace("task_1");
        let err = editor
            .apply("other", &ChartState::new(base()), field_patch("revenue"), None)
            .unwrap_err();
        assert!(matches!(err, EditError::Store(_)));
    }

    #[test]
    fn test_editor_checks_against_committed_head() {
        let (editor, _) = editor_with_trace("task_1");
        let engine = PatchEngine::new();
        let s0 = ChartState::new(base());
        let h0 = s0.hash(&engine);
        editor.commit("task_1", h0.clone());

        let edit = editor
            .apply("task_1", &s0, field_patch("revenue"), Some(&h0))
            .unwrap();
        assert_eq!(editor.head("task_1").as_deref(), Some(edit.hash.as_str()));

        // the same request again agrees with itself but no longer with the head
        let err = editor
            .apply("task_1", &s0, field_patch("profit"), Some(&h0))
            .unwrap_err();
        assert!(matches!(err, EditError::Patch(PatchError::StaleState { .. })));
        let err = editor
            .apply("task_1", &s0, field_patch("profit"), None)
            .unwrap_err();
        assert!(matches!(err, EditError::Patch(PatchError::StaleState { .. })));
        assert!(matches!(
            editor.revert("task_1", &s0, 1),
            Err(EditError::Patch(PatchError::StaleState { .. }))
        ));

        let next = editor
            .apply("task_1", &edit.state, field_patch("profit"), Some(&edit.hash))
            .unwrap();
        assert_eq!(next.state.chart["field"], "profit");
    }

    #[test]
    fn test_head_is_recovered_from_stored_trace() {
        let (editor, traces) = editor_with_trace("task_1");
        let s0 = ChartState::new(base());
        let edit = editor
            .apply("task_1", &s0, field_patch("revenue"), None)
            .unwrap();

        let clock: Arc<dyn Clock> = Arc::new(SteppingClock::new(Utc::now(), 1));
        let restarted = ChartEditor::new(traces, clock);
        assert!(restarted.head("task_1").is_none());
        assert!(matches!(
            restarted.apply("task_1", &s0, field_patch("profit"), None),
            Err(EditError::Patch(PatchError::StaleState { .. }))
        ));
        assert!(
            restarted
                .apply("task_1", &edit.state, field_patch("profit"), None)
                .is_ok()
        );
    }
}
