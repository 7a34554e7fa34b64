use std::fs;
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use vizflow_common::{Span, TraceRecord};

use super::ArtifactStore;
use crate::errors::StoreError;
use crate::util::is_valid_task_id;

/// Trace records by task id, optionally snapshotted as `<dir>/<task_id>.json`.
/// The same key names the map entry and the file.
///
/// Records written by an earlier process are loaded from disk on first
/// `require` and cached.
pub struct TraceStore {
    traces: DashMap<String, TraceRecord>,
    dir: Option<PathBuf>,
}

impl TraceStore {
    pub fn in_memory() -> Self {
        Self {
            traces: DashMap::new(),
            dir: None,
        }
    }

    pub fn with_dir(dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(dir).map_err(|source| StoreError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        Ok(Self {
            traces: DashMap::new(),
            dir: Some(dir.to_path_buf()),
        })
    }

    /// Path of the snapshot for `key`. Keys that could leave the
    /// directory are rejected even for in-memory stores.
    fn file_for(&self, key: &str) -> Result<Option<PathBuf>, StoreError> {
        if !is_valid_task_id(key) {
            return Err(StoreError::InvalidKey {
                key: key.to_string(),
            });
        }
        Ok(self.dir.as_ref().map(|d| d.join(format!("{}.json", key))))
    }

    fn persist(&self, key: &str, record: &TraceRecord) -> Result<(), StoreError> {
        if let Some(path) = self.file_for(key)? {
            let json = serde_json::to_string_pretty(record)?;
            fs::write(&path, json).map_err(|source| StoreError::Io { path, source })?;
        }
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<TraceRecord>, StoreError> {
        let Some(path) = self.file_for(key)? else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path).map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;
        let record: TraceRecord = serde_json::from_str(&content)?;
        Ok(Some(record))
    }

    /// Append one span to a stored trace and persist the result.
    pub fn append_span(&self, task_id: &str, span: Span) -> Result<TraceRecord, StoreError> {
        // Pull a disk-only record into memory first so the append lands on it.
        if !self.traces.contains_key(task_id) {
            let record = self.require(task_id)?;
            self.traces.entry(task_id.to_string()).or_insert(record);
        }
        let updated = {
            let mut entry = self
                .traces
                .get_mut(task_id)
                .ok_or_else(|| StoreError::NotFound {
                    kind: "trace",
                    key: task_id.to_string(),
                })?;
            entry.append_span(span);
            entry.clone()
        };
        self.persist(task_id, &updated)?;
        Ok(updated)
    }
}

impl ArtifactStore<TraceRecord> for TraceStore {
    fn save(&self, key: &str, value: TraceRecord) -> Result<(), StoreError> {
        self.persist(key, &value)?;
        self.traces.insert(key.to_string(), value);
        Ok(())
    }

    fn require(&self, key: &str) -> Result<TraceRecord, StoreError> {
        if let Some(record) = self.traces.get(key) {
            return Ok(record.clone());
        }
        match self.load(key)? {
            Some(record) => {
                self.traces.insert(key.to_string(), record.clone());
                Ok(record)
            }
            None => Err(StoreError::NotFound {
                kind: "trace",
                key: key.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;
    use vizflow_common::{SCHEMA_VERSION, SpanMetrics, SpanSlo, SpanStatus};

    fn span(id: &str) -> Span {
        let now = Utc::now();
        Span {
            span_id: id.into(),
            parent_span_id: None,
            operation: "chart.replace".into(),
            agent_name: "chart_editor".into(),
            status: SpanStatus::Success,
            started_at: now,
            completed_at: now,
            slo: SpanSlo::new(800, 0),
            metrics: SpanMetrics {
                duration_ms: 0,
                retry_count: 0,
                rows_in: None,
                rows_out: None,
                failure_category: None,
                failure_isolation_ratio: 1.0,
            },
            model_name: None,
            prompt_version: None,
            dataset_hash: None,
            schema_version: SCHEMA_VERSION.into(),
            abort_reason: None,
            error_class: None,
            fallback_path: None,
            sse_seq: None,
            events: vec![],
        }
    }

    fn record(task_id: &str) -> TraceRecord {
        TraceRecord {
            trace_id: "trace_1".into(),
            task_id: task_id.into(),
            dataset_id: "ds".into(),
            created_at: Utc::now(),
            spans: vec![span("root")],
        }
    }

    #[test]
    fn test_in_memory_roundtrip_and_missing() {
        let store = TraceStore::in_memory();
        assert!(matches!(
            store.require("task_1"),
            Err(StoreError::NotFound { kind: "trace", .. })
        ));
        store.save("task_1", record("task_1")).unwrap();
        assert_eq!(store.require("task_1").unwrap().spans.len(), 1);
    }

    #[test]
    fn test_dir_store_writes_json_and_reloads() {
        let dir = TempDir::new().unwrap();
        let store = TraceStore::with_dir(dir.path()).unwrap();
        store.save("task_1", record("task_1")).unwrap();
        assert!(dir.path().join("task_1.json").exists());

        let reopened = TraceStore::with_dir(dir.path()).unwrap();
        let loaded = reopened.require("task_1").unwrap();
        assert_eq!(loaded, store.require("task_1").unwrap());
    }

    #[test]
    fn test_append_span_persists() {
        let dir = TempDir::new().unwrap();
        let store = TraceStore::with_dir(dir.path()).unwrap();
        store.save("task_1", record("task_1")).unwrap();

        let reopened = TraceStore::with_dir(dir.path()).unwrap();
        let updated = reopened.append_span("task_1", span("edit")).unwrap();
        assert_eq!(updated.spans.len(), 2);

        let content = fs::read_to_string(dir.path().join("task_1.json")).unwrap();
        let on_disk: TraceRecord = serde_json::from_str(&content).unwrap();
        assert_eq!(on_disk.spans[1].span_id, "edit");
    }

    #[test]
    fn test_append_to_unknown_trace_fails() {
        let store = TraceStore::in_memory();
        assert!(store.append_span("ghost", span("x")).is_err());
    }

    #[test]
    fn test_keys_cannot_leave_trace_dir() {
        let root = TempDir::new().unwrap();
        let store = TraceStore::with_dir(&root.path().join("traces")).unwrap();

        let err = store.save("../escaped", record("../escaped")).unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey { .. }));
        assert!(!root.path().join("escaped.json").exists());

        fs::write(root.path().join("outside.json"), "{}").unwrap();
        assert!(matches!(
            store.require("../outside"),
            Err(StoreError::InvalidKey { .. })
        ));
        assert!(matches!(
            store.append_span("../outside", span("x")),
            Err(StoreError::InvalidKey { .. })
        ));
        assert!(matches!(
            TraceStore::in_memory().require("a/b"),
            Err(StoreError::InvalidKey { .. })
        ));
    }

    #[test]
    fn test_file_is_named_by_key() {
        let dir = TempDir::new().unwrap();
        let store = TraceStore::with_dir(dir.path()).unwrap();
        store.save("task_2", record("task_1")).unwrap();
        assert!(dir.path().join("task_2.json").exists());
        assert!(!dir.path().join("task_1.json").exists());

        let reopened = TraceStore::with_dir(dir.path()).unwrap();
        assert_eq!(reopened.require("task_2").unwrap().task_id, "task_1");
    }
}
