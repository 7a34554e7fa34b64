//! Integration tests for the vizflow CLI.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

const SALES: &str = r#"[
    {"order_id": 1, "region": "north", "order_date": "2024-01-01", "revenue": 120.5},
    {"order_id": 2, "region": "south", "order_date": "2024-01-02", "revenue": 80.0},
    {"order_id": 3, "region": "north", "order_date": "2024-01-02", "revenue": 40.0}
]"#;

/// Helper to create a vizflow Command isolated from the caller's environment
fn vizflow(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("vizflow");
    cmd.current_dir(dir.path())
        .env_remove("VIZFLOW_CONFIG")
        .env_remove("VIZFLOW_PORT")
        .env_remove("VIZFLOW_HOST")
        .env_remove("VIZFLOW_TRACE_DIR")
        .env_remove("VIZFLOW_LOG_LEVEL")
        .env("RUST_LOG", "error");
    cmd
}

/// Helper to write a dataset file into a temp directory
fn write_dataset(dir: &TempDir, content: &str) -> PathBuf {
    let path = dir.path().join("sales.json");
    fs::write(&path, content).unwrap();
    path
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_vizflow_help() {
        let dir = TempDir::new().unwrap();
        vizflow(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"))
            .stdout(predicate::str::contains("run"));
    }

    #[test]
    fn test_vizflow_version() {
        let dir = TempDir::new().unwrap();
        vizflow(&dir).arg("--version").assert().success();
    }

    #[test]
    fn test_run_requires_goal() {
        let dir = TempDir::new().unwrap();
        let path = write_dataset(&dir, SALES);
        vizflow(&dir).arg("run").arg(&path).assert().failure();
    }
}

// =============================================================================
// Pipeline Runs
// =============================================================================

mod runs {
    use super::*;

    #[test]
    fn test_run_streams_events_and_explanation() {
        let dir = TempDir::new().unwrap();
        let path = write_dataset(&dir, SALES);
        vizflow(&dir)
            .args(["run", path.to_str().unwrap(), "--goal", "revenue by day"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[started]"))
            .stdout(predicate::str::contains("data.scan"))
            .stdout(predicate::str::contains("explain.summarize"))
            .stdout(predicate::str::contains("[completed]"))
            .stdout(predicate::str::contains("## revenue by day"));
    }

    #[test]
    fn test_run_json_lines() {
        let dir = TempDir::new().unwrap();
        let path = write_dataset(&dir, SALES);
        let output = vizflow(&dir)
            .args(["run", path.to_str().unwrap(), "--goal", "g", "--json"])
            .args(["--task-id", "cli_task"])
            .output()
            .unwrap();
        assert!(output.status.success());

        let stdout = String::from_utf8(output.stdout).unwrap();
        let lines: Vec<serde_json::Value> = stdout
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        // started, five stages, completed, then the final snapshot
        assert_eq!(lines.len(), 8);
        assert_eq!(lines[0]["type"], "started");
        assert_eq!(lines[0]["task_id"], "cli_task");
        assert_eq!(lines[6]["type"], "completed");
        assert_eq!(lines[7]["status"], "completed");
    }

    #[test]
    fn test_run_writes_trace_file() {
        let dir = TempDir::new().unwrap();
        let path = write_dataset(&dir, SALES);
        vizflow(&dir)
            .env("VIZFLOW_TRACE_DIR", dir.path().join("traces"))
            .args(["run", path.to_str().unwrap(), "--goal", "g", "--task-id", "t1"])
            .assert()
            .success();

        let trace: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join("traces/t1.json")).unwrap())
                .unwrap();
        assert_eq!(trace["task_id"], "t1");
        assert_eq!(trace["spans"][0]["operation"], "orchestrate.run");
    }

    #[test]
    fn test_run_failure_exits_non_zero() {
        let dir = TempDir::new().unwrap();
        let path = write_dataset(&dir, "[]");
        vizflow(&dir)
            .args(["run", path.to_str().unwrap(), "--goal", "g"])
            .assert()
            .failure()
            .stdout(predicate::str::contains("[failed]"))
            .stderr(predicate::str::contains("InvalidInput"));
    }

    #[test]
    fn test_run_missing_dataset() {
        let dir = TempDir::new().unwrap();
        vizflow(&dir)
            .args(["run", "missing.json", "--goal", "g"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("does not exist"));
    }
}

// =============================================================================
// Configuration
// =============================================================================

mod configuration {
    use super::*;

    #[test]
    fn test_config_show_defaults() {
        let dir = TempDir::new().unwrap();
        vizflow(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("(defaults)"))
            .stdout(predicate::str::contains("port = 8787"));
    }

    #[test]
    fn test_config_show_applies_env() {
        let dir = TempDir::new().unwrap();
        vizflow(&dir)
            .env("VIZFLOW_PORT", "9001")
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("port = 9001"));
    }

    #[test]
    fn test_config_init_then_validate() {
        let dir = TempDir::new().unwrap();
        vizflow(&dir).args(["config", "init"]).assert().success();
        assert!(dir.path().join("vizflow.toml").exists());

        vizflow(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("valid"));

        // a second init refuses to overwrite
        vizflow(&dir).args(["config", "init"]).assert().failure();
    }

    #[test]
    fn test_config_validate_reports_problems() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("vizflow.toml"), "[server]\nport = 0\n").unwrap();
        vizflow(&dir)
            .args(["config", "validate"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("server.port"));
    }
}
