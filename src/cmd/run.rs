//! One-shot pipeline run: `vizflow run <dataset> --goal <text>`.
//!
//! The run goes through the same task runner the server uses, and events are
//! printed as they stream. A failed task exits non-zero.

use std::path::PathBuf;

use anyhow::{Context, Result};
use vizflow::config::VizflowConfig;
use vizflow::pipeline::PipelineConfig;
use vizflow::server::build_runner;
use vizflow_common::{TaskEvent, TaskStatus};

pub struct RunArgs {
    pub dataset: PathBuf,
    pub goal: String,
    pub sample_limit: Option<usize>,
    pub task_id: Option<String>,
    pub json: bool,
}

pub async fn cmd_run(config: &VizflowConfig, args: RunArgs) -> Result<()> {
    if !args.dataset.is_file() {
        anyhow::bail!("Dataset {} does not exist", args.dataset.display());
    }
    if args.goal.trim().is_empty() {
        anyhow::bail!("--goal must not be empty");
    }

    let runner = build_runner(config)?;
    let mut pipeline = PipelineConfig::new(&args.dataset, args.goal.as_str()).with_sample_limit(
        args.sample_limit
            .unwrap_or(config.runner.default_sample_limit),
    );
    pipeline.task_id = args.task_id;

    let task_id = runner.submit(pipeline).await?;
    let mut stream = runner.subscribe(&task_id).await?;
    while let Some(event) = stream.next().await {
        if args.json {
            println!("{}", serde_json::to_string(&event)?);
        } else {
            print_event(&event);
        }
    }

    let snapshot = runner.snapshot(&task_id).await?;
    runner.shutdown();

    match (snapshot.status, &snapshot.result, &snapshot.failure) {
        (TaskStatus::Completed, Some(result), _) => {
            if args.json {
                println!(
                    "{}",
                    serde_json::to_string(&snapshot).context("Failed to serialize result")?
                );
            } else {
                println!();
                println!("{}", result.explanation.markdown.trim_end());
                println!();
                println!("chart {} (hash {})", result.chart.chart_id, result.chart_hash);
            }
            Ok(())
        }
        (_, _, Some(failure)) => anyhow::bail!(
            "Task {} failed: {}: {}",
            task_id,
            failure.error_type,
            failure.error_message
        ),
        (status, _, _) => anyhow::bail!("Task {} ended in unexpected state {}", task_id, status),
    }
}

fn print_event(event: &TaskEvent) {
    match event {
        TaskEvent::Started { task_id, .. } => println!("[started]   {}", task_id),
        TaskEvent::NodeCompleted { node, span, .. } => println!(
            "[{:<9}] {} {} in {}ms",
            node, span.operation, span.status, span.metrics.duration_ms
        ),
        TaskEvent::Completed {
            chart_id, rows_out, ..
        } => println!("[completed] chart {} with {} rows", chart_id, rows_out),
        TaskEvent::Failed {
            error_type,
            error_message,
            ..
        } => println!("[failed]    {}: {}", error_type, error_message),
    }
}
