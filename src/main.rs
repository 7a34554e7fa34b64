use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use vizflow::config::VizflowConfig;
use vizflow::logging::init_tracing;

mod cmd;

#[derive(Parser)]
#[command(name = "vizflow")]
#[command(version, about = "Traced chart recommendation pipeline")]
pub struct Cli {
    /// Path to vizflow.toml. Defaults to ./vizflow.toml when present.
    #[arg(long, global = true, env = "VIZFLOW_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP API
    Serve {
        /// Port to serve on
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind
        #[arg(long)]
        host: Option<String>,

        /// Allow requests from any origin
        #[arg(long)]
        cors: bool,
    },
    /// Run the pipeline over a dataset and stream its progress
    Run {
        /// JSON file holding an array of records
        dataset: PathBuf,

        /// What the chart should show
        #[arg(short, long)]
        goal: String,

        /// Maximum groups kept by the transform stage
        #[arg(long)]
        sample_limit: Option<usize>,

        /// Use this task id instead of a generated one
        #[arg(long)]
        task_id: Option<String>,

        /// Print events and the final result as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Print the resolved configuration as TOML
    Show,
    /// Check the configuration for problems
    Validate,
    /// Write a default vizflow.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    // `config init` writes the file, so it must not require one
    let mut config = match &cli.command {
        Commands::Config {
            command: Some(ConfigCommands::Init),
        } => VizflowConfig::default(),
        _ => VizflowConfig::resolve(cli.config.as_deref())?,
    };
    if cli.verbose {
        config.logging.level = "debug".to_string();
    }
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve { port, host, cors } => {
            cmd::cmd_serve(config, port, host, cors).await?;
        }
        Commands::Run {
            dataset,
            goal,
            sample_limit,
            task_id,
            json,
        } => {
            let args = cmd::RunArgs {
                dataset,
                goal,
                sample_limit,
                task_id,
                json,
            };
            cmd::cmd_run(&config, args).await?;
        }
        Commands::Config { command } => {
            cmd::cmd_config(cli.config.as_deref(), &config, command)?;
        }
    }
    Ok(())
}
