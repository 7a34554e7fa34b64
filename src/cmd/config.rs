//! Configuration view and validation: `vizflow config`.

use std::path::Path;

use anyhow::{Context, Result};

use super::super::ConfigCommands;
use vizflow::config::{CONFIG_FILE, VizflowConfig};

pub fn cmd_config(
    config_path: Option<&Path>,
    config: &VizflowConfig,
    command: Option<ConfigCommands>,
) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            let source = match config_path {
                Some(path) => path.display().to_string(),
                None if Path::new(CONFIG_FILE).exists() => CONFIG_FILE.to_string(),
                None => "(defaults)".to_string(),
            };
            println!("# source: {}", source);
            let rendered =
                toml::to_string_pretty(config).context("Failed to render configuration")?;
            print!("{}", rendered);
        }
        Some(ConfigCommands::Validate) => {
            let errors = config.validate();
            if !errors.is_empty() {
                for error in &errors {
                    eprintln!("  - {}", error);
                }
                anyhow::bail!("Configuration has {} problem(s)", errors.len());
            }
            println!("Configuration is valid.");
        }
        Some(ConfigCommands::Init) => {
            let path = config_path.unwrap_or_else(|| Path::new(CONFIG_FILE));
            if path.exists() {
                anyhow::bail!("{} already exists", path.display());
            }
            VizflowConfig::default().save(path)?;
            println!("Wrote {}", path.display());
        }
    }
    Ok(())
}
