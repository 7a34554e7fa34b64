//! HTTP server command: `vizflow serve`.

use anyhow::Result;

use vizflow::config::VizflowConfig;
use vizflow::server::start_server;

pub async fn cmd_serve(
    mut config: VizflowConfig,
    port: Option<u16>,
    host: Option<String>,
    cors: bool,
) -> Result<()> {
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(host) = host {
        config.server.host = host;
    }
    if cors {
        config.server.cors_permissive = true;
    }

    let errors = config.validate();
    if !errors.is_empty() {
        anyhow::bail!("Invalid configuration:\n  {}", errors.join("\n  "));
    }
    start_server(config).await
}
