use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::api::{self, AppState};
use crate::clock::{Clock, UtcClock};
use crate::config::VizflowConfig;
use crate::runner::{RunnerDeps, TaskRunner};
use crate::store::{ProfileStore, TraceStore};

/// Build the stores and the runner described by `config`.
pub fn build_runner(config: &VizflowConfig) -> Result<TaskRunner> {
    let traces = match &config.storage.trace_dir {
        Some(dir) => TraceStore::with_dir(dir)
            .with_context(|| format!("Failed to open trace directory {}", dir.display()))?,
        None => TraceStore::in_memory(),
    };
    let clock: Arc<dyn Clock> = Arc::new(UtcClock);
    let runner = TaskRunner::spawn(
        RunnerDeps::new(Arc::new(ProfileStore::default()), Arc::new(traces), clock),
        config.runner.to_runner_config(),
    );
    Ok(runner)
}

/// Build the full application router.
pub fn build_router(state: Arc<AppState>, cors_permissive: bool) -> Router {
    let app = api::api_router().with_state(state);
    if cors_permissive {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

/// Start the HTTP server and run until Ctrl+C.
pub async fn start_server(config: VizflowConfig) -> Result<()> {
    let runner = build_runner(&config)?;
    let state = Arc::new(AppState {
        runner: runner.clone(),
        default_sample_limit: config.runner.default_sample_limit,
    });
    let app = build_router(state, config.server.cors_permissive);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, "vizflow server listening");
    println!("vizflow running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    runner.shutdown();
    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn test_router(cors_permissive: bool) -> Router {
        let runner = build_runner(&VizflowConfig::default()).unwrap();
        let state = Arc::new(AppState {
            runner,
            default_sample_limit: 10,
        });
        build_router(state, cors_permissive)
    }

    #[tokio::test]
    async fn test_router_serves_health() {
        let response = test_router(false)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_permissive_cors_sets_allow_origin() {
        let request = Request::builder()
            .uri("/health")
            .header("origin", "http://localhost:5173")
            .body(Body::empty())
            .unwrap();
        let response = test_router(true).oneshot(request).await.unwrap();
        assert!(response.headers().contains_key("access-control-allow-origin"));
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let response = test_router(false)
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_trace_dir_is_created() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = VizflowConfig::default();
        config.storage.trace_dir = Some(dir.path().join("traces"));
        build_runner(&config).unwrap();
        assert!(dir.path().join("traces").is_dir());
    }
}
