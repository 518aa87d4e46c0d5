//! Orchestrator server binary: loads `RuntimeConfig`, registers flow graphs
//! found under `FLOWS_DIR` (default `./flows`), and serves the external API
//! (spec §6, §9, §10.1) until a shutdown signal arrives.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use stepflow_core::FlowGraph;
use stepflow_orchestrator::api::create_router;
use stepflow_orchestrator::config::RuntimeConfig;
use stepflow_orchestrator::engine::ScriptedEngine;
use stepflow_orchestrator::oracle::ScriptedOracle;
use stepflow_orchestrator::Runtime;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(rust_log).init();

    tracing::info!("loading runtime configuration");
    let config_path = std::env::var("CONFIG_PATH").ok().map(PathBuf::from);
    let config = RuntimeConfig::load(config_path.as_deref())?;
    tracing::info!(bind_addr = %config.bind_addr, runs_root = %config.runs_root, "configuration loaded");

    // TODO(stepflow): wire a real engine adapter (the external-call boundary)
    // once a driver is chosen; ScriptedEngine keeps the server runnable for
    // flows that only exercise deterministic transitions.
    let engine = Arc::new(ScriptedEngine::new());
    let oracle = Arc::new(ScriptedOracle::unavailable());
    let runtime = Arc::new(Runtime::new(config.clone(), engine, oracle));

    let flows_dir = std::env::var("FLOWS_DIR").unwrap_or_else(|_| "./flows".to_string());
    match load_flows(&runtime, Path::new(&flows_dir)).await {
        Ok(count) => tracing::info!(flows_dir = %flows_dir, count, "registered flow graphs"),
        Err(e) => tracing::warn!(flows_dir = %flows_dir, error = %e, "no flow graphs registered at startup"),
    }

    let addr: SocketAddr = runtime.config().bind_addr.parse()?;
    let app = create_router(runtime);

    tracing::info!("starting orchestrator server on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("orchestrator server shut down gracefully");
    Ok(())
}

/// Reads every `*.json` file under `dir` as a serialized `FlowGraph` and
/// registers it. A missing directory is tolerated; flows can also be
/// registered later through an admin path.
async fn load_flows(runtime: &Runtime, dir: &Path) -> std::io::Result<usize> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut count = 0usize;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping unreadable flow file");
                continue;
            }
        };
        let graph: FlowGraph = match serde_json::from_str(&text) {
            Ok(g) => g,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping invalid flow graph");
                continue;
            }
        };
        tracing::info!(flow_id = %graph.id, path = %path.display(), "registered flow graph");
        runtime.register_flow(graph);
        count += 1;
    }
    Ok(count)
}

/// Signal for graceful shutdown (Ctrl-C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL-C signal handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received CTRL-C signal, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM signal, shutting down"),
    }
}
