//! Orchestrator server binary.
//!
//! Boots the durable components a host application needs before it can
//! drive workflow runs: the process-local message bus (C2), the
//! filesystem-backed state store with startup eviction (C5), the resumer's
//! interrupted-task scan (C6), and the WebSocket streaming server (C4).
//! Wiring an actual [`orchestrator::Orchestrator`] run requires concrete
//! planner/generator/tool collaborators (SPEC_FULL.md §6); those are
//! supplied by the embedding application, not this binary.

use std::net::SocketAddr;
use std::sync::Arc;

use orchestrator::config::OrchestratorConfig;
use orchestrator::{MessageBus, Resumer, ServerConfig, StateStore, StreamingServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(rust_log).init();

    let config_path = std::env::var("ORCHESTRATOR_CONFIG")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| std::path::PathBuf::from("orchestrator.toml"));
    let config = OrchestratorConfig::load(Some(&config_path))
        .map_err(|e| format!("loading configuration: {e}"))?;
    tracing::info!(path = %config_path.display(), "configuration loaded");

    let state_store = StateStore::new(config.state.base_dir.clone())
        .with_max_age(std::time::Duration::from_secs(config.state.max_age_days * 24 * 3600));

    let evicted = state_store
        .evict_aged()
        .map_err(|e| format!("evicting aged task state: {e}"))?;
    if evicted > 0 {
        tracing::info!(count = evicted, "evicted aged task directories");
    }

    let resumer = Resumer::new(StateStore::new(config.state.base_dir.clone()));
    match resumer.list_interrupted() {
        Ok(interrupted) if !interrupted.is_empty() => {
            tracing::info!(
                count = interrupted.len(),
                "found interrupted tasks from a prior run; newest is {:?}",
                interrupted.first()
            );
        }
        Ok(_) => tracing::info!("no interrupted tasks found"),
        Err(e) => tracing::warn!("failed to scan for interrupted tasks: {e}"),
    }

    let bus = Arc::new(MessageBus::new());

    let server_config = ServerConfig {
        host: config.server.host.clone(),
        port: config.server.port,
        auth_token: config.server.auth_token.clone(),
        messages_per_second: config.server.messages_per_second,
        heartbeat_interval: config.server.heartbeat_interval(),
        max_queue_size: config.server.max_queue_size,
        max_frame_bytes: config.server.max_frame_bytes,
        batch_size: config.server.batch_size,
        batch_interval: config.server.batch_interval(),
        descriptor_path: config.server.descriptor_path.clone(),
    };

    let server = StreamingServer::new(bus.clone(), server_config);
    server.start().map_err(|e| format!("starting streaming server: {e}"))?;
    let heartbeat_task = server.spawn_background_tasks();

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "orchestrator streaming server listening");

    axum::serve(listener, server.router().into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    heartbeat_task.abort();
    server.stop().map_err(|e| format!("stopping streaming server: {e}"))?;
    tracing::info!("orchestrator server shut down gracefully");
    Ok(())
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
