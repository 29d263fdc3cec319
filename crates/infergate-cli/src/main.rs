use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::Parser;
use infergate_cli::cli::Cli;
use infergate_cli::server::{self, AppState};
use infergate_cli::shutdown::{ShutdownController, ShutdownEvent, spawn_ctrl_c_handler};
use infergate_cli::pid;
use infergate_core::{Engine, InferenceConfig, ServerConfig};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| cli.log_level.clone());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let server_yaml = std::fs::read_to_string(&cli.server_config)
        .map_err(|e| anyhow::anyhow!("reading {}: {e}", cli.server_config.display()))?;
    let inference_yaml = std::fs::read_to_string(&cli.inference_config)
        .map_err(|e| anyhow::anyhow!("reading {}: {e}", cli.inference_config.display()))?;

    let server_cfg = ServerConfig::load(&server_yaml)?;
    let inference_cfg = InferenceConfig::load(&inference_yaml)?;

    let engine = Arc::new(Engine::bootstrap(&server_cfg, &inference_cfg).await?);
    tracing::info!(models = ?engine.model_keys(), "engine bootstrapped");

    let cwd = std::env::current_dir()?;
    pid::write_pid_file(&cwd)?;
    pid::write_version_file(&cwd)?;

    let port = server_cfg.ports()?.first().copied().unwrap_or(8080);
    let listener = TcpListener::bind((server_cfg.interface.host.as_str(), port)).await?;
    tracing::info!(%port, "listening");

    let customized_predict_http = server_cfg.interface.customized_predict_http.clone();
    let state = Arc::new(AppState {
        engine: Arc::clone(&engine),
        online: AtomicBool::new(cli.online),
        server_yaml,
        inference_yaml,
        customized_predict_http,
    });

    let serve_task = tokio::spawn(server::serve(listener, Arc::clone(&state)));

    let shutdown = Arc::new(ShutdownController::new());
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::unbounded_channel::<ShutdownEvent>();
    spawn_ctrl_c_handler(Arc::clone(&shutdown), shutdown_tx);

    loop {
        tokio::select! {
            ev = shutdown_rx.recv() => {
                match ev {
                    Some(ShutdownEvent::Graceful) => {
                        tracing::info!("shutdown requested, draining in-flight requests");
                        break;
                    }
                    Some(ShutdownEvent::Immediate) | None => {
                        tracing::warn!("immediate shutdown requested");
                        serve_task.abort();
                        engine.shutdown().await;
                        return Ok(());
                    }
                }
            }
        }
    }

    serve_task.abort();
    engine.shutdown().await;
    Ok(())
}
