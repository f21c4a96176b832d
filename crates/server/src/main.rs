use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};

use uploader::{
    recover_pending, FfmpegTool, Layout, OwnershipStore, ServiceConfig, TranscodePipeline, WorkerPool,
};

mod api;
mod auth;
mod error;

use api::AppState;
use auth::UserInfoAuthenticator;

/// Video upload and transcoding service
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Address to listen on, overrides the configuration
    #[arg(short, long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG still wins over the default level
    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();

    let mut cfg = ServiceConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;
    cfg.apply_env_overrides()
        .context("Failed to apply environment overrides")?;
    if let Some(listen) = args.listen {
        cfg.listen_addr = listen;
    }
    cfg.validate().context("Invalid configuration")?;

    info!("Configuration loaded:");
    info!("  Auth URL: {}", cfg.auth_url);
    info!("  API URL: {}/", cfg.api_url());
    info!("  Storage URL: {}/", cfg.storage_url());
    info!("  Temp path: {}", cfg.temp_dir.display());
    info!("  Serve path: {}", cfg.serve_dir.display());
    info!("  Queue capacity: {}", cfg.queue_capacity);

    for dir in [&cfg.temp_dir, &cfg.serve_dir] {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    }

    let pipeline = TranscodePipeline::new(
        Layout::from_config(&cfg),
        Arc::new(OwnershipStore::new()),
        Arc::new(FfmpegTool::from_config(&cfg)),
        WorkerPool::new("fast", cfg.fast_workers, cfg.queue_capacity),
        WorkerPool::new("slow", cfg.slow_workers, cfg.queue_capacity),
    );
    info!(
        "Transcoding with {} fast and {} slow worker(s)",
        pipeline.fast_pool().worker_count(),
        pipeline.slow_pool().worker_count()
    );

    // Pick up uploads a previous run accepted but never finished
    info!("Searching for pending work");
    match recover_pending(&pipeline) {
        Ok(report) => info!(
            "Recovery complete: {} upload(s) queued, {} skipped",
            report.admitted().len(),
            report.skipped().len()
        ),
        Err(e) => warn!("Failed to search pending transcode work: {:#}", e),
    }

    let auth = UserInfoAuthenticator::new(cfg.auth_url.clone())
        .context("Failed to create authentication client")?;
    let state = AppState {
        pipeline: pipeline.clone(),
        auth: Arc::new(auth),
    };
    let app = api::router(state, cfg.max_upload_bytes);

    let listener = tokio::net::TcpListener::bind(&cfg.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", cfg.listen_addr))?;
    info!("Serving at {}", cfg.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("Waiting for in-flight transcodes to finish");
    pipeline.shutdown().await;
    info!("Shut down");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
