use anyhow::{Context, Result};
use clap::Parser;
use humansize::{format_size, DECIMAL};
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use sysinfo::System;
use tokio::net::TcpListener;
use webmd_core::{http, JobService, ServiceConfig};

/// WebM transcoding service
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config file and PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins over --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();

    let mut cfg = ServiceConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(port) = args.port {
        cfg.port = port;
    }

    let system = System::new_all();
    let cpus = system.cpus().len();
    let concurrency = cfg.resolved_concurrency(cpus);

    info!("WebM daemon starting");
    info!("Configuration loaded:");
    info!("  Listen: {}:{}", cfg.bind_addr, cfg.port);
    info!("  Work dir: {}", cfg.work_dir.display());
    info!("  FFmpeg: {} / FFprobe: {}", cfg.ffmpeg_bin.display(), cfg.ffprobe_bin.display());
    info!("  Max upload: {}", format_size(cfg.max_upload_bytes, DECIMAL));
    info!("  Encoder slots: {} ({} CPUs, {} RAM)", concurrency, cpus, format_size(system.total_memory(), DECIMAL));
    info!("  Retention: {}s, sweep every {}s", cfg.retention_secs, cfg.sweep_interval_secs);

    let addr = format!("{}:{}", cfg.bind_addr, cfg.port);
    let service = Arc::new(JobService::new(cfg, concurrency));
    service.prepare().await?;

    let sweeper = service.spawn_sweeper();

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("🚀 Listening on {}", addr);

    http::serve(listener, Arc::clone(&service), shutdown_signal())
        .await
        .context("HTTP server failed")?;

    service.shutdown().await;
    if let Err(e) = sweeper.await {
        warn!("Sweeper task ended abnormally: {}", e);
    }

    info!("WebM daemon stopped");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}
