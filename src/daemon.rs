//! Daemon supervisor: configuration, logging, signals and the gRPC server.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use simda_metrics::MetricFlags;
use simda_proto::pb::simda_server::SimdaServer;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::DaemonConfig;
use crate::server::SimdaService;
use crate::watcher;

pub async fn run(config_path: PathBuf) -> Result<()> {
    let cfg = DaemonConfig::load(&config_path).unwrap_or_else(|e| {
        eprintln!("load config error: {e:#}");
        eprintln!("use default values");
        DaemonConfig::default()
    });

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::new(cfg.log_level.as_directive()))
        .init();

    let flags = Arc::new(MetricFlags::all_enabled());
    cfg.apply_metrics(&flags);

    let _config_watcher = match watcher::spawn(config_path, flags.clone()) {
        Ok(w) => Some(w),
        Err(e) => {
            warn!(error = %e, "config watcher unavailable, hot reload disabled");
            None
        }
    };

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_shutdown_signal(shutdown.clone()));

    let addr = format!("{}:{}", cfg.host, cfg.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(grpc = %addr, "server started");

    let service = SimdaService::new(flags, cfg.system_paths(), shutdown.clone());

    Server::builder()
        .add_service(SimdaServer::new(service))
        .serve_with_incoming_shutdown(
            TcpListenerStream::new(listener),
            shutdown.clone().cancelled_owned(),
        )
        .await
        .context("grpc server failed")?;

    info!("server stopped");
    Ok(())
}

/// Resolves when SIGINT, SIGTERM or SIGHUP is delivered, then cancels the
/// server token so active streams drain and the listener closes.
async fn wait_for_shutdown_signal(shutdown: CancellationToken) {
    let mut interrupt = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut terminate = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut hangup = signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");

    tokio::select! {
        _ = interrupt.recv() => info!("SIGINT received, shutting down"),
        _ = terminate.recv() => info!("SIGTERM received, shutting down"),
        _ = hangup.recv() => info!("SIGHUP received, shutting down"),
    }
    shutdown.cancel();
}
