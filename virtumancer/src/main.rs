use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use virtumancer::rest::create_router;
use virtumancer::{Args, Service, Store};
use virtumancer_hv::DriverRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_filter()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tokio::fs::create_dir_all(&args.data_dir)
        .await
        .with_context(|| format!("failed to create data directory {}", args.data_dir.display()))?;
    let store = Store::open(&args.data_dir)
        .await
        .with_context(|| format!("failed to open inventory in {}", args.data_dir.display()))?;

    info!(
        "Starting virtumancer - HTTP: {}, data: {}",
        args.listen,
        args.data_dir.display()
    );

    let token = CancellationToken::new();
    let service = Service::start(
        store,
        Arc::new(DriverRegistry::with_defaults()),
        args.service_config(),
        token.clone(),
    )
    .await
    .context("failed to start service")?;

    let listener = tokio::net::TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    info!("Listening on {}", listener.local_addr()?);

    let router = create_router(Arc::clone(&service));
    let server_token = token.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(server_token.cancelled_owned())
            .await
    });

    // Wait for shutdown signal
    let ctrl_c = signal::ctrl_c();
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;
    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }

    service.shutdown().await;
    server.await?.context("server error")?;
    info!("Shutdown complete");
    Ok(())
}
