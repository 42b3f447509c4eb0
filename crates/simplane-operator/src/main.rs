//! simplane - multi-tenant simulation job control plane

mod cli;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use simplane_common::telemetry::{init_telemetry, TelemetryConfig};
use simplane_controller::ControlPlane;
use simplane_orchestrator::{create_client_with_timeout, KubeOrchestrator};
use simplane_store::{MemoryStore, PostgresStore, Store};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cli::{Cli, StoreBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Kubernetes and Postgres TLS both go through rustls
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install aws-lc-rs crypto provider: {e:?}");
        std::process::exit(1);
    }

    let cli = Cli::parse();
    init_telemetry(TelemetryConfig::default()).context("failed to initialize telemetry")?;

    let settings = cli
        .control_plane_settings()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;

    let store = build_store(&cli).await?;
    let client = create_client_with_timeout(
        cli.kubeconfig.as_deref(),
        Duration::from_secs(cli.kube_connect_timeout_secs),
        Duration::from_secs(cli.kube_read_timeout_secs),
    )
    .await
    .context("failed to create Kubernetes client")?;
    let orchestrator = Arc::new(KubeOrchestrator::new(client));

    let max_payload_bytes = settings.admission.max_payload_bytes;
    let plane = ControlPlane::new(store, orchestrator, settings);

    let cancel = CancellationToken::new();
    let reconciler = tokio::spawn(plane.reconciler.clone().run(cancel.clone()));
    let sweeper = tokio::spawn(plane.reconciler.clone().run_sweeper(cancel.clone()));
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let listener = TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("failed to bind {}", cli.listen))?;
    let app = simplane_api::router(plane, max_payload_bytes);
    let served = simplane_api::serve(listener, app, cancel.clone()).await;

    // Stop the loops whether the server exited on a signal or on an error
    cancel.cancel();
    await_loop("reconciler", reconciler).await;
    await_loop("sweeper", sweeper).await;

    served.context("HTTP server failed")?;
    info!("simplane stopped");
    Ok(())
}

async fn build_store(cli: &Cli) -> anyhow::Result<Arc<dyn Store>> {
    match cli.store {
        StoreBackend::Postgres => {
            // connect applies outstanding migrations
            let store = PostgresStore::connect(&cli.store_settings())
                .await
                .context("failed to connect to the job store")?;
            info!("using postgres job store");
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            warn!("using in-memory job store; state is lost on exit");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

async fn await_loop(name: &str, handle: JoinHandle<()>) {
    if let Err(e) = handle.await {
        error!(task = name, error = %e, "background loop ended abnormally");
    }
}

/// Cancel `cancel` on SIGINT or SIGTERM
async fn cancel_on_signal(cancel: CancellationToken) {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
        _ = cancel.cancelled() => return,
    }
    cancel.cancel();
}
