//! GPU Inventory Controller (GINV)
//!
//! Watches node-feature objects for advertised GPU hardware and publishes
//! one GPUDevice record per physically present GPU, fusing feature labels,
//! the node detection agent, and exporter telemetry into each record.

mod cli;
mod config;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use kube::api::ListParams;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::ResourceExt;
use thiserror::Error;
use tokio::signal;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::Cli;
use config::Config;
use ginv_core::labels::node_has_gpu_hardware_labels;
use ginv_core::metrics::MetricsRegistry;
use ginv_k8s::agents::{HttpDetectionSource, HttpTelemetrySource};
use ginv_k8s::{K8sClient, NodeFeature, NodeReconciler};

/// Initialize the tracing/logging subsystem
fn init_logging(log_level: &str, json_format: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}

/// Shared context of the reconcile workers
struct Ctx {
    reconciler: NodeReconciler,
    workers: Semaphore,
}

#[derive(Debug, Error)]
enum ReconcileError {
    #[error(transparent)]
    Reconcile(#[from] anyhow::Error),
}

/// Map one node-feature object to its node reconciliation.
///
/// Objects without a name or without GPU hardware labels produce no work.
async fn reconcile(feature: Arc<NodeFeature>, ctx: Arc<Ctx>) -> Result<Action, ReconcileError> {
    let node_name = feature.name_any();
    if node_name.is_empty() || !node_has_gpu_hardware_labels(Some(&feature.spec.labels)) {
        debug!(feature = %node_name, "Feature carries no GPU hardware, skipping");
        return Ok(Action::await_change());
    }

    let _permit = ctx
        .workers
        .acquire()
        .await
        .context("Worker pool closed")?;

    let outcome = ctx.reconciler.reconcile_node(&node_name).await?;
    Ok(match outcome.requeue_after {
        Some(delay) => Action::requeue(delay),
        None => Action::await_change(),
    })
}

fn error_policy(feature: Arc<NodeFeature>, error: &ReconcileError, _ctx: Arc<Ctx>) -> Action {
    warn!(
        node = %feature.name_any(),
        error = %error,
        "Node reconciliation failed, requeueing"
    );
    Action::requeue(Duration::from_secs(30))
}

/// Build the node reconciler from config.
fn build_reconciler(client: K8sClient, config: &Config) -> Result<NodeReconciler> {
    let approval = config.approval.build_policy()?;
    let telemetry = HttpTelemetrySource::new(
        client.clone(),
        config.workloads_namespace.clone(),
        config.telemetry.app_label.clone(),
        config.telemetry.timeout,
    )?;
    let detection = HttpDetectionSource::new(
        client.clone(),
        config.workloads_namespace.clone(),
        config.detection.app_label.clone(),
        config.detection.timeout,
    )?;

    Ok(NodeReconciler::new(
        client,
        Arc::new(telemetry),
        Arc::new(detection),
        approval,
        Arc::new(MetricsRegistry::new()),
    )
    .with_requeue(config.requeue.base, config.requeue.cap))
}

/// Run the controller until shutdown
async fn run(config: Config, mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
    let client = K8sClient::new().await?;
    client.health_check().await?;

    let reconciler = build_reconciler(client.clone(), &config)?;
    let ctx = Arc::new(Ctx {
        reconciler,
        workers: Semaphore::new(config.workers),
    });

    if config.metrics.enabled {
        let port = config.metrics.port;
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(port).await {
                error!(error = %e, "Metrics server failed");
            }
        });
    }

    info!(workers = config.workers, "Starting node-feature controller");

    let features = client.node_features();
    Controller::new(features, watcher::Config::default())
        .graceful_shutdown_on(async move {
            let _ = shutdown_rx.changed().await;
        })
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((feature, _)) => debug!(feature = %feature, "Reconciliation complete"),
                Err(e) => debug!(error = %e, "Controller stream error"),
            }
        })
        .await;

    info!("GINV shutdown complete");
    Ok(())
}

/// Reconcile every GPU node once and exit (--once mode)
async fn run_once(config: Config) -> Result<()> {
    let client = K8sClient::new().await?;
    let reconciler = build_reconciler(client.clone(), &config)?;

    let features = client
        .node_features()
        .list(&ListParams::default())
        .await
        .context("Failed to list node features")?;

    for feature in features.items {
        let node_name = feature.name_any();
        if node_name.is_empty() || !node_has_gpu_hardware_labels(Some(&feature.spec.labels)) {
            continue;
        }

        match reconciler.reconcile_node(&node_name).await {
            Ok(outcome) => info!(node = %node_name, requeue = ?outcome.requeue_after, "Node reconciled"),
            Err(e) => warn!(node = %node_name, error = %format!("{e:#}"), "Node reconciliation failed"),
        }
    }

    Ok(())
}

/// Start the Prometheus metrics HTTP server
async fn start_metrics_server(port: u16) -> Result<()> {
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(port = port, "Metrics server listening");

    loop {
        let (mut socket, _) = listener.accept().await?;

        tokio::spawn(async move {
            let mut buf = [0; 1024];
            let _ = socket.read(&mut buf).await;

            let metrics_output = prometheus::TextEncoder::new()
                .encode_to_string(&prometheus::gather())
                .unwrap_or_default();

            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\n\r\n{}",
                metrics_output.len(),
                metrics_output
            );

            let _ = socket.write_all(response.as_bytes()).await;
        });
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse_args();

    // Initialize logging
    init_logging(&cli.log_level, cli.log_json);

    info!(version = env!("CARGO_PKG_VERSION"), "GINV starting");

    // Load configuration
    let mut config = if cli.config.exists() {
        Config::from_file(&cli.config)
            .with_context(|| format!("Failed to load config from {:?}", cli.config))?
    } else {
        warn!(path = ?cli.config, "Config file not found, using defaults");
        Config::default()
    };

    // Apply CLI overrides
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }

    // Validate configuration; a bad approval selector must fail startup.
    config.validate().context("Invalid configuration")?;
    config
        .approval
        .build_policy()
        .context("Invalid approval policy")?;

    info!(
        workers = config.workers,
        approval_mode = %config.approval.mode,
        "Configuration loaded"
    );

    if cli.once {
        info!("Running single reconciliation pass (--once mode)");
        return run_once(config).await;
    }

    // Setup shutdown signal handler
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("Failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C, initiating shutdown");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating shutdown");
            }
        }

        let _ = shutdown_tx.send(true);
    });

    // Run main controller loop
    run(config, shutdown_rx).await
}
