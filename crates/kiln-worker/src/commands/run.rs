//! Long-running worker command.

use anyhow::{Context, Result};
use kiln_config::WorkerConfig;
use kiln_core::WorkerId;
use kiln_executor::{KanikoBuilder, KubeCluster, RegistryClient};
use kiln_scheduler::{CallbackNotifier, PgBuildQueue, Processor, ProcessorConfig, QueueLogSink};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::connect;

/// Process build jobs until SIGINT or SIGTERM, then drain.
pub async fn run(cfg: WorkerConfig) -> Result<()> {
    let worker_id = cfg
        .worker_id
        .clone()
        .map(WorkerId::new)
        .unwrap_or_else(WorkerId::generate);

    let pool = connect(&cfg).await?;
    let queue = Arc::new(PgBuildQueue::new(pool));

    let cluster = KubeCluster::new(cfg.namespace.clone())
        .await
        .context("Failed to connect to Kubernetes")?;
    let builder = KanikoBuilder::new(
        Arc::new(cluster),
        Arc::new(RegistryClient::from_settings(&cfg.registry)),
        cfg.clone(),
    )
    .with_log_sink(Arc::new(QueueLogSink::new(queue.clone())));

    let notifier = CallbackNotifier::new(cfg.callback.timeout, cfg.callback.token.clone())?;
    let processor = Processor::new(
        worker_id,
        queue,
        Arc::new(builder),
        ProcessorConfig::from(&cfg),
    )
    .with_notifier(notifier);

    info!(
        namespace = %cfg.namespace,
        registry = %cfg.registry.url,
        sbom = cfg.sbom.enabled,
        signing = cfg.signing.mode().is_some(),
        "Starting build worker"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    processor.run(shutdown).await?;
    Ok(())
}

async fn wait_for_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
    shutdown.cancel();
}
