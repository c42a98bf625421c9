use futures::StreamExt;
use kube::runtime::{watcher, Controller};
use kube::{Api, Client};
use sop_operator::config::ControllerConfig;
use sop_operator::controller::actions::ActionRegistry;
use sop_operator::controller::cleanup::StartupCleanup;
use sop_operator::controller::clock::SystemClock;
use sop_operator::controller::cluster::{ClusterApi, KubeCluster};
use sop_operator::controller::{error_policy, reconcile, Context};
use sop_operator::crd::sop::Sop;
use sop_operator::server::{
    create_metrics, run_health_server, shutdown_channel, wait_for_signal, ReadinessState,
};
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting SOP controller");

    let config = ControllerConfig::from_env();
    info!(
        health_port = config.health_port,
        requeue_secs = config.requeue_delay.as_secs(),
        probe = %config.verification.probe.key(),
        reference = %config.verification.reference,
        "Configuration loaded"
    );

    let (shutdown_controller, shutdown_signal) = shutdown_channel();
    let readiness = ReadinessState::new();

    let metrics = create_metrics()
        .map_err(|e| anyhow::anyhow!("Failed to create metrics registry: {}", e))?;
    info!("Prometheus metrics registry initialized");

    let client = match Client::try_default().await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to create Kubernetes client");
            return Err(e.into());
        }
    };
    info!("Connected to Kubernetes cluster");

    // Health server comes up first so liveness passes during cleanup
    let health_port = config.health_port;
    let health_readiness = readiness.clone();
    let health_metrics = metrics.clone();
    let health_handle = tokio::spawn(async move {
        if let Err(e) =
            run_health_server(health_port, health_readiness, health_metrics, shutdown_signal).await
        {
            warn!(error = %e, "Health server failed");
        }
    });

    let cluster: Arc<dyn ClusterApi> = Arc::new(KubeCluster::new(client.clone()));

    // Leftovers from a previous run are removed before any reconciliation
    let startup_cleanup = StartupCleanup::new();
    if let Some(report) = startup_cleanup
        .run_once(&*cluster, &config.verification.probe)
        .await
    {
        metrics.record_cleanup_deletions(report.deletions());
    }

    let registry = ActionRegistry::standard(&config);
    info!(actions = ?registry.identifiers(), "Action registry initialized");

    let ctx = Arc::new(Context::new(
        cluster,
        registry,
        Arc::new(SystemClock),
        Some(metrics.clone()),
        config.requeue_delay,
    ));

    let procedures = Api::<Sop>::all(client);

    readiness.set_ready();
    info!("Controller ready, starting reconciliation loop");

    // error_policy already logs failures
    let controller = Controller::new(procedures, watcher::Config::default())
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            if let Ok((obj, action)) = res {
                info!(sop = %obj.name, action = ?action, "Reconciled");
            }
        });

    tokio::select! {
        _ = controller => {
            info!("Controller stream ended");
        }
        signal = wait_for_signal() => {
            match signal {
                Ok(name) => info!(signal = name, "Initiating graceful shutdown"),
                Err(e) => error!(error = %e, "Failed to listen for termination signals"),
            }
            readiness.set_not_ready();
        }
    }

    shutdown_controller.shutdown();

    info!("Stopping components...");
    if let Err(e) = health_handle.await {
        warn!(error = %e, "Health server task did not exit cleanly");
    }

    info!("SOP controller shut down gracefully");
    Ok(())
}
