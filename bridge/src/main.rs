//! ruleset-cache-server: RuleSet reconciler and pull-based ruleset cache.

use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use bridge::cluster::{ClusterClient, InMemoryCluster, ManifestLoader};
use bridge::config::ServerConfig;
use bridge::grpc_server::{start_grpc_server, RuleSetDistributionService};
use bridge::refresh::{RefreshService, ResyncScheduler};
use bridge::telemetry::SubscriptionTracker;
use bridge::{Controller, DistributionServer, RuleSetCache, ServerError};

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    let config = ServerConfig::parse();

    // Initialize tracing; `log` records from the libraries are bridged in.
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_filter)),
        )
        .init();

    config.validate()?;
    let addr = config.socket_addr()?;

    let cluster = Arc::new(InMemoryCluster::new());
    let loader = match &config.manifest_dir {
        Some(dir) => {
            let loader = Arc::new(ManifestLoader::new(dir.clone(), Arc::clone(&cluster)));
            let stats = loader.load_once()?;
            info!(
                "loaded {} objects from {} manifest files in {}",
                stats.objects,
                stats.files,
                dir.display()
            );
            Some(loader)
        }
        None => {
            warn!("no manifest directory configured, starting with an empty cluster");
            None
        }
    };
    let cluster_client: Arc<dyn ClusterClient> = cluster;

    let cache = Arc::new(RuleSetCache::new(config.history_size));
    let subscriptions = Arc::new(SubscriptionTracker::new());
    let distribution = Arc::new(DistributionServer::new(
        Arc::clone(&cache),
        Arc::clone(&subscriptions),
    ));
    info!("server id {}", distribution.server_id());

    let controller = Controller::new(
        Arc::clone(&cluster_client),
        Arc::clone(&cache),
        config.controller_config(),
    );
    let refresh = Arc::new(RefreshService::new(
        Arc::clone(&cluster_client),
        controller.queue(),
    ));
    let mut scheduler = ResyncScheduler::new(
        controller.context(),
        Arc::clone(&subscriptions),
        config.scheduler_config(),
    );
    if let Some(loader) = loader {
        scheduler = scheduler.with_manifests(loader);
    }
    let scheduler = Arc::new(scheduler);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    {
        let shutdown_tx = Arc::clone(&shutdown_tx);
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("received Ctrl-C, shutting down"),
                Err(e) => error!("failed to listen for Ctrl-C: {}", e),
            }
            let _ = shutdown_tx.send(true);
        });
    }

    let mut controller_task = tokio::spawn(controller.run(shutdown_rx.clone()));
    let scheduler_task = tokio::spawn(Arc::clone(&scheduler).run(shutdown_rx.clone()));
    let mut grpc_task = tokio::spawn(start_grpc_server(
        addr,
        RuleSetDistributionService::new(distribution, refresh),
        shutdown_rx,
    ));

    // Whichever of the controller and the gRPC server stops first takes the
    // rest down with it.
    let (controller_result, grpc_result) = tokio::select! {
        result = &mut controller_task => {
            let _ = shutdown_tx.send(true);
            (result, grpc_task.await)
        }
        result = &mut grpc_task => {
            let _ = shutdown_tx.send(true);
            (controller_task.await, result)
        }
    };
    scheduler_task.await?;

    controller_result??;
    grpc_result??;
    info!("ruleset-cache-server stopped");
    Ok(())
}
