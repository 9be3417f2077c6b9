use anyhow::{Context, Result};
use gateway_api::apis::experimental::grpcroutes::GRPCRoute;
use gateway_api::apis::standard::httproutes::HTTPRoute;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tunnel_control::apis::gateway::gateway::GatewayReconciler;
use tunnel_control::apis::gateway::gateway_class::GatewayClassReconciler;
use tunnel_control::apis::gateway::route::RouteReconciler;
use tunnel_control::apis::gateway::secret_watcher::WatchedSecrets;
use tunnel_control::apis::gateway::status::KubeStatusWriter;
use tunnel_control::config::ControllerConfig;
use tunnel_control::credentials::{ConfigResolver, KubeConfigResolver};
use tunnel_control::sync::{KubeClusterReader, SyncDeps, SyncOrchestrator};
use tunnel_control::tunnel::CloudflareTunnelClient;

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("TUNNEL_LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize rustls crypto provider (needed for Kubernetes and tunnel API TLS)
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok(); // Ignore error if already installed

    init_tracing();

    let config = ControllerConfig::from_env().context("invalid configuration")?;
    info!(
        controller_name = %config.controller_name,
        gateway_class = %config.gateway_class_name,
        api = %config.api.base_url,
        "Starting tunnel gateway controller"
    );

    let client = kube::Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    let watched_secrets = Arc::new(WatchedSecrets::new());
    let resolver: Arc<dyn ConfigResolver> =
        Arc::new(KubeConfigResolver::new(client.clone(), watched_secrets.clone()));
    let tunnel = CloudflareTunnelClient::new(config.api.base_url.clone(), config.api.timeout())
        .context("failed to build tunnel API client")?;

    let orchestrator = Arc::new(SyncOrchestrator::new(
        config.gateway_class_name.clone(),
        config.controller_name.clone(),
        config.cluster_domain.clone(),
        config.timing.clone(),
        SyncDeps {
            resolver: resolver.clone(),
            tunnel: Arc::new(tunnel),
            reader: Arc::new(KubeClusterReader::new(client.clone())),
            status: Arc::new(KubeStatusWriter::new(
                client.clone(),
                config.controller_name.clone(),
                config.status_retries,
            )),
        },
    ));

    let mut handles = vec![];

    // Metrics and health
    let server_orchestrator = orchestrator.clone();
    let metrics_addr = config.metrics_addr;
    handles.push(tokio::spawn(async move {
        if let Err(e) = tunnel_control::server::serve(metrics_addr, server_orchestrator).await {
            error!("Metrics server error: {}", e);
        }
    }));

    // Initial sync; controllers defer until it completes
    let startup = orchestrator.clone();
    handles.push(tokio::spawn(async move { startup.run_startup().await }));

    let gc_reconciler = GatewayClassReconciler::new(
        client.clone(),
        config.controller_name.clone(),
        resolver,
        orchestrator.clone(),
    );
    handles.push(tokio::spawn(async move {
        if let Err(e) = gc_reconciler.run().await {
            error!("GatewayClass controller error: {}", e);
        }
    }));

    let gw_reconciler = GatewayReconciler::new(client.clone(), orchestrator.clone(), watched_secrets);
    handles.push(tokio::spawn(async move {
        if let Err(e) = gw_reconciler.run().await {
            error!("Gateway controller error: {}", e);
        }
    }));

    let http_reconciler = RouteReconciler::<HTTPRoute>::new(client.clone(), orchestrator.clone());
    handles.push(tokio::spawn(async move {
        if let Err(e) = http_reconciler.run().await {
            error!("HTTPRoute controller error: {}", e);
        }
    }));

    let grpc_reconciler = RouteReconciler::<GRPCRoute>::new(client, orchestrator);
    handles.push(tokio::spawn(async move {
        if let Err(e) = grpc_reconciler.run().await {
            error!("GRPCRoute controller error: {}", e);
        }
    }));

    info!("Gateway API controllers started");

    shutdown_signal().await;
    info!("Shutdown signal received");

    // In-flight tunnel writes are not rolled back
    for handle in handles {
        handle.abort();
    }

    Ok(())
}
