//! CMMD placement controller
//!
//! Runs as a Deployment in the operator namespace. Reconciles `CMMD`
//! allocation requests into placed workloads, watches placed pods for
//! reallocation and serves health and metrics.

use anyhow::{Context as _, Result};
use controller_lib::{
    cleanup,
    cluster::KubeCluster,
    controller,
    events::KubeEventSink,
    health::{components, HealthRegistry},
    observability::{ControllerMetrics, StructuredLogger},
    telemetry::HttpTelemetryClient,
    watcher::{run_device_sweep, ReallocationWatcher},
    Context,
};
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const CONTROLLER_NAME: &str = "cmmd-controller";
const CONTROLLER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting {}", CONTROLLER_NAME);

    let config = config::ControllerConfig::load()?;
    info!(
        namespace = %config.namespace,
        agent_service = %config.agent_service,
        "Controller configured"
    );

    let client = Client::try_default()
        .await
        .context("failed to build Kubernetes client")?;

    let health_registry = HealthRegistry::new();
    health_registry.register(components::RECONCILER).await;
    health_registry.register(components::WATCHER).await;

    let settings = config.settings();
    if settings.device_sweep_interval.is_some() {
        health_registry.register(components::DEVICE_SWEEP).await;
    }

    let metrics = ControllerMetrics::new();
    let instance = config
        .instance
        .clone()
        .unwrap_or_else(|| CONTROLLER_NAME.to_string());
    let logger = StructuredLogger::new(&instance);
    logger.log_startup(CONTROLLER_VERSION, &config.namespace);

    let telemetry = HttpTelemetryClient::new(config.telemetry())
        .context("failed to build node-agent telemetry client")?;
    let ctx = Arc::new(
        Context::new(
            Arc::new(KubeCluster::new(client.clone())),
            Arc::new(telemetry),
            Arc::new(KubeEventSink::new(
                client.clone(),
                CONTROLLER_NAME,
                config.instance.clone(),
            )),
            settings,
        )
        .with_logger(logger.clone())
        .with_metrics(metrics.clone())
        .with_health(health_registry.clone())
        .with_installed(config.installed_objects()?),
    );

    let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    let watcher_handle = tokio::spawn(
        ReallocationWatcher::new().run(Api::<Pod>::all(client.clone()), Arc::clone(&ctx)),
    );
    let sweep_handle = ctx
        .settings
        .device_sweep_interval
        .map(|interval| tokio::spawn(run_device_sweep(Arc::clone(&ctx), interval)));

    health_registry.set_ready(true).await;

    // Returns once a shutdown signal has drained the controller
    controller::run(client, Arc::clone(&ctx), config.reconcile_concurrency).await;

    logger.log_shutdown("signal received");
    health_registry.set_ready(false).await;
    watcher_handle.abort();
    if let Some(handle) = sweep_handle {
        handle.abort();
    }

    if config.cleanup_on_shutdown && !ctx.installed.is_empty() {
        let report = cleanup::teardown(Arc::clone(&ctx.cluster), &ctx.installed).await;
        ctx.metrics.add_cleanup_failures(report.failed.len() as u64);
        logger.log_cleanup(report.deleted.len(), report.failed.len());
    }

    api_handle.abort();
    info!("Shutting down");

    Ok(())
}
