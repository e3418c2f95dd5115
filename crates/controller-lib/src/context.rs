//! Shared state threaded through the reconciler, the watcher and the sweep

use crate::cleanup::InstalledObjects;
use crate::cluster::ClusterClient;
use crate::engine::{AllocationEngine, DiscoveryConfig, DEFAULT_FETCH_CONCURRENCY};
use crate::events::EventSink;
use crate::health::HealthRegistry;
use crate::observability::{ControllerMetrics, StructuredLogger};
use crate::telemetry::TelemetrySource;
use std::sync::Arc;
use std::time::Duration;

/// Tunables that are not part of any single request
#[derive(Debug, Clone)]
pub struct Settings {
    pub discovery: DiscoveryConfig,
    /// Requeue delay after a workload was created
    pub created_requeue: Duration,
    /// Requeue delay after a failed reconciliation
    pub error_backoff: Duration,
    /// `None` disables the device health sweep
    pub device_sweep_interval: Option<Duration>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            discovery: DiscoveryConfig {
                agent_namespace: "cmmd-system".to_string(),
                agent_service: "cmmd-agent".to_string(),
                fetch_concurrency: DEFAULT_FETCH_CONCURRENCY,
            },
            created_requeue: Duration::from_secs(1),
            error_backoff: Duration::from_secs(30),
            device_sweep_interval: Some(Duration::from_secs(60)),
        }
    }
}

pub struct Context {
    pub cluster: Arc<dyn ClusterClient>,
    pub telemetry: Arc<dyn TelemetrySource>,
    pub events: Arc<dyn EventSink>,
    pub settings: Settings,
    pub metrics: ControllerMetrics,
    pub logger: StructuredLogger,
    pub health: HealthRegistry,
    pub installed: InstalledObjects,
}

impl Context {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        telemetry: Arc<dyn TelemetrySource>,
        events: Arc<dyn EventSink>,
        settings: Settings,
    ) -> Self {
        Self {
            cluster,
            telemetry,
            events,
            settings,
            metrics: ControllerMetrics::new(),
            logger: StructuredLogger::new("cmmd-controller"),
            health: HealthRegistry::new(),
            installed: InstalledObjects::default(),
        }
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_metrics(mut self, metrics: ControllerMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = health;
        self
    }

    pub fn with_installed(mut self, installed: InstalledObjects) -> Self {
        self.installed = installed;
        self
    }

    /// An allocation engine over this context's collaborators
    pub fn engine(&self) -> AllocationEngine {
        AllocationEngine::new(
            Arc::clone(&self.cluster),
            Arc::clone(&self.telemetry),
            self.settings.discovery.clone(),
        )
        .with_logger(self.logger.clone())
        .with_metrics(self.metrics.clone())
    }
}
