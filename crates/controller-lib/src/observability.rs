//! Observability infrastructure for the placement controller
//!
//! Provides:
//! - Prometheus metrics on a per-controller registry (reconcile latency and
//!   outcomes, telemetry fetches, placements, reallocations)
//! - Structured JSON logging with tracing

use crate::engine::{AllocationResult, MemoryDomain, NodeSnapshot};
use crate::quantity::gib;
use prometheus::proto::MetricFamily;
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Histogram buckets for reconcile latency (in seconds)
const RECONCILE_BUCKETS: &[f64] = &[0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

/// Histogram buckets for a single telemetry fetch (in seconds)
const FETCH_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];

struct ControllerMetricsInner {
    registry: Registry,
    reconcile_duration_seconds: Histogram,
    reconciliations: IntCounterVec,
    reconcile_errors: IntCounterVec,
    telemetry_fetch_seconds: Histogram,
    telemetry_errors: IntCounter,
    candidate_nodes: IntGauge,
    placements: IntCounterVec,
    reallocations: IntCounterVec,
    cleanup_failures: IntCounter,
}

fn register<M>(registry: &Registry, metric: M) -> prometheus::Result<M>
where
    M: prometheus::core::Collector + Clone + 'static,
{
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

impl ControllerMetricsInner {
    fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        Ok(Self {
            reconcile_duration_seconds: register(
                &registry,
                Histogram::with_opts(
                    HistogramOpts::new(
                        "cmmd_controller_reconcile_duration_seconds",
                        "Time spent in one reconciliation pass",
                    )
                    .buckets(RECONCILE_BUCKETS.to_vec()),
                )?,
            )?,
            reconciliations: register(
                &registry,
                IntCounterVec::new(
                    Opts::new(
                        "cmmd_controller_reconciliations_total",
                        "Reconciliation passes by outcome",
                    ),
                    &["outcome"],
                )?,
            )?,
            reconcile_errors: register(
                &registry,
                IntCounterVec::new(
                    Opts::new(
                        "cmmd_controller_reconcile_errors_total",
                        "Failed reconciliation passes by error category",
                    ),
                    &["category"],
                )?,
            )?,
            telemetry_fetch_seconds: register(
                &registry,
                Histogram::with_opts(
                    HistogramOpts::new(
                        "cmmd_controller_telemetry_fetch_seconds",
                        "Time spent fetching telemetry from one node agent",
                    )
                    .buckets(FETCH_BUCKETS.to_vec()),
                )?,
            )?,
            telemetry_errors: register(
                &registry,
                IntCounter::new(
                    "cmmd_controller_telemetry_errors_total",
                    "Node agent telemetry fetches that failed",
                )?,
            )?,
            candidate_nodes: register(
                &registry,
                IntGauge::new(
                    "cmmd_controller_candidate_nodes",
                    "Candidate nodes seen in the most recent allocation",
                )?,
            )?,
            placements: register(
                &registry,
                IntCounterVec::new(
                    Opts::new("cmmd_controller_placements_total", "Workloads placed, by memory type"),
                    &["mem_type"],
                )?,
            )?,
            reallocations: register(
                &registry,
                IntCounterVec::new(
                    Opts::new(
                        "cmmd_controller_reallocations_total",
                        "Pods marked for reallocation, by reason",
                    ),
                    &["reason"],
                )?,
            )?,
            cleanup_failures: register(
                &registry,
                IntCounter::new(
                    "cmmd_controller_cleanup_failures_total",
                    "Installed objects that could not be deleted on shutdown",
                )?,
            )?,
            registry,
        })
    }
}

/// Controller metrics for Prometheus exposition
///
/// Each handle owns its own [`Registry`]; clones share it. The controller
/// builds one and hands it to the [`Context`](crate::Context) and the
/// metrics endpoint.
#[derive(Clone)]
pub struct ControllerMetrics {
    inner: Arc<ControllerMetricsInner>,
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerMetrics {
    pub fn new() -> Self {
        let inner = ControllerMetricsInner::new()
            .expect("Failed to register controller metrics in a fresh registry");
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Snapshot of every metric family in this handle's registry
    pub fn gather(&self) -> Vec<MetricFamily> {
        self.inner.registry.gather()
    }

    fn inner(&self) -> &ControllerMetricsInner {
        &self.inner
    }

    pub fn observe_reconcile(&self, duration_secs: f64, outcome: &str) {
        self.inner().reconcile_duration_seconds.observe(duration_secs);
        self.inner()
            .reconciliations
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn inc_reconcile_error(&self, category: &str) {
        self.inner()
            .reconcile_errors
            .with_label_values(&[category])
            .inc();
    }

    pub fn observe_telemetry_fetch(&self, duration_secs: f64, success: bool) {
        self.inner().telemetry_fetch_seconds.observe(duration_secs);
        if !success {
            self.inner().telemetry_errors.inc();
        }
    }

    pub fn set_candidate_nodes(&self, count: i64) {
        self.inner().candidate_nodes.set(count);
    }

    pub fn inc_placement(&self, mem_type: &str) {
        self.inner().placements.with_label_values(&[mem_type]).inc();
    }

    pub fn inc_reallocation(&self, reason: &str) {
        self.inner().reallocations.with_label_values(&[reason]).inc();
    }

    pub fn add_cleanup_failures(&self, count: u64) {
        self.inner().cleanup_failures.inc_by(count);
    }
}

/// Structured logger for placement events
///
/// Provides consistent JSON-formatted logging for node status, candidate
/// evaluation and placement decisions.
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    /// Log a node snapshot: readiness, local totals and each domain
    pub fn log_node_status(&self, node: &NodeSnapshot) {
        if let Some(error) = &node.error {
            warn!(
                event = "node_status",
                controller = %self.instance,
                node = %node.hostname,
                address = %node.address,
                error = %error,
                "Node telemetry unavailable"
            );
            return;
        }

        info!(
            event = "node_status",
            controller = %self.instance,
            node = %node.hostname,
            address = %node.address,
            ready_files = node.ready_files(),
            local_total_gib = gib(node.local_total),
            local_reserved_gib = gib(node.local_reserved),
            local_available_gib = gib(node.local_available),
            "Node status"
        );
        for domain in &node.domains {
            let t = &domain.telemetry;
            debug!(
                event = "domain_status",
                node = %node.hostname,
                domain = t.id,
                cpu_list = %t.cpu_list,
                movable = t.movable,
                device_mode = %t.device_mode,
                device_size_gib = gib(t.device_size),
                status = %t.status,
                total_gib = gib(t.total),
                reserved_gib = gib(domain.reserved_memory),
                available_gib = gib(domain.available_memory),
                device_id = %t.device_id,
                "Memory domain"
            );
        }
    }

    /// Log one local-memory candidate check
    pub fn log_local_candidate(&self, node: &NodeSnapshot, requested: f64, allocatable: bool) {
        debug!(
            event = "local_candidate",
            node = %node.hostname,
            local_available_gib = gib(node.local_available),
            requested_gib = gib(requested),
            allocatable = allocatable,
            "Local memory candidate"
        );
    }

    /// Log one CMMD domain candidate check
    pub fn log_domain_candidate(
        &self,
        node: &NodeSnapshot,
        domain: &MemoryDomain,
        requested: f64,
        allocatable: bool,
    ) {
        debug!(
            event = "domain_candidate",
            node = %node.hostname,
            domain = domain.telemetry.id,
            has_cpu = domain.has_cpu(),
            eligibility_failures = %domain.eligibility().describe(),
            available_gib = gib(domain.available_memory),
            requested_gib = gib(requested),
            allocatable = allocatable,
            "CMMD domain candidate"
        );
    }

    /// Log a change of the best candidate during selection
    pub fn log_best_changed(&self, node: &str, domain: Option<&str>, available: f64) {
        debug!(
            event = "best_candidate",
            node = %node,
            domain = ?domain,
            available_gib = gib(available),
            "Best candidate changed"
        );
    }

    /// Log the final placement decision
    pub fn log_placement(&self, namespace: &str, name: &str, result: &AllocationResult, requested: f64) {
        info!(
            event = "placement_decided",
            controller = %self.instance,
            namespace = %namespace,
            name = %name,
            node = %result.node_name,
            domain = %result.memory_domain,
            cpu_list = %result.cpu_list,
            requested_gib = gib(requested),
            "Placement decided"
        );
    }

    /// Log controller startup
    pub fn log_startup(&self, version: &str, namespace: &str) {
        info!(
            event = "controller_started",
            controller = %self.instance,
            controller_version = %version,
            namespace = %namespace,
            "CMMD placement controller started"
        );
    }

    /// Log controller shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "controller_shutdown",
            controller = %self.instance,
            reason = %reason,
            "CMMD placement controller shutting down"
        );
    }

    /// Log the outcome of the teardown batch
    pub fn log_cleanup(&self, deleted: usize, failed: usize) {
        if failed == 0 {
            info!(
                event = "cleanup_finished",
                controller = %self.instance,
                deleted = deleted,
                "Installed objects removed"
            );
        } else {
            warn!(
                event = "cleanup_finished",
                controller = %self.instance,
                deleted = deleted,
                failed = failed,
                "Some installed objects could not be removed"
            );
        }
    }
}
