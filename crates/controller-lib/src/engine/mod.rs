//! Allocation engine
//!
//! Chooses a (node, memory domain, cpu list) for a workload. Each call
//! resolves candidate nodes, locates their agents through the agent
//! service's endpoints, fetches telemetry concurrently and merges it with
//! the reservation ledger before selecting.

mod select;
mod snapshot;

pub use select::{
    admitted, select_auto, select_local, select_manual, AllocationResult, Placement,
};
pub use snapshot::{
    Eligibility, EligibilityFailure, MemoryDomain, NodeSnapshot, DEVICE_SIZE_TOLERANCE_PCT,
};

use crate::cluster::ClusterClient;
use crate::crd::AllocationRequestSpec;
use crate::error::{Error, Result};
use crate::ledger::ReservationLedger;
use crate::observability::{ControllerMetrics, StructuredLogger};
use crate::telemetry::TelemetrySource;
use crate::workload::Workload;
use futures::{stream, StreamExt};
use k8s_openapi::api::core::v1::{Endpoints, Node, Taint};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Default number of agents queried at once
pub const DEFAULT_FETCH_CONCURRENCY: usize = 8;

/// Where the node agents are published
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub agent_namespace: String,
    pub agent_service: String,
    pub fetch_concurrency: usize,
}

#[derive(Clone)]
pub struct AllocationEngine {
    cluster: Arc<dyn ClusterClient>,
    telemetry: Arc<dyn TelemetrySource>,
    discovery: DiscoveryConfig,
    metrics: ControllerMetrics,
    logger: StructuredLogger,
}

impl AllocationEngine {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        telemetry: Arc<dyn TelemetrySource>,
        discovery: DiscoveryConfig,
    ) -> Self {
        Self {
            cluster,
            telemetry,
            discovery,
            metrics: ControllerMetrics::new(),
            logger: StructuredLogger::new("cmmd-controller"),
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

    /// Pick a placement for `workload` under `spec`
    ///
    /// `requested` is the workload's total memory (per pod times replicas),
    /// computed once by the caller.
    pub async fn allocate(
        &self,
        spec: &AllocationRequestSpec,
        workload: &Workload,
        requested: i64,
    ) -> Result<AllocationResult> {
        let nodes = self.snapshots(&workload.node_selector()).await?;
        self.metrics.set_candidate_nodes(nodes.len() as i64);
        for node in &nodes {
            self.logger.log_node_status(node);
        }

        let placement = Placement::from_spec(spec);
        debug!(
            placement = placement.name(),
            candidates = nodes.len(),
            requested_bytes = requested,
            "Selecting placement"
        );
        placement.select(&nodes, &workload.tolerations(), requested as f64, &self.logger)
    }

    /// Fully populated snapshots of every node matching `selector`
    pub async fn snapshots(&self, selector: &BTreeMap<String, String>) -> Result<Vec<NodeSnapshot>> {
        let candidates = self.candidates(selector).await?;
        self.populate(candidates).await
    }

    /// Candidate nodes with their agent addresses, without telemetry
    ///
    /// A node is a candidate once per agent endpoint on its InternalIP;
    /// nodes without an agent endpoint are dropped.
    pub async fn candidates(&self, selector: &BTreeMap<String, String>) -> Result<Vec<NodeSnapshot>> {
        let nodes = self.cluster.list_nodes(selector).await?;
        if nodes.is_empty() {
            return Err(Error::NoCandidateNodes(selector.clone()));
        }

        let endpoints = self
            .cluster
            .get_endpoints(&self.discovery.agent_namespace, &self.discovery.agent_service)
            .await
            .map_err(|e| match e {
                Error::NotFound(what) => Error::Endpoints(format!("{what} not found")),
                other => other,
            })?;

        let candidates = resolve_agents(&nodes, &endpoints);
        debug!(
            nodes = nodes.len(),
            candidates = candidates.len(),
            service = %self.discovery.agent_service,
            "Resolved node agents"
        );
        Ok(candidates)
    }

    /// Fetch telemetry for each candidate and apply the reservation ledger
    pub async fn populate(&self, mut candidates: Vec<NodeSnapshot>) -> Result<Vec<NodeSnapshot>> {
        let ledger = ReservationLedger::build(self.cluster.as_ref()).await?;

        let addresses: Vec<String> = candidates.iter().map(|c| c.address.clone()).collect();
        let mut fetched: Vec<_> = stream::iter(addresses.into_iter().enumerate())
            .map(|(index, address)| async move {
                let start = Instant::now();
                let result = self.telemetry.fetch(&address).await;
                self.metrics
                    .observe_telemetry_fetch(start.elapsed().as_secs_f64(), result.is_ok());
                (index, result)
            })
            .buffer_unordered(self.discovery.fetch_concurrency.max(1))
            .collect()
            .await;
        fetched.sort_by_key(|(index, _)| *index);

        for (index, result) in fetched {
            candidates[index].apply_telemetry(result, &ledger);
        }

        let failed = candidates.iter().filter(|c| !c.is_healthy()).count();
        if failed > 0 {
            info!(failed, total = candidates.len(), "Some node agents did not report");
        }
        Ok(candidates)
    }
}

/// Pair node identities with agent endpoints by InternalIP
///
/// Output follows endpoint order: subsets, then addresses, then ports.
pub fn resolve_agents(nodes: &[Node], endpoints: &Endpoints) -> Vec<NodeSnapshot> {
    let mut by_ip: HashMap<String, (String, Vec<Taint>)> = HashMap::new();
    for node in nodes {
        let mut hostname = String::new();
        let mut ip = String::new();
        let addresses = node.status.as_ref().and_then(|s| s.addresses.as_ref());
        for address in addresses.into_iter().flatten() {
            match address.type_.as_str() {
                "Hostname" => hostname = address.address.clone(),
                "InternalIP" => ip = address.address.clone(),
                _ => {}
            }
        }
        let taints = node
            .spec
            .as_ref()
            .and_then(|s| s.taints.clone())
            .unwrap_or_default();
        by_ip.insert(ip, (hostname, taints));
    }

    let mut candidates = Vec::new();
    for subset in endpoints.subsets.iter().flatten() {
        let ports = subset.ports.as_deref().unwrap_or_default();
        for address in subset.addresses.iter().flatten() {
            let Some((hostname, taints)) = by_ip.get(&address.ip) else {
                continue;
            };
            for port in ports {
                candidates.push(NodeSnapshot::candidate(
                    hostname.clone(),
                    format!("{}:{}", address.ip, port.port),
                    taints.clone(),
                ));
            }
        }
    }
    candidates
}
