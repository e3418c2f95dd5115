//! Reservation ledger
//!
//! Telemetry reports what the kernel sees as free; the ledger reports what
//! this controller has already promised to workloads it placed. Both are
//! needed: a freshly created workload has not touched its memory yet.

use crate::cluster::ClusterClient;
use crate::error::Result;
use crate::keys;
use crate::workload::pod_memory;
use k8s_openapi::api::core::v1::Pod;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Memory committed per (node, memory domain); an empty domain means "no
/// particular domain", i.e. local memory
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReservationLedger {
    entries: HashMap<(String, String), f64>,
}

impl ReservationLedger {
    /// Build the ledger from every pod carrying the ownership label
    pub async fn build(cluster: &dyn ClusterClient) -> Result<Self> {
        let pods = cluster.list_pods(&keys::operator_selector()).await?;
        let ledger = Self::from_pods(&pods)?;
        debug!(pods = pods.len(), entries = ledger.entries.len(), "Reservation ledger built");
        Ok(ledger)
    }

    /// Aggregate reservations from pod state
    ///
    /// A pod stamped with a replica count stands for its whole workload: the
    /// first pod seen for an (owner, node, domain) reserves `per_pod x
    /// replicas`, later replicas of the same owner add nothing. Unbound pods
    /// are not counted.
    pub fn from_pods(pods: &[Pod]) -> Result<Self> {
        let mut ledger = Self::default();
        let mut counted_owners = HashSet::new();

        for pod in pods {
            let Some(spec) = pod.spec.as_ref() else {
                continue;
            };
            let Some(node) = spec.node_name.as_deref().filter(|n| !n.is_empty()) else {
                continue;
            };

            let annotations = pod.metadata.annotations.as_ref();
            let domain = annotations
                .and_then(|a| a.get(keys::ANNO_HOOK_MEM_DOMAIN))
                .cloned()
                .unwrap_or_default();
            let replicas = annotations
                .and_then(|a| a.get(keys::ANNO_REPLICAS))
                .and_then(|r| r.parse::<i64>().ok());

            let per_pod = pod_memory(spec)?;
            let amount = match replicas {
                Some(replicas) => {
                    let owner = annotations
                        .and_then(|a| a.get(keys::ANNO_OWNER))
                        .cloned()
                        .unwrap_or_default();
                    let namespace = pod.metadata.namespace.clone().unwrap_or_default();
                    let key = (namespace, owner, node.to_string(), domain.clone());
                    if !counted_owners.insert(key) {
                        continue;
                    }
                    per_pod * replicas
                }
                None => per_pod,
            };

            *ledger
                .entries
                .entry((node.to_string(), domain))
                .or_insert(0.0) += amount as f64;
        }

        Ok(ledger)
    }

    /// Memory reserved on a specific domain of a node
    pub fn reserved(&self, node: &str, domain: &str) -> f64 {
        self.entries
            .get(&(node.to_string(), domain.to_string()))
            .copied()
            .unwrap_or(0.0)
    }

    /// Memory reserved on a node without a specific domain
    pub fn unassigned(&self, node: &str) -> f64 {
        self.reserved(node, "")
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, node: &str, domain: &str, bytes: f64) {
        *self
            .entries
            .entry((node.to_string(), domain.to_string()))
            .or_insert(0.0) += bytes;
    }
}
