//! Workload manifests embedded in allocation requests
//!
//! A request payload may only carry a Pod, a Deployment or a ReplicaSet.
//! Each is kept as its native typed manifest so that stamping placement
//! metadata never goes through untyped maps.

use crate::error::{Error, Result};
use crate::keys;
use crate::quantity::quantity_bytes;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::{Pod, PodSpec, PodTemplateSpec, Toleration};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;

/// Supported workload kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkloadKind {
    Pod,
    Deployment,
    ReplicaSet,
}

impl WorkloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::Pod => "Pod",
            WorkloadKind::Deployment => "Deployment",
            WorkloadKind::ReplicaSet => "ReplicaSet",
        }
    }

    pub fn parse(kind: &str) -> Result<Self> {
        match kind {
            "Pod" => Ok(WorkloadKind::Pod),
            "Deployment" => Ok(WorkloadKind::Deployment),
            "ReplicaSet" => Ok(WorkloadKind::ReplicaSet),
            other => Err(Error::UnsupportedKind(other.to_string())),
        }
    }
}

impl std::fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed workload manifest
#[derive(Debug, Clone, PartialEq)]
pub enum Workload {
    Pod(Pod),
    Deployment(Deployment),
    ReplicaSet(ReplicaSet),
}

impl Workload {
    /// Convert an embedded request payload into a typed manifest
    pub fn from_payload(payload: &serde_json::Value) -> Result<Self> {
        let kind = payload
            .get("kind")
            .and_then(|k| k.as_str())
            .unwrap_or_default();
        let kind = WorkloadKind::parse(kind)?;

        let convert = |source| Error::Payload {
            kind: kind.to_string(),
            source,
        };
        let payload = payload.clone();
        Ok(match kind {
            WorkloadKind::Pod => Workload::Pod(serde_json::from_value(payload).map_err(convert)?),
            WorkloadKind::Deployment => {
                Workload::Deployment(serde_json::from_value(payload).map_err(convert)?)
            }
            WorkloadKind::ReplicaSet => {
                Workload::ReplicaSet(serde_json::from_value(payload).map_err(convert)?)
            }
        })
    }

    pub fn kind(&self) -> WorkloadKind {
        match self {
            Workload::Pod(_) => WorkloadKind::Pod,
            Workload::Deployment(_) => WorkloadKind::Deployment,
            Workload::ReplicaSet(_) => WorkloadKind::ReplicaSet,
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Workload::Pod(p) => &p.metadata,
            Workload::Deployment(d) => &d.metadata,
            Workload::ReplicaSet(r) => &r.metadata,
        }
    }

    pub fn metadata_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Workload::Pod(p) => &mut p.metadata,
            Workload::Deployment(d) => &mut d.metadata,
            Workload::ReplicaSet(r) => &mut r.metadata,
        }
    }

    pub fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or_default()
    }

    pub fn annotations(&self) -> Option<&BTreeMap<String, String>> {
        self.metadata().annotations.as_ref()
    }

    /// Pod spec the workload runs, if one is set
    pub fn pod_spec(&self) -> Option<&PodSpec> {
        match self {
            Workload::Pod(p) => p.spec.as_ref(),
            Workload::Deployment(d) => d.spec.as_ref().and_then(|s| s.template.spec.as_ref()),
            Workload::ReplicaSet(r) => r
                .spec
                .as_ref()
                .and_then(|s| s.template.as_ref())
                .and_then(|t| t.spec.as_ref()),
        }
    }

    /// Node the workload's pods are pinned to, if it has been placed
    pub fn placed_node(&self) -> Option<&str> {
        self.pod_spec()
            .and_then(|s| s.node_name.as_deref())
            .filter(|n| !n.is_empty())
            .or_else(|| {
                self.template_metadata()
                    .and_then(|m| m.labels.as_ref())
                    .and_then(|l| l.get(keys::LABEL_ALLOCATE_NODE))
                    .map(String::as_str)
            })
    }

    /// Mutable pod spec, created empty when missing
    pub fn pod_spec_mut(&mut self) -> &mut PodSpec {
        match self {
            Workload::Pod(p) => p.spec.get_or_insert_with(Default::default),
            Workload::Deployment(d) => d
                .spec
                .get_or_insert_with(Default::default)
                .template
                .spec
                .get_or_insert_with(Default::default),
            Workload::ReplicaSet(r) => replica_set_template(r)
                .spec
                .get_or_insert_with(Default::default),
        }
    }

    /// Metadata of the pods this workload creates; for a Pod, its own metadata
    pub fn template_metadata(&self) -> Option<&ObjectMeta> {
        match self {
            Workload::Pod(p) => Some(&p.metadata),
            Workload::Deployment(d) => d.spec.as_ref().and_then(|s| s.template.metadata.as_ref()),
            Workload::ReplicaSet(r) => r
                .spec
                .as_ref()
                .and_then(|s| s.template.as_ref())
                .and_then(|t| t.metadata.as_ref()),
        }
    }

    pub fn template_annotation(&self, key: &str) -> Option<&str> {
        self.template_metadata()
            .and_then(|m| m.annotations.as_ref())
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }

    pub fn template_metadata_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Workload::Pod(p) => &mut p.metadata,
            Workload::Deployment(d) => d
                .spec
                .get_or_insert_with(Default::default)
                .template
                .metadata
                .get_or_insert_with(Default::default),
            Workload::ReplicaSet(r) => replica_set_template(r)
                .metadata
                .get_or_insert_with(Default::default),
        }
    }

    pub fn node_selector(&self) -> BTreeMap<String, String> {
        self.pod_spec()
            .and_then(|s| s.node_selector.clone())
            .unwrap_or_default()
    }

    pub fn tolerations(&self) -> Vec<Toleration> {
        self.pod_spec()
            .and_then(|s| s.tolerations.clone())
            .unwrap_or_default()
    }

    /// Desired replica count; a bare Pod counts as one
    pub fn replicas(&self) -> i64 {
        let replicas = match self {
            Workload::Pod(_) => None,
            Workload::Deployment(d) => d.spec.as_ref().and_then(|s| s.replicas),
            Workload::ReplicaSet(r) => r.spec.as_ref().and_then(|s| s.replicas),
        };
        replicas.map(i64::from).unwrap_or(1)
    }

    /// Total memory the workload asks for: per-pod memory times replicas
    pub fn requested_memory(&self) -> Result<i64> {
        let per_pod = match self.pod_spec() {
            Some(spec) => pod_memory(spec)?,
            None => 0,
        };
        Ok(per_pod * self.replicas())
    }
}

fn replica_set_template(r: &mut ReplicaSet) -> &mut PodTemplateSpec {
    r.spec
        .get_or_insert_with(Default::default)
        .template
        .get_or_insert_with(Default::default)
}

/// Sum of each container's memory request, falling back to its limit
pub fn pod_memory(spec: &PodSpec) -> Result<i64> {
    let mut total = 0;
    for container in &spec.containers {
        let Some(resources) = container.resources.as_ref() else {
            continue;
        };
        let request = resources.requests.as_ref().and_then(|r| r.get("memory"));
        let limit = resources.limits.as_ref().and_then(|l| l.get("memory"));
        total += quantity_bytes(request.or(limit))?;
    }
    Ok(total)
}
