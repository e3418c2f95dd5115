//! Error types for the placement controller

use thiserror::Error;

/// Errors surfaced by the allocation engine, reconciler and watcher
#[derive(Debug, Error)]
pub enum Error {
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("conflicting write to {0}")]
    Conflict(String),

    #[error("not supported object kind: {0:?}")]
    UnsupportedKind(String),

    #[error("convert to {kind} error: {source}")]
    Payload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid quantity {0:?}")]
    InvalidQuantity(String),

    #[error("get node list error: empty list: nodeSelector: {0:?}")]
    NoCandidateNodes(std::collections::BTreeMap<String, String>),

    #[error("get endpoints error: {0}")]
    Endpoints(String),

    #[error("telemetry error: {0}")]
    Telemetry(String),

    #[error(
        "not found allocatable node error: ensure that free space of memory or total request \
         memory size (request memory x replicas = {requested_gib:.3}GiB)"
    )]
    NoAllocatableNode { requested_gib: f64 },

    #[error(
        "not found allocatable node error: ensure that free space of memory or total request \
         memory size (request memory x replicas = {requested_gib:.3}GiB) or CMMD device status"
    )]
    NoAllocatableDomain { requested_gib: f64 },

    #[error("not found node error: {0}")]
    NodeNotFound(String),

    #[error("node {node} is not usable: {reason}")]
    NodeUnhealthy { node: String, reason: String },

    #[error("not found required files error: {0}")]
    FilesNotReady(String),

    #[error("not found numanode error: domain {domain} on node {node}")]
    DomainNotFound { node: String, domain: String },

    #[error(
        "not allocatable node error: domain {domain} on node {node}: ensure that free space of \
         memory or total request memory size (request memory x replicas = {requested_gib:.3}GiB)"
    )]
    DomainNotAllocatable {
        node: String,
        domain: String,
        requested_gib: f64,
    },

    #[error("invalid managed object {0:?}: expected Kind/namespace/name")]
    InvalidManagedObject(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// True for errors the reconciler treats as "already gone"
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    /// True for optimistic-concurrency conflicts
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict(_) => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 409,
            _ => false,
        }
    }

    /// True when the allocation engine found no feasible placement
    pub fn is_infeasible(&self) -> bool {
        matches!(
            self,
            Error::NoAllocatableNode { .. }
                | Error::NoAllocatableDomain { .. }
                | Error::NodeNotFound(_)
                | Error::NodeUnhealthy { .. }
                | Error::FilesNotReady(_)
                | Error::DomainNotFound { .. }
                | Error::DomainNotAllocatable { .. }
        )
    }

    /// Short label used for metrics
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::Kube(_) | Error::NotFound(_) | Error::Conflict(_) => "api",
            Error::UnsupportedKind(_) | Error::Payload { .. } | Error::InvalidQuantity(_) => {
                "payload"
            }
            Error::NoCandidateNodes(_) | Error::Endpoints(_) | Error::Telemetry(_) => "discovery",
            Error::Serialization(_) => "serialization",
            Error::InvalidManagedObject(_) => "config",
            _ => "infeasible",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
