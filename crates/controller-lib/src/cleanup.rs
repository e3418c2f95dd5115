//! Best-effort teardown of collaborator objects
//!
//! Deletions are dispatched concurrently and never retried. Individual
//! failures do not stop the others; they are collected into a
//! [`CleanupReport`] so the caller can log the batch outcome.

use crate::cluster::ClusterClient;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Kinds of supporting objects the controller may tear down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManagedKind {
    DaemonSet,
    Deployment,
    Service,
    ServiceAccount,
    ConfigMap,
}

/// A supporting object registered for teardown
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedObject {
    pub kind: ManagedKind,
    pub namespace: String,
    pub name: String,
}

impl ManagedObject {
    /// Parse `Kind/namespace/name`
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = || Error::InvalidManagedObject(raw.to_string());
        let mut parts = raw.trim().splitn(3, '/');
        let (Some(kind), Some(namespace), Some(name)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(invalid());
        };
        if namespace.is_empty() || name.is_empty() {
            return Err(invalid());
        }
        let kind = match kind {
            "DaemonSet" => ManagedKind::DaemonSet,
            "Deployment" => ManagedKind::Deployment,
            "Service" => ManagedKind::Service,
            "ServiceAccount" => ManagedKind::ServiceAccount,
            "ConfigMap" => ManagedKind::ConfigMap,
            _ => return Err(invalid()),
        };
        Ok(Self {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }
}

impl std::fmt::Display for ManagedObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// Objects installed alongside the controller, owned by its context
#[derive(Debug, Clone, Default)]
pub struct InstalledObjects {
    objects: Vec<ManagedObject>,
}

impl InstalledObjects {
    pub fn new(objects: Vec<ManagedObject>) -> Self {
        Self { objects }
    }

    pub fn register(&mut self, object: ManagedObject) {
        if !self.objects.contains(&object) {
            self.objects.push(object);
        }
    }

    pub fn objects(&self) -> &[ManagedObject] {
        &self.objects
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

/// Outcome of a teardown batch
#[derive(Debug, Default)]
pub struct CleanupReport {
    pub deleted: Vec<ManagedObject>,
    pub failed: Vec<(ManagedObject, String)>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Delete every installed object concurrently and collect the outcome
pub async fn teardown(cluster: Arc<dyn ClusterClient>, installed: &InstalledObjects) -> CleanupReport {
    let mut tasks = JoinSet::new();
    for object in installed.objects().iter().cloned() {
        let cluster = Arc::clone(&cluster);
        tasks.spawn(async move {
            let result = cluster.delete_object(&object).await;
            (object, result)
        });
    }

    let mut report = CleanupReport::default();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((object, Ok(()))) => {
                info!(object = %object, "Deleted installed object");
                report.deleted.push(object);
            }
            Ok((object, Err(e))) if e.is_not_found() => {
                info!(object = %object, "Installed object already gone");
                report.deleted.push(object);
            }
            Ok((object, Err(e))) => {
                warn!(object = %object, error = %e, "Failed to delete installed object");
                report.failed.push((object, e.to_string()));
            }
            Err(e) => {
                warn!(error = %e, "Cleanup task aborted");
            }
        }
    }
    report
}
