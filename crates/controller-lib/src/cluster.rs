//! Cluster access seam
//!
//! Every Kubernetes API call made by the engine, the reconciler and the
//! watcher goes through [`ClusterClient`]. [`KubeCluster`] is the production
//! implementation; tests substitute an in-memory cluster.

use crate::cleanup::{ManagedKind, ManagedObject};
use crate::crd::AllocationRequest;
use crate::error::{Error, Result};
use crate::workload::{Workload, WorkloadKind};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Node, Pod, Service, ServiceAccount};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::Client;
use std::collections::BTreeMap;

#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Nodes matching every label in `selector` (all nodes when empty)
    async fn list_nodes(&self, selector: &BTreeMap<String, String>) -> Result<Vec<Node>>;

    async fn get_node(&self, name: &str) -> Result<Option<Node>>;

    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<Endpoints>;

    /// Pods across all namespaces matching a label selector string
    async fn list_pods(&self, label_selector: &str) -> Result<Vec<Pod>>;

    async fn get_request(&self, namespace: &str, name: &str) -> Result<Option<AllocationRequest>>;

    async fn list_requests(&self, namespace: Option<&str>) -> Result<Vec<AllocationRequest>>;

    /// Write the status subresource; a stale resource version yields `Error::Conflict`
    async fn update_request_status(&self, request: &AllocationRequest) -> Result<()>;

    async fn get_workload(
        &self,
        namespace: &str,
        name: &str,
        kind: WorkloadKind,
    ) -> Result<Option<Workload>>;

    async fn create_workload(&self, workload: &Workload) -> Result<()>;

    /// Replace a workload; a stale resource version yields `Error::Conflict`
    async fn update_workload(&self, workload: &Workload) -> Result<()>;

    async fn delete_workload(&self, workload: &Workload) -> Result<()>;

    async fn delete_object(&self, object: &ManagedObject) -> Result<()>;
}

/// Render a label map as a selector string
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn map_api_error(err: kube::Error, what: impl Into<String>) -> Error {
    match &err {
        kube::Error::Api(resp) if resp.code == 404 => Error::NotFound(what.into()),
        kube::Error::Api(resp) if resp.code == 409 => Error::Conflict(what.into()),
        _ => Error::Kube(err),
    }
}

/// [`ClusterClient`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

macro_rules! workload_api {
    ($self:ident, $namespace:expr, $workload:expr, |$api:ident, $obj:ident| $body:expr) => {
        match $workload {
            Workload::Pod($obj) => {
                let $api: Api<Pod> = Api::namespaced($self.client.clone(), $namespace);
                $body
            }
            Workload::Deployment($obj) => {
                let $api: Api<Deployment> = Api::namespaced($self.client.clone(), $namespace);
                $body
            }
            Workload::ReplicaSet($obj) => {
                let $api: Api<ReplicaSet> = Api::namespaced($self.client.clone(), $namespace);
                $body
            }
        }
    };
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn list_nodes(&self, selector: &BTreeMap<String, String>) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let mut params = ListParams::default();
        if !selector.is_empty() {
            params = params.labels(&label_selector(selector));
        }
        Ok(api.list(&params).await?.items)
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<Endpoints> {
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await?
            .ok_or_else(|| Error::Endpoints(format!("{namespace}/{name} not found")))
    }

    async fn list_pods(&self, label_selector: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().labels(label_selector);
        Ok(api.list(&params).await?.items)
    }

    async fn get_request(&self, namespace: &str, name: &str) -> Result<Option<AllocationRequest>> {
        let api: Api<AllocationRequest> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_requests(&self, namespace: Option<&str>) -> Result<Vec<AllocationRequest>> {
        let api: Api<AllocationRequest> = match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn update_request_status(&self, request: &AllocationRequest) -> Result<()> {
        let namespace = request.metadata.namespace.as_deref().unwrap_or("default");
        let name = request.metadata.name.as_deref().unwrap_or_default();
        let api: Api<AllocationRequest> = Api::namespaced(self.client.clone(), namespace);
        api.replace_status(name, &PostParams::default(), serde_json::to_vec(request)?)
            .await
            .map_err(|e| map_api_error(e, format!("CMMD {namespace}/{name} status")))?;
        Ok(())
    }

    async fn get_workload(
        &self,
        namespace: &str,
        name: &str,
        kind: WorkloadKind,
    ) -> Result<Option<Workload>> {
        Ok(match kind {
            WorkloadKind::Pod => {
                let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
                api.get_opt(name).await?.map(Workload::Pod)
            }
            WorkloadKind::Deployment => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
                api.get_opt(name).await?.map(Workload::Deployment)
            }
            WorkloadKind::ReplicaSet => {
                let api: Api<ReplicaSet> = Api::namespaced(self.client.clone(), namespace);
                api.get_opt(name).await?.map(Workload::ReplicaSet)
            }
        })
    }

    async fn create_workload(&self, workload: &Workload) -> Result<()> {
        let namespace = workload.metadata().namespace.as_deref().unwrap_or("default");
        let what = format!("{} {}/{}", workload.kind(), namespace, workload.name());
        workload_api!(self, namespace, workload, |api, obj| {
            api.create(&PostParams::default(), obj)
                .await
                .map_err(|e| map_api_error(e, what))?;
        });
        Ok(())
    }

    async fn update_workload(&self, workload: &Workload) -> Result<()> {
        let namespace = workload.metadata().namespace.as_deref().unwrap_or("default");
        let name = workload.name();
        let what = format!("{} {}/{}", workload.kind(), namespace, name);
        workload_api!(self, namespace, workload, |api, obj| {
            api.replace(name, &PostParams::default(), obj)
                .await
                .map_err(|e| map_api_error(e, what))?;
        });
        Ok(())
    }

    async fn delete_workload(&self, workload: &Workload) -> Result<()> {
        let namespace = workload.metadata().namespace.as_deref().unwrap_or("default");
        let name = workload.name();
        let what = format!("{} {}/{}", workload.kind(), namespace, name);
        workload_api!(self, namespace, workload, |api, _obj| {
            api.delete(name, &DeleteParams::background())
                .await
                .map_err(|e| map_api_error(e, what))?;
        });
        Ok(())
    }

    async fn delete_object(&self, object: &ManagedObject) -> Result<()> {
        let ns = object.namespace.as_str();
        let name = object.name.as_str();
        let params = DeleteParams::background();
        let client = self.client.clone();
        let result = match object.kind {
            ManagedKind::DaemonSet => Api::<DaemonSet>::namespaced(client, ns)
                .delete(name, &params)
                .await
                .map(|_| ()),
            ManagedKind::Deployment => Api::<Deployment>::namespaced(client, ns)
                .delete(name, &params)
                .await
                .map(|_| ()),
            ManagedKind::Service => Api::<Service>::namespaced(client, ns)
                .delete(name, &params)
                .await
                .map(|_| ()),
            ManagedKind::ServiceAccount => Api::<ServiceAccount>::namespaced(client, ns)
                .delete(name, &params)
                .await
                .map(|_| ()),
            ManagedKind::ConfigMap => Api::<ConfigMap>::namespaced(client, ns)
                .delete(name, &params)
                .await
                .map(|_| ()),
        };
        result.map_err(|e| map_api_error(e, object.to_string()))
    }
}
