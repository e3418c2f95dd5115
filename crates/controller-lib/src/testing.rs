//! In-memory fakes and fixtures shared by unit tests

use crate::cleanup::ManagedObject;
use crate::cluster::ClusterClient;
use crate::context::{Context, Settings};
use crate::crd::{AllocationRequest, AllocationRequestSpec};
use crate::error::{Error, Result};
use crate::events::{EventReason, EventSink};
use crate::keys;
use crate::telemetry::{DomainTelemetry, NodeTelemetry, RequiredFile, TelemetrySource};
use crate::workload::{Workload, WorkloadKind};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Node, NodeAddress,
    NodeCondition, NodeSpec, NodeStatus, Pod, PodSpec, ResourceRequirements, Taint,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

pub const GI: f64 = (1u64 << 30) as f64;

/// A healthy CMMD (memory-only) domain
pub fn cmmd_domain(id: i64, total: f64) -> DomainTelemetry {
    DomainTelemetry {
        id,
        cpu_list: String::new(),
        cpu_none: true,
        movable: true,
        device_mode: "system-ram".to_string(),
        device_size: total,
        status: "valid".to_string(),
        total,
        free: total,
        mem_available: total,
        ..Default::default()
    }
}

/// A local domain with CPUs attached
pub fn local_domain(id: i64, total: f64) -> DomainTelemetry {
    DomainTelemetry {
        id,
        cpu_list: "0-15".to_string(),
        total,
        free: total,
        mem_available: total,
        ..Default::default()
    }
}

pub fn ready_files() -> Vec<RequiredFile> {
    vec![RequiredFile {
        filename: "cmmd-hook".to_string(),
        filepath: "/usr/local/bin/cmmd-hook".to_string(),
        exist: true,
    }]
}

/// A pod this controller placed, for ledger tests
pub fn pod_on(
    name: &str,
    namespace: &str,
    node: &str,
    domain: Option<&str>,
    memory_request: &str,
    replicas: Option<(&str, i64)>,
) -> Pod {
    let mut annotations = BTreeMap::new();
    if let Some(domain) = domain {
        annotations.insert(keys::ANNO_HOOK_MEM_DOMAIN.to_string(), domain.to_string());
    }
    let owner = match replicas {
        Some((owner, count)) => {
            annotations.insert(keys::ANNO_REPLICAS.to_string(), count.to_string());
            owner
        }
        None => name,
    };
    annotations.insert(keys::ANNO_OWNER.to_string(), owner.to_string());

    let mut requests = BTreeMap::new();
    requests.insert("memory".to_string(), Quantity(memory_request.to_string()));

    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(operator_labels()),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node.to_string()),
            containers: vec![Container {
                name: "c".to_string(),
                resources: Some(ResourceRequirements {
                    requests: Some(requests),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: None,
    }
}

/// A placed pod as the watcher sees it, owned by the request of the same name
pub fn placed_pod(name: &str, namespace: &str, node: &str, enable: &str, mode: &str) -> Pod {
    let mut annotations = BTreeMap::new();
    annotations.insert(keys::ANNO_OWNER.to_string(), name.to_string());
    annotations.insert(keys::ANNO_SPEC_ENABLE.to_string(), enable.to_string());
    annotations.insert(keys::ANNO_SPEC_ALLOCATE_MODE.to_string(), mode.to_string());

    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(format!("uid-{namespace}-{name}")),
            labels: Some(operator_labels()),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node.to_string()),
            ..Default::default()
        }),
        status: None,
    }
}

fn operator_labels() -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(
        keys::LABEL_OPERATOR.to_string(),
        keys::LABEL_OPERATOR_VALUE.to_string(),
    );
    labels
}

/// A Ready node whose name and hostname are both `hostname`
pub fn node_named(hostname: &str, ip: &str, taints: Vec<Taint>) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(hostname.to_string()),
            ..Default::default()
        },
        spec: Some(NodeSpec {
            taints: if taints.is_empty() { None } else { Some(taints) },
            ..Default::default()
        }),
        status: Some(NodeStatus {
            addresses: Some(vec![
                NodeAddress {
                    type_: "InternalIP".to_string(),
                    address: ip.to_string(),
                },
                NodeAddress {
                    type_: "Hostname".to_string(),
                    address: hostname.to_string(),
                },
            ]),
            conditions: Some(vec![NodeCondition {
                type_: "Ready".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

/// Agent service endpoints: one subset with every ip and every port
pub fn agent_endpoints(ips: &[&str], ports: &[i32]) -> Endpoints {
    Endpoints {
        metadata: ObjectMeta {
            name: Some("cmmd-agent".to_string()),
            namespace: Some("cmmd-system".to_string()),
            ..Default::default()
        },
        subsets: Some(vec![EndpointSubset {
            addresses: Some(
                ips.iter()
                    .map(|ip| EndpointAddress {
                        ip: ip.to_string(),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ports: Some(
                ports
                    .iter()
                    .map(|port| EndpointPort {
                        port: *port,
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }]),
    }
}

/// A stored request with a uid, so owner references can be built from it
pub fn request_for(
    name: &str,
    namespace: &str,
    enable: bool,
    mode: &str,
    payload: serde_json::Value,
) -> AllocationRequest {
    let spec: AllocationRequestSpec = serde_json::from_value(serde_json::json!({
        "enable": enable,
        "allocateMode": mode,
        "payload": payload,
    }))
    .expect("valid request spec");
    let mut request = AllocationRequest::new(name, spec);
    request.metadata.namespace = Some(namespace.to_string());
    request.metadata.uid = Some(format!("uid-{namespace}-{name}"));
    request
}

/// Whether `labels` satisfy an equality-only `k=v,...` selector
pub fn matches_selector(selector: &str, labels: Option<&BTreeMap<String, String>>) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| {
            let (key, value) = term.split_once('=').unwrap_or((term, ""));
            labels.and_then(|l| l.get(key)).map(String::as_str) == Some(value)
        })
}

#[derive(Default)]
struct ClusterState {
    nodes: Vec<Node>,
    endpoints: HashMap<(String, String), Endpoints>,
    pods: Vec<Pod>,
    requests: BTreeMap<(String, String), AllocationRequest>,
    workloads: BTreeMap<(String, String), Workload>,
    status_conflict: bool,
    workload_conflict: bool,
    failing_deletes: HashSet<String>,
    deleted: Vec<ManagedObject>,
}

/// [`ClusterClient`] over in-memory state
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<ClusterState>,
}

impl FakeCluster {
    fn state(&self) -> std::sync::MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap()
    }

    pub fn add_node(&self, node: Node) {
        self.state().nodes.push(node);
    }

    pub fn remove_node(&self, name: &str) {
        self.state()
            .nodes
            .retain(|n| n.metadata.name.as_deref() != Some(name));
    }

    pub fn set_endpoints(&self, namespace: &str, name: &str, endpoints: Endpoints) {
        self.state()
            .endpoints
            .insert((namespace.to_string(), name.to_string()), endpoints);
    }

    pub fn add_pod(&self, pod: Pod) {
        self.state().pods.push(pod);
    }

    /// Insert or replace a request
    pub fn add_request(&self, request: AllocationRequest) {
        let key = (
            request.metadata.namespace.clone().unwrap_or_default(),
            request.metadata.name.clone().unwrap_or_default(),
        );
        let mut state = self.state();
        let status = state.requests.get(&key).and_then(|r| r.status.clone());
        let mut request = request;
        if request.status.is_none() {
            request.status = status;
        }
        state.requests.insert(key, request);
    }

    pub fn request(&self, namespace: &str, name: &str) -> Option<AllocationRequest> {
        self.state()
            .requests
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn put_workload(&self, workload: Workload) {
        let key = workload_key(&workload);
        self.state().workloads.insert(key, workload);
    }

    pub fn workload(&self, namespace: &str, name: &str) -> Option<Workload> {
        self.state()
            .workloads
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn conflict_on_status_update(&self) {
        self.state().status_conflict = true;
    }

    pub fn conflict_on_workload_update(&self) {
        self.state().workload_conflict = true;
    }

    pub fn fail_delete_of(&self, name: &str) {
        self.state().failing_deletes.insert(name.to_string());
    }

    pub fn deleted_objects(&self) -> Vec<ManagedObject> {
        self.state().deleted.clone()
    }
}

fn workload_key(workload: &Workload) -> (String, String) {
    (
        workload.metadata().namespace.clone().unwrap_or_default(),
        workload.name().to_string(),
    )
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn list_nodes(&self, selector: &BTreeMap<String, String>) -> Result<Vec<Node>> {
        Ok(self
            .state()
            .nodes
            .iter()
            .filter(|node| {
                selector.iter().all(|(k, v)| {
                    node.metadata.labels.as_ref().and_then(|l| l.get(k)) == Some(v)
                })
            })
            .cloned()
            .collect())
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        Ok(self
            .state()
            .nodes
            .iter()
            .find(|n| n.metadata.name.as_deref() == Some(name))
            .cloned())
    }

    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<Endpoints> {
        self.state()
            .endpoints
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("endpoints {namespace}/{name}")))
    }

    async fn list_pods(&self, label_selector: &str) -> Result<Vec<Pod>> {
        let state = self.state();
        let created = state.workloads.values().filter_map(|w| match w {
            Workload::Pod(p) => Some(p),
            _ => None,
        });
        Ok(state
            .pods
            .iter()
            .chain(created)
            .filter(|p| matches_selector(label_selector, p.metadata.labels.as_ref()))
            .cloned()
            .collect())
    }

    async fn get_request(&self, namespace: &str, name: &str) -> Result<Option<AllocationRequest>> {
        Ok(self.request(namespace, name))
    }

    async fn list_requests(&self, namespace: Option<&str>) -> Result<Vec<AllocationRequest>> {
        Ok(self
            .state()
            .requests
            .iter()
            .filter(|((ns, _), _)| namespace.map_or(true, |n| n == ns))
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn update_request_status(&self, request: &AllocationRequest) -> Result<()> {
        let mut state = self.state();
        if state.status_conflict {
            return Err(Error::Conflict("CMMD status".to_string()));
        }
        let key = (
            request.metadata.namespace.clone().unwrap_or_default(),
            request.metadata.name.clone().unwrap_or_default(),
        );
        state.requests.insert(key, request.clone());
        Ok(())
    }

    async fn get_workload(
        &self,
        namespace: &str,
        name: &str,
        kind: WorkloadKind,
    ) -> Result<Option<Workload>> {
        Ok(self
            .workload(namespace, name)
            .filter(|w| w.kind() == kind))
    }

    async fn create_workload(&self, workload: &Workload) -> Result<()> {
        let key = workload_key(workload);
        let mut state = self.state();
        if state.workloads.contains_key(&key) {
            return Err(Error::Conflict(format!("{}/{} exists", key.0, key.1)));
        }
        state.workloads.insert(key, workload.clone());
        Ok(())
    }

    async fn update_workload(&self, workload: &Workload) -> Result<()> {
        let key = workload_key(workload);
        let mut state = self.state();
        if state.workload_conflict {
            return Err(Error::Conflict(format!("{}/{}", key.0, key.1)));
        }
        if !state.workloads.contains_key(&key) {
            return Err(Error::NotFound(format!("{}/{}", key.0, key.1)));
        }
        state.workloads.insert(key, workload.clone());
        Ok(())
    }

    async fn delete_workload(&self, workload: &Workload) -> Result<()> {
        let key = workload_key(workload);
        match self.state().workloads.remove(&key) {
            Some(_) => Ok(()),
            None => Err(Error::NotFound(format!("{}/{}", key.0, key.1))),
        }
    }

    async fn delete_object(&self, object: &ManagedObject) -> Result<()> {
        let mut state = self.state();
        if state.failing_deletes.contains(&object.name) {
            return Err(Error::Conflict(format!("delete {object} refused")));
        }
        state.deleted.push(object.clone());
        Ok(())
    }
}

/// [`TelemetrySource`] answering from canned responses keyed by address
#[derive(Default)]
pub struct FakeTelemetry {
    responses: Mutex<HashMap<String, std::result::Result<NodeTelemetry, String>>>,
}

impl FakeTelemetry {
    pub fn respond(&self, address: &str, telemetry: NodeTelemetry) {
        self.responses
            .lock()
            .unwrap()
            .insert(address.to_string(), Ok(telemetry));
    }

    pub fn fail(&self, address: &str, message: &str) {
        self.responses
            .lock()
            .unwrap()
            .insert(address.to_string(), Err(message.to_string()));
    }
}

#[async_trait]
impl TelemetrySource for FakeTelemetry {
    async fn fetch(&self, address: &str) -> Result<NodeTelemetry> {
        match self.responses.lock().unwrap().get(address) {
            Some(Ok(telemetry)) => Ok(telemetry.clone()),
            Some(Err(message)) => Err(Error::Telemetry(message.clone())),
            None => Err(Error::Telemetry(format!("no agent at {address}"))),
        }
    }
}

/// [`EventSink`] that remembers every published reason
#[derive(Default)]
pub struct RecordingEvents {
    published: Mutex<Vec<(EventReason, String)>>,
}

impl RecordingEvents {
    pub fn reasons(&self) -> Vec<EventReason> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(reason, _)| *reason)
            .collect()
    }
}

#[async_trait]
impl EventSink for RecordingEvents {
    async fn publish(&self, _request: &AllocationRequest, reason: EventReason, note: String) -> Result<()> {
        self.published.lock().unwrap().push((reason, note));
        Ok(())
    }
}

/// A context over fakes, plus handles to inspect them afterwards
pub fn test_context(
    cluster: FakeCluster,
    telemetry: FakeTelemetry,
) -> (Context, Arc<FakeCluster>, Arc<RecordingEvents>) {
    let cluster = Arc::new(cluster);
    let events = Arc::new(RecordingEvents::default());
    let ctx = Context::new(
        cluster.clone(),
        Arc::new(telemetry),
        events.clone(),
        Settings::default(),
    );
    (ctx, cluster, events)
}
