//! Reallocation watcher and device health sweep
//!
//! Watches pods carrying the ownership label. When a placed pod is deleted,
//! fails, or shows up for a request whose placement can move (disabled, or
//! enabled in auto mode), the pod's node is re-checked. A node that is gone,
//! no longer tolerated, or not Ready gets the owning workload stamped with a
//! `reallocate` annotation; the reconciler then deletes and re-places it.
//!
//! The device sweep does the same for CMMD placements whose memory domain
//! stopped passing the device checks.

use crate::context::Context;
use crate::error::Result;
use crate::events::{emit, EventReason};
use crate::filter;
use crate::health::components;
use crate::keys;
use crate::workload::Workload;
use futures::{pin_mut, TryStreamExt};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::Api;
use kube::runtime::watcher::{self, Event};
use kube::ResourceExt;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const POD_PHASE_FAILED: &str = "Failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReallocationReason {
    NodeNotFound,
    NodeNotReady,
    TolerationsNotSatisfied,
    DeviceFailure,
}

impl ReallocationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReallocationReason::NodeNotFound => "nodeNotFound",
            ReallocationReason::NodeNotReady => "nodeNotReady",
            ReallocationReason::TolerationsNotSatisfied => "tolerationsNotSatisfied",
            ReallocationReason::DeviceFailure => "deviceFailure",
        }
    }
}

impl fmt::Display for ReallocationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a pod event is worth inspecting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodTrigger {
    Deleted,
    Failed,
    Observed,
}

fn is_owned(pod: &Pod) -> bool {
    pod.labels().get(keys::LABEL_OPERATOR).map(String::as_str) == Some(keys::LABEL_OPERATOR_VALUE)
}

/// A newly observed pod matters when its placement is allowed to move
fn movable_placement(pod: &Pod) -> bool {
    let annotations = pod.annotations();
    let enable = annotations.get(keys::ANNO_SPEC_ENABLE).map(String::as_str);
    let mode = annotations.get(keys::ANNO_SPEC_ALLOCATE_MODE).map(String::as_str);
    match enable {
        Some("false") => true,
        Some("true") => mode == Some(crate::crd::AllocateMode::Auto.as_str()),
        _ => false,
    }
}

/// Classify an applied pod; `first_seen` is true the first time its uid shows up
pub fn trigger_for_applied(pod: &Pod, first_seen: bool) -> Option<PodTrigger> {
    if !is_owned(pod) {
        return None;
    }
    if pod.metadata.deletion_timestamp.is_some() {
        return Some(PodTrigger::Deleted);
    }
    let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
    if phase == Some(POD_PHASE_FAILED) {
        return Some(PodTrigger::Failed);
    }
    if first_seen && movable_placement(pod) {
        return Some(PodTrigger::Observed);
    }
    None
}

pub fn is_node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// Why `pod` should move off `node`, if at all; first match wins
pub fn reallocation_reason(node: Option<&Node>, pod: &Pod) -> Option<ReallocationReason> {
    let Some(node) = node else {
        return Some(ReallocationReason::NodeNotFound);
    };
    let taints = node
        .spec
        .as_ref()
        .and_then(|s| s.taints.as_deref())
        .unwrap_or_default();
    let tolerations = pod
        .spec
        .as_ref()
        .and_then(|s| s.tolerations.as_deref())
        .unwrap_or_default();
    if !filter::admit(taints, tolerations) {
        return Some(ReallocationReason::TolerationsNotSatisfied);
    }
    if !is_node_ready(node) {
        return Some(ReallocationReason::NodeNotReady);
    }
    None
}

/// Stamp `reallocate: <reason>` on the workload owned by request `namespace/owner`
///
/// `node` is where the inspected pod ran. A workload already placed on a
/// different node has been re-placed since and is left alone.
///
/// Returns whether a workload was stamped. A missing request or workload is
/// not an error, and a conflicting concurrent write is swallowed.
pub async fn stamp_reallocate(
    ctx: &Context,
    namespace: &str,
    owner: &str,
    node: &str,
    reason: ReallocationReason,
) -> Result<bool> {
    let Some(request) = ctx.cluster.get_request(namespace, owner).await? else {
        warn!(namespace, owner, "Failed to get CMMD for reallocation");
        return Ok(false);
    };

    let kind = match Workload::from_payload(&request.spec.payload) {
        Ok(w) => w.kind(),
        Err(e) => {
            emit(
                ctx.events.as_ref(),
                &request,
                EventReason::FailedWatch,
                format!("Failed to get payload object: {e}"),
            )
            .await;
            return Err(e);
        }
    };

    let mut workload = match ctx.cluster.get_workload(namespace, owner, kind).await {
        Ok(Some(w)) => w,
        Ok(None) => return Ok(false),
        Err(e) => {
            emit(
                ctx.events.as_ref(),
                &request,
                EventReason::FailedWatch,
                format!("Failed to get payload object: {e}"),
            )
            .await;
            return Err(e);
        }
    };

    if let Some(placed) = workload.placed_node() {
        if placed != node {
            debug!(
                namespace,
                owner,
                placed,
                node,
                "Workload already moved off the inspected node"
            );
            return Ok(false);
        }
    }

    workload
        .metadata_mut()
        .annotations
        .get_or_insert_with(Default::default)
        .insert(keys::ANNO_REALLOCATE.to_string(), reason.as_str().to_string());

    match ctx.cluster.update_workload(&workload).await {
        Ok(()) => {}
        Err(e) if e.is_conflict() => {
            debug!(namespace, owner, "Conflict stamping reallocation; another writer won");
        }
        Err(e) => {
            emit(
                ctx.events.as_ref(),
                &request,
                EventReason::FailedWatch,
                format!("Failed to update object to reallocate node: {e}"),
            )
            .await;
            return Err(e);
        }
    }

    ctx.metrics.inc_reallocation(reason.as_str());
    info!(
        event = "reallocation_requested",
        namespace,
        owner,
        reason = %reason,
        "Allocated node not available, new reconciling will be triggered"
    );
    Ok(true)
}

/// Tracks pods already seen so that only new pods count as observed, and
/// terminating pods already inspected so each is checked once
#[derive(Default)]
pub struct ReallocationWatcher {
    seen: HashSet<String>,
    terminating: HashSet<String>,
}

impl ReallocationWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle one watch event; returns the reasons stamped
    pub async fn handle(&mut self, ctx: &Context, event: Event<Pod>) -> Vec<ReallocationReason> {
        let mut triggered = Vec::new();
        match event {
            Event::Applied(pod) => {
                let first_seen = self.seen.insert(pod_key(&pod));
                if let Some(trigger) = self.classify(&pod, first_seen) {
                    triggered.push((pod, trigger));
                }
            }
            Event::Deleted(pod) => {
                let key = pod_key(&pod);
                self.seen.remove(&key);
                let inspected = self.terminating.remove(&key);
                if is_owned(&pod) && !inspected {
                    triggered.push((pod, PodTrigger::Deleted));
                }
            }
            Event::Restarted(pods) => {
                let previous = std::mem::take(&mut self.seen);
                let terminating = std::mem::take(&mut self.terminating);
                for pod in pods {
                    let key = pod_key(&pod);
                    let first_seen = !previous.contains(&key);
                    if terminating.contains(&key) {
                        self.terminating.insert(key.clone());
                    }
                    self.seen.insert(key);
                    if let Some(trigger) = self.classify(&pod, first_seen) {
                        triggered.push((pod, trigger));
                    }
                }
            }
        }

        let mut stamped = Vec::new();
        for (pod, trigger) in triggered {
            match self.inspect(ctx, &pod, trigger).await {
                Ok(Some(reason)) => stamped.push(reason),
                Ok(None) => {}
                Err(e) => warn!(pod = %pod.name_any(), error = %e, "Reallocation check failed"),
            }
        }
        stamped
    }

    /// Like [`trigger_for_applied`], but a terminating pod triggers only once
    fn classify(&mut self, pod: &Pod, first_seen: bool) -> Option<PodTrigger> {
        let trigger = trigger_for_applied(pod, first_seen)?;
        if trigger == PodTrigger::Deleted && !self.terminating.insert(pod_key(pod)) {
            return None;
        }
        Some(trigger)
    }

    async fn inspect(&self, ctx: &Context, pod: &Pod, trigger: PodTrigger) -> Result<Option<ReallocationReason>> {
        let namespace = pod.namespace().unwrap_or_default();
        let Some(owner) = pod.annotations().get(keys::ANNO_OWNER).cloned() else {
            warn!(namespace = %namespace, pod = %pod.name_any(), "Pod has no owner annotation");
            return Ok(None);
        };
        debug!(namespace = %namespace, owner = %owner, trigger = ?trigger, "Watch handler start");

        let node_name = pod
            .spec
            .as_ref()
            .and_then(|s| s.node_name.as_deref())
            .unwrap_or_default();
        let node = if node_name.is_empty() {
            None
        } else {
            ctx.cluster.get_node(node_name).await?
        };

        let Some(reason) = reallocation_reason(node.as_ref(), pod) else {
            return Ok(None);
        };
        info!(namespace = %namespace, owner = %owner, reason = %reason, "Reallocatable reason found");
        let stamped = stamp_reallocate(ctx, &namespace, &owner, node_name, reason).await?;
        Ok(stamped.then_some(reason))
    }

    /// Consume the pod watch until it ends
    pub async fn run(mut self, api: Api<Pod>, ctx: Arc<Context>) {
        let config = watcher::Config::default().labels(&keys::operator_selector());
        let stream = watcher::watcher(api, config);
        pin_mut!(stream);

        loop {
            match stream.try_next().await {
                Ok(Some(event)) => {
                    self.handle(&ctx, event).await;
                    ctx.health.record_success(components::WATCHER).await;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Pod watch error");
                    ctx.health
                        .record_failure(components::WATCHER, e.to_string())
                        .await;
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        warn!("Pod watch stream ended");
        ctx.health
            .set_unhealthy(components::WATCHER, "pod watch stream ended")
            .await;
    }
}

fn pod_key(pod: &Pod) -> String {
    pod.uid().unwrap_or_else(|| {
        format!("{}/{}", pod.namespace().unwrap_or_default(), pod.name_any())
    })
}

/// Re-check every CMMD placement against current device telemetry
///
/// Returns the number of workloads stamped with `deviceFailure`.
pub async fn sweep_devices(ctx: &Context) -> Result<usize> {
    let selector = format!(
        "{},{}={}",
        keys::operator_selector(),
        keys::LABEL_MEM_TYPE,
        keys::MEM_TYPE_CMMD
    );
    let pods = ctx.cluster.list_pods(&selector).await?;

    // (node, domain) -> owning requests
    let mut groups: BTreeMap<(String, String), BTreeSet<(String, String)>> = BTreeMap::new();
    for pod in &pods {
        let node = pod
            .spec
            .as_ref()
            .and_then(|s| s.node_name.clone())
            .unwrap_or_default();
        let annotations = pod.annotations();
        let domain = annotations
            .get(keys::ANNO_HOOK_MEM_DOMAIN)
            .cloned()
            .unwrap_or_default();
        let Some(owner) = annotations.get(keys::ANNO_OWNER).cloned() else {
            continue;
        };
        if node.is_empty() || domain.is_empty() {
            continue;
        }
        groups
            .entry((node, domain))
            .or_default()
            .insert((pod.namespace().unwrap_or_default(), owner));
    }
    if groups.is_empty() {
        return Ok(0);
    }

    let hosts: BTreeSet<&str> = groups.keys().map(|(node, _)| node.as_str()).collect();
    let engine = ctx.engine();
    let candidates = engine
        .candidates(&BTreeMap::new())
        .await?
        .into_iter()
        .filter(|c| hosts.contains(c.hostname.as_str()))
        .collect();
    let snapshots = engine.populate(candidates).await?;

    let mut stamped = 0;
    for ((node, domain), owners) in &groups {
        let Some(snapshot) = snapshots.iter().find(|s| &s.hostname == node && s.is_healthy()) else {
            debug!(node = %node, "Skipping device check: no telemetry");
            continue;
        };
        let failed = match snapshot.domain(domain) {
            None => true,
            Some(d) => !d.eligibility().is_eligible(),
        };
        if !failed {
            continue;
        }

        warn!(
            node = %node,
            domain = %domain,
            workloads = owners.len(),
            "CMMD device no longer usable"
        );
        for (namespace, owner) in owners {
            match stamp_reallocate(ctx, namespace, owner, node, ReallocationReason::DeviceFailure).await {
                Ok(true) => stamped += 1,
                Ok(false) => {}
                Err(e) => warn!(namespace = %namespace, owner = %owner, error = %e, "Device reallocation failed"),
            }
        }
    }
    Ok(stamped)
}

/// Run the device sweep every `interval` until the task is dropped
pub async fn run_device_sweep(ctx: Arc<Context>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        match sweep_devices(&ctx).await {
            Ok(stamped) => {
                if stamped > 0 {
                    info!(stamped, "Device sweep requested reallocations");
                }
                ctx.health.record_success(components::DEVICE_SWEEP).await;
            }
            Err(e) => {
                warn!(error = %e, "Device sweep failed");
                ctx.health
                    .record_failure(components::DEVICE_SWEEP, e.to_string())
                    .await;
            }
        }
    }
}
