//! Reconciliation of allocation requests
//!
//! One pass per (request, child workload):
//! - request gone: nothing to do
//! - child absent: allocate, stamp and create it
//! - child present but stale: delete it; the deletion triggers the next pass
//! - otherwise: mirror the placement into the request status
//!
//! A child is never mutated in place. Placement changes always go through
//! delete and create.

mod recreate;
mod stamp;

pub use recreate::{need_recreate, LastAppliedSpec, RecreateReason};
pub use stamp::{mem_type, stamp_placement};

use crate::context::Context;
use crate::crd::{AllocationRequest, AllocationStatus};
use crate::error::{Error, Result};
use crate::events::{emit, EventReason};
use crate::health::components;
use crate::keys;
use crate::quantity::format_binary;
use crate::workload::Workload;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::runtime::controller::{self, Action, Config as ControllerConfig, Controller};
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// What a reconciliation pass did
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    RequestGone,
    Created,
    Recreating(RecreateReason),
    StatusUpdated { changed: bool },
}

impl ReconcileOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileOutcome::RequestGone => "request_gone",
            ReconcileOutcome::Created => "created",
            ReconcileOutcome::Recreating(_) => "recreating",
            ReconcileOutcome::StatusUpdated { .. } => "status_updated",
        }
    }
}

/// Run one reconciliation pass for the request `namespace/name`
pub async fn reconcile_request(namespace: &str, name: &str, ctx: &Context) -> Result<ReconcileOutcome> {
    let Some(request) = ctx.cluster.get_request(namespace, name).await? else {
        info!(namespace, name, "CMMD resource not found. Ignoring since object must be deleted");
        return Ok(ReconcileOutcome::RequestGone);
    };

    let desired = match Workload::from_payload(&request.spec.payload) {
        Ok(w) => w,
        Err(e) => {
            emit(
                ctx.events.as_ref(),
                &request,
                EventReason::FailedCR,
                format!("Failed to get object from payload: {e}"),
            )
            .await;
            return Err(e);
        }
    };
    let kind = desired.kind();

    let child = match ctx.cluster.get_workload(namespace, name, kind).await {
        Ok(child) => child,
        Err(e) => {
            emit(
                ctx.events.as_ref(),
                &request,
                EventReason::Failed,
                format!("Failed to get {kind}: {e}"),
            )
            .await;
            return Err(e);
        }
    };

    let Some(child) = child else {
        return match create_child(&request, desired, ctx).await {
            Ok(()) => {
                info!(namespace, name, kind = %kind, "Object created");
                emit(
                    ctx.events.as_ref(),
                    &request,
                    EventReason::Created,
                    format!("Created {kind}"),
                )
                .await;
                Ok(ReconcileOutcome::Created)
            }
            Err(e) => {
                warn!(namespace, name, kind = %kind, error = %e, "Failed to create object");
                emit(
                    ctx.events.as_ref(),
                    &request,
                    EventReason::Failed,
                    format!("Failed to create {kind}: {e}"),
                )
                .await;
                Err(e)
            }
        };
    };

    if let Some(reason) = need_recreate(&child, &request.spec) {
        info!(namespace, name, reason = %reason, "Object recreate needed");
        match ctx.cluster.delete_workload(&child).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                emit(
                    ctx.events.as_ref(),
                    &request,
                    EventReason::Failed,
                    format!("Failed to delete {kind} for recreate"),
                )
                .await;
                return Err(e);
            }
        }
        emit(
            ctx.events.as_ref(),
            &request,
            EventReason::Configured,
            format!("Deleted {kind}"),
        )
        .await;
        return Ok(ReconcileOutcome::Recreating(reason));
    }

    let status = build_status(&request, &desired, &child)?;
    if request.status.as_ref() == Some(&status) {
        debug!(namespace, name, "Status unchanged");
        return Ok(ReconcileOutcome::StatusUpdated { changed: false });
    }

    let mut updated = request.clone();
    updated.status = Some(status);
    match ctx.cluster.update_request_status(&updated).await {
        Ok(()) => {
            emit(
                ctx.events.as_ref(),
                &request,
                EventReason::Modified,
                format!("Updated status of {kind} placement"),
            )
            .await;
            Ok(ReconcileOutcome::StatusUpdated { changed: true })
        }
        Err(e) if e.is_conflict() => {
            info!(namespace, name, "Conflict CMMD status. Ignoring old resource version");
            Ok(ReconcileOutcome::StatusUpdated { changed: false })
        }
        Err(e) => Err(e),
    }
}

async fn create_child(request: &AllocationRequest, mut workload: Workload, ctx: &Context) -> Result<()> {
    let requested = workload.requested_memory()?;
    let result = ctx.engine().allocate(&request.spec, &workload, requested).await?;
    ctx.logger.log_placement(
        &request.namespace().unwrap_or_default(),
        &request.name_any(),
        &result,
        requested as f64,
    );

    stamp_placement(&mut workload, request, &result)?;
    ctx.cluster.create_workload(&workload).await?;
    ctx.metrics.inc_placement(mem_type(request.spec.enable));
    Ok(())
}

/// Status mirroring the request and the placement stamped on its child
pub fn build_status(request: &AllocationRequest, desired: &Workload, child: &Workload) -> Result<AllocationStatus> {
    let amount = desired.requested_memory()?;
    let spec = &request.spec;
    Ok(AllocationStatus {
        namespace: request.namespace().unwrap_or_default(),
        name: child.name().to_string(),
        kind: child.kind().to_string(),
        enable: spec.enable,
        allocate_mode: Some(spec.allocate_mode),
        node_name: child
            .pod_spec()
            .and_then(|s| s.node_name.clone())
            .unwrap_or_default(),
        memory: child
            .template_annotation(keys::ANNO_HOOK_MEM_DOMAIN)
            .unwrap_or_default()
            .to_string(),
        cpu: child
            .template_annotation(keys::ANNO_HOOK_CPU_LIST)
            .unwrap_or_default()
            .to_string(),
        amount_memory: amount,
        amount_memory_str: format_binary(amount),
    })
}

/// Controller entry point for one request
pub async fn reconcile(request: Arc<AllocationRequest>, ctx: Arc<Context>) -> Result<Action> {
    let start = Instant::now();
    let namespace = request.namespace().unwrap_or_default();
    let name = request.name_any();
    debug!(namespace = %namespace, name = %name, "Reconciling start");

    let result = reconcile_request(&namespace, &name, &ctx).await;
    let elapsed = start.elapsed().as_secs_f64();

    match result {
        Ok(outcome) => {
            ctx.metrics.observe_reconcile(elapsed, outcome.as_str());
            debug!(namespace = %namespace, name = %name, outcome = outcome.as_str(), "Reconciling done");
            Ok(match outcome {
                ReconcileOutcome::Created => Action::requeue(ctx.settings.created_requeue),
                _ => Action::await_change(),
            })
        }
        Err(e) => {
            ctx.metrics.observe_reconcile(elapsed, "error");
            ctx.metrics.inc_reconcile_error(e.metric_label());
            Err(e)
        }
    }
}

/// Requeue failed passes after the configured backoff
pub fn error_policy(request: Arc<AllocationRequest>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!(
        namespace = %request.namespace().unwrap_or_default(),
        name = %request.name_any(),
        error = %error,
        infeasible = error.is_infeasible(),
        "Reconciliation failed"
    );
    Action::requeue(ctx.settings.error_backoff)
}

/// Drive the reconciler until a shutdown signal arrives
pub async fn run(client: Client, ctx: Arc<Context>, concurrency: u16) {
    let requests: Api<AllocationRequest> = Api::all(client.clone());
    let owned = watcher::Config::default().labels(&keys::operator_selector());

    Controller::new(requests, watcher::Config::default())
        .owns(Api::<Pod>::all(client.clone()), owned.clone())
        .owns(Api::<Deployment>::all(client.clone()), owned.clone())
        .owns(Api::<ReplicaSet>::all(client), owned)
        .with_config(ControllerConfig::default().concurrency(concurrency))
        .shutdown_on_signal()
        .run(reconcile, error_policy, Arc::clone(&ctx))
        .for_each(|result| {
            let ctx = Arc::clone(&ctx);
            async move {
                match result {
                    Ok((object, _)) => {
                        debug!(object = %object, "Reconciled");
                        ctx.health.record_success(components::RECONCILER).await;
                    }
                    Err(controller::Error::ReconcilerFailed(e, _)) if e.is_infeasible() => {
                        ctx.health.record_success(components::RECONCILER).await;
                    }
                    Err(e) => {
                        debug!(error = %e, "Reconcile dispatch failed");
                        ctx.health
                            .record_failure(components::RECONCILER, e.to_string())
                            .await;
                    }
                }
            }
        })
        .await;

    ctx.health
        .set_unhealthy(components::RECONCILER, "controller stream ended")
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::AllocateMode;
    use crate::telemetry::NodeTelemetry;
    use crate::testing::{
        agent_endpoints, cmmd_domain, local_domain, matches_selector, node_named, placed_pod,
        ready_files, request_for, test_context, FakeCluster, FakeTelemetry, GI,
    };
    use crate::watcher::{ReallocationReason, ReallocationWatcher};
    use crate::workload::WorkloadKind;
    use kube::runtime::watcher::Event;
    use serde_json::json;

    fn pod_payload() -> serde_json::Value {
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": "web" },
            "spec": { "containers": [{ "name": "c", "resources": { "requests": { "memory": "2Gi" } } }] }
        })
    }

    fn deployment_payload() -> serde_json::Value {
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "db" },
            "spec": {
                "replicas": 2,
                "selector": { "matchLabels": { "app": "db" } },
                "template": {
                    "metadata": { "labels": { "app": "db" } },
                    "spec": { "containers": [{ "name": "db", "resources": { "requests": { "memory": "1Gi" } } }] }
                }
            }
        })
    }

    /// Whether the owned-object watch on this workload's kind would see it
    fn owned_watch_sees(workload: &Workload) -> bool {
        matches_selector(&keys::operator_selector(), workload.metadata().labels.as_ref())
    }

    fn cluster_with_nodes() -> (FakeCluster, FakeTelemetry) {
        let cluster = FakeCluster::default();
        cluster.add_node(node_named("A", "10.0.0.1", vec![]));
        cluster.add_node(node_named("B", "10.0.0.2", vec![]));
        cluster.set_endpoints(
            "cmmd-system",
            "cmmd-agent",
            agent_endpoints(&["10.0.0.1", "10.0.0.2"], &[8080]),
        );

        let telemetry = FakeTelemetry::default();
        telemetry.respond(
            "10.0.0.1:8080",
            NodeTelemetry {
                files: ready_files(),
                domains: vec![local_domain(0, 4.0 * GI), cmmd_domain(1, 32.0 * GI)],
                error: String::new(),
            },
        );
        telemetry.respond(
            "10.0.0.2:8080",
            NodeTelemetry {
                files: ready_files(),
                domains: vec![local_domain(0, 8.0 * GI)],
                error: String::new(),
            },
        );
        (cluster, telemetry)
    }

    #[tokio::test]
    async fn test_missing_request_ends_pass() {
        let (ctx, _, _) = test_context(FakeCluster::default(), FakeTelemetry::default());
        let outcome = reconcile_request("default", "gone", &ctx).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::RequestGone);
    }

    #[tokio::test]
    async fn test_create_then_status_mirrors_placement() {
        let (cluster, telemetry) = cluster_with_nodes();
        cluster.add_request(request_for("web", "default", false, "auto", pod_payload()));
        let (ctx, cluster, events) = test_context(cluster, telemetry);

        let outcome = reconcile_request("default", "web", &ctx).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Created);
        assert_eq!(events.reasons(), vec![EventReason::Created]);

        let child = cluster
            .workload("default", "web")
            .expect("child workload created");
        assert_eq!(child.pod_spec().unwrap().node_name.as_deref(), Some("B"));

        let outcome = reconcile_request("default", "web", &ctx).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::StatusUpdated { changed: true });

        let status = cluster
            .request("default", "web")
            .and_then(|r| r.status)
            .unwrap();
        assert_eq!(status.node_name, "B");
        assert_eq!(status.kind, "Pod");
        assert_eq!(status.amount_memory, 2 * (1 << 30));
        assert_eq!(status.amount_memory_str, "2Gi");
        assert_eq!(status.memory, "");

        let outcome = reconcile_request("default", "web", &ctx).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::StatusUpdated { changed: false });
    }

    #[tokio::test]
    async fn test_auto_request_records_domain_in_status() {
        let (cluster, telemetry) = cluster_with_nodes();
        cluster.add_request(request_for("web", "default", true, "auto", pod_payload()));
        let (ctx, cluster, _) = test_context(cluster, telemetry);

        reconcile_request("default", "web", &ctx).await.unwrap();
        reconcile_request("default", "web", &ctx).await.unwrap();

        let status = cluster
            .request("default", "web")
            .and_then(|r| r.status)
            .unwrap();
        assert_eq!(status.node_name, "A");
        assert_eq!(status.memory, "1");
        assert_eq!(status.allocate_mode, Some(AllocateMode::Auto));
    }

    #[tokio::test]
    async fn test_spec_change_deletes_child_without_recreating() {
        let (cluster, telemetry) = cluster_with_nodes();
        cluster.add_request(request_for("web", "default", false, "auto", pod_payload()));
        let (ctx, cluster, events) = test_context(cluster, telemetry);

        reconcile_request("default", "web", &ctx).await.unwrap();
        cluster.add_request(request_for("web", "default", true, "auto", pod_payload()));

        let outcome = reconcile_request("default", "web", &ctx).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Recreating(RecreateReason::EnableChanged));
        assert!(cluster.workload("default", "web").is_none());
        assert_eq!(
            events.reasons(),
            vec![EventReason::Created, EventReason::Configured]
        );

        let outcome = reconcile_request("default", "web", &ctx).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Created);
        let child = cluster.workload("default", "web").unwrap();
        assert_eq!(child.pod_spec().unwrap().node_name.as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn test_deployment_create_recreate_create() {
        let (cluster, telemetry) = cluster_with_nodes();
        cluster.add_request(request_for("db", "default", false, "auto", deployment_payload()));
        let (ctx, cluster, _) = test_context(cluster, telemetry);

        let outcome = reconcile_request("default", "db", &ctx).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Created);
        let child = cluster.workload("default", "db").unwrap();
        assert_eq!(child.kind(), WorkloadKind::Deployment);
        assert_eq!(child.placed_node(), Some("B"));
        assert_eq!(child.template_annotation(keys::ANNO_REPLICAS), Some("2"));
        assert!(owned_watch_sees(&child));

        let outcome = reconcile_request("default", "db", &ctx).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::StatusUpdated { changed: true });
        let status = cluster.request("default", "db").and_then(|r| r.status).unwrap();
        assert_eq!(status.kind, "Deployment");
        assert_eq!(status.amount_memory_str, "2Gi");

        cluster.add_request(request_for("db", "default", true, "auto", deployment_payload()));
        let outcome = reconcile_request("default", "db", &ctx).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Recreating(RecreateReason::EnableChanged));
        assert!(cluster.workload("default", "db").is_none());

        let outcome = reconcile_request("default", "db", &ctx).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Created);
        let child = cluster.workload("default", "db").unwrap();
        assert_eq!(child.placed_node(), Some("A"));
        assert_eq!(child.template_annotation(keys::ANNO_HOOK_MEM_DOMAIN), Some("1"));
        assert!(owned_watch_sees(&child));
    }

    #[tokio::test]
    async fn test_watcher_stamp_on_deployment_moves_it() {
        let (cluster, telemetry) = cluster_with_nodes();
        cluster.add_request(request_for("db", "default", false, "auto", deployment_payload()));
        let (ctx, cluster, _) = test_context(cluster, telemetry);

        reconcile_request("default", "db", &ctx).await.unwrap();
        assert_eq!(
            cluster.workload("default", "db").unwrap().placed_node(),
            Some("B")
        );

        cluster.remove_node("B");
        let mut watcher = ReallocationWatcher::new();
        let replica = placed_pod("db", "default", "B", "false", "auto");
        let stamped = watcher.handle(&ctx, Event::Deleted(replica)).await;
        assert_eq!(stamped, vec![ReallocationReason::NodeNotFound]);

        // The stamped update must reach the reconciler through the owned watch.
        let child = cluster.workload("default", "db").unwrap();
        assert!(owned_watch_sees(&child));
        assert_eq!(child.annotations().unwrap()[keys::ANNO_REALLOCATE], "nodeNotFound");

        let outcome = reconcile_request("default", "db", &ctx).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Recreating(RecreateReason::Reallocate("nodeNotFound".to_string()))
        );

        let outcome = reconcile_request("default", "db", &ctx).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Created);
        let child = cluster.workload("default", "db").unwrap();
        assert_eq!(child.placed_node(), Some("A"));
        assert!(!child.annotations().unwrap().contains_key(keys::ANNO_REALLOCATE));
    }

    #[tokio::test]
    async fn test_unsupported_payload_emits_failed_cr() {
        let cluster = FakeCluster::default();
        cluster.add_request(request_for(
            "sts",
            "default",
            false,
            "auto",
            json!({ "apiVersion": "apps/v1", "kind": "StatefulSet", "metadata": { "name": "sts" } }),
        ));
        let (ctx, _, events) = test_context(cluster, FakeTelemetry::default());

        let err = reconcile_request("default", "sts", &ctx).await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedKind(_)));
        assert_eq!(events.reasons(), vec![EventReason::FailedCR]);
    }

    #[tokio::test]
    async fn test_infeasible_allocation_emits_failed() {
        let (cluster, telemetry) = cluster_with_nodes();
        let payload = json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": "huge" },
            "spec": { "containers": [{ "name": "c", "resources": { "requests": { "memory": "512Gi" } } }] }
        });
        cluster.add_request(request_for("huge", "default", true, "auto", payload));
        let (ctx, cluster, events) = test_context(cluster, telemetry);

        let err = reconcile_request("default", "huge", &ctx).await.unwrap_err();
        assert!(err.is_infeasible());
        assert_eq!(events.reasons(), vec![EventReason::Failed]);
        assert!(cluster.workload("default", "huge").is_none());
    }

    #[tokio::test]
    async fn test_status_conflict_is_not_an_error() {
        let (cluster, telemetry) = cluster_with_nodes();
        cluster.add_request(request_for("web", "default", false, "auto", pod_payload()));
        let (ctx, cluster, _) = test_context(cluster, telemetry);

        reconcile_request("default", "web", &ctx).await.unwrap();
        cluster.conflict_on_status_update();
        let outcome = reconcile_request("default", "web", &ctx).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::StatusUpdated { changed: false });
    }

    #[tokio::test]
    async fn test_reconcile_maps_outcomes_to_actions() {
        let (cluster, telemetry) = cluster_with_nodes();
        let request = request_for("web", "default", false, "auto", pod_payload());
        cluster.add_request(request.clone());
        let (ctx, _, _) = test_context(cluster, telemetry);
        let ctx = Arc::new(ctx);

        let action = reconcile(Arc::new(request.clone()), Arc::clone(&ctx)).await.unwrap();
        assert_eq!(action, Action::requeue(ctx.settings.created_requeue));

        let action = reconcile(Arc::new(request), Arc::clone(&ctx)).await.unwrap();
        assert_eq!(action, Action::await_change());
    }
}
