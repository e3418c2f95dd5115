//! Stamping a placement decision onto a workload manifest

use super::recreate::LastAppliedSpec;
use crate::crd::AllocationRequest;
use crate::engine::AllocationResult;
use crate::error::Result;
use crate::keys;
use crate::workload::{Workload, WorkloadKind};
use kube::{Resource, ResourceExt};

/// Write placement, ownership and bookkeeping metadata onto `workload`
///
/// The workload takes the request's name and namespace and is pinned to
/// the chosen node. Pod-level metadata goes on the pod template so every
/// replica carries it.
pub fn stamp_placement(
    workload: &mut Workload,
    request: &AllocationRequest,
    result: &AllocationResult,
) -> Result<()> {
    let spec = &request.spec;
    let enable = spec.enable.to_string();
    let mode = spec.allocate_mode.as_str().to_string();
    let replicas = workload.replicas();
    let kind = workload.kind();
    let last_applied = LastAppliedSpec::from_spec(spec).to_annotation()?;

    let meta = workload.metadata_mut();
    meta.name = Some(request.name_any());
    meta.namespace = request.namespace();
    let annotations = meta.annotations.get_or_insert_with(Default::default);
    annotations.remove(keys::ANNO_REALLOCATE);
    annotations.insert(keys::ANNO_LAST_APPLIED.to_string(), last_applied);
    if let Some(owner) = request.controller_owner_ref(&()) {
        let refs = meta.owner_references.get_or_insert_with(Default::default);
        refs.retain(|r| r.controller != Some(true));
        refs.push(owner);
    }

    workload.pod_spec_mut().node_name = Some(result.node_name.clone());

    let template = workload.template_metadata_mut();
    let annotations = template.annotations.get_or_insert_with(Default::default);
    annotations.insert(keys::ANNO_OWNER.to_string(), request.name_any());
    annotations.insert(keys::ANNO_SPEC_ENABLE.to_string(), enable.clone());
    annotations.insert(keys::ANNO_SPEC_ALLOCATE_MODE.to_string(), mode);
    annotations.insert(keys::ANNO_HOOK_ENABLE.to_string(), enable);
    annotations.insert(
        keys::ANNO_HOOK_MEM_DOMAIN.to_string(),
        result.memory_domain.clone(),
    );
    annotations.insert(keys::ANNO_HOOK_CPU_LIST.to_string(), result.cpu_list.clone());
    if kind != WorkloadKind::Pod {
        annotations.insert(keys::ANNO_REPLICAS.to_string(), replicas.to_string());
    }

    let labels = template.labels.get_or_insert_with(Default::default);
    labels.insert(
        keys::LABEL_ALLOCATE_NODE.to_string(),
        result.node_name.clone(),
    );
    labels.insert(
        keys::LABEL_OPERATOR.to_string(),
        keys::LABEL_OPERATOR_VALUE.to_string(),
    );
    labels.insert(
        keys::LABEL_MEM_TYPE.to_string(),
        mem_type(spec.enable).to_string(),
    );

    // Owned-object watches select on the workload's own labels, not its pods'.
    let labels = workload
        .metadata_mut()
        .labels
        .get_or_insert_with(Default::default);
    labels.insert(
        keys::LABEL_OPERATOR.to_string(),
        keys::LABEL_OPERATOR_VALUE.to_string(),
    );
    labels.insert(
        keys::LABEL_MEM_TYPE.to_string(),
        mem_type(spec.enable).to_string(),
    );

    Ok(())
}

/// Memory type label value for a request
pub fn mem_type(enable: bool) -> &'static str {
    if enable {
        keys::MEM_TYPE_CMMD
    } else {
        keys::MEM_TYPE_LOCAL
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{matches_selector, request_for};
    use serde_json::json;

    fn deployment_payload() -> serde_json::Value {
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "ignored", "annotations": { "cmmd.samsung.com/reallocate": "nodeNotFound" } },
            "spec": {
                "replicas": 3,
                "selector": { "matchLabels": { "app": "db" } },
                "template": {
                    "metadata": { "labels": { "app": "db" } },
                    "spec": { "containers": [{ "name": "db", "resources": { "requests": { "memory": "2Gi" } } }] }
                }
            }
        })
    }

    #[test]
    fn test_stamp_deployment_template() {
        let request = request_for("db", "prod", true, "auto", deployment_payload());
        let mut workload = Workload::from_payload(&request.spec.payload).unwrap();
        let result = AllocationResult {
            node_name: "node-a".to_string(),
            memory_domain: "1".to_string(),
            cpu_list: String::new(),
        };

        stamp_placement(&mut workload, &request, &result).unwrap();

        assert_eq!(workload.name(), "db");
        assert_eq!(workload.metadata().namespace.as_deref(), Some("prod"));
        let annotations = workload.annotations().unwrap();
        assert!(!annotations.contains_key(keys::ANNO_REALLOCATE));
        assert!(annotations.contains_key(keys::ANNO_LAST_APPLIED));

        let owner = &workload.metadata().owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.kind, "CMMD");
        assert_eq!(owner.controller, Some(true));

        assert_eq!(workload.pod_spec().unwrap().node_name.as_deref(), Some("node-a"));
        assert_eq!(workload.template_annotation(keys::ANNO_OWNER), Some("db"));
        assert_eq!(workload.template_annotation(keys::ANNO_HOOK_ENABLE), Some("true"));
        assert_eq!(workload.template_annotation(keys::ANNO_HOOK_MEM_DOMAIN), Some("1"));
        assert_eq!(workload.template_annotation(keys::ANNO_HOOK_CPU_LIST), Some(""));
        assert_eq!(workload.template_annotation(keys::ANNO_REPLICAS), Some("3"));

        let labels = workload
            .template_metadata()
            .and_then(|m| m.labels.as_ref())
            .unwrap();
        assert_eq!(labels["app"], "db");
        assert_eq!(labels[keys::LABEL_OPERATOR], keys::LABEL_OPERATOR_VALUE);
        assert_eq!(labels[keys::LABEL_ALLOCATE_NODE], "node-a");
        assert_eq!(labels[keys::LABEL_MEM_TYPE], "cmmd");
    }

    #[test]
    fn test_stamped_deployment_is_visible_to_owned_watch() {
        let request = request_for("db", "prod", false, "auto", deployment_payload());
        let mut workload = Workload::from_payload(&request.spec.payload).unwrap();
        let result = AllocationResult {
            node_name: "node-a".to_string(),
            ..Default::default()
        };

        stamp_placement(&mut workload, &request, &result).unwrap();

        let labels = workload.metadata().labels.as_ref().unwrap();
        assert_eq!(labels[keys::LABEL_OPERATOR], keys::LABEL_OPERATOR_VALUE);
        assert_eq!(labels[keys::LABEL_MEM_TYPE], "local");
        assert!(matches_selector(&keys::operator_selector(), workload.metadata().labels.as_ref()));
        // The pod selector is untouched.
        assert!(!labels.contains_key("app"));
    }

    #[test]
    fn test_stamp_bare_pod_uses_own_metadata() {
        let request = request_for(
            "p",
            "default",
            false,
            "auto",
            json!({
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": { "name": "p" },
                "spec": { "containers": [] }
            }),
        );
        let mut workload = Workload::from_payload(&request.spec.payload).unwrap();
        let result = AllocationResult {
            node_name: "node-b".to_string(),
            ..Default::default()
        };

        stamp_placement(&mut workload, &request, &result).unwrap();

        let labels = workload.metadata().labels.as_ref().unwrap();
        assert_eq!(labels[keys::LABEL_MEM_TYPE], "local");
        assert_eq!(workload.template_annotation(keys::ANNO_SPEC_ENABLE), Some("false"));
        assert_eq!(workload.template_annotation(keys::ANNO_REPLICAS), None);
    }
}
