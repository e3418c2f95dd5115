//! Allocation request listing

use anyhow::Result;
use controller_lib::cluster::ClusterClient;
use controller_lib::AllocationRequest;
use kube::ResourceExt;
use tabled::Tabled;

use crate::client::ClusterSession;
use crate::output::{color_status, format_age, or_dash, print_rows, OutputFormat};

/// Row for the requests table
#[derive(Tabled)]
struct RequestRow {
    #[tabled(rename = "Namespace")]
    namespace: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "CMMD")]
    enable: bool,
    #[tabled(rename = "Mode")]
    mode: String,
    #[tabled(rename = "Node")]
    node: String,
    #[tabled(rename = "Domain")]
    domain: String,
    #[tabled(rename = "CPUs")]
    cpus: String,
    #[tabled(rename = "Memory")]
    memory: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Age")]
    age: String,
}

fn request_row(request: &AllocationRequest) -> RequestRow {
    let status = request.status.clone().unwrap_or_default();
    let kind = if status.kind.is_empty() {
        request
            .spec
            .payload
            .get("kind")
            .and_then(|k| k.as_str())
            .unwrap_or_default()
            .to_string()
    } else {
        status.kind.clone()
    };
    let state = if status.node_name.is_empty() {
        "pending"
    } else {
        "placed"
    };

    RequestRow {
        namespace: request.namespace().unwrap_or_default(),
        name: request.name_any(),
        kind: or_dash(&kind),
        enable: request.spec.enable,
        mode: request.spec.allocate_mode.to_string(),
        node: or_dash(&status.node_name),
        domain: or_dash(&status.memory),
        cpus: or_dash(&status.cpu),
        memory: or_dash(&status.amount_memory_str),
        state: color_status(state),
        age: format_age(request.metadata.creation_timestamp.as_ref().map(|t| t.0)),
    }
}

/// List allocation requests and their recorded placement
pub async fn list_requests(
    session: &ClusterSession,
    namespace: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let mut requests = session.cluster.list_requests(namespace.as_deref()).await?;
    requests.sort_by_key(|r| (r.namespace(), r.name_any()));

    let rows = requests.iter().map(request_row).collect();
    print_rows(rows, &requests, format)
}

#[cfg(test)]
mod tests {
    use super::*;
    use controller_lib::{AllocationRequestSpec, AllocationStatus};
    use serde_json::json;

    fn request(status: Option<AllocationStatus>) -> AllocationRequest {
        let spec: AllocationRequestSpec = serde_json::from_value(json!({
            "enable": true,
            "allocateMode": "auto",
            "payload": { "kind": "Deployment" }
        }))
        .unwrap();
        let mut request = AllocationRequest::new("db", spec);
        request.metadata.namespace = Some("prod".to_string());
        request.status = status;
        request
    }

    #[test]
    fn test_pending_request_row_uses_payload_kind() {
        let row = request_row(&request(None));
        assert_eq!(row.kind, "Deployment");
        assert_eq!(row.node, "-");
        assert_eq!(row.mode, "auto");
        assert!(row.state.contains("pending"));
    }

    #[test]
    fn test_placed_request_row_mirrors_status() {
        let row = request_row(&request(Some(AllocationStatus {
            kind: "Deployment".to_string(),
            node_name: "node-a".to_string(),
            memory: "1".to_string(),
            amount_memory_str: "6Gi".to_string(),
            ..Default::default()
        })));
        assert_eq!(row.node, "node-a");
        assert_eq!(row.domain, "1");
        assert_eq!(row.cpus, "-");
        assert_eq!(row.memory, "6Gi");
        assert!(row.state.contains("placed"));
    }
}
