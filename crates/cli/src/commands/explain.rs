//! Dry-run placement for an existing request
//!
//! Runs the allocation engine against live telemetry exactly as the
//! controller would, without creating, deleting or updating anything.

use anyhow::{anyhow, Result};
use colored::Colorize;
use controller_lib::cluster::ClusterClient;
use controller_lib::controller::need_recreate;
use controller_lib::engine::AllocationResult;
use controller_lib::quantity::format_binary;
use controller_lib::Workload;
use serde::Serialize;

use crate::client::ClusterSession;
use crate::output::{or_dash, print_error, print_info, print_json, print_success, OutputFormat};

#[derive(Debug, Serialize)]
struct Explanation {
    namespace: String,
    name: String,
    kind: String,
    enable: bool,
    allocate_mode: String,
    replicas: i64,
    requested_bytes: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    placement: Option<AllocationResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    /// Current child and whether the controller would recreate it
    #[serde(skip_serializing_if = "Option::is_none")]
    child: Option<ChildState>,
}

#[derive(Debug, Serialize)]
struct ChildState {
    node_name: String,
    recreate: Option<String>,
}

/// Explain where a request would be placed right now
pub async fn explain(
    session: &ClusterSession,
    name: &str,
    namespace: &str,
    format: OutputFormat,
) -> Result<()> {
    let request = session
        .cluster
        .get_request(namespace, name)
        .await?
        .ok_or_else(|| anyhow!("CMMD {}/{} not found", namespace, name))?;

    let workload = Workload::from_payload(&request.spec.payload)?;
    let requested = workload.requested_memory()?;

    let (placement, error) = match session
        .engine
        .allocate(&request.spec, &workload, requested)
        .await
    {
        Ok(result) => (Some(result), None),
        Err(e) => (None, Some(e.to_string())),
    };

    let child = session
        .cluster
        .get_workload(namespace, name, workload.kind())
        .await?
        .map(|child| ChildState {
            node_name: child
                .pod_spec()
                .and_then(|s| s.node_name.clone())
                .unwrap_or_default(),
            recreate: need_recreate(&child, &request.spec).map(|r| r.to_string()),
        });

    let explanation = Explanation {
        namespace: namespace.to_string(),
        name: name.to_string(),
        kind: workload.kind().to_string(),
        enable: request.spec.enable,
        allocate_mode: request.spec.allocate_mode.to_string(),
        replicas: workload.replicas(),
        requested_bytes: requested,
        placement,
        error,
        child,
    };

    match format {
        OutputFormat::Json => print_json(&explanation)?,
        OutputFormat::Table => print_explanation(&explanation),
    }
    Ok(())
}

fn print_explanation(e: &Explanation) {
    println!("{}", "Placement (dry run)".bold());
    println!("{}", "=".repeat(50));
    println!("Request:      {}/{}", e.namespace, e.name.cyan());
    println!("Workload:     {} x{}", e.kind, e.replicas);
    println!("CMMD:         {} ({})", e.enable, e.allocate_mode);
    println!("Requested:    {}", format_binary(e.requested_bytes));
    println!();

    match (&e.placement, &e.error) {
        (Some(p), _) => {
            print_success("Placement found");
            println!("  Node:       {}", p.node_name.green());
            println!("  Domain:     {}", or_dash(&p.memory_domain));
            println!("  CPUs:       {}", or_dash(&p.cpu_list));
        }
        (None, Some(err)) => print_error(err),
        (None, None) => {}
    }

    println!();
    match &e.child {
        None => print_info("No child workload exists; the controller will create one"),
        Some(child) => {
            println!("Current node: {}", or_dash(&child.node_name));
            match &child.recreate {
                Some(reason) => print_info(&format!("Child will be recreated: {reason}")),
                None => print_info("Child is up to date; placement is kept"),
            }
        }
    }
}
