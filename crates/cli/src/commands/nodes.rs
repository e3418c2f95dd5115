//! Node and memory domain inspection

use anyhow::{bail, Result};
use colored::Colorize;
use controller_lib::engine::{MemoryDomain, NodeSnapshot};
use serde::Serialize;
use std::collections::BTreeMap;
use tabled::Tabled;

use crate::client::ClusterSession;
use crate::output::{color_status, format_gib, print_json, print_rows, print_warning, OutputFormat};

#[derive(Tabled, Serialize)]
struct NodeRow {
    #[tabled(rename = "Node")]
    node: String,
    #[tabled(rename = "Agent")]
    agent: String,
    #[tabled(rename = "Hook Files")]
    files: String,
    #[tabled(rename = "Local Total")]
    local_total: String,
    #[tabled(rename = "Local Reserved")]
    local_reserved: String,
    #[tabled(rename = "Local Available")]
    local_available: String,
    #[tabled(rename = "Status")]
    status: String,
}

#[derive(Tabled, Serialize)]
struct DomainRow {
    #[tabled(rename = "Node")]
    node: String,
    #[tabled(rename = "Domain")]
    domain: String,
    #[tabled(rename = "CPUs")]
    cpus: String,
    #[tabled(rename = "Total")]
    total: String,
    #[tabled(rename = "Reserved")]
    reserved: String,
    #[tabled(rename = "Available")]
    available: String,
    #[tabled(rename = "Device")]
    device: String,
    #[tabled(rename = "Failures")]
    failures: String,
}

#[derive(Serialize)]
struct NodesReport {
    nodes: Vec<NodeRow>,
    domains: Vec<DomainRow>,
}

/// Parse `k=v,k2=v2` into a label map
pub fn parse_selector(raw: &str) -> Result<BTreeMap<String, String>> {
    let mut selector = BTreeMap::new();
    for term in raw.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let Some((key, value)) = term.split_once('=') else {
            bail!("Invalid selector term {term:?}: expected key=value");
        };
        if key.is_empty() {
            bail!("Invalid selector term {term:?}: empty key");
        }
        selector.insert(key.to_string(), value.to_string());
    }
    Ok(selector)
}

fn node_row(node: &NodeSnapshot) -> NodeRow {
    let files = node.files.iter().filter(|f| f.exist).count();
    NodeRow {
        node: node.hostname.clone(),
        agent: node.address.clone(),
        files: format!("{}/{}", files, node.files.len()),
        local_total: format_gib(node.local_total),
        local_reserved: format_gib(node.local_reserved),
        local_available: format_gib(node.local_available),
        status: match &node.error {
            None => "healthy".to_string(),
            Some(e) => format!("error: {e}"),
        },
    }
}

fn domain_row(node: &NodeSnapshot, domain: &MemoryDomain) -> DomainRow {
    let (device, failures) = if domain.has_cpu() {
        ("local".to_string(), "-".to_string())
    } else {
        let eligibility = domain.eligibility();
        let device = if eligibility.is_eligible() {
            "eligible"
        } else {
            "ineligible"
        };
        (device.to_string(), eligibility.describe())
    };
    DomainRow {
        node: node.hostname.clone(),
        domain: domain.id(),
        cpus: if domain.has_cpu() {
            domain.telemetry.cpu_list.clone()
        } else {
            "-".to_string()
        },
        total: format_gib(domain.telemetry.total),
        reserved: format_gib(domain.reserved_memory),
        available: format_gib(domain.available_memory),
        device,
        failures,
    }
}

/// Show candidate nodes with their telemetry and reservations
pub async fn show_nodes(
    session: &ClusterSession,
    selector: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let selector = parse_selector(selector.as_deref().unwrap_or_default())?;
    let snapshots = session.engine.snapshots(&selector).await?;

    let nodes: Vec<NodeRow> = snapshots.iter().map(node_row).collect();
    let domains: Vec<DomainRow> = snapshots
        .iter()
        .flat_map(|n| n.domains.iter().map(move |d| domain_row(n, d)))
        .collect();

    match format {
        OutputFormat::Json => print_json(&NodesReport { nodes, domains })?,
        OutputFormat::Table => {
            println!("{}", "Nodes".bold());
            let unhealthy = snapshots.iter().filter(|n| !n.is_healthy()).count();
            let nodes: Vec<NodeRow> = nodes
                .into_iter()
                .map(|mut row| {
                    row.status = color_status(&row.status);
                    row
                })
                .collect();
            print_rows(nodes, &(), format)?;
            println!();
            println!("{}", "Memory domains".bold());
            print_rows(domains, &(), format)?;
            if unhealthy > 0 {
                print_warning(&format!(
                    "{} node agent(s) did not report and are excluded from placement",
                    unhealthy
                ));
            }
        }
    }
    Ok(())
}
