//! Placement selection over a fixed set of node snapshots
//!
//! Everything in here is pure: given snapshots, tolerations and a request
//! size it picks a placement or explains why none exists.

use super::snapshot::NodeSnapshot;
use crate::crd::{Allocate, AllocateMode, AllocationRequestSpec};
use crate::error::{Error, Result};
use crate::filter;
use crate::keys;
use crate::observability::StructuredLogger;
use crate::quantity::gib;
use k8s_openapi::api::core::v1::Toleration;
use serde::Serialize;

/// A placement decision
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AllocationResult {
    pub node_name: String,
    /// Empty when no specific domain was chosen
    pub memory_domain: String,
    pub cpu_list: String,
}

/// Selection strategy derived from a request
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Placement<'a> {
    /// CMMD disabled: place on local memory only
    Local,
    Auto,
    Manual(&'a Allocate),
}

impl<'a> Placement<'a> {
    pub fn from_spec(spec: &'a AllocationRequestSpec) -> Self {
        match (spec.enable, spec.allocate_mode) {
            (false, _) => Placement::Local,
            (true, AllocateMode::Auto) => Placement::Auto,
            (true, AllocateMode::Manual) => Placement::Manual(&spec.allocate),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Placement::Local => "local",
            Placement::Auto => "auto",
            Placement::Manual(_) => "manual",
        }
    }

    /// Manual placement names its node, so taints are not consulted
    pub fn filters_tolerations(&self) -> bool {
        !matches!(self, Placement::Manual(_))
    }

    pub fn select(
        &self,
        nodes: &[NodeSnapshot],
        tolerations: &[Toleration],
        requested: f64,
        logger: &StructuredLogger,
    ) -> Result<AllocationResult> {
        let candidates: Vec<&NodeSnapshot> = if self.filters_tolerations() {
            admitted(nodes, tolerations)
        } else {
            nodes.iter().collect()
        };

        match self {
            Placement::Local => select_local(&candidates, requested, logger),
            Placement::Auto => select_auto(&candidates, requested, logger),
            Placement::Manual(allocate) => select_manual(&candidates, allocate, requested, logger),
        }
    }
}

/// Nodes whose taints the tolerations admit, in input order
pub fn admitted<'n>(nodes: &'n [NodeSnapshot], tolerations: &[Toleration]) -> Vec<&'n NodeSnapshot> {
    nodes
        .iter()
        .filter(|n| filter::admit(&n.taints, tolerations))
        .collect()
}

/// Node with the most local memory available; first wins ties
pub fn select_local(
    nodes: &[&NodeSnapshot],
    requested: f64,
    logger: &StructuredLogger,
) -> Result<AllocationResult> {
    let mut best: Option<&NodeSnapshot> = None;

    for node in nodes.iter().copied().filter(|n| n.is_healthy()) {
        let allocatable = node.local_allocatable(requested);
        logger.log_local_candidate(node, requested, allocatable);
        if !allocatable {
            continue;
        }
        if best.map_or(true, |b| node.local_available > b.local_available) {
            logger.log_best_changed(&node.hostname, None, node.local_available);
            best = Some(node);
        }
    }

    let node = best.ok_or(Error::NoAllocatableNode {
        requested_gib: gib(requested),
    })?;
    Ok(AllocationResult {
        node_name: node.hostname.clone(),
        memory_domain: String::new(),
        cpu_list: String::new(),
    })
}

/// Memory-only, device-eligible domain with the most memory available,
/// on nodes whose agent reported no error
pub fn select_auto(
    nodes: &[&NodeSnapshot],
    requested: f64,
    logger: &StructuredLogger,
) -> Result<AllocationResult> {
    let mut best: Option<(&NodeSnapshot, &super::MemoryDomain)> = None;

    for node in nodes.iter().copied().filter(|n| n.is_healthy()) {
        if !node.ready_files() {
            tracing::debug!(node = %node.hostname, "Skipping node: files not ready");
            continue;
        }
        for domain in &node.domains {
            let allocatable = domain.cmmd_allocatable(requested);
            logger.log_domain_candidate(node, domain, requested, allocatable);
            if !allocatable {
                continue;
            }
            if best.map_or(true, |(_, d)| domain.available_memory > d.available_memory) {
                logger.log_best_changed(
                    &node.hostname,
                    Some(&domain.id()),
                    domain.available_memory,
                );
                best = Some((node, domain));
            }
        }
    }

    let (node, domain) = best.ok_or(Error::NoAllocatableDomain {
        requested_gib: gib(requested),
    })?;
    Ok(AllocationResult {
        node_name: node.hostname.clone(),
        memory_domain: domain.id(),
        cpu_list: domain.telemetry.cpu_list.clone(),
    })
}

/// Validate an operator-chosen (node, domain) pair
///
/// Checks run in a fixed order (node exists, agent healthy, files, domain,
/// allocatable) and the first failure is returned.
pub fn select_manual(
    nodes: &[&NodeSnapshot],
    allocate: &Allocate,
    requested: f64,
    logger: &StructuredLogger,
) -> Result<AllocationResult> {
    let node = nodes
        .iter()
        .copied()
        .find(|n| n.hostname == allocate.node_name)
        .ok_or_else(|| Error::NodeNotFound(allocate.node_name.clone()))?;

    if let Some(reason) = &node.error {
        return Err(Error::NodeUnhealthy {
            node: node.hostname.clone(),
            reason: reason.clone(),
        });
    }

    if !node.ready_files() {
        return Err(Error::FilesNotReady(node.hostname.clone()));
    }

    let domain = node
        .domain(&allocate.memory)
        .ok_or_else(|| Error::DomainNotFound {
            node: node.hostname.clone(),
            domain: allocate.memory.clone(),
        })?;

    let allocatable = domain.cmmd_allocatable(requested);
    logger.log_domain_candidate(node, domain, requested, allocatable);
    if !allocatable {
        return Err(Error::DomainNotAllocatable {
            node: node.hostname.clone(),
            domain: allocate.memory.clone(),
            requested_gib: gib(requested),
        });
    }

    let cpu_list = if allocate.cpu == keys::CPU_AUTO {
        String::new()
    } else {
        allocate.cpu.clone()
    };
    Ok(AllocationResult {
        node_name: allocate.node_name.clone(),
        memory_domain: allocate.memory.clone(),
        cpu_list,
    })
}
