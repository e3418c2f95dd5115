//! CMMD placement controller library
//!
//! This crate provides the core functionality for:
//! - Allocation requests (`CMMD` custom resources) and their workloads
//! - Placement of workloads onto nodes and CMMD memory domains
//! - Reconciliation of requests into stamped child workloads
//! - Reallocation when a node or device stops being usable
//! - Health checks and observability

pub mod cleanup;
pub mod cluster;
pub mod context;
pub mod controller;
pub mod crd;
pub mod engine;
pub mod error;
pub mod events;
pub mod filter;
pub mod health;
pub mod keys;
pub mod ledger;
pub mod observability;
pub mod quantity;
pub mod telemetry;
pub mod watcher;
pub mod workload;

#[cfg(test)]
mod testing;

pub use context::{Context, Settings};
pub use crd::{Allocate, AllocateMode, AllocationRequest, AllocationRequestSpec, AllocationStatus};
pub use engine::{AllocationEngine, AllocationResult, DiscoveryConfig, NodeSnapshot};
pub use error::{Error, Result};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use observability::{ControllerMetrics, StructuredLogger};
pub use workload::{Workload, WorkloadKind};
