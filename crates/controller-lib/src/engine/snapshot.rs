//! Per-reconciliation node snapshots
//!
//! A snapshot merges a node's live telemetry with the reservation ledger.
//! Snapshots are rebuilt on every pass and never cached.

use crate::error::Result;
use crate::ledger::ReservationLedger;
use crate::telemetry::{DomainTelemetry, NodeTelemetry, RequiredFile};
use k8s_openapi::api::core::v1::Taint;
use std::fmt;

/// Allowed gap between the kernel-reported size and the device size, in percent
pub const DEVICE_SIZE_TOLERANCE_PCT: f64 = 10.0;

const DEVICE_MODE_SYSTEM_RAM: &str = "system-ram";

/// Why a memory-only domain is not usable as CMMD memory
#[derive(Debug, Clone, PartialEq)]
pub enum EligibilityFailure {
    NotMovable,
    DeviceMode(String),
    InvalidTotal(f64),
    SizeMismatch { total: f64, device: f64, diff_pct: f64 },
    Status(String),
    UnknownStatus(String),
}

impl fmt::Display for EligibilityFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EligibilityFailure::NotMovable => write!(f, "Movable: false"),
            EligibilityFailure::DeviceMode(mode) => write!(f, "DaxctlMode: {mode}"),
            EligibilityFailure::InvalidTotal(total) => write!(f, "Invalid total size: {total}"),
            EligibilityFailure::SizeMismatch {
                total,
                device,
                diff_pct,
            } => write!(
                f,
                "Memory size differs too big. total: {total:.0}, cmmd: {device:.0}, \
                 diffPct: {diff_pct:.0}, allowedDiffPct: {DEVICE_SIZE_TOLERANCE_PCT:.0}"
            ),
            EligibilityFailure::Status(status) => write!(f, "Vendor status: {status}"),
            EligibilityFailure::UnknownStatus(status) => {
                write!(f, "Vendor status: unknown({status})")
            }
        }
    }
}

/// Result of the device checks on one domain; empty means eligible
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Eligibility {
    pub failures: Vec<EligibilityFailure>,
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn describe(&self) -> String {
        if self.failures.is_empty() {
            return "none".to_string();
        }
        self.failures
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// A memory domain with its reservation applied
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryDomain {
    pub telemetry: DomainTelemetry,
    pub reserved_memory: f64,
    /// `total - reserved`; may go negative
    pub available_memory: f64,
}

impl MemoryDomain {
    pub fn new(telemetry: DomainTelemetry, reserved_memory: f64) -> Self {
        let available_memory = telemetry.total - reserved_memory;
        Self {
            telemetry,
            reserved_memory,
            available_memory,
        }
    }

    pub fn id(&self) -> String {
        self.telemetry.id.to_string()
    }

    /// Domains with CPUs are local memory; CPU-less domains are device memory
    pub fn has_cpu(&self) -> bool {
        !self.telemetry.cpu_list.is_empty()
    }

    pub fn mem_allocatable(&self, requested: f64) -> bool {
        self.available_memory >= requested
    }

    /// Run every device check and record each failure
    pub fn eligibility(&self) -> Eligibility {
        let t = &self.telemetry;
        let mut failures = Vec::new();

        if !t.movable {
            failures.push(EligibilityFailure::NotMovable);
        }
        if t.device_mode != DEVICE_MODE_SYSTEM_RAM {
            failures.push(EligibilityFailure::DeviceMode(t.device_mode.clone()));
        }
        if t.total <= 0.0 {
            failures.push(EligibilityFailure::InvalidTotal(t.total));
        } else {
            let diff_pct = (t.total - t.device_size).abs() / t.total * 100.0;
            if diff_pct > DEVICE_SIZE_TOLERANCE_PCT {
                failures.push(EligibilityFailure::SizeMismatch {
                    total: t.total,
                    device: t.device_size,
                    diff_pct,
                });
            }
        }
        match t.status.as_str() {
            "valid" | "unchecked" => {}
            "invalid" => failures.push(EligibilityFailure::Status(t.status.clone())),
            other => failures.push(EligibilityFailure::UnknownStatus(other.to_string())),
        }

        Eligibility { failures }
    }

    /// Memory-only, device-eligible and large enough
    pub fn cmmd_allocatable(&self, requested: f64) -> bool {
        !self.has_cpu() && self.eligibility().is_eligible() && self.mem_allocatable(requested)
    }
}

/// Everything known about one candidate node for one pass
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSnapshot {
    pub hostname: String,
    /// Node agent `ip:port`
    pub address: String,
    pub taints: Vec<Taint>,
    pub files: Vec<RequiredFile>,
    pub domains: Vec<MemoryDomain>,
    pub local_total: f64,
    pub local_reserved: f64,
    pub local_available: f64,
    pub error: Option<String>,
}

impl NodeSnapshot {
    pub fn candidate(hostname: impl Into<String>, address: impl Into<String>, taints: Vec<Taint>) -> Self {
        Self {
            hostname: hostname.into(),
            address: address.into(),
            taints,
            files: Vec::new(),
            domains: Vec::new(),
            local_total: 0.0,
            local_reserved: 0.0,
            local_available: 0.0,
            error: None,
        }
    }

    /// Merge a telemetry fetch outcome and the ledger into this snapshot
    ///
    /// A failed fetch, or an agent-reported error, leaves the node with an
    /// error string; it stays in the list but is never selected.
    pub fn apply_telemetry(&mut self, fetched: Result<NodeTelemetry>, ledger: &ReservationLedger) {
        let telemetry = match fetched {
            Ok(t) => t,
            Err(e) => {
                self.error = Some(e.to_string());
                NodeTelemetry::default()
            }
        };
        if !telemetry.error.is_empty() {
            self.error = Some(format!("remote node error : {}", telemetry.error));
        }

        self.files = telemetry.files;
        let mut domains = telemetry.domains;
        domains.sort_by_key(|d| d.id);

        self.local_total = 0.0;
        self.local_reserved = 0.0;
        self.domains = domains
            .into_iter()
            .map(|d| {
                let reserved = ledger.reserved(&self.hostname, &d.id.to_string());
                MemoryDomain::new(d, reserved)
            })
            .collect();

        for domain in self.domains.iter().filter(|d| d.has_cpu()) {
            self.local_total += domain.telemetry.total;
            self.local_reserved += domain.reserved_memory;
        }
        self.local_reserved += ledger.unassigned(&self.hostname);
        self.local_available = self.local_total - self.local_reserved;
    }

    /// All readiness files present, and at least one reported
    pub fn ready_files(&self) -> bool {
        let exists = self.files.iter().filter(|f| f.exist).count();
        exists > 0 && exists == self.files.len()
    }

    pub fn local_allocatable(&self, requested: f64) -> bool {
        self.local_available >= requested
    }

    pub fn is_healthy(&self) -> bool {
        self.error.is_none()
    }

    pub fn domain(&self, id: &str) -> Option<&MemoryDomain> {
        self.domains.iter().find(|d| d.id() == id)
    }
}
