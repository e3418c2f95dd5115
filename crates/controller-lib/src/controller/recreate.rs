//! Change detection between a request and the workload created from it
//!
//! The request fields that shaped a placement are recorded on the workload
//! as JSON and compared structurally on every pass.

use crate::crd::{Allocate, AllocateMode, AllocationRequestSpec};
use crate::error::Result;
use crate::keys;
use crate::workload::Workload;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The request fields a placement was computed from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastAppliedSpec {
    pub enable: bool,
    pub allocate_mode: AllocateMode,
    #[serde(default)]
    pub allocate: Allocate,
}

impl LastAppliedSpec {
    pub fn from_spec(spec: &AllocationRequestSpec) -> Self {
        Self {
            enable: spec.enable,
            allocate_mode: spec.allocate_mode,
            allocate: spec.allocate.clone(),
        }
    }

    pub fn to_annotation(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Read the record from a workload; `None` when it carries none
    pub fn from_workload(workload: &Workload) -> Option<Result<Self>> {
        workload
            .annotations()
            .and_then(|a| a.get(keys::ANNO_LAST_APPLIED))
            .map(|raw| serde_json::from_str(raw).map_err(Into::into))
    }
}

/// Why a workload has to be deleted and placed again
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecreateReason {
    /// Stamped by the reallocation watcher or the device sweep
    Reallocate(String),
    MissingRecord,
    UnreadableRecord(String),
    EnableChanged,
    ModeChanged,
    AllocateChanged,
}

impl fmt::Display for RecreateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecreateReason::Reallocate(reason) => write!(f, "delivered annotation: {reason}"),
            RecreateReason::MissingRecord => write!(f, "empty annotation"),
            RecreateReason::UnreadableRecord(e) => write!(f, "unreadable last-applied spec: {e}"),
            RecreateReason::EnableChanged => write!(f, "enable updated"),
            RecreateReason::ModeChanged => write!(f, "allocateMode updated"),
            RecreateReason::AllocateChanged => write!(f, "allocate updated"),
        }
    }
}

/// Decide whether `child` must be recreated for `spec`; first match wins
pub fn need_recreate(child: &Workload, spec: &AllocationRequestSpec) -> Option<RecreateReason> {
    if let Some(reason) = child.annotations().and_then(|a| a.get(keys::ANNO_REALLOCATE)) {
        return Some(RecreateReason::Reallocate(reason.clone()));
    }

    let recorded = match LastAppliedSpec::from_workload(child) {
        None => return Some(RecreateReason::MissingRecord),
        Some(Err(e)) => return Some(RecreateReason::UnreadableRecord(e.to_string())),
        Some(Ok(recorded)) => recorded,
    };

    if recorded.enable != spec.enable {
        return Some(RecreateReason::EnableChanged);
    }
    if recorded.allocate_mode != spec.allocate_mode {
        return Some(RecreateReason::ModeChanged);
    }
    if recorded.allocate_mode == AllocateMode::Manual && recorded.allocate != spec.allocate {
        return Some(RecreateReason::AllocateChanged);
    }
    None
}
