//! Taint/toleration admission
//!
//! Counts (taint, toleration) pairs that match rather than pairing each
//! taint with a distinct toleration, so one toleration can cover several
//! taints. A toleration without an explicit `Equal` or `Exists` operator
//! matches nothing.

use k8s_openapi::api::core::v1::{Taint, Toleration};

const OPERATOR_EQUAL: &str = "Equal";
const OPERATOR_EXISTS: &str = "Exists";

fn pair_matches(taint: &Taint, toleration: &Toleration) -> bool {
    if toleration.key.as_deref().unwrap_or_default() != taint.key
        || toleration.effect.as_deref().unwrap_or_default() != taint.effect
    {
        return false;
    }
    match toleration.operator.as_deref() {
        Some(OPERATOR_EQUAL) => {
            toleration.value.as_deref().unwrap_or_default()
                == taint.value.as_deref().unwrap_or_default()
        }
        Some(OPERATOR_EXISTS) => true,
        _ => false,
    }
}

/// Number of matching (taint, toleration) pairs
pub fn matched_pairs(taints: &[Taint], tolerations: &[Toleration]) -> usize {
    taints
        .iter()
        .map(|taint| tolerations.iter().filter(|t| pair_matches(taint, t)).count())
        .sum()
}

/// Whether a node with `taints` admits a pod with `tolerations`
pub fn admit(taints: &[Taint], tolerations: &[Toleration]) -> bool {
    matched_pairs(taints, tolerations) == taints.len()
}
