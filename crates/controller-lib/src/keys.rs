//! Well-known label and annotation keys stamped onto managed workloads

/// Ownership label carried by every pod this controller places
pub const LABEL_OPERATOR: &str = "socmmd";
pub const LABEL_OPERATOR_VALUE: &str = "v1";

/// Node the placement decision targeted
pub const LABEL_ALLOCATE_NODE: &str = "cmmd-allocate-node";

/// Memory type the placement decision targeted
pub const LABEL_MEM_TYPE: &str = "socmmd-type";
pub const MEM_TYPE_LOCAL: &str = "local";
pub const MEM_TYPE_CMMD: &str = "cmmd";

/// Hook annotations read by the node-side runtime hook
pub const ANNO_HOOK_ENABLE: &str = "cmmd-enable";
pub const ANNO_HOOK_MEM_DOMAIN: &str = "cmmd-numa";
pub const ANNO_HOOK_CPU_LIST: &str = "cmmd-cpus";

/// Name of the owning request, on the pod template
pub const ANNO_OWNER: &str = "cmmd.samsung.com/owner";

/// Presence forces recreation; value is the reallocation reason
pub const ANNO_REALLOCATE: &str = "cmmd.samsung.com/reallocate";

/// Request fields copied onto pods so the watcher can filter without a lookup
pub const ANNO_SPEC_ENABLE: &str = "cmmd.samsung.com/enable";
pub const ANNO_SPEC_ALLOCATE_MODE: &str = "cmmd.samsung.com/allocateMode";

/// Replica count the placement reserved memory for
pub const ANNO_REPLICAS: &str = "cmmd.samsung.com/replicas";

/// JSON snapshot of the request spec the workload was created from
pub const ANNO_LAST_APPLIED: &str = "cmmd.samsung.com/last-applied-spec";

/// Sentinel for "let the runtime pick CPUs"
pub const CPU_AUTO: &str = "auto";

/// Selector matching every pod this controller owns
pub fn operator_selector() -> String {
    format!("{}={}", LABEL_OPERATOR, LABEL_OPERATOR_VALUE)
}
