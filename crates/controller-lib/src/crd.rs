//! The `CMMD` custom resource: a user-submitted allocation request

use kube::CustomResource;
use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// How the target memory domain is chosen
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum AllocateMode {
    #[default]
    Auto,
    Manual,
}

impl AllocateMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocateMode::Auto => "auto",
            AllocateMode::Manual => "manual",
        }
    }
}

impl std::fmt::Display for AllocateMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Manual placement; only meaningful when `allocateMode` is `manual`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Allocate {
    #[serde(default)]
    pub node_name: String,
    /// Memory domain id
    #[serde(default)]
    pub memory: String,
    /// Explicit cpu list, or `auto`
    #[serde(default)]
    pub cpu: String,
}

#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "cmmd.samsung.com",
    version = "v1",
    kind = "CMMD",
    root = "AllocationRequest",
    namespaced,
    status = "AllocationStatus",
    shortname = "cmmd",
    printcolumn = r#"{"name":"Kind","type":"string","jsonPath":".status.kind"}"#,
    printcolumn = r#"{"name":"Node","type":"string","jsonPath":".status.nodeName"}"#,
    printcolumn = r#"{"name":"Memory","type":"string","jsonPath":".status.amountMemoryStr"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AllocationRequestSpec {
    /// Whether to place onto a CMMD memory domain
    pub enable: bool,
    pub allocate_mode: AllocateMode,
    #[serde(default)]
    pub allocate: Allocate,
    /// Embedded Pod, Deployment or ReplicaSet manifest
    #[schemars(schema_with = "embedded_resource")]
    pub payload: serde_json::Value,
}

/// Mirror of the last successful placement
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AllocationStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default)]
    pub enable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocate_mode: Option<AllocateMode>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub memory: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cpu: String,
    #[serde(default)]
    pub amount_memory: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub amount_memory_str: String,
}

fn embedded_resource(_: &mut SchemaGenerator) -> Schema {
    let mut schema = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    schema.extensions.insert(
        "x-kubernetes-embedded-resource".to_string(),
        serde_json::Value::Bool(true),
    );
    Schema::Object(schema)
}
