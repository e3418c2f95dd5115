//! Controller configuration

use anyhow::{Context as _, Result};
use controller_lib::cleanup::{InstalledObjects, ManagedObject};
use controller_lib::engine::DiscoveryConfig;
use controller_lib::telemetry::TelemetryConfig;
use controller_lib::Settings;
use serde::Deserialize;
use std::time::Duration;

/// Controller configuration, read from `CMMD_*` environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    /// Namespace the controller and the node agents run in
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Service publishing the node agents
    #[serde(default = "default_agent_service")]
    pub agent_service: String,

    #[serde(default = "default_agent_scheme")]
    pub agent_scheme: String,

    #[serde(default = "default_agent_path")]
    pub agent_path: String,

    #[serde(default = "default_telemetry_timeout")]
    pub telemetry_timeout_secs: u64,

    /// Node agents queried at once
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,

    /// Requests reconciled at once
    #[serde(default = "default_reconcile_concurrency")]
    pub reconcile_concurrency: u16,

    #[serde(default = "default_created_requeue")]
    pub created_requeue_secs: u64,

    #[serde(default = "default_error_backoff")]
    pub error_backoff_secs: u64,

    /// 0 disables the device health sweep
    #[serde(default = "default_device_sweep_interval")]
    pub device_sweep_interval_secs: u64,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Delete `managed_objects` when the controller stops
    #[serde(default)]
    pub cleanup_on_shutdown: bool,

    /// `Kind/namespace/name` entries, comma separated in the environment
    #[serde(default)]
    pub managed_objects: Vec<String>,

    /// Reporting instance for events; the pod name when running in-cluster
    #[serde(default = "default_instance")]
    pub instance: Option<String>,
}

fn default_namespace() -> String {
    std::env::var("OPER_NAMESPACE").unwrap_or_else(|_| "cmmd-system".to_string())
}

fn default_agent_service() -> String {
    "cmmd-agent".to_string()
}

fn default_agent_scheme() -> String {
    "http".to_string()
}

fn default_agent_path() -> String {
    controller_lib::telemetry::DEFAULT_TELEMETRY_PATH.to_string()
}

fn default_telemetry_timeout() -> u64 {
    5
}

fn default_fetch_concurrency() -> usize {
    controller_lib::engine::DEFAULT_FETCH_CONCURRENCY
}

fn default_reconcile_concurrency() -> u16 {
    4
}

fn default_created_requeue() -> u64 {
    1
}

fn default_error_backoff() -> u64 {
    30
}

fn default_device_sweep_interval() -> u64 {
    60
}

fn default_api_port() -> u16 {
    8080
}

fn default_instance() -> Option<String> {
    std::env::var("POD_NAME").ok()
}

impl ControllerConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(
                config::Environment::with_prefix("CMMD")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("managed_objects"),
            )
            .build()?;

        config
            .try_deserialize()
            .context("invalid CMMD_* configuration")
    }

    pub fn settings(&self) -> Settings {
        Settings {
            discovery: DiscoveryConfig {
                agent_namespace: self.namespace.clone(),
                agent_service: self.agent_service.clone(),
                fetch_concurrency: self.fetch_concurrency.max(1),
            },
            created_requeue: Duration::from_secs(self.created_requeue_secs),
            error_backoff: Duration::from_secs(self.error_backoff_secs),
            device_sweep_interval: match self.device_sweep_interval_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        }
    }

    pub fn telemetry(&self) -> TelemetryConfig {
        TelemetryConfig {
            scheme: self.agent_scheme.clone(),
            path: self.agent_path.clone(),
            timeout: Duration::from_secs(self.telemetry_timeout_secs),
        }
    }

    pub fn installed_objects(&self) -> Result<InstalledObjects> {
        let mut installed = InstalledObjects::default();
        for raw in self.managed_objects.iter().filter(|s| !s.trim().is_empty()) {
            installed.register(ManagedObject::parse(raw)?);
        }
        Ok(installed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_json(value: serde_json::Value) -> ControllerConfig {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = from_json(serde_json::json!({}));
        assert_eq!(config.agent_service, "cmmd-agent");
        assert_eq!(config.agent_path, "/metrics");
        assert_eq!(config.api_port, 8080);
        assert!(!config.cleanup_on_shutdown);

        let settings = config.settings();
        assert_eq!(settings.error_backoff, Duration::from_secs(30));
        assert_eq!(settings.device_sweep_interval, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_zero_interval_disables_sweep() {
        let config = from_json(serde_json::json!({ "device_sweep_interval_secs": 0 }));
        assert_eq!(config.settings().device_sweep_interval, None);
    }

    #[test]
    fn test_managed_objects_are_parsed() {
        let config = from_json(serde_json::json!({
            "managed_objects": ["DaemonSet/cmmd-system/cmmd-agent", "Service/cmmd-system/cmmd-agent"]
        }));
        assert_eq!(config.installed_objects().unwrap().objects().len(), 2);

        let config = from_json(serde_json::json!({ "managed_objects": ["Secret/x/y"] }));
        assert!(config.installed_objects().is_err());
    }
}
