//! Node-agent telemetry client
//!
//! Every node runs an agent that reports memory-domain topology, CMMD device
//! state and the presence of the runtime hook files. The controller fetches
//! it once per node per reconciliation; there is no cache and no retry.

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

/// Well-known path served by the node agent
pub const DEFAULT_TELEMETRY_PATH: &str = "/metrics";

/// Default bound on a single telemetry request
pub const DEFAULT_TELEMETRY_TIMEOUT: Duration = Duration::from_secs(5);

/// A readiness file the node agent checks for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequiredFile {
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub filepath: String,
    #[serde(default)]
    pub exist: bool,
}

/// One memory domain as reported by the node agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomainTelemetry {
    #[serde(rename = "numa_node")]
    pub id: i64,
    #[serde(default)]
    pub cpu_list: String,
    #[serde(default)]
    pub cpu_none: bool,
    #[serde(default)]
    pub movable: bool,
    #[serde(rename = "daxctl_mode", default)]
    pub device_mode: String,
    #[serde(rename = "daxctl_size", default)]
    pub device_size: f64,
    /// valid, invalid or unchecked
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub total: f64,
    #[serde(default)]
    pub free: f64,
    #[serde(default)]
    pub used: f64,
    #[serde(default)]
    pub mem_available: f64,
    #[serde(default)]
    pub sreclaimable: f64,
    #[serde(default)]
    pub active_file: f64,
    #[serde(default)]
    pub inactive_file: f64,
    #[serde(default)]
    pub unevictable: f64,
    #[serde(default)]
    pub mlocked: f64,
    #[serde(default)]
    pub device_id: String,
}

/// Full telemetry payload of one node agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeTelemetry {
    #[serde(default)]
    pub files: Vec<RequiredFile>,
    #[serde(rename = "nodes", default)]
    pub domains: Vec<DomainTelemetry>,
    #[serde(default)]
    pub error: String,
}

/// Source of per-node telemetry
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// Fetch telemetry from the agent at `address` (`ip:port` or a full URL)
    async fn fetch(&self, address: &str) -> Result<NodeTelemetry>;
}

/// Configuration for the HTTP telemetry client
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Scheme used when the address carries none
    pub scheme: String,
    pub path: String,
    pub timeout: Duration,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            scheme: "http".to_string(),
            path: DEFAULT_TELEMETRY_PATH.to_string(),
            timeout: DEFAULT_TELEMETRY_TIMEOUT,
        }
    }
}

/// HTTP(S) client for node agents
///
/// Agents serve self-signed certificates, so the TLS client skips
/// certificate validation. Plain HTTP and TLS use separate clients and the
/// URL scheme picks between them.
pub struct HttpTelemetryClient {
    config: TelemetryConfig,
    plain: reqwest::Client,
    insecure_tls: reqwest::Client,
}

impl HttpTelemetryClient {
    pub fn new(config: TelemetryConfig) -> Result<Self> {
        let plain = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Telemetry(format!("failed to create http client: {e}")))?;
        let insecure_tls = reqwest::Client::builder()
            .timeout(config.timeout)
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| Error::Telemetry(format!("failed to create https client: {e}")))?;

        Ok(Self {
            config,
            plain,
            insecure_tls,
        })
    }

    /// Build the request URL for an agent address
    pub fn url_for(&self, address: &str) -> Result<url::Url> {
        let base = if address.contains("://") {
            address.to_string()
        } else {
            format!("{}://{}", self.config.scheme, address)
        };
        let base = url::Url::parse(&base)
            .map_err(|e| Error::Telemetry(format!("invalid agent address {address}: {e}")))?;
        base.join(&self.config.path)
            .map_err(|e| Error::Telemetry(format!("invalid telemetry path: {e}")))
    }
}

#[async_trait]
impl TelemetrySource for HttpTelemetryClient {
    async fn fetch(&self, address: &str) -> Result<NodeTelemetry> {
        let url = self.url_for(address)?;
        let client = if url.scheme() == "https" {
            &self.insecure_tls
        } else {
            &self.plain
        };

        let start = Instant::now();
        let response = client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| Error::Telemetry(format!("{} error : {e}", url.scheme())))?;

        if !response.status().is_success() {
            return Err(Error::Telemetry(format!(
                "agent {} returned {}",
                url,
                response.status()
            )));
        }

        let telemetry: NodeTelemetry = response
            .json()
            .await
            .map_err(|e| Error::Telemetry(format!("unmarshal node response error: {e}")))?;

        debug!(
            destination = %url,
            domains = telemetry.domains.len(),
            files = telemetry.files.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Node response"
        );
        Ok(telemetry)
    }
}
