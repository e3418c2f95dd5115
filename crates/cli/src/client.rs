//! Cluster access for the CLI

use anyhow::{Context, Result};
use controller_lib::cluster::{ClusterClient, KubeCluster};
use controller_lib::engine::{AllocationEngine, DiscoveryConfig, DEFAULT_FETCH_CONCURRENCY};
use controller_lib::telemetry::{HttpTelemetryClient, TelemetryConfig};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use std::sync::Arc;

/// Where to find the node agents
#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub namespace: String,
    pub service: String,
    pub scheme: String,
}

/// Read-only view of the cluster and the node agents
pub struct ClusterSession {
    pub cluster: Arc<KubeCluster>,
    pub engine: AllocationEngine,
}

impl ClusterSession {
    /// Connect using an explicit kubeconfig, or the default discovery chain
    pub async fn connect(
        kubeconfig: Option<&str>,
        context: Option<&str>,
        agents: AgentOptions,
    ) -> Result<Self> {
        let client = build_client(kubeconfig, context).await?;
        let cluster = Arc::new(KubeCluster::new(client));

        let telemetry = HttpTelemetryClient::new(TelemetryConfig {
            scheme: agents.scheme,
            ..Default::default()
        })
        .context("Failed to create telemetry client")?;

        let engine = AllocationEngine::new(
            cluster.clone() as Arc<dyn ClusterClient>,
            Arc::new(telemetry),
            DiscoveryConfig {
                agent_namespace: agents.namespace,
                agent_service: agents.service,
                fetch_concurrency: DEFAULT_FETCH_CONCURRENCY,
            },
        );

        Ok(Self { cluster, engine })
    }
}

async fn build_client(kubeconfig: Option<&str>, context: Option<&str>) -> Result<Client> {
    let options = KubeConfigOptions {
        context: context.map(String::from),
        ..Default::default()
    };

    let config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("Failed to read kubeconfig {path}"))?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &options)
                .await
                .context("Invalid kubeconfig")?
        }
        None if context.is_some() => kube::Config::from_kubeconfig(&options)
            .await
            .context("Invalid kubeconfig")?,
        None => kube::Config::infer()
            .await
            .context("Failed to infer Kubernetes configuration")?,
    };

    Client::try_from(config).context("Failed to create Kubernetes client")
}
