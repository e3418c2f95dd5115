//! CMMD placement controller CLI
//!
//! A command-line tool for listing allocation requests, inspecting node
//! memory domains and dry-running placements.

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use client::{AgentOptions, ClusterSession};
use commands::{explain, nodes, requests};

/// CMMD placement controller CLI
#[derive(Parser)]
#[command(name = "cmmdctl")]
#[command(author, version, about = "CLI for the CMMD placement controller", long_about = None)]
pub struct Cli {
    /// Path to kubeconfig file (uses default if not specified)
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<String>,

    /// Kubeconfig context to use
    #[arg(long)]
    pub context: Option<String>,

    /// Namespace the node agents run in
    #[arg(long, env = "OPER_NAMESPACE", default_value = "cmmd-system")]
    pub agent_namespace: String,

    /// Service publishing the node agents
    #[arg(long, env = "CMMD_AGENT_SERVICE", default_value = "cmmd-agent")]
    pub agent_service: String,

    /// Scheme used to reach the node agents
    #[arg(long, env = "CMMD_AGENT_SCHEME", default_value = "http")]
    pub agent_scheme: String,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List allocation requests and their placement
    Requests {
        /// Filter by namespace (all namespaces if not specified)
        #[arg(long, short)]
        namespace: Option<String>,
    },

    /// Show candidate nodes, memory domains and reservations
    Nodes {
        /// Node label selector (key=value,...)
        #[arg(long, short)]
        selector: Option<String>,
    },

    /// Dry-run the placement of a request without changing anything
    Explain {
        /// Request name
        name: String,

        /// Request namespace
        #[arg(long, short, default_value = "default")]
        namespace: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let session = ClusterSession::connect(
        cli.kubeconfig.as_deref(),
        cli.context.as_deref(),
        AgentOptions {
            namespace: cli.agent_namespace,
            service: cli.agent_service,
            scheme: cli.agent_scheme,
        },
    )
    .await?;

    match cli.command {
        Commands::Requests { namespace } => {
            requests::list_requests(&session, namespace, cli.format).await?;
        }
        Commands::Nodes { selector } => {
            nodes::show_nodes(&session, selector, cli.format).await?;
        }
        Commands::Explain { name, namespace } => {
            explain::explain(&session, &name, &namespace, cli.format).await?;
        }
    }

    Ok(())
}
