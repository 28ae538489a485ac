//! Canvas CLI
//!
//! A command-line tool for inspecting SD multiplayer canvas instances and
//! operating on their workloads.

mod client;
mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{instances, workloads};

/// SD Multiplayer canvas CLI
#[derive(Parser)]
#[command(name = "canvasctl")]
#[command(author, version, about = "CLI for SD Multiplayer canvas instances", long_about = None)]
pub struct Cli {
    /// Namespace holding the instances (falls back to the config file)
    #[arg(long, short, env = "CANVAS_NAMESPACE")]
    pub namespace: Option<String>,

    /// Path to kubeconfig file (uses default if not specified)
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<String>,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the SDMultiplayer CustomResourceDefinition as YAML
    Crd,

    /// List canvas instances and their status
    List,

    /// Set the replica count of a deployment
    Scale {
        /// Deployment name
        deployment: String,

        /// Desired replica count
        replicas: i32,
    },

    /// Trigger a rolling restart of a deployment
    Restart {
        /// Deployment name
        deployment: String,
    },

    /// List canvas pods
    Pods,

    /// Print the logs of a pod
    Logs {
        /// Pod name
        pod: String,

        /// Container name (defaults to the pod's only container)
        #[arg(long, short)]
        container: Option<String>,

        /// Number of lines from the end of the log
        #[arg(long)]
        tail: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // The CRD is rendered locally; everything else needs a cluster
    let command = match cli.command {
        Commands::Crd => return instances::print_crd(),
        command => command,
    };

    let settings = config::Config::load()?;
    let namespace = settings.namespace(cli.namespace);
    let kubeconfig = cli.kubeconfig.or(settings.kubeconfig);
    let client = client::connect(kubeconfig.as_deref()).await?;

    match command {
        Commands::Crd => {}
        Commands::List => {
            instances::list_instances(client, &namespace, cli.format).await?;
        }
        Commands::Scale {
            deployment,
            replicas,
        } => {
            workloads::scale_deployment(client, &namespace, &deployment, replicas).await?;
        }
        Commands::Restart { deployment } => {
            workloads::restart_deployment(client, &namespace, &deployment).await?;
        }
        Commands::Pods => {
            workloads::list_pods(client, &namespace, cli.format).await?;
        }
        Commands::Logs {
            pod,
            container,
            tail,
        } => {
            workloads::print_logs(client, &namespace, &pod, container, tail).await?;
        }
    }

    Ok(())
}
