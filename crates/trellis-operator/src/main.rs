//! Trellis Operator - dependency-ordered cluster provisioning

use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use trellis_common::kube_utils::create_client;
use trellis_operator::controller_runner::cancel_on_signal;
use trellis_operator::crds::{crds_yaml, ensure_crds_installed};
use trellis_operator::telemetry::init_tracing;
use trellis_operator::{ControllerArgs, ControllerRegistry, OperatorConfig};

/// Trellis - provisions Kubernetes clusters as ordered graphs of cloud components
#[derive(Parser, Debug)]
#[command(name = "trellis", version, about, long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    controller: ControllerArgs,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    ///
    /// Watches ManagedCluster resources and the network, control plane and
    /// node pool children they own, walking each cluster's component graph
    /// until it converges.
    Controller(ControllerArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        println!("{}", crds_yaml()?);
        return Ok(());
    }

    let args = match cli.command {
        Some(Commands::Controller(args)) => args,
        None => cli.controller,
    };
    let log_format = args.log_format;
    init_tracing(log_format)?;

    let config = OperatorConfig::try_from(args)?;
    run_controller(config).await
}

async fn run_controller(config: OperatorConfig) -> anyhow::Result<()> {
    tracing::info!(
        workers = config.workers,
        resync_secs = config.resync.as_secs(),
        namespace = config.namespace.as_deref().unwrap_or("*"),
        "starting Trellis controller"
    );

    let shutdown = CancellationToken::new();
    cancel_on_signal(shutdown.clone());

    let client = create_client(Duration::from_secs(5), Duration::from_secs(30)).await?;

    ensure_crds_installed(&client, config.crd_wait, &shutdown).await?;

    let registry = ControllerRegistry::with_defaults();
    let controllers = registry.build_all(client, &config, &shutdown);
    futures::future::join_all(controllers).await;

    tracing::info!("all controllers stopped");
    Ok(())
}
