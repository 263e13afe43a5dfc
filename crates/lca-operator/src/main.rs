//! Lifecycle agent operator - drives image based upgrades of a single node cluster

use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};

use lca_common::crd::ImageBasedUpgrade;
use lca_common::telemetry::{init_telemetry, TelemetryConfig};
use lca_controller::{error_policy, reconcile, Context, ControllerConfig};

/// Watch timeout, kept below the API server's default request timeout
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Lifecycle agent - ImageBasedUpgrade operator
#[derive(Parser, Debug)]
#[command(name = "lca-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Leave CRD installation to the deployment manifests
    #[arg(long, env = "LCA_SKIP_CRD_INSTALL")]
    skip_crd_install: bool,

    #[command(flatten)]
    config: ControllerConfig,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    ///
    /// Watches the ImageBasedUpgrade resource and walks the node through
    /// Prep, Upgrade, Rollback and back to Idle as the requested stage changes.
    Controller,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&ImageBasedUpgrade::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        service_name: "lca-operator".to_string(),
        ..Default::default()
    })
    .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    match cli.command {
        Some(Commands::Controller) | None => run_controller(cli.config, !cli.skip_crd_install).await,
    }
}

/// Ensure the ImageBasedUpgrade CRD is installed
///
/// Server-side apply keeps the installed schema in step with the operator version.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply("lca-operator").force();

    tracing::info!("Installing ImageBasedUpgrade CRD...");
    crds.patch(
        "imagebasedupgrades.lca.openshift.io",
        &params,
        &Patch::Apply(&ImageBasedUpgrade::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install ImageBasedUpgrade CRD: {}", e))?;

    Ok(())
}

async fn run_controller(config: ControllerConfig, install_crds: bool) -> anyhow::Result<()> {
    tracing::info!(workspace = %config.workspace.display(), "Starting lifecycle agent controller");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    if install_crds {
        ensure_crds_installed(&client).await?;
    }

    let ctx = Arc::new(Context::builder(client.clone(), config).build());
    let upgrades: Api<ImageBasedUpgrade> = Api::all(client);

    Controller::new(upgrades, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(log_reconcile_result("ImageBasedUpgrade"))
        .await;

    tracing::info!("Controller stopped");
    Ok(())
}

/// Log the outcome of each reconciliation
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
