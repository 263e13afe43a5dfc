//! lca-cli
//!
//! Node-side tooling for image based upgrades: seed image creation and
//! image based install preparation.

use clap::Parser;

use lca_cli::{Cli, Result};
use lca_common::telemetry::{init_telemetry, TelemetryConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Err(e) = init_telemetry(TelemetryConfig::cli(cli.verbose)) {
        eprintln!("Failed to initialize logging: {e}");
    }
    cli.run().await
}
