//! lca-cli library
//!
//! - [`seed`]: turning a running single node cluster into a seed image
//! - [`install`]: preparing a disk for an image based install

pub mod commands;
pub mod error;
pub mod install;
pub mod poll;
pub mod seed;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};

use clap::{Parser, Subcommand};

/// Lifecycle agent node tooling
#[derive(Parser, Debug)]
#[command(name = "lca-cli")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a seed image from this node and push it to a registry
    Create(commands::create::CreateArgs),
    /// Prepare a disk for image based install from a seed image
    Ibi(commands::ibi::IbiArgs),
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Create(args) => commands::create::run(args).await,
            Commands::Ibi(args) => commands::ibi::run(args).await,
        }
    }
}
