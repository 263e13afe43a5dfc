//! Create command - turn this single node cluster into a seed image
//!
//! Runs on the seed node with the host mounted at `/host`. The cluster is
//! shut down along the way, so after a successful run the node only comes
//! back by rebooting or reinstalling it.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use kube::Client;
use tracing::info;

use lca_common::{DEFAULT_RECERT_IMAGE, IMAGE_REGISTRY_AUTH_FILE};
use lca_ostree::{CommandHostOps, HostOps, RpmOstreeCli, StaterootPaths};

use crate::seed::cluster::KubeSeedCluster;
use crate::seed::{SeedCreator, SeedOptions, BACKUP_DIR, CONFIG_FILES_DIR};
use crate::Result;

/// Create a seed image from this node
#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Seed image reference to build and push
    #[arg(short = 'i', long)]
    pub image: String,

    /// Registry auth file used to push the seed image
    #[arg(short = 'a', long = "auth-file", visible_alias = "authfile", default_value = IMAGE_REGISTRY_AUTH_FILE)]
    pub auth_file: String,

    /// recert container image
    #[arg(
        short = 'e',
        long,
        env = "RELATED_IMAGE_RECERT_IMAGE",
        default_value = DEFAULT_RECERT_IMAGE
    )]
    pub recert_image: String,

    /// Do not expire the seed's certificates
    #[arg(long)]
    pub skip_recert: bool,

    /// Host directory to collect the backups in
    #[arg(long, default_value = BACKUP_DIR)]
    pub backup_dir: String,

    /// Configuration scripts and units to install on the seed
    #[arg(long, default_value = CONFIG_FILES_DIR)]
    pub config_files_dir: PathBuf,
}

impl CreateArgs {
    fn options(&self) -> SeedOptions {
        SeedOptions {
            image: self.image.clone(),
            auth_file: self.auth_file.clone(),
            recert_image: self.recert_image.clone(),
            skip_recert: self.skip_recert,
            backup_dir: self.backup_dir.clone(),
            config_files_dir: self.config_files_dir.clone(),
        }
    }
}

/// Run the create command
pub async fn run(args: CreateArgs) -> Result<()> {
    let client = Client::try_default().await?;
    let ops: Arc<dyn HostOps> = Arc::new(CommandHostOps::nsenter());

    let creator = SeedCreator::new(
        ops.clone(),
        Arc::new(RpmOstreeCli::new(ops)),
        Arc::new(KubeSeedCluster::new(client)),
        StaterootPaths::default(),
        args.options(),
    );
    creator.create().await?;

    info!(image = %args.image, "Seed image created");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        args: CreateArgs,
    }

    #[test]
    fn defaults_push_with_the_kubelet_pull_secret() {
        let cli = TestCli::try_parse_from(["create", "-i", "quay.io/seeds/sno:4.16.1"])
            .expect("parse");
        let options = cli.args.options();
        assert_eq!(options.auth_file, IMAGE_REGISTRY_AUTH_FILE);
        assert!(!options.skip_recert);
        assert_eq!(options.backup_dir, BACKUP_DIR);
        assert_eq!(options.config_files_dir, PathBuf::from(CONFIG_FILES_DIR));
    }

    #[test]
    fn image_is_required() {
        assert!(TestCli::try_parse_from(["create"]).is_err());
    }
}
