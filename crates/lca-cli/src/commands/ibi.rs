//! Ibi command - prepare a disk for image based install
//!
//! Runs directly on the target host, booted from a live ISO.

use std::sync::Arc;

use clap::{ArgAction, Args};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use lca_common::{IMAGE_REGISTRY_AUTH_FILE, OSTREE_DEPLOY_ROOT};
use lca_ostree::{CommandHostOps, HostOps, OstreeCli, RpmOstreeCli, StaterootManager, StaterootPaths};
use lca_precache::{PodmanPuller, PrecacheMode};

use crate::install::{ExtraPartition, IbiOptions, IbiPreparation, IBI_MOUNT};
use crate::{Error, Result};

/// Prepare a disk for image based install
#[derive(Args, Debug)]
pub struct IbiArgs {
    /// Seed image reference
    #[arg(short = 's', long)]
    pub seed_image: String,

    /// Release version of the seed image
    #[arg(long)]
    pub seed_version: String,

    /// Registry auth file used to pull the seed image
    #[arg(short = 'a', long = "auth-file", visible_alias = "authfile", default_value = IMAGE_REGISTRY_AUTH_FILE)]
    pub auth_file: String,

    /// Pull secret used while precaching
    #[arg(short = 'p', long)]
    pub pull_secret_file: String,

    /// Disk to install to
    #[arg(long)]
    pub installation_disk: String,

    /// Keep going when some images cannot be precached
    #[arg(long)]
    pub precache_best_effort: bool,

    /// Do not precache images
    #[arg(long)]
    pub precache_disabled: bool,

    /// Leave the host running when done
    #[arg(long)]
    pub skip_shutdown: bool,

    /// Put container storage on its own partition
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub create_extra_partition: bool,

    /// Number of the container storage partition
    #[arg(long, default_value_t = 5)]
    pub extra_partition_number: usize,

    /// Start of the container storage partition
    #[arg(long, default_value = "40G")]
    pub extra_partition_start: String,

    /// Label of the container storage partition
    #[arg(long, default_value = "varlibcontainers")]
    pub extra_partition_label: String,
}

impl IbiArgs {
    fn options(&self) -> Result<IbiOptions> {
        let precache = match (self.precache_disabled, self.precache_best_effort) {
            (true, true) => {
                return Err(Error::validation(
                    "--precache-disabled and --precache-best-effort are mutually exclusive",
                ))
            }
            (true, false) => None,
            (false, true) => Some(PrecacheMode::BestEffort),
            (false, false) => Some(PrecacheMode::Strict),
        };
        let extra_partition = self.create_extra_partition.then(|| ExtraPartition {
            number: self.extra_partition_number,
            start: self.extra_partition_start.clone(),
            label: self.extra_partition_label.clone(),
        });
        Ok(IbiOptions {
            seed_image: self.seed_image.clone(),
            seed_version: self.seed_version.clone(),
            installation_disk: self.installation_disk.clone(),
            extra_partition,
            precache,
            skip_shutdown: self.skip_shutdown,
        })
    }
}

/// Run the ibi command
pub async fn run(args: IbiArgs) -> Result<()> {
    let options = args.options()?;
    let ops: Arc<dyn HostOps> = Arc::new(CommandHostOps::direct());

    let stateroots = StaterootManager::new(
        Arc::new(RpmOstreeCli::new(ops.clone())),
        Arc::new(OstreeCli::with_sysroot(ops.clone(), IBI_MOUNT)),
        ops.clone(),
        StaterootPaths {
            host_root: "/".into(),
            deploy_root: format!("{IBI_MOUNT}{OSTREE_DEPLOY_ROOT}").into(),
        },
    );
    let ibi = IbiPreparation::new(
        ops.clone(),
        stateroots,
        Arc::new(PodmanPuller::new(ops.clone(), Some(args.auth_file.clone()))),
        Arc::new(PodmanPuller::new(ops, Some(args.pull_secret_file.clone()))),
        options,
    );

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling precache");
            on_signal.cancel();
        }
    });

    ibi.run(cancel).await?;
    info!("Image based install preparation completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        args: IbiArgs,
    }

    fn parse(extra: &[&str]) -> IbiArgs {
        let mut argv = vec![
            "ibi",
            "-s",
            "quay.io/seeds/sno:4.16.1",
            "--seed-version",
            "4.16.1",
            "-p",
            "/ps.json",
            "--installation-disk",
            "/dev/sda",
        ];
        argv.extend_from_slice(extra);
        TestCli::try_parse_from(argv).expect("parse").args
    }

    #[test]
    fn defaults_create_the_container_partition_and_precache_strictly() {
        let options = parse(&[]).options().expect("options");
        assert_eq!(options.precache, Some(PrecacheMode::Strict));
        assert_eq!(
            options.extra_partition,
            Some(ExtraPartition {
                number: 5,
                start: "40G".to_string(),
                label: "varlibcontainers".to_string(),
            })
        );
        assert!(!options.skip_shutdown);
    }

    #[test]
    fn extra_partition_can_be_turned_off() {
        let options = parse(&["--create-extra-partition", "false", "--precache-best-effort"])
            .options()
            .expect("options");
        assert_eq!(options.extra_partition, None);
        assert_eq!(options.precache, Some(PrecacheMode::BestEffort));
    }

    #[test]
    fn precache_flags_conflict() {
        let args = parse(&["--precache-disabled", "--precache-best-effort"]);
        assert!(args.options().is_err());
        assert_eq!(parse(&["--precache-disabled"]).options().expect("options").precache, None);
    }
}
