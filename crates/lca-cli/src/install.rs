//! Image based install preparation
//!
//! Runs from a live ISO on the target host: writes the installation disk,
//! lays out the partitions, builds a stateroot from the seed image under
//! [`IBI_MOUNT`], precaches the seed's images into the new
//! `/var/lib/containers` and powers the host off.

use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use lca_common::{Error, Result};
use lca_ostree::{read_precaching_list, HostOps, SeedStaterootRequest, StaterootManager};
use lca_precache::{precache, ImagePuller, PrecacheConfig, PrecacheMode, PrecacheProgress};

/// Where the installed root filesystem is mounted
pub const IBI_MOUNT: &str = "/mnt";
/// Images to precache, copied out of the seed
pub const IMAGE_LIST_FILE: &str = "/var/tmp/imageListFile";

/// Partition dedicated to `/var/lib/containers`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtraPartition {
    /// Partition number on the installation disk
    pub number: usize,
    /// Start offset understood by sgdisk, e.g. `40G`
    pub start: String,
    /// GPT partition label
    pub label: String,
}

/// How to install
#[derive(Clone, Debug)]
pub struct IbiOptions {
    /// Seed image reference
    pub seed_image: String,
    /// Release version the seed must carry
    pub seed_version: String,
    /// Disk to install to, e.g. `/dev/sda`
    pub installation_disk: String,
    /// Separate partition for container storage, or a bind mount when `None`
    pub extra_partition: Option<ExtraPartition>,
    /// Precache mode, `None` disables precaching
    pub precache: Option<PrecacheMode>,
    /// Leave the host running when done
    pub skip_shutdown: bool,
}

/// One program invocation on the host
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostCommand {
    /// Program to run
    pub program: String,
    /// Its arguments
    pub args: Vec<String>,
}

impl HostCommand {
    fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

impl fmt::Display for HostCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Wipe old signatures and write the OS image to `disk`
pub fn install_commands(disk: &str) -> Vec<HostCommand> {
    vec![
        HostCommand::new("wipefs", &["--all", "--force", disk]),
        HostCommand::new("coreos-installer", &["install", disk]),
    ]
}

/// Create `extra` at the end of the freshly written partition table
pub fn partition_commands(disk: &str, extra: &ExtraPartition) -> Vec<HostCommand> {
    let script = format!("sfdisk {disk} <<< write");
    let new = format!("{}:{}", extra.number, extra.start);
    let name = format!("{}:{}", extra.number, extra.label);
    vec![
        HostCommand::new("bash", &["-c", script.as_str()]),
        HostCommand::new("sgdisk", &["--new", new.as_str(), "--change-name", name.as_str(), disk]),
    ]
}

/// Grow and mount the root filesystem and set up container storage
pub fn environment_commands(disk: &str, extra: Option<&ExtraPartition>) -> Vec<HostCommand> {
    let mut cmds = vec![
        HostCommand::new("growpart", &[disk, "4"]),
        HostCommand::new("mount", &["/dev/disk/by-partlabel/root", "/mnt"]),
        HostCommand::new("mount", &["/dev/disk/by-partlabel/boot", "/mnt/boot"]),
        HostCommand::new("xfs_growfs", &["/dev/disk/by-partlabel/root"]),
    ];
    match extra {
        Some(extra) => {
            let device = format!("/dev/disk/by-partlabel/{}", extra.label);
            cmds.push(HostCommand::new("mount", &[device.as_str(), "/mnt/var/lib/containers"]));
        }
        None => cmds.extend([
            HostCommand::new("chattr", &["-i", "/mnt/"]),
            HostCommand::new("mkdir", &["-p", "/mnt/containers"]),
            HostCommand::new("chattr", &["+i", "/mnt/"]),
            HostCommand::new("mount", &["-o", "bind", "/mnt/containers", "/var/lib/containers"]),
        ]),
    }
    cmds.push(HostCommand::new("restorecon", &["-R", "/mnt/var/lib/containers"]));
    cmds
}

#[derive(Deserialize)]
struct BlockDevices {
    #[serde(default)]
    blockdevices: Vec<BlockDevice>,
}

#[derive(Deserialize)]
struct BlockDevice {
    #[serde(default)]
    path: String,
    #[serde(default)]
    children: Vec<BlockDevice>,
}

/// Device path of partition `number` in `lsblk <disk> --json -O` output
pub fn extra_partition_path(lsblk: &str, number: usize) -> Result<String> {
    let devices: BlockDevices = serde_json::from_str(lsblk)
        .map_err(|e| Error::serialization_for_kind("lsblk", e.to_string()))?;
    devices
        .blockdevices
        .first()
        .and_then(|disk| disk.children.get(number.checked_sub(1)?))
        .map(|partition| partition.path.clone())
        .filter(|path| !path.is_empty())
        .ok_or_else(|| {
            Error::validation_for("installation disk", format!("no partition number {number}"))
        })
}

/// Installs a host from a seed image
pub struct IbiPreparation {
    ops: Arc<dyn HostOps>,
    stateroots: StaterootManager,
    seed_puller: Arc<dyn ImagePuller>,
    precache_puller: Arc<dyn ImagePuller>,
    options: IbiOptions,
}

impl IbiPreparation {
    /// Create; the two pullers differ in the credentials they use
    pub fn new(
        ops: Arc<dyn HostOps>,
        stateroots: StaterootManager,
        seed_puller: Arc<dyn ImagePuller>,
        precache_puller: Arc<dyn ImagePuller>,
        options: IbiOptions,
    ) -> Self {
        Self {
            ops,
            stateroots,
            seed_puller,
            precache_puller,
            options,
        }
    }

    /// Prepare the disk, deploy the seed, precache and shut down
    #[instrument(skip(self, cancel), fields(seed = %self.options.seed_image, disk = %self.options.installation_disk))]
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        self.prepare_disk().await?;

        info!("Pulling seed image");
        self.seed_puller.pull(&self.options.seed_image).await?;

        let request = SeedStaterootRequest {
            seed_image: self.options.seed_image.clone(),
            expected_version: self.options.seed_version.clone(),
            image_list_file: IMAGE_LIST_FILE.into(),
            seed_info_file: None,
            ibi: true,
        };
        let stateroot = self.stateroots.setup_stateroot(&request).await?;
        info!(stateroot = %stateroot, "Stateroot ready");

        self.precache(cancel).await?;
        self.shutdown().await
    }

    async fn prepare_disk(&self) -> Result<()> {
        let disk = self.options.installation_disk.as_str();
        info!("Preparing disk");
        self.run_all(&install_commands(disk)).await?;

        if let Some(extra) = &self.options.extra_partition {
            self.run_all(&partition_commands(disk, extra)).await?;
            let lsblk = self
                .ops
                .run_in_host_namespace("lsblk", &[disk.to_string(), "--json".into(), "-O".into()])
                .await?;
            let partition = extra_partition_path(&lsblk, extra.number)?;
            self.run_all(&[HostCommand::new("mkfs.xfs", &["-f", partition.as_str()])])
                .await?;
        }

        self.run_all(&environment_commands(disk, self.options.extra_partition.as_ref()))
            .await?;
        info!("Disk prepared");
        Ok(())
    }

    async fn precache(&self, cancel: CancellationToken) -> Result<()> {
        let Some(mode) = self.options.precache else {
            info!("Precache disabled, skipping it");
            return Ok(());
        };

        let list = self.stateroots.paths().outside_chroot(IMAGE_LIST_FILE);
        let images = read_precaching_list(&list, None).await?;
        let summary = precache(
            images,
            self.precache_puller.clone(),
            &PrecacheConfig::with_mode(mode),
            cancel,
            Arc::new(PrecacheProgress::default()),
        )
        .await?;
        for (image, error) in &summary.failures {
            warn!(image = %image, error = %error, "Image was not precached");
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        if self.options.skip_shutdown {
            info!("Skipping shutdown");
            return Ok(());
        }
        info!("Shutting down the host");
        self.ops
            .run_in_host_namespace("shutdown", &["now".to_string()])
            .await
            .map(drop)
    }

    async fn run_all(&self, cmds: &[HostCommand]) -> Result<()> {
        for cmd in cmds {
            info!(command = %cmd, "Running");
            self.ops.run_in_host_namespace(&cmd.program, &cmd.args).await?;
        }
        Ok(())
    }
}
