//! Seed image creation
//!
//! A seed is the backup of a stopped single node cluster packed into an
//! OCI image: `/var`, the `/etc` diff, the ostree repo, the rpm-ostree
//! status, the machine config and the list of images to precache. Every
//! step that is expensive or not repeatable is checkpointed under
//! [`CHECKPOINT_DIR`] so a rerun after a failure picks up where it stopped.

pub mod cluster;
pub mod recert;

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use tracing::{info, instrument, warn};

use lca_common::retry::{retry_with_backoff, RetryConfig};
use lca_common::{
    Checkpoints, Error, Result, SEED_FORMAT_OCI_LABEL, SEED_FORMAT_VERSION,
    SEED_MANIFEST_FILE_NAME,
};
use lca_controller::cluster_config::copy_tree;
use lca_ostree::{deployment_from_deployment_id, DeploymentQuery, HostOps, StaterootPaths};

use crate::poll::wait_with_timeout;
use cluster::SeedCluster;
use recert::Recert;

/// Default host directory the seed image is built from
pub const BACKUP_DIR: &str = "/var/tmp/backup";
/// Host directory receiving the preserved signer keys and CAs
pub const BACKUP_CERTS_DIR: &str = "/var/tmp/backupCertsDir";
/// Host directory holding step markers
pub const CHECKPOINT_DIR: &str = "/var/tmp/checks";
/// Host directory the cluster info manifest is also written to
pub const SEED_DATA_DIR: &str = "/var/seed_data";
/// Scripts and units installed on the seed, shipped in the agent image
pub const CONFIG_FILES_DIR: &str = "/usr/local/installation_configuration_files";
/// Images to precache, relative to the backup directory
pub const CONTAINER_LIST_FILE: &str = "containers.list";

/// Node specific certificates that must not end up in the seed
pub const NODE_CERT_DIRS: &[&str] = &[
    "/var/lib/ovn-ic/etc/ovnkube-node-certs",
    "/etc/cni/multus/certs",
];

/// Paths left out of the `/var` backup
pub const VAR_BACKUP_EXCLUDES: &[&str] = &[
    "/var/tmp/*",
    "/var/lib/log/*",
    "/var/log/*",
    "/var/lib/containers/*",
    "/var/lib/kubelet/pods/*",
    "/var/lib/cni/bin/*",
    "/var/lib/ovn-ic/etc/ovnkube-node-certs/*",
];

pub(crate) const STEP_CONTAINER_LIST: &str = "create_container_list";
pub(crate) const STEP_CLUSTER_INFO: &str = "gather_cluster_info";
pub(crate) const STEP_BACKUP_CERTS: &str = "backup_certs";
pub(crate) const STEP_DELETE_NODE: &str = "delete_node";
pub(crate) const STEP_WAIT_OVN: &str = "wait_for_ovn_to_go_down";
pub(crate) const STEP_RECERT: &str = "recert";

const OVN_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const OVN_POLL_INTERVAL: Duration = Duration::from_secs(10);

const STOP_CONTAINERS_SCRIPT: &str =
    "crictl ps -q | xargs --no-run-if-empty --max-args 1 --max-procs 10 crictl stop --timeout 5";

const CONTAINERFILE: &str = "/var/tmp/seed.Containerfile";

static DEFAULT_CATALOG_IMAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^registry\.redhat\.io/redhat/.+-index:.+")
        .expect("default catalog image pattern is valid")
});

#[derive(Deserialize)]
struct CrictlImages {
    #[serde(default)]
    images: Vec<CrictlImage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CrictlImage {
    #[serde(default)]
    repo_tags: Vec<String>,
    #[serde(default)]
    repo_digests: Vec<String>,
}

/// Image references from `crictl images -o json`, tags preferred over digests
pub fn parse_crictl_images(json: &str) -> Result<Vec<String>> {
    let listing: CrictlImages = serde_json::from_str(json)
        .map_err(|e| Error::serialization_for_kind("crictl images", e.to_string()))?;
    Ok(listing
        .images
        .into_iter()
        .flat_map(|image| {
            if image.repo_tags.is_empty() {
                image.repo_digests
            } else {
                image.repo_tags
            }
        })
        .collect())
}

/// Images worth precaching on a node upgraded to this seed.
///
/// Catalog index images are dropped; the cluster will pull whatever catalog
/// it is configured with. The recert image is always included.
pub fn container_list(images: Vec<String>, catalogs: &[String], recert_image: &str) -> Vec<String> {
    let mut list: Vec<String> = images
        .into_iter()
        .filter(|image| !catalogs.contains(image) && !DEFAULT_CATALOG_IMAGE.is_match(image))
        .collect();
    if !list.iter().any(|image| image == recert_image) {
        list.push(recert_image.to_string());
    }
    list
}

/// Checkpointed backup steps and the host shell script each one runs
pub fn backup_steps(backup_dir: &str) -> Vec<(&'static str, String)> {
    let excludes = VAR_BACKUP_EXCLUDES
        .iter()
        .map(|path| format!("--exclude '{path}'"))
        .collect::<Vec<_>>()
        .join(" ");
    vec![
        (
            "backup_var",
            format!("tar czf {backup_dir}/var.tgz {excludes} --selinux /var"),
        ),
        (
            "backup_etc",
            format!(
                "ostree admin config-diff | awk '$1 == \"D\" {{print \"/etc/\" $2}}' > {backup_dir}/etc.deletions && \
                 ostree admin config-diff | grep -v 'cni/multus' | awk '$1 != \"D\" {{print \"/etc/\" $2}}' | \
                 tar czf {backup_dir}/etc.tgz --selinux -T -"
            ),
        ),
        (
            "backup_ostree",
            format!("tar czf {backup_dir}/ostree.tgz --selinux -C /ostree/repo ."),
        ),
        (
            "backup_rpmostree",
            format!("rpm-ostree status -v --json > {backup_dir}/rpm-ostree.json"),
        ),
        (
            "backup_mco_config",
            format!("cp /etc/machine-config-daemon/currentconfig {backup_dir}/mco-currentconfig.json"),
        ),
    ]
}

/// What to build and where to push it
#[derive(Clone, Debug)]
pub struct SeedOptions {
    /// Seed image reference to push
    pub image: String,
    /// Registry auth file on the host
    pub auth_file: String,
    /// recert image, also added to the precache list
    pub recert_image: String,
    /// Leave the seed's certificates untouched
    pub skip_recert: bool,
    /// Host directory the backups are collected in and the image built from
    pub backup_dir: String,
    /// Local directory with scripts and units to install on the host
    pub config_files_dir: PathBuf,
}

/// Turns the node into a seed image
pub struct SeedCreator {
    ops: Arc<dyn HostOps>,
    query: Arc<dyn DeploymentQuery>,
    cluster: Arc<dyn SeedCluster>,
    paths: StaterootPaths,
    checkpoints: Checkpoints,
    recert: Recert,
    options: SeedOptions,
    container_stop: RetryConfig,
}

impl SeedCreator {
    /// Create a seed creator; `paths` maps host paths to local ones
    pub fn new(
        ops: Arc<dyn HostOps>,
        query: Arc<dyn DeploymentQuery>,
        cluster: Arc<dyn SeedCluster>,
        paths: StaterootPaths,
        options: SeedOptions,
    ) -> Self {
        Self {
            checkpoints: Checkpoints::new(paths.outside_chroot(CHECKPOINT_DIR)),
            recert: Recert::new(ops.clone(), paths.clone()),
            container_stop: RetryConfig::fixed(5, Duration::from_secs(10)),
            ops,
            query,
            cluster,
            paths,
            options,
        }
    }

    fn local(&self, host_path: impl AsRef<Path>) -> PathBuf {
        self.paths.outside_chroot(host_path)
    }

    /// Back up the node and push the seed image
    #[instrument(skip(self), fields(image = %self.options.image))]
    pub async fn create(&self) -> Result<()> {
        info!("Creating seed image");
        self.install_config_files().await?;

        let backup_dir = self.local(&self.options.backup_dir);
        tokio::fs::create_dir_all(&backup_dir)
            .await
            .map_err(|e| Error::io(&backup_dir, e))?;

        self.checkpoints
            .run_once(STEP_CONTAINER_LIST, || self.create_container_list())
            .await?;
        self.checkpoints
            .run_once(STEP_CLUSTER_INFO, || self.gather_cluster_info())
            .await?;
        if self.options.skip_recert {
            info!("Skipping certificate backup, recert is disabled");
        } else {
            self.checkpoints
                .run_once(STEP_BACKUP_CERTS, || self.backup_certs())
                .await?;
        }
        self.checkpoints
            .run_once(STEP_DELETE_NODE, || self.cluster.delete_node())
            .await?;
        self.checkpoints
            .run_once_best_effort(STEP_WAIT_OVN, || self.wait_for_ovn_down())
            .await;

        self.stop_services().await?;

        if self.options.skip_recert {
            info!("Skipping recert");
        } else {
            self.checkpoints
                .run_once(STEP_RECERT, || {
                    self.recert
                        .force_expire(&self.options.recert_image, &self.options.auth_file)
                })
                .await?;
        }

        self.remove_node_certs().await?;

        for (step, script) in backup_steps(&self.options.backup_dir) {
            self.checkpoints
                .run_once(step, || async {
                    self.ops.run_bash_in_host_namespace(&script).await.map(drop)
                })
                .await?;
        }

        self.build_and_push().await
    }

    /// Copy the configuration scripts and enable their units; absent is fine
    async fn install_config_files(&self) -> Result<()> {
        let src = &self.options.config_files_dir;
        if !tokio::fs::try_exists(src)
            .await
            .map_err(|e| Error::io(src, e))?
        {
            info!(dir = %src.display(), "No configuration files to install");
            return Ok(());
        }

        let (from, to) = (src.clone(), self.local(CONFIG_FILES_DIR));
        let copied = tokio::task::spawn_blocking(move || copy_tree(&from, &to))
            .await
            .map_err(|e| Error::internal_with_context("seed", e.to_string()))??;
        info!(files = copied, "Installed configuration files");

        let services = src.join("services");
        if !tokio::fs::try_exists(&services)
            .await
            .map_err(|e| Error::io(&services, e))?
        {
            return Ok(());
        }
        let unit_dir = self.local("/etc/systemd/system");
        let mut entries = tokio::fs::read_dir(&services)
            .await
            .map_err(|e| Error::io(&services, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::io(&services, e))?
        {
            let unit = entry.file_name().to_string_lossy().into_owned();
            let target = unit_dir.join(&unit);
            tokio::fs::copy(entry.path(), &target)
                .await
                .map_err(|e| Error::io(&target, e))?;
            self.systemctl(&["enable", unit.as_str()]).await?;
        }
        Ok(())
    }

    async fn create_container_list(&self) -> Result<()> {
        self.ops
            .run_in_host_namespace("podman", &args(&["image", "prune", "-f"]))
            .await?;
        let listing = self
            .ops
            .run_in_host_namespace("crictl", &args(&["images", "-o", "json"]))
            .await?;
        let catalogs = self.cluster.catalog_images().await?;
        let list = container_list(
            parse_crictl_images(&listing)?,
            &catalogs,
            &self.options.recert_image,
        );

        let path = self.local(&self.options.backup_dir).join(CONTAINER_LIST_FILE);
        let mut content = list.join("\n");
        content.push('\n');
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| Error::io(&path, e))?;
        info!(images = list.len(), "Wrote container list");
        Ok(())
    }

    async fn gather_cluster_info(&self) -> Result<()> {
        let info = self.cluster.cluster_info(&self.options.recert_image).await?;
        let data = serde_json::to_vec_pretty(&info)?;
        for dir in [SEED_DATA_DIR, self.options.backup_dir.as_str()] {
            let dir = self.local(dir);
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| Error::io(&dir, e))?;
            let path = dir.join(SEED_MANIFEST_FILE_NAME);
            tokio::fs::write(&path, &data)
                .await
                .map_err(|e| Error::io(&path, e))?;
        }
        info!(version = %info.version, "Recorded seed cluster info");
        Ok(())
    }

    async fn backup_certs(&self) -> Result<()> {
        let dir = self.local(BACKUP_CERTS_DIR);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::io(&dir, e))?;
        for (name, pem) in self.cluster.crypto_files().await? {
            let path = dir.join(name);
            tokio::fs::write(&path, pem)
                .await
                .map_err(|e| Error::io(&path, e))?;
        }
        Ok(())
    }

    async fn wait_for_ovn_down(&self) -> Result<()> {
        wait_with_timeout(OVN_TIMEOUT, OVN_POLL_INTERVAL, "ovnkube-node to go down", || async {
            Ok((!self.cluster.ovn_node_running().await?).then_some(()))
        })
        .await
    }

    async fn stop_services(&self) -> Result<()> {
        info!("Stopping kubelet");
        self.systemctl(&["stop", "kubelet"]).await?;
        self.systemctl(&["disable", "kubelet"]).await?;

        let crio = self
            .ops
            .run_bash_in_host_namespace("systemctl is-active crio || true")
            .await?;
        if crio.trim() != "active" {
            info!("crio is not running");
            return Ok(());
        }

        info!("Stopping containers and crio");
        retry_with_backoff(&self.container_stop, "stop containers", || {
            self.ops.run_bash_in_host_namespace(STOP_CONTAINERS_SCRIPT)
        })
        .await?;
        self.systemctl(&["stop", "crio.service"]).await
    }

    async fn remove_node_certs(&self) -> Result<()> {
        for dir in NODE_CERT_DIRS {
            let local = self.local(dir);
            match tokio::fs::remove_dir_all(&local).await {
                Ok(()) => info!(dir, "Removed node certificates"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::io(&local, e)),
            }
        }
        Ok(())
    }

    /// The booted deployment's origin file, needed to deploy the seed's ref
    async fn backup_origin(&self) -> Result<()> {
        let deployments = self.query.query_status().await?;
        let booted = deployments
            .iter()
            .find(|d| d.booted)
            .ok_or(Error::NoBootedDeployment)?;
        let deployment = deployment_from_deployment_id(&booted.id)?;

        let dest = self
            .local(&self.options.backup_dir)
            .join(format!("ostree-{deployment}.origin"));
        if tokio::fs::try_exists(&dest)
            .await
            .map_err(|e| Error::io(&dest, e))?
        {
            return Ok(());
        }
        let src = self.local(self.paths.deployment_origin(&booted.osname, &deployment));
        tokio::fs::copy(&src, &dest)
            .await
            .map_err(|e| Error::io(&src, e))?;
        Ok(())
    }

    async fn build_and_push(&self) -> Result<()> {
        self.backup_origin().await?;

        let containerfile = self.local(CONTAINERFILE);
        tokio::fs::write(&containerfile, "FROM scratch\nCOPY . /\n")
            .await
            .map_err(|e| Error::io(&containerfile, e))?;

        let label = format!("{SEED_FORMAT_OCI_LABEL}={SEED_FORMAT_VERSION}");
        info!(image = %self.options.image, "Building seed image");
        let built = self
            .ops
            .run_in_host_namespace(
                "podman",
                &args(&[
                    "build",
                    "--file",
                    CONTAINERFILE,
                    "--tag",
                    self.options.image.as_str(),
                    "--label",
                    label.as_str(),
                    self.options.backup_dir.as_str(),
                ]),
            )
            .await;
        if let Err(e) = tokio::fs::remove_file(&containerfile).await {
            warn!(error = %e, "Failed to remove Containerfile");
        }
        built?;

        info!(image = %self.options.image, "Pushing seed image");
        self.ops
            .run_in_host_namespace(
                "podman",
                &args(&[
                    "push",
                    "--authfile",
                    self.options.auth_file.as_str(),
                    self.options.image.as_str(),
                ]),
            )
            .await
            .map(drop)
    }

    async fn systemctl(&self, command: &[&str]) -> Result<()> {
        self.ops
            .run_in_host_namespace("systemctl", &args(command))
            .await
            .map(drop)
    }
}

fn args(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

#[cfg(test)]
mod tests;
