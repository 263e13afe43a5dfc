//! Stateroot removal
//!
//! The booted stateroot is never touched. Every destructive operation
//! re-queries the deployment list first because indices shift after each
//! undeploy and another actor may have changed the list in between.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{error, info, instrument, warn};

use lca_common::{Error, Result};

use crate::client::{DeploymentQuery, HostOps, OstreeClient};
use crate::deployment::{booted_stateroot, stateroot_removal_order, stateroots_for_removal, Deployment};

/// Where stateroots live
#[derive(Clone, Debug)]
pub struct StaterootPaths {
    /// Host root filesystem as mounted into this process (e.g. `/host`)
    pub host_root: PathBuf,
    /// Stateroot parent directory as seen on the host (e.g. `/ostree/deploy`)
    pub deploy_root: PathBuf,
}

impl Default for StaterootPaths {
    fn default() -> Self {
        Self {
            host_root: PathBuf::from(lca_common::HOST_ROOT),
            deploy_root: PathBuf::from(lca_common::OSTREE_DEPLOY_ROOT),
        }
    }
}

impl StaterootPaths {
    /// Translate a host path into a path readable from this process
    pub fn outside_chroot(&self, host_path: impl AsRef<Path>) -> PathBuf {
        let host_path = host_path.as_ref();
        self.host_root
            .join(host_path.strip_prefix("/").unwrap_or(host_path))
    }

    /// Host path of a stateroot, `/ostree/deploy/<osname>`
    pub fn stateroot(&self, osname: &str) -> PathBuf {
        self.deploy_root.join(osname)
    }

    /// Host path of a deployment checkout, `/ostree/deploy/<osname>/deploy/<deployment>`
    pub fn deployment_dir(&self, osname: &str, deployment: &str) -> PathBuf {
        self.stateroot(osname).join("deploy").join(deployment)
    }

    /// Host path of a deployment origin file
    pub fn deployment_origin(&self, osname: &str, deployment: &str) -> PathBuf {
        self.stateroot(osname)
            .join("deploy")
            .join(format!("{deployment}.origin"))
    }
}

/// Enumerates deployments and removes unbooted stateroots
pub struct StaterootManager {
    pub(crate) query: Arc<dyn DeploymentQuery>,
    pub(crate) ostree: Arc<dyn OstreeClient>,
    pub(crate) ops: Arc<dyn HostOps>,
    pub(crate) paths: StaterootPaths,
}

impl StaterootManager {
    /// Create a manager over the given host seams
    pub fn new(
        query: Arc<dyn DeploymentQuery>,
        ostree: Arc<dyn OstreeClient>,
        ops: Arc<dyn HostOps>,
        paths: StaterootPaths,
    ) -> Self {
        Self {
            query,
            ostree,
            ops,
            paths,
        }
    }

    /// Path configuration
    pub fn paths(&self) -> &StaterootPaths {
        &self.paths
    }

    /// The ostree seam, for callers that change the default deployment
    pub fn ostree(&self) -> &Arc<dyn OstreeClient> {
        &self.ostree
    }

    /// The privileged host command seam
    pub fn ops(&self) -> &Arc<dyn HostOps> {
        &self.ops
    }

    /// Deployments in on-disk order
    pub async fn query_deployments(&self) -> Result<Vec<Deployment>> {
        self.query.query_status().await
    }

    /// Remove every stateroot except the booted one.
    ///
    /// Stateroots with deployment records are removed through
    /// [`remove_stateroot`](Self::remove_stateroot). Directories under the
    /// deploy root without any record, left behind by a failed deploy, are
    /// deleted directly. All removals are attempted before the failure count
    /// is reported.
    #[instrument(skip(self))]
    pub async fn undeploy_unbooted(&self) -> Result<()> {
        let deployments = self.query_deployments().await?;
        let booted = booted_stateroot(&deployments)?.to_string();
        let targets = stateroots_for_removal(&deployments)?;

        let mut failures = 0usize;
        for stateroot in &targets {
            if let Err(e) = self.remove_stateroot(stateroot).await {
                error!(stateroot = %stateroot, error = %e, "Failed to remove stateroot");
                failures += 1;
            }
        }

        let scan_dir = self.paths.outside_chroot(&self.paths.deploy_root);
        let mut entries = tokio::fs::read_dir(&scan_dir)
            .await
            .map_err(|e| Error::io(&scan_dir, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::io(&scan_dir, e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            if !is_dir || name == booted || deployments.iter().any(|d| d.osname == name) {
                continue;
            }

            info!(stateroot = %name, "Removing stateroot directory without deployments");
            if let Err(e) = tokio::fs::remove_dir_all(entry.path()).await {
                error!(stateroot = %name, error = %e, "Failed to remove undeployed stateroot");
                failures += 1;
            }
        }

        if failures == 0 {
            Ok(())
        } else {
            Err(Error::StaterootCleanup { failed: failures })
        }
    }

    /// Undeploy all deployments of `name` and delete its directory.
    ///
    /// Fails with `BootedConflict` without touching anything if one of the
    /// deployments is booted.
    #[instrument(skip(self))]
    pub async fn remove_stateroot(&self, name: &str) -> Result<()> {
        let deployments = self.query_deployments().await?;
        let order = stateroot_removal_order(&deployments, name)?;

        for index in order {
            info!(stateroot = %name, index, "Undeploying");
            self.ostree.undeploy(index).await.map_err(|e| {
                Error::internal_with_context(
                    "stateroot",
                    format!("failed to undeploy {name} with index {index}: {e}"),
                )
            })?;
        }

        let host_path = self.paths.stateroot(name);
        let local_path = self.paths.outside_chroot(&host_path);
        match tokio::fs::try_exists(&local_path).await {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(e) => {
                warn!(path = %local_path.display(), error = %e, "Cannot stat stateroot, assuming removed");
                return Ok(());
            }
        }

        self.ops
            .remount_and_remove(&host_path.to_string_lossy())
            .await
            .map_err(|e| {
                Error::internal_with_context(
                    "stateroot",
                    format!("removing stateroot {name} failed: {e}"),
                )
            })
    }
}
