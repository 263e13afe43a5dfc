//! Host tool seams
//!
//! Everything that touches the host goes through these traits so the
//! stateroot logic can be exercised without an ostree system.

use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use lca_common::{Error, Result};

use crate::deployment::{parse_status, Deployment};

/// Lists deployments on the host
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DeploymentQuery: Send + Sync {
    /// Deployments in on-disk order
    async fn query_status(&self) -> Result<Vec<Deployment>>;
}

/// ostree admin operations
#[cfg_attr(test, automock)]
#[async_trait]
pub trait OstreeClient: Send + Sync {
    /// Remove the deployment at `index`
    async fn undeploy(&self, index: usize) -> Result<()>;
    /// Import all refs from a local repository
    async fn pull_local(&self, repo: &str) -> Result<()>;
    /// Create a new stateroot
    async fn os_init(&self, osname: &str) -> Result<()>;
    /// Deploy `refsha` into `osname` with extra kernel arguments
    async fn deploy(&self, osname: &str, refsha: &str, kargs: &[String]) -> Result<()>;
    /// Deployment (`<checksum>.<serial>`) of `osname`, read from ostree itself
    async fn deployment_for(&self, osname: &str) -> Result<String>;
    /// Make the deployment at `index` the default boot entry
    async fn set_default(&self, index: usize) -> Result<()>;
}

/// Privileged operations in the host mount namespace
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HostOps: Send + Sync {
    /// Run `program` on the host, returning trimmed stdout
    async fn run_in_host_namespace(&self, program: &str, args: &[String]) -> Result<String>;
    /// Run a shell snippet on the host, returning trimmed stdout
    async fn run_bash_in_host_namespace(&self, script: &str) -> Result<String>;
    /// Remount /sysroot read-write in a private mount namespace and delete `path`
    async fn remount_and_remove(&self, path: &str) -> Result<()>;
    /// Remount /sysroot read-write
    async fn remount_sysroot(&self) -> Result<()>;
    /// Mount an image and return the host mountpoint
    async fn mount_image(&self, image: &str) -> Result<String>;
    /// Unmount an image and remove it from local storage
    async fn unmount_and_remove_image(&self, image: &str) -> Result<()>;
    /// Extract a gzipped tarball keeping SELinux labels
    async fn extract_tar_with_selinux(&self, archive: &str, dest: &str) -> Result<()>;
}

pub(crate) fn to_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

/// Deployment listing through `rpm-ostree status --json`
pub struct RpmOstreeCli {
    ops: Arc<dyn HostOps>,
}

impl RpmOstreeCli {
    /// Create a client running rpm-ostree through `ops`
    pub fn new(ops: Arc<dyn HostOps>) -> Self {
        Self { ops }
    }
}

#[async_trait]
impl DeploymentQuery for RpmOstreeCli {
    async fn query_status(&self) -> Result<Vec<Deployment>> {
        let output = self
            .ops
            .run_in_host_namespace("rpm-ostree", &to_args(&["status", "--json"]))
            .await
            .map_err(|e| Error::query(e.to_string()))?;
        parse_status(output.as_bytes()).map_err(|e| Error::query(e.to_string()))
    }
}

/// ostree admin through the `ostree` binary
pub struct OstreeCli {
    ops: Arc<dyn HostOps>,
    sysroot: Option<String>,
}

impl OstreeCli {
    /// Operate on the running system
    pub fn new(ops: Arc<dyn HostOps>) -> Self {
        Self { ops, sysroot: None }
    }

    /// Operate on a sysroot mounted at `sysroot`, as during install
    pub fn with_sysroot(ops: Arc<dyn HostOps>, sysroot: impl Into<String>) -> Self {
        Self {
            ops,
            sysroot: Some(sysroot.into()),
        }
    }

    async fn admin(&self, args: &[&str]) -> Result<String> {
        let mut full = vec!["admin".to_string()];
        full.extend(to_args(args));
        if let Some(sysroot) = &self.sysroot {
            full.push("--sysroot".to_string());
            full.push(sysroot.clone());
        }
        debug!(args = ?full, "Running ostree admin");
        self.ops.run_in_host_namespace("ostree", &full).await
    }

    fn repo(&self) -> String {
        match &self.sysroot {
            Some(sysroot) => format!("{}/ostree/repo", sysroot.trim_end_matches('/')),
            None => "/ostree/repo".to_string(),
        }
    }
}

/// Find the deployment of `osname` in `ostree admin status` output.
///
/// Lines look like `* rhcos 1a2b3c.0` with the marker only on the booted
/// entry.
pub fn parse_admin_status(output: &str, osname: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let mut fields = line.trim_start_matches(['*', ' ']).split_whitespace();
        match (fields.next(), fields.next()) {
            (Some(name), Some(deployment)) if name == osname => Some(deployment.to_string()),
            _ => None,
        }
    })
}

#[async_trait]
impl OstreeClient for OstreeCli {
    async fn undeploy(&self, index: usize) -> Result<()> {
        let index = index.to_string();
        self.admin(&["undeploy", index.as_str()]).await.map(drop)
    }

    async fn pull_local(&self, repo: &str) -> Result<()> {
        let target = self.repo();
        self.ops
            .run_in_host_namespace(
                "ostree",
                &to_args(&["pull-local", "--repo", target.as_str(), repo]),
            )
            .await
            .map(drop)
    }

    async fn os_init(&self, osname: &str) -> Result<()> {
        self.admin(&["os-init", osname]).await.map(drop)
    }

    async fn deploy(&self, osname: &str, refsha: &str, kargs: &[String]) -> Result<()> {
        let mut args = vec!["deploy", "--os", osname, "--no-prune"];
        if self.sysroot.is_none() {
            args.push("--retain");
        }
        args.extend(kargs.iter().map(String::as_str));
        args.push(refsha);
        self.admin(&args).await.map(drop)
    }

    async fn deployment_for(&self, osname: &str) -> Result<String> {
        let output = self.admin(&["status"]).await?;
        parse_admin_status(&output, osname)
            .ok_or_else(|| Error::query(format!("no deployment found for stateroot {osname}")))
    }

    async fn set_default(&self, index: usize) -> Result<()> {
        let index = index.to_string();
        self.admin(&["set-default", index.as_str()]).await.map(drop)
    }
}
