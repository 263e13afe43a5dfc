//! Building a new stateroot from a seed image
//!
//! The seed image carries an ostree repository, the seed's `/var` and
//! `/etc` as archives, the seed's rpm-ostree status and machine config,
//! and the list of container images the seed cluster used.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{info, instrument, warn};

use lca_common::seedinfo::SeedClusterInfo;
use lca_common::{stateroot_name, Error, Result, SEED_MANIFEST_FILE_NAME};

use crate::deployment::{booted_deployment_id, deployment_from_deployment_id, deployment_id_for};
use crate::stateroot::StaterootManager;

/// Inputs for [`StaterootManager::setup_stateroot`]
#[derive(Clone, Debug)]
pub struct SeedStaterootRequest {
    /// Seed image reference, already pulled
    pub seed_image: String,
    /// Release version the caller expects the seed to carry
    pub expected_version: String,
    /// Host path the seed's container list is copied to
    pub image_list_file: PathBuf,
    /// Host path the seed's `manifest.json` is kept at, if wanted
    pub seed_info_file: Option<PathBuf>,
    /// Install flow: the target disk is mounted and rpm-ostree cannot see it
    pub ibi: bool,
}

#[derive(Deserialize, Default)]
struct MachineConfig {
    #[serde(default)]
    spec: MachineConfigSpec,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct MachineConfigSpec {
    #[serde(default)]
    kernel_arguments: Vec<String>,
}

/// `ostree admin deploy` arguments for the kernel arguments in a MachineConfig.
///
/// Each argument is JSON-quoted so embedded quotes survive the reboot.
pub fn kernel_args_from_machine_config(json: &[u8]) -> Result<Vec<String>> {
    let mc: MachineConfig = serde_json::from_slice(json)
        .map_err(|e| Error::serialization_for_kind("MachineConfig", e.to_string()))?;

    let mut args = Vec::with_capacity(mc.spec.kernel_arguments.len() * 2);
    for karg in &mc.spec.kernel_arguments {
        args.push("--karg-append".to_string());
        args.push(serde_json::to_string(karg)?);
    }
    Ok(args)
}

/// Replace the registry host of `image` when it equals `from`
pub fn replace_image_registry(image: &str, from: &str, to: &str) -> String {
    match image.split_once('/') {
        Some((registry, rest)) if registry == from => format!("{to}/{rest}"),
        _ => image.to_string(),
    }
}

/// Registry rewrite for a seed's images, `(seed, cluster)`.
///
/// Only when both registries are known and differ.
pub fn registry_override<'a>(
    seed_registry: &'a str,
    cluster_registry: &'a str,
) -> Option<(&'a str, &'a str)> {
    (!seed_registry.is_empty() && !cluster_registry.is_empty() && seed_registry != cluster_registry)
        .then_some((seed_registry, cluster_registry))
}

/// Parse a precaching list, one image per line.
///
/// With `registry_override = Some((seed, cluster))` images from the seed's
/// registry are rewritten to the cluster's.
pub fn parse_precaching_list(content: &str, registry_override: Option<(&str, &str)>) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|image| match registry_override {
            Some((seed, cluster)) => replace_image_registry(image, seed, cluster),
            None => image.to_string(),
        })
        .collect()
}

/// Read a precaching list file
pub async fn read_precaching_list(
    path: &Path,
    registry_override: Option<(&str, &str)>,
) -> Result<Vec<String>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::io(path, e))?;
    Ok(parse_precaching_list(&content, registry_override))
}

async fn read_file(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path).await.map_err(|e| Error::io(path, e))
}

async fn copy_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::io(parent, e))?;
    }
    tokio::fs::copy(from, to)
        .await
        .map(drop)
        .map_err(|e| Error::io(from, e))
}

fn host_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

impl StaterootManager {
    /// Create and populate the stateroot for `request.expected_version`.
    ///
    /// The seed image is unmounted and removed afterwards whatever the
    /// outcome, and the temporary extraction directory is always deleted.
    #[instrument(skip(self), fields(seed = %request.seed_image, version = %request.expected_version))]
    pub async fn setup_stateroot(&self, request: &SeedStaterootRequest) -> Result<String> {
        info!("Setting up stateroot from seed image");

        let tmp_parent = self.paths.outside_chroot("/var/tmp");
        tokio::fs::create_dir_all(&tmp_parent)
            .await
            .map_err(|e| Error::io(&tmp_parent, e))?;
        let workspace = tempfile::Builder::new()
            .prefix("lca-seed-")
            .tempdir_in(&tmp_parent)
            .map_err(|e| Error::io(&tmp_parent, e))?;

        let result = self.populate_stateroot(request, workspace.path()).await;

        if let Err(e) = self.ops.unmount_and_remove_image(&request.seed_image).await {
            warn!(error = %e, "Failed to unmount seed image");
        }
        if let Err(e) = workspace.close() {
            warn!(error = %e, "Failed to remove seed workspace");
        }
        result
    }

    async fn populate_stateroot(
        &self,
        request: &SeedStaterootRequest,
        workspace_local: &Path,
    ) -> Result<String> {
        let relative = workspace_local
            .strip_prefix(&self.paths.host_root)
            .map_err(|_| {
                Error::internal_with_context("setup", "workspace is outside the host root")
            })?;
        let workspace = Path::new("/").join(relative);

        if !request.ibi {
            self.ops.remount_sysroot().await?;
        }

        let mountpoint = PathBuf::from(self.ops.mount_image(&request.seed_image).await?);
        let seed = |name: &str| self.paths.outside_chroot(mountpoint.join(name));

        let repo = workspace.join("ostree");
        let repo_local = self.paths.outside_chroot(&repo);
        tokio::fs::create_dir(&repo_local)
            .await
            .map_err(|e| Error::io(&repo_local, e))?;
        self.ops
            .extract_tar_with_selinux(&host_str(&mountpoint.join("ostree.tgz")), &host_str(&repo))
            .await?;

        // rhcos-<ref>.<serial> -> <ref>.<serial> -> <ref>
        let seed_booted_id = booted_deployment_id(&read_file(&seed("rpm-ostree.json")).await?)?;
        let seed_booted_deployment = deployment_from_deployment_id(&seed_booted_id)?;
        let seed_booted_ref = seed_booted_deployment
            .split('.')
            .next()
            .unwrap_or(&seed_booted_deployment)
            .to_string();

        let info = SeedClusterInfo::from_json(&read_file(&seed(SEED_MANIFEST_FILE_NAME)).await?)?;
        if info.version != request.expected_version {
            return Err(Error::VersionMismatch {
                seed: info.version,
                requested: request.expected_version.clone(),
            });
        }
        if let Some(target) = &request.seed_info_file {
            copy_file(&seed(SEED_MANIFEST_FILE_NAME), &self.paths.outside_chroot(target)).await?;
        }

        let osname = stateroot_name(&request.expected_version);

        self.ostree.pull_local(&host_str(&repo)).await?;
        self.ostree.os_init(&osname).await?;

        let kargs =
            kernel_args_from_machine_config(&read_file(&seed("mco-currentconfig.json")).await?)?;
        self.ostree.deploy(&osname, &seed_booted_ref, &kargs).await?;

        let deployment = if request.ibi {
            self.ostree.deployment_for(&osname).await?
        } else {
            let deployments = self.query.query_status().await?;
            deployment_from_deployment_id(&deployment_id_for(&deployments, &osname)?)?
        };
        info!(stateroot = %osname, deployment = %deployment, "Seed deployed");

        copy_file(
            &seed(&format!("ostree-{seed_booted_deployment}.origin")),
            &self
                .paths
                .outside_chroot(self.paths.deployment_origin(&osname, &deployment)),
        )
        .await?;

        self.ops
            .extract_tar_with_selinux(
                &host_str(&mountpoint.join("var.tgz")),
                &host_str(&self.paths.stateroot(&osname)),
            )
            .await?;
        let deployment_dir = self.paths.deployment_dir(&osname, &deployment);
        self.ops
            .extract_tar_with_selinux(
                &host_str(&mountpoint.join("etc.tgz")),
                &host_str(&deployment_dir),
            )
            .await?;

        self.remove_etc_deletions(&seed("etc.deletions"), &deployment_dir)
            .await?;

        copy_file(
            &seed("containers.list"),
            &self.paths.outside_chroot(&request.image_list_file),
        )
        .await?;

        Ok(osname)
    }

    /// Delete the files the seed removed from `/etc`, relative to the new deployment
    async fn remove_etc_deletions(&self, list: &Path, deployment_dir: &Path) -> Result<()> {
        let content = tokio::fs::read_to_string(list)
            .await
            .map_err(|e| Error::io(list, e))?;
        for entry in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let target = self
                .paths
                .outside_chroot(deployment_dir.join(entry.trim_start_matches('/')));
            tokio::fs::remove_file(&target)
                .await
                .map_err(|e| Error::io(&target, e))?;
        }
        Ok(())
    }
}
