//! Force-expiring the seed's crypto with recert
//!
//! recert rewrites certificates in etcd and on disk, so it needs an etcd
//! serving the node's data directory while kubelet and crio are down. A
//! throwaway etcd container is started from the image the static pod uses,
//! recert runs against it, and the container is killed afterwards.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{info, instrument, warn};

use lca_common::retry::{retry_with_backoff, RetryConfig};
use lca_common::{Error, Result};
use lca_ostree::{HostOps, StaterootPaths};

/// Static pod manifest carrying the etcd image
pub const ETCD_STATIC_POD_FILE: &str = "/etc/kubernetes/manifests/etcd-pod.yaml";
/// recert configuration written on the host
pub const RECERT_CONFIG_FILE: &str = "/var/tmp/recert-config.json";
/// Summary recert writes, without private keys
pub const RECERT_SUMMARY_FILE: &str = "/var/tmp/recert-seed-clean-summary.yaml";

const ETCD_CONTAINER: &str = "recert_etcd";
const RECERT_CONTAINER: &str = "recert";

/// Image of the `etcd` container in the etcd static pod manifest
pub fn etcd_image(manifest: &str) -> Result<String> {
    let pod: serde_yaml::Value = serde_yaml::from_str(manifest)
        .map_err(|e| Error::serialization_for_kind("etcd static pod", e.to_string()))?;
    pod["spec"]["containers"]
        .as_sequence()
        .into_iter()
        .flatten()
        .find(|c| c["name"].as_str() == Some("etcd"))
        .and_then(|c| c["image"].as_str())
        .map(str::to_string)
        .ok_or_else(|| Error::validation_for("etcd static pod", "no etcd container image"))
}

/// recert settings for a seed: expire everything, keep nothing cluster specific
pub fn seed_recert_config() -> serde_json::Value {
    json!({
        "dry_run": false,
        "etcd_endpoint": "localhost:2379",
        "static_dirs": ["/kubernetes", "/kubelet", "/machine-config-daemon"],
        "static_files": ["/host-etc/mcs-machine-config-content.json"],
        "summary_file_clean": RECERT_SUMMARY_FILE,
        "force_expire": true,
    })
}

fn etcd_args(image: &str, auth_file: &str) -> Vec<String> {
    [
        "run", "--name", ETCD_CONTAINER, "--detach", "--rm", "--network=host", "--privileged",
        "--replace", "--authfile", auth_file, "--entrypoint", "etcd",
        "-v", "/var/lib/etcd:/store", image, "--name", "editor", "--data-dir", "/store",
    ]
    .iter()
    .map(|a| a.to_string())
    .collect()
}

/// `podman run` arguments for recert
pub fn recert_args(image: &str, auth_file: &str) -> Vec<String> {
    let config_env = format!("RECERT_CONFIG={RECERT_CONFIG_FILE}");
    [
        "run", "--rm", "--name", RECERT_CONTAINER, "--network=host", "--privileged",
        "--replace", "--authfile", auth_file,
        "-v", "/etc:/host-etc",
        "-v", "/etc/kubernetes:/kubernetes",
        "-v", "/var/lib/kubelet:/kubelet",
        "-v", "/etc/machine-config-daemon:/machine-config-daemon",
        "-v", "/var/tmp:/var/tmp",
        "-e", config_env.as_str(),
        image,
    ]
    .iter()
    .map(|a| a.to_string())
    .collect()
}

/// Runs recert against the host's etcd data
pub struct Recert {
    ops: Arc<dyn HostOps>,
    paths: StaterootPaths,
    etcd_ready: RetryConfig,
}

impl Recert {
    /// Create a runner; `paths` translates host paths for local file access
    pub fn new(ops: Arc<dyn HostOps>, paths: StaterootPaths) -> Self {
        Self {
            ops,
            paths,
            etcd_ready: RetryConfig::fixed(30, Duration::from_secs(2)),
        }
    }

    /// Expire all certificates of the node's cluster
    #[instrument(skip(self))]
    pub async fn force_expire(&self, recert_image: &str, auth_file: &str) -> Result<()> {
        let manifest_path = self.paths.outside_chroot(ETCD_STATIC_POD_FILE);
        let manifest = tokio::fs::read_to_string(&manifest_path)
            .await
            .map_err(|e| Error::io(&manifest_path, e))?;
        let etcd = etcd_image(&manifest)?;

        let config_path = self.paths.outside_chroot(RECERT_CONFIG_FILE);
        write_json(&config_path, &seed_recert_config()).await?;

        info!(image = %etcd, "Starting etcd for recert");
        self.ops
            .run_in_host_namespace("podman", &etcd_args(&etcd, auth_file))
            .await?;

        let result = self.run_against_etcd(recert_image, auth_file).await;

        if let Err(e) = self
            .ops
            .run_in_host_namespace("podman", &["kill".to_string(), ETCD_CONTAINER.to_string()])
            .await
        {
            warn!(error = %e, "Failed to stop recert etcd");
        }
        result
    }

    async fn run_against_etcd(&self, recert_image: &str, auth_file: &str) -> Result<()> {
        let health = ["exec", ETCD_CONTAINER, "etcdctl", "endpoint", "health"].map(String::from);
        retry_with_backoff(&self.etcd_ready, "recert etcd health", || {
            self.ops.run_in_host_namespace("podman", &health)
        })
        .await?;

        info!(image = %recert_image, "Running recert");
        self.ops
            .run_in_host_namespace("podman", &recert_args(recert_image, auth_file))
            .await
            .map(drop)
    }
}

async fn write_json(path: &Path, value: &serde_json::Value) -> Result<()> {
    let data = serde_json::to_vec_pretty(value)?;
    tokio::fs::write(path, data)
        .await
        .map_err(|e| Error::io(path, e))
}
