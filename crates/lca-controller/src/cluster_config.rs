//! Export of the running cluster's identity into the new stateroot
//!
//! The node booted into the new stateroot has the seed cluster's identity.
//! Before rebooting, the identity and crypto of the running cluster are
//! written into the new stateroot's `/var` as a [`SeedReconfiguration`],
//! together with the host's network configuration files, so that the first
//! boot can take them over.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Secret};
use kube::api::{Api, DynamicObject, GroupVersionKind, ListParams};
use kube::discovery::ApiResource;
use kube::{Client, ResourceExt};
use tracing::{debug, info, instrument};

#[cfg(test)]
use mockall::automock;

use lca_common::seedreconfig::SeedReconfiguration;
use lca_common::{Error, Result};
use lca_ostree::StaterootPaths;

/// Directory under `/var/opt/openshift` holding the reconfiguration document
pub const CLUSTER_CONFIG_DIR: &str = "cluster-configuration";
/// Directory under `/var/opt/openshift` holding copied network files
pub const NETWORK_CONFIG_DIR: &str = "network-configuration";
/// File name of the reconfiguration document
pub const SEED_RECONFIGURATION_FILE_NAME: &str = "manifest.json";

/// Host paths copied into the new stateroot
pub const DEFAULT_NETWORK_PATHS: &[&str] = &[
    "/etc/hostname",
    "/etc/NetworkManager/system-connections",
    "/var/lib/ovnk/iface_default_hint",
];

const KUBE_APISERVER_OPERATOR_NAMESPACE: &str = "openshift-kube-apiserver-operator";
const INGRESS_OPERATOR_NAMESPACE: &str = "openshift-ingress-operator";
const CONFIG_NAMESPACE: &str = "openshift-config";

/// Writes the cluster configuration into a stateroot
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterConfigExporter: Send + Sync {
    /// Export into the stateroot named `stateroot`
    async fn export(&self, stateroot: &str) -> Result<()>;

    /// Registry host of the running cluster's release image
    async fn release_registry(&self) -> Result<String>;
}

/// `https://api.<cluster>.<base_domain>:6443` -> `<cluster>`
pub fn cluster_name_from_api_url(url: &str, base_domain: &str) -> Option<String> {
    let host = url.split("://").nth(1).unwrap_or(url);
    let host = host.split([':', '/']).next()?;
    let name = host
        .strip_prefix("api.")?
        .strip_suffix(base_domain)?
        .strip_suffix('.')?;
    (!name.is_empty()).then(|| name.to_string())
}

/// Registry host of an image reference, `quay.io/openshift/release@sha256:..` -> `quay.io`
pub fn registry_of(image: &str) -> String {
    image.split('/').next().unwrap_or_default().to_string()
}

/// Host path of `/var/opt/openshift` inside a stateroot
pub fn stateroot_openshift_dir(paths: &StaterootPaths, stateroot: &str) -> PathBuf {
    paths.stateroot(stateroot).join("var/opt/openshift")
}

/// Write `config` as `<dir>/cluster-configuration/manifest.json`
pub async fn write_seed_reconfiguration(dir: &Path, config: &SeedReconfiguration) -> Result<PathBuf> {
    let target_dir = dir.join(CLUSTER_CONFIG_DIR);
    tokio::fs::create_dir_all(&target_dir)
        .await
        .map_err(|e| Error::io(&target_dir, e))?;
    let target = target_dir.join(SEED_RECONFIGURATION_FILE_NAME);
    tokio::fs::write(&target, config.to_json()?)
        .await
        .map_err(|e| Error::io(&target, e))?;
    Ok(target)
}

/// Recursively copy `src` to `dest`, creating parents. Returns files copied.
pub fn copy_tree(src: &Path, dest: &Path) -> Result<usize> {
    let mut copied = 0;
    for entry in walkdir::WalkDir::new(src) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(src).to_path_buf();
            Error::io(path, std::io::Error::other(e.to_string()))
        })?;
        let relative = entry.path().strip_prefix(src).unwrap_or(Path::new(""));
        let target = if relative.as_os_str().is_empty() {
            dest.to_path_buf()
        } else {
            dest.join(relative)
        };

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target).map_err(|e| Error::io(&target, e))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        std::fs::copy(entry.path(), &target).map_err(|e| Error::io(entry.path(), e))?;
        copied += 1;
    }
    Ok(copied)
}

/// Copy each host path in `sources` to `<dest>/<path>`; paths missing on the host are skipped
pub async fn copy_network_config(
    paths: &StaterootPaths,
    sources: &[PathBuf],
    dest: &Path,
) -> Result<usize> {
    let mut copied = 0;
    for source in sources {
        let local = paths.outside_chroot(source);
        if !tokio::fs::try_exists(&local)
            .await
            .map_err(|e| Error::io(&local, e))?
        {
            debug!(path = %source.display(), "Network path not present, skipping");
            continue;
        }
        let target = dest.join(source.strip_prefix("/").unwrap_or(source));
        copied += tokio::task::spawn_blocking(move || copy_tree(&local, &target))
            .await
            .map_err(|e| Error::internal_with_context("cluster-config", e.to_string()))??;
    }
    Ok(copied)
}

/// `v1` resource of a cluster-scoped OpenShift config kind
pub fn config_resource(group: &str, kind: &str) -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(group, "v1", kind))
}

/// String at a JSON pointer of `obj`, empty when absent
pub fn str_at(obj: &DynamicObject, pointer: &str) -> String {
    obj.data
        .pointer(pointer)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

/// [`ClusterConfigExporter`] reading from the cluster API
pub struct KubeClusterConfigExporter {
    client: Client,
    paths: StaterootPaths,
    network_paths: Vec<PathBuf>,
}

impl KubeClusterConfigExporter {
    /// Create an exporter writing below `paths`
    pub fn new(client: Client, paths: StaterootPaths) -> Self {
        Self {
            client,
            paths,
            network_paths: DEFAULT_NETWORK_PATHS.iter().map(PathBuf::from).collect(),
        }
    }

    async fn config_object(&self, kind: &str, name: &str) -> Result<DynamicObject> {
        let api: Api<DynamicObject> =
            Api::all_with(self.client.clone(), &config_resource("config.openshift.io", kind));
        Ok(api.get(name).await?)
    }

    async fn secret_value(&self, namespace: &str, name: &str, key: &str) -> Result<String> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api.get(name).await?;
        secret
            .data
            .as_ref()
            .and_then(|d| d.get(key))
            .map(|v| String::from_utf8_lossy(&v.0).into_owned())
            .ok_or_else(|| {
                Error::validation_for(format!("secret {namespace}/{name}"), format!("missing key {key}"))
            })
    }

    async fn ssh_key(&self) -> Result<String> {
        let api: Api<DynamicObject> = Api::all_with(
            self.client.clone(),
            &config_resource("machineconfiguration.openshift.io", "MachineConfig"),
        );
        Ok(api
            .get_opt("99-master-ssh")
            .await?
            .map(|mc| str_at(&mc, "/spec/config/passwd/users/0/sshAuthorizedKeys/0"))
            .unwrap_or_default())
    }

    async fn node_identity(&self) -> Result<(String, String)> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api.list(&ListParams::default()).await?.items;
        let [node] = nodes.as_slice() else {
            return Err(Error::validation_for(
                "cluster",
                format!("expected exactly one node, found {}", nodes.len()),
            ));
        };
        let ip = node
            .status
            .as_ref()
            .and_then(|s| s.addresses.as_ref())
            .and_then(|a| a.iter().find(|a| a.type_ == "InternalIP"))
            .map(|a| a.address.clone())
            .unwrap_or_default();
        Ok((node.name_any(), ip))
    }

    /// Gather the running cluster's identity and crypto
    pub async fn gather(&self) -> Result<SeedReconfiguration> {
        let mut config = SeedReconfiguration::new();

        let version = self.config_object("ClusterVersion", "version").await?;
        config.cluster_id = str_at(&version, "/spec/clusterID");
        config.release_registry = registry_of(&str_at(&version, "/status/desired/image"));

        let dns = self.config_object("DNS", "cluster").await?;
        config.base_domain = str_at(&dns, "/spec/baseDomain");

        let infra = self.config_object("Infrastructure", "cluster").await?;
        config.cluster_name =
            cluster_name_from_api_url(&str_at(&infra, "/status/apiServerURL"), &config.base_domain)
                .unwrap_or_default();

        (config.hostname, config.node_ip) = self.node_identity().await?;
        config.pull_secret = self
            .secret_value(CONFIG_NAMESPACE, "pull-secret", ".dockerconfigjson")
            .await?;
        config.ssh_key = self.ssh_key().await?;

        let serving = &mut config.kubeconfig_crypto_retention.kube_api_crypto.serving_crypto;
        serving.localhost_signer_private_key = self
            .secret_value(KUBE_APISERVER_OPERATOR_NAMESPACE, "localhost-serving-signer", "tls.key")
            .await?;
        serving.service_network_signer_private_key = self
            .secret_value(
                KUBE_APISERVER_OPERATOR_NAMESPACE,
                "service-network-serving-signer",
                "tls.key",
            )
            .await?;
        serving.loadbalancer_signer_private_key = self
            .secret_value(KUBE_APISERVER_OPERATOR_NAMESPACE, "loadbalancer-serving-signer", "tls.key")
            .await?;

        let cms: Api<ConfigMap> = Api::namespaced(self.client.clone(), CONFIG_NAMESPACE);
        config
            .kubeconfig_crypto_retention
            .kube_api_crypto
            .client_auth_crypto
            .admin_ca_certificate = cms
            .get("admin-kubeconfig-client-ca")
            .await?
            .data
            .and_then(|mut d| d.remove("ca-bundle.crt"))
            .unwrap_or_default();

        config.kubeconfig_crypto_retention.ingress_crypto.ingress_ca = self
            .secret_value(INGRESS_OPERATOR_NAMESPACE, "router-ca", "tls.crt")
            .await?;

        Ok(config)
    }
}

#[async_trait]
impl ClusterConfigExporter for KubeClusterConfigExporter {
    #[instrument(skip(self))]
    async fn export(&self, stateroot: &str) -> Result<()> {
        let config = self.gather().await?;
        let dir = self
            .paths
            .outside_chroot(stateroot_openshift_dir(&self.paths, stateroot));

        let manifest = write_seed_reconfiguration(&dir, &config).await?;
        let copied =
            copy_network_config(&self.paths, &self.network_paths, &dir.join(NETWORK_CONFIG_DIR))
                .await?;
        info!(manifest = %manifest.display(), network_files = copied, "Exported cluster configuration");
        Ok(())
    }

    async fn release_registry(&self) -> Result<String> {
        let version = self.config_object("ClusterVersion", "version").await?;
        Ok(registry_of(&str_at(&version, "/status/desired/image")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_name_comes_from_api_host() {
        assert_eq!(
            cluster_name_from_api_url("https://api.sno1.example.com:6443", "example.com").as_deref(),
            Some("sno1")
        );
        assert_eq!(cluster_name_from_api_url("https://api.example.com:6443", "example.com"), None);
        assert_eq!(cluster_name_from_api_url("https://other.sno1.example.com", "example.com"), None);
    }

    #[test]
    fn registry_is_first_path_component() {
        assert_eq!(registry_of("quay.io/openshift-release-dev/ocp-release@sha256:abc"), "quay.io");
        assert_eq!(registry_of(""), "");
    }

    #[tokio::test]
    async fn reconfiguration_lands_in_cluster_configuration_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = SeedReconfiguration::new();
        config.cluster_name = "sno1".to_string();

        let written = write_seed_reconfiguration(dir.path(), &config)
            .await
            .expect("write");
        assert_eq!(
            written,
            dir.path().join("cluster-configuration").join("manifest.json")
        );
        let read = SeedReconfiguration::from_json(&std::fs::read(written).expect("read"))
            .expect("parse");
        assert_eq!(read, config);
    }

    /// Story: the node's connection profiles and hostname are carried into the
    /// new stateroot; a hint file that does not exist on this host is skipped.
    #[tokio::test]
    async fn story_network_files_copied_under_their_host_paths() {
        let host = tempfile::tempdir().expect("tempdir");
        let paths = StaterootPaths {
            host_root: host.path().to_path_buf(),
            ..Default::default()
        };
        let connections = host.path().join("etc/NetworkManager/system-connections");
        std::fs::create_dir_all(&connections).expect("mkdir");
        std::fs::write(connections.join("eth0.nmconnection"), "[connection]").expect("write");
        std::fs::write(host.path().join("etc/hostname"), "sno1").expect("write");

        let dest = host.path().join("out");
        let sources: Vec<PathBuf> = DEFAULT_NETWORK_PATHS.iter().map(PathBuf::from).collect();
        let copied = copy_network_config(&paths, &sources, &dest)
            .await
            .expect("copy");

        assert_eq!(copied, 2);
        assert_eq!(
            std::fs::read_to_string(dest.join("etc/hostname")).expect("hostname"),
            "sno1"
        );
        assert!(dest
            .join("etc/NetworkManager/system-connections/eth0.nmconnection")
            .exists());
        assert!(!dest.join("var/lib/ovnk/iface_default_hint").exists());
    }

    #[test]
    fn openshift_dir_is_inside_stateroot_var() {
        let paths = StaterootPaths::default();
        assert_eq!(
            stateroot_openshift_dir(&paths, "rhcos_4.16.1"),
            PathBuf::from("/ostree/deploy/rhcos_4.16.1/var/opt/openshift")
        );
    }
}
