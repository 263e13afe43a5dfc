//! Cluster facts and actions needed while turning a node into a seed

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, DeleteParams, DynamicObject, GroupVersionKind, ListParams};
use kube::discovery::ApiResource;
use kube::{Client, ResourceExt};
use tracing::{info, instrument};

#[cfg(test)]
use mockall::automock;

use lca_common::seedinfo::SeedClusterInfo;
use lca_common::seedreconfig::KubeConfigCryptoRetention;
use lca_common::{Error, Result};
use lca_controller::cluster_config::{config_resource, str_at, KubeClusterConfigExporter};
use lca_ostree::StaterootPaths;

const OVN_NAMESPACE: &str = "openshift-ovn-kubernetes";
const OVN_NODE_POD_PREFIX: &str = "ovnkube-node";

/// What seed creation needs from the cluster API
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SeedCluster: Send + Sync {
    /// Identity of the seed cluster, recording `recert_image` as the one used
    async fn cluster_info(&self, recert_image: &str) -> Result<SeedClusterInfo>;
    /// Index images referenced by catalog sources
    async fn catalog_images(&self) -> Result<Vec<String>>;
    /// Signer keys and CA certificates as file name and PEM
    async fn crypto_files(&self) -> Result<Vec<(String, String)>>;
    /// Delete the node object
    async fn delete_node(&self) -> Result<()>;
    /// True while any ovnkube-node pod is left
    async fn ovn_node_running(&self) -> Result<bool>;
}

/// File names used for the preserved crypto in the cert backup directory
pub fn crypto_files(crypto: &KubeConfigCryptoRetention) -> Vec<(String, String)> {
    let serving = &crypto.kube_api_crypto.serving_crypto;
    [
        ("loadbalancer-serving-signer.key", &serving.loadbalancer_signer_private_key),
        ("localhost-serving-signer.key", &serving.localhost_signer_private_key),
        ("service-network-serving-signer.key", &serving.service_network_signer_private_key),
        (
            "admin-kubeconfig-client-ca.crt",
            &crypto.kube_api_crypto.client_auth_crypto.admin_ca_certificate,
        ),
        ("ingress-ca.crt", &crypto.ingress_crypto.ingress_ca),
    ]
    .into_iter()
    .map(|(name, pem)| (name.to_string(), pem.clone()))
    .collect()
}

/// [`SeedCluster`] backed by the cluster API
pub struct KubeSeedCluster {
    client: Client,
    exporter: KubeClusterConfigExporter,
}

impl KubeSeedCluster {
    /// Create from a client
    pub fn new(client: Client) -> Self {
        Self {
            exporter: KubeClusterConfigExporter::new(client.clone(), StaterootPaths::default()),
            client,
        }
    }

    async fn single_node(&self) -> Result<Node> {
        let api: Api<Node> = Api::all(self.client.clone());
        let mut nodes = api.list(&ListParams::default()).await?.items;
        if nodes.len() != 1 {
            return Err(Error::validation_for(
                "cluster",
                format!("seed creation needs a single node cluster, found {} nodes", nodes.len()),
            ));
        }
        Ok(nodes.remove(0))
    }
}

#[async_trait]
impl SeedCluster for KubeSeedCluster {
    async fn cluster_info(&self, recert_image: &str) -> Result<SeedClusterInfo> {
        let api: Api<DynamicObject> = Api::all_with(
            self.client.clone(),
            &config_resource("config.openshift.io", "ClusterVersion"),
        );
        let version = str_at(&api.get("version").await?, "/status/desired/version");
        if version.is_empty() {
            return Err(Error::validation_for(
                "ClusterVersion/version",
                "no desired version reported",
            ));
        }

        let config = self.exporter.gather().await?;
        Ok(SeedClusterInfo {
            version,
            base_domain: config.base_domain,
            cluster_name: config.cluster_name,
            cluster_id: config.cluster_id,
            node_ip: config.node_ip,
            release_registry: config.release_registry,
            hostname: config.hostname,
            recert_image: recert_image.to_string(),
        })
    }

    async fn catalog_images(&self) -> Result<Vec<String>> {
        let resource = ApiResource::from_gvk(&GroupVersionKind::gvk(
            "operators.coreos.com",
            "v1alpha1",
            "CatalogSource",
        ));
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &resource);
        let sources = match api.list(&ListParams::default()).await {
            Ok(list) => list.items,
            // OLM is not installed
            Err(kube::Error::Api(e)) if e.code == 404 => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(sources
            .iter()
            .map(|cs| str_at(cs, "/spec/image"))
            .filter(|image| !image.is_empty())
            .collect())
    }

    async fn crypto_files(&self) -> Result<Vec<(String, String)>> {
        let config = self.exporter.gather().await?;
        Ok(crypto_files(&config.kubeconfig_crypto_retention))
    }

    #[instrument(skip(self))]
    async fn delete_node(&self) -> Result<()> {
        let node = self.single_node().await?;
        let name = node.name_any();
        let api: Api<Node> = Api::all(self.client.clone());
        api.delete(&name, &DeleteParams::default()).await?;
        info!(node = %name, "Deleted node");
        Ok(())
    }

    async fn ovn_node_running(&self) -> Result<bool> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), OVN_NAMESPACE);
        let pods = api.list(&ListParams::default()).await?.items;
        Ok(pods
            .iter()
            .any(|p| p.name_any().starts_with(OVN_NODE_POD_PREFIX)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_signer_and_ca_gets_a_file() {
        let mut crypto = KubeConfigCryptoRetention::default();
        crypto.kube_api_crypto.serving_crypto.localhost_signer_private_key = "lh".to_string();
        crypto.ingress_crypto.ingress_ca = "ingress".to_string();

        let files = crypto_files(&crypto);
        assert_eq!(files.len(), 5);
        assert!(files.contains(&("localhost-serving-signer.key".to_string(), "lh".to_string())));
        assert!(files.contains(&("ingress-ca.crt".to_string(), "ingress".to_string())));
    }
}
