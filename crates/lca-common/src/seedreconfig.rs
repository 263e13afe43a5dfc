//! Seed reconfiguration document
//!
//! Describes the identity and crypto material a node booted from a seed
//! image must take on. During an upgrade it is gathered from the running
//! cluster and written into the new stateroot. The install operator writes
//! the same document into its configuration ISO, so key names are part of
//! a contract with another program and must not change. Breaking changes
//! bump [`SEED_RECONFIGURATION_VERSION`].

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Current version of the document format
pub const SEED_RECONFIGURATION_VERSION: u32 = 1;

/// PEM-encoded key or certificate
pub type Pem = String;

/// Target cluster identity applied to a node booted from a seed image
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct SeedReconfiguration {
    /// Format version, checked before anything else is read
    pub api_version: u32,

    /// Base domain of the cluster
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub base_domain: String,

    /// Cluster name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_name: String,

    /// Cluster ID; empty means a new one is generated
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_id: String,

    /// IP address of the node
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_ip: String,

    /// Registry hosting the release image
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub release_registry: String,

    /// Hostname of the node
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,

    /// Crypto material that keeps existing kubeconfigs valid after recert
    #[serde(rename = "KubeconfigCryptoRetention", default)]
    pub kubeconfig_crypto_retention: KubeConfigCryptoRetention,

    /// Public SSH key for node access
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ssh_key: String,

    /// Registry pull secret
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pull_secret: String,
}

/// Crypto retained across recert
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct KubeConfigCryptoRetention {
    /// API server crypto
    #[serde(rename = "KubeAPICrypto", default)]
    pub kube_api_crypto: KubeApiCrypto,

    /// Ingress crypto. The key spelling is fixed by existing consumers.
    #[serde(rename = "IngresssCrypto", default)]
    pub ingress_crypto: IngressCrypto,
}

/// API server serving and client-auth crypto
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct KubeApiCrypto {
    /// Serving signer keys
    #[serde(rename = "ServingCrypto", default)]
    pub serving_crypto: ServingCrypto,

    /// Client auth CA
    #[serde(rename = "ClientAuthCrypto", default)]
    pub client_auth_crypto: ClientAuthCrypto,
}

/// Serving signer private keys
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ServingCrypto {
    /// localhost-serving-signer key
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub localhost_signer_private_key: Pem,

    /// service-network-serving-signer key
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_network_signer_private_key: Pem,

    /// loadbalancer-serving-signer key
    #[serde(
        rename = "loadbalancer_external_signer_private_key",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub loadbalancer_signer_private_key: Pem,
}

/// Client auth crypto
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ClientAuthCrypto {
    /// Admin kubeconfig client CA
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub admin_ca_certificate: Pem,
}

/// Ingress crypto
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct IngressCrypto {
    /// Ingress CA certificate
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ingress_ca: Pem,
}

#[derive(Deserialize)]
struct VersionProbe {
    api_version: Option<u32>,
}

impl SeedReconfiguration {
    /// Empty document at the current version
    pub fn new() -> Self {
        Self {
            api_version: SEED_RECONFIGURATION_VERSION,
            ..Default::default()
        }
    }

    /// Parse a document, rejecting missing or newer versions before reading
    /// the remaining fields.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let probe: VersionProbe = serde_json::from_slice(data)
            .map_err(|e| Error::serialization_for_kind("SeedReconfiguration", e.to_string()))?;
        let found = probe.api_version.ok_or_else(|| {
            Error::serialization_for_kind("SeedReconfiguration", "missing api_version")
        })?;
        if found > SEED_RECONFIGURATION_VERSION {
            return Err(Error::UnsupportedApiVersion {
                found,
                supported: SEED_RECONFIGURATION_VERSION,
            });
        }

        serde_json::from_slice(data)
            .map_err(|e| Error::serialization_for_kind("SeedReconfiguration", e.to_string()))
    }

    /// Serialize to pretty-printed JSON
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| Error::serialization_for_kind("SeedReconfiguration", e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_key_names_are_preserved() {
        let mut config = SeedReconfiguration::new();
        config.cluster_name = "sno".to_string();
        config
            .kubeconfig_crypto_retention
            .kube_api_crypto
            .serving_crypto
            .loadbalancer_signer_private_key = "lb-key".to_string();
        config
            .kubeconfig_crypto_retention
            .kube_api_crypto
            .client_auth_crypto
            .admin_ca_certificate = "admin-ca".to_string();
        config.kubeconfig_crypto_retention.ingress_crypto.ingress_ca = "ingress".to_string();

        let json: serde_json::Value =
            serde_json::from_slice(&config.to_json().expect("serialize")).expect("parse");

        assert_eq!(json["api_version"], 1);
        assert_eq!(json["cluster_name"], "sno");
        let retention = &json["KubeconfigCryptoRetention"];
        assert_eq!(
            retention["KubeAPICrypto"]["ServingCrypto"]["loadbalancer_external_signer_private_key"],
            "lb-key"
        );
        assert_eq!(
            retention["KubeAPICrypto"]["ClientAuthCrypto"]["admin_ca_certificate"],
            "admin-ca"
        );
        assert_eq!(retention["IngresssCrypto"]["ingress_ca"], "ingress");
    }

    #[test]
    fn test_empty_scalars_are_omitted() {
        let json: serde_json::Value =
            serde_json::from_slice(&SeedReconfiguration::new().to_json().expect("serialize"))
                .expect("parse");
        let obj = json.as_object().expect("object");
        assert!(!obj.contains_key("base_domain"));
        assert!(!obj.contains_key("pull_secret"));
        assert!(obj.contains_key("KubeconfigCryptoRetention"));
    }

    #[test]
    fn test_parses_current_version() {
        let doc = br#"{"api_version":1,"hostname":"node-0","node_ip":"192.0.2.10"}"#;
        let config = SeedReconfiguration::from_json(doc).expect("parse");
        assert_eq!(config.hostname, "node-0");
        assert_eq!(config.node_ip, "192.0.2.10");
    }

    #[test]
    fn test_rejects_newer_version_before_reading_fields() {
        // hostname has the wrong type, but the version check comes first
        let doc = br#"{"api_version":2,"hostname":42}"#;
        match SeedReconfiguration::from_json(doc) {
            Err(Error::UnsupportedApiVersion { found, supported }) => {
                assert_eq!(found, 2);
                assert_eq!(supported, 1);
            }
            other => panic!("expected UnsupportedApiVersion, got {other:?}"),
        }
    }

    #[test]
    fn test_rejects_missing_version() {
        let result = SeedReconfiguration::from_json(br#"{"hostname":"node-0"}"#);
        assert!(matches!(result, Err(Error::Serialization { .. })));
    }
}
