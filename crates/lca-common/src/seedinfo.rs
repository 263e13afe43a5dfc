//! Seed cluster information stored in every seed image
//!
//! Written by `lca-cli create` as `manifest.json` next to the backups and
//! read back when a stateroot is built from the seed.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Facts about the cluster a seed image was taken from
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct SeedClusterInfo {
    /// Release version of the seed cluster
    #[serde(rename = "seed_cluster_ocp_version")]
    pub version: String,

    /// Base domain of the seed cluster
    #[serde(default)]
    pub base_domain: String,

    /// Cluster name of the seed cluster
    #[serde(default)]
    pub cluster_name: String,

    /// Cluster ID of the seed cluster
    #[serde(default)]
    pub cluster_id: String,

    /// IP address of the seed node
    #[serde(default)]
    pub node_ip: String,

    /// Registry hosting the release image
    #[serde(default)]
    pub release_registry: String,

    /// Hostname of the seed node
    #[serde(rename = "sno_hostname", default)]
    pub hostname: String,

    /// Recert image used when the seed was created
    #[serde(rename = "recert_image_pull_spec", default)]
    pub recert_image: String,
}

impl SeedClusterInfo {
    /// Parse a `manifest.json` document
    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| Error::serialization_for_kind("SeedClusterInfo", e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_manifest() {
        let info = SeedClusterInfo::from_json(
            br#"{"seed_cluster_ocp_version":"4.16.0","sno_hostname":"seed","cluster_name":"s"}"#,
        )
        .expect("parse");
        assert_eq!(info.version, "4.16.0");
        assert_eq!(info.hostname, "seed");
        assert!(info.release_registry.is_empty());
    }

    #[test]
    fn test_version_is_required() {
        assert!(SeedClusterInfo::from_json(br#"{"cluster_name":"s"}"#).is_err());
    }
}
