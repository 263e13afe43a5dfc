//! Common types for the lifecycle agent: CRDs, errors, checkpoints and utilities

#![deny(missing_docs)]

pub mod checkpoint;
pub mod crd;
pub mod error;
pub mod events;
pub mod retry;
pub mod seedinfo;
pub mod seedreconfig;
pub mod telemetry;

pub use checkpoint::Checkpoints;
pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace the lifecycle agent operator runs in
pub const LCA_NAMESPACE: &str = "openshift-lifecycle-agent";

/// Mount point of the host root filesystem inside the agent container
pub const HOST_ROOT: &str = "/host";

/// Directory holding all ostree stateroots
pub const OSTREE_DEPLOY_ROOT: &str = "/ostree/deploy";

/// Default workspace for upgrade bookkeeping, removed wholesale on cleanup
pub const DEFAULT_WORKSPACE: &str = "/var/ibu";

/// Seed image format version, bumped on every incompatible seed layout change
pub const SEED_FORMAT_VERSION: u32 = 3;

/// OCI label carrying [`SEED_FORMAT_VERSION`] on seed images
pub const SEED_FORMAT_OCI_LABEL: &str = "com.openshift.lifecycle-agent.seed_format_version";

/// Name of the cluster info / seed reconfiguration manifest file
pub const SEED_MANIFEST_FILE_NAME: &str = "manifest.json";

/// Default recert container image
pub const DEFAULT_RECERT_IMAGE: &str = "quay.io/edge-infrastructure/recert:latest";

/// Pull secret written by the machine-config-operator
pub const IMAGE_REGISTRY_AUTH_FILE: &str = "/var/lib/kubelet/config.json";

/// Translate an absolute host path into the path visible from inside the agent container.
///
/// `"/var/ibu"` becomes `"/host/var/ibu"`.
pub fn path_outside_chroot(path: impl AsRef<std::path::Path>) -> std::path::PathBuf {
    let path = path.as_ref();
    let relative = path.strip_prefix("/").unwrap_or(path);
    std::path::Path::new(HOST_ROOT).join(relative)
}

/// Stateroot name used for a given release version
///
/// `"4.16.0-rc.1"` becomes `"rhcos_4.16.0_rc.1"`.
pub fn stateroot_name(version: &str) -> String {
    format!("rhcos_{}", version.replace('-', "_"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_outside_chroot() {
        assert_eq!(
            path_outside_chroot("/var/ibu"),
            std::path::PathBuf::from("/host/var/ibu")
        );
        assert_eq!(
            path_outside_chroot("ostree/deploy"),
            std::path::PathBuf::from("/host/ostree/deploy")
        );
    }

    #[test]
    fn test_stateroot_name_replaces_dashes() {
        assert_eq!(stateroot_name("4.16.0"), "rhcos_4.16.0");
        assert_eq!(stateroot_name("4.16.0-rc.1"), "rhcos_4.16.0_rc.1");
    }
}
