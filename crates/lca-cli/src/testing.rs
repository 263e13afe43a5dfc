//! Shared test mocks for the host seams

use std::path::Path;

use async_trait::async_trait;
use mockall::mock;

use lca_common::Result;
use lca_ostree::{Deployment, DeploymentQuery, HostOps, OstreeClient, StaterootPaths};
use lca_precache::{ImagePuller, PrecacheError};

// Local mocks since the mockall-generated mocks are only available within
// the lca-ostree crate's test configuration
mock! {
    pub Ops {}

    #[async_trait]
    impl HostOps for Ops {
        async fn run_in_host_namespace(&self, program: &str, args: &[String]) -> Result<String>;
        async fn run_bash_in_host_namespace(&self, script: &str) -> Result<String>;
        async fn remount_and_remove(&self, path: &str) -> Result<()>;
        async fn remount_sysroot(&self) -> Result<()>;
        async fn mount_image(&self, image: &str) -> Result<String>;
        async fn unmount_and_remove_image(&self, image: &str) -> Result<()>;
        async fn extract_tar_with_selinux(&self, archive: &str, dest: &str) -> Result<()>;
    }
}

mock! {
    pub Ostree {}

    #[async_trait]
    impl OstreeClient for Ostree {
        async fn undeploy(&self, index: usize) -> Result<()>;
        async fn pull_local(&self, repo: &str) -> Result<()>;
        async fn os_init(&self, osname: &str) -> Result<()>;
        async fn deploy(&self, osname: &str, refsha: &str, kargs: &[String]) -> Result<()>;
        async fn deployment_for(&self, osname: &str) -> Result<String>;
        async fn set_default(&self, index: usize) -> Result<()>;
    }
}

mock! {
    pub Query {}

    #[async_trait]
    impl DeploymentQuery for Query {
        async fn query_status(&self) -> Result<Vec<Deployment>>;
    }
}

// Same for lca-precache
mock! {
    pub Puller {}

    #[async_trait]
    impl ImagePuller for Puller {
        async fn pull(&self, image: &str) -> std::result::Result<(), PrecacheError>;
    }
}

/// Paths rooted in a temporary directory standing in for the host root
pub fn temp_paths(host: &Path) -> StaterootPaths {
    StaterootPaths {
        host_root: host.to_path_buf(),
        ..Default::default()
    }
}
