//! Shared test fixtures: mocks for the host seams and a fake host filesystem

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use mockall::mock;

use lca_common::crd::{
    ImageBasedUpgrade, ImageBasedUpgradeSpec, ImageBasedUpgradeStatus, SeedImageRef, Stage,
    UpgradePhase,
};
use lca_common::{Error, Result};
use lca_ostree::{Deployment, DeploymentQuery, HostOps, OstreeClient, StaterootManager, StaterootPaths};
use lca_precache::{ImagePuller, PrecacheError};

// Local mocks since the mockall-generated mocks are only available within
// the lca-ostree crate's test configuration
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

// Same for lca-precache
mock! {
    pub Puller {}

    #[async_trait]
    impl ImagePuller for Puller {
        async fn pull(&self, image: &str) -> std::result::Result<(), PrecacheError>;
    }
}

/// Deployment listing backed by a shared vector the test can change
pub struct LiveQuery {
    pub deployments: Arc<Mutex<Vec<Deployment>>>,
    pub fail: bool,
}

#[async_trait]
impl DeploymentQuery for LiveQuery {
    async fn query_status(&self) -> Result<Vec<Deployment>> {
        if self.fail {
            return Err(Error::query("rpm-ostree unavailable"));
        }
        Ok(self.deployments.lock().expect("deployments lock").clone())
    }
}

/// Host seams for a [`StaterootManager`], with expectations set by the test
pub struct HostMocks {
    pub deployments: Arc<Mutex<Vec<Deployment>>>,
    pub ostree: MockOstree,
    pub ops: MockOps,
    fail_queries: bool,
}

impl HostMocks {
    /// Make every deployment query fail
    pub fn fail_queries(&mut self) {
        self.fail_queries = true;
    }

    /// Build the manager over `paths`
    pub fn into_manager(self, paths: StaterootPaths) -> StaterootManager {
        StaterootManager::new(
            Arc::new(LiveQuery {
                deployments: self.deployments,
                fail: self.fail_queries,
            }),
            Arc::new(self.ostree),
            Arc::new(self.ops),
            paths,
        )
    }
}

/// Mocks with no expectations over a fixed deployment listing
pub fn host_mocks(deployments: Vec<Deployment>) -> HostMocks {
    HostMocks {
        deployments: Arc::new(Mutex::new(deployments)),
        ostree: MockOstree::new(),
        ops: MockOps::new(),
        fail_queries: false,
    }
}

/// Paths rooted in a temporary directory standing in for `/host`
pub fn temp_paths(host: &Path) -> StaterootPaths {
    StaterootPaths {
        host_root: host.to_path_buf(),
        ..Default::default()
    }
}

/// An ImageBasedUpgrade with the given desired stage and current phase
pub fn sample_ibu(stage: Stage, phase: Option<UpgradePhase>) -> ImageBasedUpgrade {
    ImageBasedUpgrade {
        metadata: ObjectMeta {
            name: Some("upgrade".to_string()),
            generation: Some(2),
            ..Default::default()
        },
        spec: ImageBasedUpgradeSpec {
            stage,
            seed_image_ref: SeedImageRef {
                image: "quay.io/seeds/sno:4.16.1".to_string(),
                version: "4.16.1".to_string(),
                pull_secret_ref: None,
            },
            auto_rollback_on_failure: None,
        },
        status: phase.map(ImageBasedUpgradeStatus::with_phase),
    }
}
