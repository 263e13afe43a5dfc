//! Image pullers

use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use lca_ostree::HostOps;

use crate::PrecacheError;

/// Pulls one container image into local storage
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ImagePuller: Send + Sync {
    /// Pull `image`
    async fn pull(&self, image: &str) -> Result<(), PrecacheError>;
}

/// Pulls with `podman pull` on the host
pub struct PodmanPuller {
    ops: Arc<dyn HostOps>,
    auth_file: Option<String>,
}

impl PodmanPuller {
    /// Create a puller, optionally authenticating with `auth_file`
    pub fn new(ops: Arc<dyn HostOps>, auth_file: Option<String>) -> Self {
        Self { ops, auth_file }
    }

    fn args(&self, image: &str) -> Vec<String> {
        let mut args = vec!["pull".to_string()];
        if let Some(auth) = &self.auth_file {
            args.push("--authfile".to_string());
            args.push(auth.clone());
        }
        args.push(image.to_string());
        args
    }
}

#[async_trait]
impl ImagePuller for PodmanPuller {
    async fn pull(&self, image: &str) -> Result<(), PrecacheError> {
        self.ops
            .run_in_host_namespace("podman", &self.args(image))
            .await
            .map(drop)
            .map_err(|e| PrecacheError::pull(image, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lca_common::Error;
    use mockall::mock;

    mock! {
        pub Ops {}

        #[async_trait]
        impl HostOps for Ops {
            async fn run_in_host_namespace(&self, program: &str, args: &[String]) -> lca_common::Result<String>;
            async fn run_bash_in_host_namespace(&self, script: &str) -> lca_common::Result<String>;
            async fn remount_and_remove(&self, path: &str) -> lca_common::Result<()>;
            async fn remount_sysroot(&self) -> lca_common::Result<()>;
            async fn mount_image(&self, image: &str) -> lca_common::Result<String>;
            async fn unmount_and_remove_image(&self, image: &str) -> lca_common::Result<()>;
            async fn extract_tar_with_selinux(&self, archive: &str, dest: &str) -> lca_common::Result<()>;
        }
    }

    #[tokio::test]
    async fn podman_pull_uses_auth_file() {
        let mut ops = MockOps::new();
        ops.expect_run_in_host_namespace()
            .withf(|program, args| {
                program == "podman"
                    && args == ["pull", "--authfile", "/var/lib/kubelet/config.json", "quay.io/a:1"]
            })
            .times(1)
            .returning(|_, _| Ok(String::new()));

        PodmanPuller::new(
            Arc::new(ops),
            Some("/var/lib/kubelet/config.json".to_string()),
        )
        .pull("quay.io/a:1")
        .await
        .expect("pull");
    }

    #[tokio::test]
    async fn podman_failure_is_a_pull_error() {
        let mut ops = MockOps::new();
        ops.expect_run_in_host_namespace()
            .returning(|_, _| Err(Error::command("podman", "manifest unknown")));

        let err = PodmanPuller::new(Arc::new(ops), None)
            .pull("quay.io/missing:1")
            .await
            .expect_err("should fail");
        match err {
            PrecacheError::Pull { image, message } => {
                assert_eq!(image, "quay.io/missing:1");
                assert!(message.contains("manifest unknown"));
            }
            other => panic!("expected Pull error, got {other:?}"),
        }
    }
}
