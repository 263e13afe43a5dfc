//! Controller configuration

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

use lca_precache::{PrecacheConfig, PrecacheMode, DEFAULT_CONCURRENCY};

/// How long to wait before the next reconcile in each situation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequeueConfig {
    /// Retry after an error or while a step is in flight
    pub short: Duration,
    /// Steady-state wait, e.g. for manual cleanup
    pub long: Duration,
    /// Poll interval while waiting for the cluster to stabilize
    pub health_check: Duration,
}

impl Default for RequeueConfig {
    fn default() -> Self {
        Self {
            short: Duration::from_secs(5),
            long: Duration::from_secs(60),
            health_check: Duration::from_secs(20),
        }
    }
}

/// Operator settings, from flags or environment
#[derive(Args, Clone, Debug)]
pub struct ControllerConfig {
    /// Working directory for upgrade state, as seen on the host
    #[arg(long, env = "LCA_WORKSPACE", default_value = lca_common::DEFAULT_WORKSPACE)]
    pub workspace: PathBuf,

    /// Directory for step checkpoint markers; defaults to <workspace>/checkpoints
    #[arg(long, env = "LCA_CHECKPOINT_DIR")]
    pub checkpoint_dir: Option<PathBuf>,

    /// Where the host root filesystem is mounted in this container
    #[arg(long, env = "LCA_HOST_ROOT", default_value = lca_common::HOST_ROOT)]
    pub host_root: PathBuf,

    /// Parent directory of all stateroots on the host
    #[arg(long, env = "LCA_DEPLOY_ROOT", default_value = lca_common::OSTREE_DEPLOY_ROOT)]
    pub deploy_root: PathBuf,

    /// Seconds to wait for the precache worker to stop on cancel
    #[arg(long, env = "LCA_PRECACHE_GRACE_SECONDS", default_value_t = 30)]
    pub precache_grace_seconds: u64,

    /// Precache failure handling: best-effort or strict
    #[arg(long, env = "LCA_PRECACHE_MODE", default_value = "best-effort")]
    pub precache_mode: PrecacheMode,

    /// Concurrent image pulls during precache
    #[arg(long, env = "LCA_PRECACHE_CONCURRENCY", default_value_t = DEFAULT_CONCURRENCY)]
    pub precache_concurrency: usize,

    /// Registry credentials used for pulls
    #[arg(long, env = "LCA_AUTH_FILE", default_value = lca_common::IMAGE_REGISTRY_AUTH_FILE)]
    pub auth_file: String,

    /// Seconds before retrying after an error
    #[arg(long, env = "LCA_REQUEUE_SHORT_SECONDS", default_value_t = 5)]
    pub requeue_short_seconds: u64,

    /// Seconds between steady-state checks
    #[arg(long, env = "LCA_REQUEUE_LONG_SECONDS", default_value_t = 60)]
    pub requeue_long_seconds: u64,

    /// Seconds between health checks while finalizing
    #[arg(long, env = "LCA_HEALTH_CHECK_SECONDS", default_value_t = 20)]
    pub health_check_seconds: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workspace: PathBuf::from(lca_common::DEFAULT_WORKSPACE),
            checkpoint_dir: None,
            host_root: PathBuf::from(lca_common::HOST_ROOT),
            deploy_root: PathBuf::from(lca_common::OSTREE_DEPLOY_ROOT),
            precache_grace_seconds: 30,
            precache_mode: PrecacheMode::BestEffort,
            precache_concurrency: DEFAULT_CONCURRENCY,
            auth_file: lca_common::IMAGE_REGISTRY_AUTH_FILE.to_string(),
            requeue_short_seconds: 5,
            requeue_long_seconds: 60,
            health_check_seconds: 20,
        }
    }
}

impl ControllerConfig {
    /// Checkpoint directory as seen on the host
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.checkpoint_dir
            .clone()
            .unwrap_or_else(|| self.workspace.join("checkpoints"))
    }

    /// Requeue intervals
    pub fn requeue(&self) -> RequeueConfig {
        RequeueConfig {
            short: Duration::from_secs(self.requeue_short_seconds),
            long: Duration::from_secs(self.requeue_long_seconds),
            health_check: Duration::from_secs(self.health_check_seconds),
        }
    }

    /// Precache worker settings
    pub fn precache(&self) -> PrecacheConfig {
        PrecacheConfig {
            mode: self.precache_mode,
            concurrency: self.precache_concurrency.max(1),
        }
    }

    /// Grace period for cancelling the precache worker
    pub fn precache_grace(&self) -> Duration {
        Duration::from_secs(self.precache_grace_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        config: ControllerConfig,
    }

    #[test]
    fn defaults_match_documented_intervals() {
        let requeue = ControllerConfig::default().requeue();
        assert_eq!(requeue, RequeueConfig::default());
        assert_eq!(requeue.short, Duration::from_secs(5));
        assert_eq!(requeue.long, Duration::from_secs(60));
        assert_eq!(requeue.health_check, Duration::from_secs(20));
    }

    #[test]
    fn checkpoints_live_under_workspace_by_default() {
        let config = ControllerConfig::default();
        assert_eq!(config.checkpoint_dir(), PathBuf::from("/var/ibu/checkpoints"));
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::parse_from([
            "lca",
            "--workspace",
            "/var/lca",
            "--precache-mode",
            "strict",
            "--precache-concurrency",
            "0",
        ]);
        assert_eq!(cli.config.checkpoint_dir(), PathBuf::from("/var/lca/checkpoints"));
        assert_eq!(cli.config.precache().mode, PrecacheMode::Strict);
        assert_eq!(cli.config.precache().concurrency, 1);
    }
}
