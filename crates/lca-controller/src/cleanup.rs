//! Best-effort cleanup after abort or finalize
//!
//! Every action runs regardless of earlier failures. Failures are collected
//! into a [`CleanupReport`] and only rendered to text when the caller writes
//! the status.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{error, info, instrument, warn};

use lca_common::{Error, Result};
use lca_ostree::StaterootManager;
use lca_precache::{CancelOutcome, PrecacheResources, PrecacheTask};

use crate::backup::BackupRestore;

/// Cleanup actions that can fail, in the order they run
///
/// Stopping the precache worker comes first and never fails; a worker that
/// outlives the grace period is detached and flagged on the report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CleanupStep {
    /// Remove every stateroot except the booted one
    Stateroots,
    /// Remove precache files
    PrecacheResources,
    /// Delete DeleteBackupRequest objects
    DeleteBackupRequests,
    /// Delete Backup objects
    Backups,
    /// Restore PV reclaim policies
    PvReclaimPolicy,
    /// Remove the workspace directory
    Workspace,
}

impl std::fmt::Display for CleanupStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Stateroots => "stateroots",
            Self::PrecacheResources => "precache resources",
            Self::DeleteBackupRequests => "delete backup requests",
            Self::Backups => "backups",
            Self::PvReclaimPolicy => "pv reclaim policy",
            Self::Workspace => "workspace",
        };
        f.write_str(name)
    }
}

/// One failed cleanup action
#[derive(Debug)]
pub struct CleanupFailure {
    /// Which action failed
    pub step: CleanupStep,
    /// Why
    pub error: Error,
}

/// Outcome of a cleanup run
#[derive(Debug, Default)]
pub struct CleanupReport {
    /// Failed actions, in run order
    pub failures: Vec<CleanupFailure>,
    /// Set when the precache worker had to be detached after the grace period
    pub precache_detached: bool,
}

impl CleanupReport {
    /// Returns true if every action succeeded
    pub fn is_successful(&self) -> bool {
        self.failures.is_empty()
    }

    /// Every failure's text, each followed by a space
    pub fn message(&self) -> String {
        self.failures
            .iter()
            .map(|f| format!("{} ", f.error))
            .collect()
    }

    fn record(&mut self, step: CleanupStep, result: Result<()>) {
        if let Err(e) = result {
            error!(step = %step, error = %e, "Cleanup step failed");
            self.failures.push(CleanupFailure { step, error: e });
        }
    }
}

/// Removes everything an upgrade attempt left on the host and cluster
pub struct CleanupCoordinator<'a> {
    /// Stateroot removal
    pub stateroots: &'a StaterootManager,
    /// Precache files
    pub precache: &'a PrecacheResources,
    /// Backup objects and PV policies
    pub backup: &'a dyn BackupRestore,
    /// Workspace directory as readable from this process
    pub workspace: PathBuf,
    /// Wait for the precache worker to stop
    pub grace: Duration,
}

impl CleanupCoordinator<'_> {
    /// Run every cleanup action, in order, without stopping at failures
    #[instrument(skip_all)]
    pub async fn cleanup(&self, task: &mut PrecacheTask) -> CleanupReport {
        let mut report = CleanupReport::default();

        info!(grace_secs = self.grace.as_secs(), "Terminating precache worker");
        if task.cancel_and_reset(self.grace).await == CancelOutcome::TimedOut {
            warn!("Precache worker detached after grace period");
            report.precache_detached = true;
        }

        info!("Cleaning up stateroots");
        report.record(
            CleanupStep::Stateroots,
            self.stateroots.undeploy_unbooted().await,
        );

        info!("Cleaning up precache resources");
        report.record(CleanupStep::PrecacheResources, self.precache.cleanup().await);

        info!("Cleaning up DeleteBackupRequest and Backup objects");
        report.record(
            CleanupStep::DeleteBackupRequests,
            self.backup.cleanup_delete_backup_requests().await,
        );
        report.record(CleanupStep::Backups, self.backup.cleanup_backups().await);
        report.record(
            CleanupStep::PvReclaimPolicy,
            self.backup.restore_pv_reclaim_policy().await,
        );

        info!(workspace = %self.workspace.display(), "Cleaning up workspace");
        report.record(CleanupStep::Workspace, remove_workspace(&self.workspace).await);

        if report.is_successful() {
            info!("Cleanup finished");
        }
        report
    }
}

/// Remove `dir` recursively if it exists
pub async fn remove_workspace(dir: &Path) -> Result<()> {
    if !tokio::fs::try_exists(dir).await.unwrap_or(false) {
        return Ok(());
    }
    tokio::fs::remove_dir_all(dir)
        .await
        .map_err(|e| Error::io(dir, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::MockBackupRestore;
    use crate::testing::{host_mocks, HostMocks};
    use lca_ostree::{Deployment, StaterootPaths};
    use lca_precache::PrecacheError;

    struct Fixture {
        host: tempfile::TempDir,
        stateroots: StaterootManager,
        resources: PrecacheResources,
    }

    fn fixture(mocks: HostMocks) -> Fixture {
        let host = tempfile::tempdir().expect("tempdir");
        let paths = StaterootPaths {
            host_root: host.path().to_path_buf(),
            ..Default::default()
        };
        std::fs::create_dir_all(paths.outside_chroot("/ostree/deploy/rhcos")).expect("mkdir");
        let stateroots = mocks.into_manager(paths);
        let resources = PrecacheResources::in_workspace(&host.path().join("var/ibu"));
        Fixture {
            host,
            stateroots,
            resources,
        }
    }

    fn backup_ok() -> MockBackupRestore {
        let mut backup = MockBackupRestore::new();
        backup
            .expect_cleanup_delete_backup_requests()
            .returning(|| Ok(()));
        backup.expect_cleanup_backups().returning(|| Ok(()));
        backup.expect_restore_pv_reclaim_policy().returning(|| Ok(()));
        backup
    }

    #[tokio::test]
    async fn clean_host_reports_success_and_removes_workspace() {
        let f = fixture(host_mocks(vec![Deployment::new("rhcos", "rhcos-a.0", true)]));
        let workspace = f.host.path().join("var/ibu");
        std::fs::create_dir_all(workspace.join("checkpoints")).expect("mkdir");
        let backup = backup_ok();

        let coordinator = CleanupCoordinator {
            stateroots: &f.stateroots,
            precache: &f.resources,
            backup: &backup,
            workspace: workspace.clone(),
            grace: Duration::from_secs(30),
        };
        let report = coordinator.cleanup(&mut PrecacheTask::new()).await;

        assert!(report.is_successful(), "{}", report.message());
        assert!(!workspace.exists());
        assert!(f.host.path().join("ostree/deploy/rhcos").exists());
    }

    /// Story: abort where only the backup cleanup fails. Every other action
    /// still runs, and the report carries exactly the backup error text.
    #[tokio::test]
    async fn story_only_backup_cleanup_fails() {
        let f = fixture(host_mocks(vec![Deployment::new("rhcos", "rhcos-a.0", true)]));
        let workspace = f.host.path().join("var/ibu");
        std::fs::create_dir_all(&workspace).expect("mkdir");

        let mut backup = MockBackupRestore::new();
        backup
            .expect_cleanup_delete_backup_requests()
            .times(1)
            .returning(|| Ok(()));
        backup
            .expect_cleanup_backups()
            .times(1)
            .returning(|| Err(Error::internal_with_context("backup", "velero unreachable")));
        backup
            .expect_restore_pv_reclaim_policy()
            .times(1)
            .returning(|| Ok(()));

        let coordinator = CleanupCoordinator {
            stateroots: &f.stateroots,
            precache: &f.resources,
            backup: &backup,
            workspace: workspace.clone(),
            grace: Duration::from_secs(30),
        };
        let report = coordinator.cleanup(&mut PrecacheTask::new()).await;

        assert!(!report.is_successful());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].step, CleanupStep::Backups);
        assert_eq!(
            report.message(),
            "internal error [backup]: velero unreachable "
        );
        assert!(!workspace.exists(), "later steps still ran");
    }

    #[tokio::test]
    async fn every_failure_is_collected_in_order() {
        let mut mocks = host_mocks(vec![Deployment::new("rhcos", "rhcos-a.0", true)]);
        mocks.fail_queries();
        let f = fixture(mocks);

        let mut backup = MockBackupRestore::new();
        backup
            .expect_cleanup_delete_backup_requests()
            .returning(|| Err(Error::internal("dbr")));
        backup
            .expect_cleanup_backups()
            .returning(|| Err(Error::internal("backups")));
        backup
            .expect_restore_pv_reclaim_policy()
            .returning(|| Err(Error::internal("pvs")));

        let coordinator = CleanupCoordinator {
            stateroots: &f.stateroots,
            precache: &f.resources,
            backup: &backup,
            workspace: f.host.path().join("absent"),
            grace: Duration::from_secs(30),
        };
        let report = coordinator.cleanup(&mut PrecacheTask::new()).await;

        let steps: Vec<_> = report.failures.iter().map(|f| f.step).collect();
        assert_eq!(
            steps,
            vec![
                CleanupStep::Stateroots,
                CleanupStep::DeleteBackupRequests,
                CleanupStep::Backups,
                CleanupStep::PvReclaimPolicy,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_precache_worker_is_detached() {
        let f = fixture(host_mocks(vec![Deployment::new("rhcos", "rhcos-a.0", true)]));
        let backup = backup_ok();
        let mut task = PrecacheTask::new();
        task.start_with(|_, _| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(PrecacheError::Cancelled)
        })
        .expect("start");

        let coordinator = CleanupCoordinator {
            stateroots: &f.stateroots,
            precache: &f.resources,
            backup: &backup,
            workspace: f.host.path().join("absent"),
            grace: Duration::from_secs(30),
        };
        let report = coordinator.cleanup(&mut task).await;

        assert!(report.precache_detached);
        assert!(report.is_successful());
        assert_eq!(report.message(), "");
        assert!(!task.is_active());
    }
}
