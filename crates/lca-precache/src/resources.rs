//! Files the precache flow leaves on the host

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use lca_common::{Error, Result};
use tracing::debug;

use crate::workload::ProgressSnapshot;

/// Image list file name inside the workspace
pub const IMAGE_LIST_FILE_NAME: &str = "images.list";
/// Progress file name inside the workspace
pub const STATUS_FILE_NAME: &str = "precache-status.json";

/// The image list handed to the worker and its progress file
#[derive(Clone, Debug)]
pub struct PrecacheResources {
    /// Images to pull, one reference per line
    pub image_list_file: PathBuf,
    /// Last progress snapshot written by the controller
    pub status_file: PathBuf,
}

impl PrecacheResources {
    /// Resources with the default file names under `workspace`
    pub fn in_workspace(workspace: &Path) -> Self {
        Self {
            image_list_file: workspace.join(IMAGE_LIST_FILE_NAME),
            status_file: workspace.join(STATUS_FILE_NAME),
        }
    }

    /// Persist a progress snapshot
    pub async fn write_status(&self, snapshot: &ProgressSnapshot) -> Result<()> {
        if let Some(parent) = self.status_file.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::io(parent, e))?;
        }
        let body = serde_json::to_vec_pretty(snapshot)?;
        tokio::fs::write(&self.status_file, body)
            .await
            .map_err(|e| Error::io(&self.status_file, e))
    }

    /// Last persisted snapshot, or `None` if none was written
    pub async fn read_status(&self) -> Result<Option<ProgressSnapshot>> {
        match tokio::fs::read(&self.status_file).await {
            Ok(body) => Ok(Some(serde_json::from_slice(&body)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(&self.status_file, e)),
        }
    }

    /// Remove both files; files that do not exist are skipped
    pub async fn cleanup(&self) -> Result<()> {
        for path in [&self.image_list_file, &self.status_file] {
            match tokio::fs::remove_file(path).await {
                Ok(()) => debug!(path = %path.display(), "Removed precache file"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(Error::io(path, e)),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cleanup_removes_files_and_tolerates_missing_ones() {
        let dir = tempfile::tempdir().expect("tempdir");
        let resources = PrecacheResources::in_workspace(dir.path());
        tokio::fs::write(&resources.image_list_file, "quay.io/a:1\n")
            .await
            .expect("write list");

        resources.cleanup().await.expect("first cleanup");
        assert!(!resources.image_list_file.exists());

        resources.cleanup().await.expect("second cleanup is a no-op");
    }

    #[tokio::test]
    async fn status_survives_a_round_trip_through_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let resources = PrecacheResources::in_workspace(&dir.path().join("ibu"));
        assert_eq!(resources.read_status().await.expect("read"), None);

        let snapshot = ProgressSnapshot {
            total: 4,
            pulled: 3,
            failed: 1,
        };
        resources.write_status(&snapshot).await.expect("write");
        assert_eq!(resources.read_status().await.expect("read"), Some(snapshot));
    }
}
