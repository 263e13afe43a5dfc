//! Checkpointed step runner
//!
//! Each completed step leaves a marker file named after the step in the
//! checkpoint directory. A step whose marker exists is skipped, so a
//! pipeline restarted after a crash resumes at the first unfinished step
//! and never repeats a step that already succeeded.
//!
//! Markers are written to a temporary file, synced, renamed into place and
//! the directory synced. A marker therefore either exists completely or not
//! at all after a power loss.
//!
//! One process at a time may use a checkpoint directory. Nothing here
//! locks it.

use std::future::Future;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::{Error, Result};

const TEMP_SUFFIX: &str = ".partial";

/// Runs named steps at most once per checkpoint directory
#[derive(Clone, Debug)]
pub struct Checkpoints {
    dir: PathBuf,
}

impl Checkpoints {
    /// Create a runner storing markers under `dir`
    ///
    /// The directory is created lazily when the first marker is written.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the markers
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Run `action` unless `step` already completed.
    ///
    /// The marker is written only after `action` succeeds. If `action` fails
    /// no marker is written and the error is returned, so the next call runs
    /// the step again.
    pub async fn run_once<F, Fut>(&self, step: &str, action: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if self.is_done(step).await? {
            info!(step = %step, "Skipping step, already completed");
            return Ok(());
        }

        info!(step = %step, "Running step");
        action().await?;
        self.record(step).await?;
        debug!(step = %step, "Step completed");
        Ok(())
    }

    /// Like [`run_once`](Self::run_once), but failures are logged and swallowed.
    ///
    /// A failed step leaves no marker and is attempted again next time.
    pub async fn run_once_best_effort<F, Fut>(&self, step: &str, action: F)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if let Err(e) = self.run_once(step, action).await {
            warn!(step = %step, error = %e, "Best-effort step failed, continuing");
        }
    }

    /// Returns true if the marker for `step` exists
    pub async fn is_done(&self, step: &str) -> Result<bool> {
        let path = self.marker_path(step)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| Error::io(path, e))
    }

    /// Write the marker for `step` durably
    ///
    /// An existing marker is left untouched.
    pub async fn record(&self, step: &str) -> Result<()> {
        let path = self.marker_path(step)?;
        if tokio::fs::try_exists(&path)
            .await
            .map_err(|e| Error::io(&path, e))?
        {
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Error::io(&self.dir, e))?;

        let temp = self.dir.join(format!("{step}{TEMP_SUFFIX}"));
        let mut file = tokio::fs::File::create(&temp)
            .await
            .map_err(|e| Error::io(&temp, e))?;
        file.write_all(Utc::now().to_rfc3339().as_bytes())
            .await
            .map_err(|e| Error::io(&temp, e))?;
        file.sync_all().await.map_err(|e| Error::io(&temp, e))?;
        drop(file);

        tokio::fs::rename(&temp, &path)
            .await
            .map_err(|e| Error::io(&path, e))?;
        sync_dir(&self.dir).await
    }

    fn marker_path(&self, step: &str) -> Result<PathBuf> {
        validate_step_name(step)?;
        Ok(self.dir.join(step))
    }
}

fn validate_step_name(step: &str) -> Result<()> {
    if step.is_empty() {
        return Err(Error::validation("checkpoint step name must not be empty"));
    }
    if step.contains('/') || step.contains('\\') || step == "." || step == ".." {
        return Err(Error::validation(format!(
            "checkpoint step name '{step}' must be a plain file name"
        )));
    }
    if step.ends_with(TEMP_SUFFIX) {
        return Err(Error::validation(format!(
            "checkpoint step name '{step}' must not end with {TEMP_SUFFIX}"
        )));
    }
    Ok(())
}

async fn sync_dir(dir: &Path) -> Result<()> {
    let handle = tokio::fs::File::open(dir)
        .await
        .map_err(|e| Error::io(dir, e))?;
    handle.sync_all().await.map_err(|e| Error::io(dir, e))
}
