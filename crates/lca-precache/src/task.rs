//! Handle for the single background precache task
//!
//! A task is either absent or active. An active task owns its cancellation
//! token, join handle and progress counters together, so there is never a
//! token without a running task behind it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::workload::{precache, PrecacheProgress, PrecacheSummary, ProgressSnapshot};
use crate::{ImagePuller, PrecacheConfig, PrecacheError};

/// Default time to wait for the worker to observe cancellation
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(30);

type WorkerResult = Result<PrecacheSummary, PrecacheError>;

struct ActiveTask {
    cancel: CancellationToken,
    handle: JoinHandle<WorkerResult>,
    progress: Arc<PrecacheProgress>,
}

/// Result of [`PrecacheTask::cancel`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelOutcome {
    /// No task was running
    NotActive,
    /// The worker exited within the grace period
    Stopped,
    /// The worker was still running when the grace period ran out
    TimedOut,
}

/// Result of [`PrecacheTask::poll`]
#[derive(Debug)]
pub enum TaskPoll {
    /// No task has been started, or the last result was already collected
    Idle,
    /// Still pulling
    Running(ProgressSnapshot),
    /// Finished; the handle is cleared
    Finished(WorkerResult),
}

/// Owner of at most one precache worker
#[derive(Default)]
pub struct PrecacheTask {
    active: Option<ActiveTask>,
}

impl std::fmt::Debug for PrecacheTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrecacheTask")
            .field("active", &self.is_active())
            .finish()
    }
}

impl PrecacheTask {
    /// Create an idle handle
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a worker pulling `images`
    pub fn start(
        &mut self,
        images: Vec<String>,
        puller: Arc<dyn ImagePuller>,
        config: PrecacheConfig,
    ) -> Result<(), PrecacheError> {
        self.start_with(move |cancel, progress| async move {
            precache(images, puller, &config, cancel, progress).await
        })
    }

    /// Spawn an arbitrary worker.
    ///
    /// The worker receives the task's cancellation token and progress
    /// counters. Fails with [`PrecacheError::AlreadyRunning`] if a task is
    /// active.
    pub fn start_with<F, Fut>(&mut self, worker: F) -> Result<(), PrecacheError>
    where
        F: FnOnce(CancellationToken, Arc<PrecacheProgress>) -> Fut,
        Fut: Future<Output = WorkerResult> + Send + 'static,
    {
        if self.active.is_some() {
            return Err(PrecacheError::AlreadyRunning);
        }

        let cancel = CancellationToken::new();
        let progress = Arc::new(PrecacheProgress::default());
        let handle = tokio::spawn(worker(cancel.clone(), progress.clone()));
        self.active = Some(ActiveTask {
            cancel,
            handle,
            progress,
        });
        debug!("Precache task started");
        Ok(())
    }

    /// Returns true while a worker is owned by this handle
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Progress of the active worker, if any
    pub fn progress(&self) -> Option<ProgressSnapshot> {
        self.active.as_ref().map(|a| a.progress.snapshot())
    }

    /// Signal cancellation and wait at most `grace` for the worker to exit.
    ///
    /// A worker that stops in time is cleared from the handle. One that does
    /// not stays owned until [`reset`](Self::reset).
    pub async fn cancel(&mut self, grace: Duration) -> CancelOutcome {
        let Some(active) = self.active.as_mut() else {
            return CancelOutcome::NotActive;
        };

        active.cancel.cancel();
        match tokio::time::timeout(grace, &mut active.handle).await {
            Ok(result) => {
                match result {
                    Ok(Ok(summary)) => debug!(pulled = summary.pulled, "Precache worker finished"),
                    Ok(Err(e)) => debug!(error = %e, "Precache worker stopped"),
                    Err(e) => warn!(error = %e, "Precache worker terminated abnormally"),
                }
                self.active = None;
                info!("Precache task cancelled");
                CancelOutcome::Stopped
            }
            Err(_) => {
                warn!(
                    grace_secs = grace.as_secs(),
                    "Precache worker did not stop within grace period"
                );
                CancelOutcome::TimedOut
            }
        }
    }

    /// Drop ownership of any worker.
    ///
    /// A worker still running is detached, not killed; its token stays
    /// cancelled.
    pub fn reset(&mut self) {
        if let Some(active) = self.active.take() {
            active.cancel.cancel();
            if !active.handle.is_finished() {
                warn!("Detaching precache worker that is still running");
            }
        }
    }

    /// [`cancel`](Self::cancel) followed by [`reset`](Self::reset)
    pub async fn cancel_and_reset(&mut self, grace: Duration) -> CancelOutcome {
        let outcome = self.cancel(grace).await;
        self.reset();
        outcome
    }

    /// Check on the worker without blocking on it.
    ///
    /// A finished worker's result is collected and the handle cleared.
    pub async fn poll(&mut self) -> TaskPoll {
        match &self.active {
            None => return TaskPoll::Idle,
            Some(active) if !active.handle.is_finished() => {
                return TaskPoll::Running(active.progress.snapshot())
            }
            Some(_) => {}
        }

        let Some(active) = self.active.take() else {
            return TaskPoll::Idle;
        };
        let result = active
            .handle
            .await
            .unwrap_or_else(|e| Err(PrecacheError::Worker(e.to_string())));
        TaskPoll::Finished(result)
    }
}
