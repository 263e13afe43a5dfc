//! The precache worker
//!
//! Pulls a list of images with bounded concurrency. Cancellation is checked
//! while waiting on every pull, so a cancelled worker stops at the next
//! pull boundary or as soon as the in-flight pull future yields.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{ImagePuller, PrecacheConfig, PrecacheError, PrecacheMode};

/// Live counters shared between the worker and whoever polls it
#[derive(Debug, Default)]
pub struct PrecacheProgress {
    total: AtomicUsize,
    pulled: AtomicUsize,
    failed: AtomicUsize,
}

/// Point-in-time copy of [`PrecacheProgress`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// Images requested
    pub total: usize,
    /// Images pulled so far
    pub pulled: usize,
    /// Images that failed so far
    pub failed: usize,
}

impl PrecacheProgress {
    /// Current counters
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            total: self.total.load(Ordering::Relaxed),
            pulled: self.pulled.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Display for ProgressSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} of {} images pulled, {} failed",
            self.pulled, self.total, self.failed
        )
    }
}

/// Result of a finished precache run
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PrecacheSummary {
    /// Images pulled
    pub pulled: usize,
    /// Images that failed, with the failure text
    pub failures: Vec<(String, String)>,
}

impl PrecacheSummary {
    /// Returns true if every image was pulled
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Pull every image in `images`.
///
/// In [`PrecacheMode::Strict`] the first failure cancels the remaining pulls
/// and is returned. In [`PrecacheMode::BestEffort`] failures are collected in
/// the summary, and the run only fails if no image could be pulled.
pub async fn precache(
    images: Vec<String>,
    puller: Arc<dyn ImagePuller>,
    config: &PrecacheConfig,
    cancel: CancellationToken,
    progress: Arc<PrecacheProgress>,
) -> Result<PrecacheSummary, PrecacheError> {
    let total = images.len();
    progress.total.store(total, Ordering::Relaxed);
    info!(total, mode = %config.mode, concurrency = config.concurrency, "Starting precache");

    let mut results = stream::iter(images)
        .map(|image| {
            let puller = puller.clone();
            let cancel = cancel.clone();
            async move {
                let outcome = tokio::select! {
                    _ = cancel.cancelled() => Err(PrecacheError::Cancelled),
                    r = puller.pull(&image) => r,
                };
                (image, outcome)
            }
        })
        .buffer_unordered(config.concurrency.max(1));

    let mut summary = PrecacheSummary::default();
    while let Some((image, outcome)) = results.next().await {
        match outcome {
            Ok(()) => {
                debug!(image = %image, "Image pulled");
                progress.pulled.fetch_add(1, Ordering::Relaxed);
                summary.pulled += 1;
            }
            Err(PrecacheError::Cancelled) => {
                info!(pulled = summary.pulled, total, "Precache cancelled");
                return Err(PrecacheError::Cancelled);
            }
            Err(e) => {
                warn!(image = %image, error = %e, "Failed to pull image");
                progress.failed.fetch_add(1, Ordering::Relaxed);
                if config.mode == PrecacheMode::Strict {
                    return Err(e);
                }
                summary.failures.push((image, e.to_string()));
            }
        }
    }

    if total > 0 && summary.pulled == 0 {
        return Err(PrecacheError::Incomplete {
            failed: summary.failures.len(),
            total,
        });
    }

    info!(pulled = summary.pulled, failed = summary.failures.len(), "Precache finished");
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::puller::MockImagePuller;
    use std::time::Duration;

    fn images(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn failing_on(bad: &'static str) -> MockImagePuller {
        let mut puller = MockImagePuller::new();
        puller.expect_pull().returning(move |image| {
            if image == bad {
                Err(PrecacheError::pull(image, "not found"))
            } else {
                Ok(())
            }
        });
        puller
    }

    #[tokio::test]
    async fn best_effort_collects_failures() {
        let progress = Arc::new(PrecacheProgress::default());
        let summary = precache(
            images(&["a", "b", "c"]),
            Arc::new(failing_on("b")),
            &PrecacheConfig::with_mode(PrecacheMode::BestEffort),
            CancellationToken::new(),
            progress.clone(),
        )
        .await
        .expect("best effort succeeds");

        assert_eq!(summary.pulled, 2);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].0, "b");
        assert!(!summary.is_complete());
        assert_eq!(
            progress.snapshot(),
            ProgressSnapshot {
                total: 3,
                pulled: 2,
                failed: 1
            }
        );
    }

    #[tokio::test]
    async fn best_effort_fails_when_nothing_was_pulled() {
        let mut puller = MockImagePuller::new();
        puller
            .expect_pull()
            .returning(|image| Err(PrecacheError::pull(image, "registry down")));

        let result = precache(
            images(&["a", "b"]),
            Arc::new(puller),
            &PrecacheConfig::default(),
            CancellationToken::new(),
            Arc::new(PrecacheProgress::default()),
        )
        .await;
        assert!(matches!(
            result,
            Err(PrecacheError::Incomplete {
                failed: 2,
                total: 2
            })
        ));
    }

    #[tokio::test]
    async fn strict_stops_at_first_failure() {
        let config = PrecacheConfig {
            mode: PrecacheMode::Strict,
            concurrency: 1,
        };
        let mut puller = MockImagePuller::new();
        puller
            .expect_pull()
            .withf(|image| image == "a")
            .times(1)
            .returning(|_| Ok(()));
        puller
            .expect_pull()
            .withf(|image| image == "b")
            .times(1)
            .returning(|image| Err(PrecacheError::pull(image, "denied")));

        let result = precache(
            images(&["a", "b", "c"]),
            Arc::new(puller),
            &config,
            CancellationToken::new(),
            Arc::new(PrecacheProgress::default()),
        )
        .await;
        assert!(matches!(result, Err(PrecacheError::Pull { image, .. }) if image == "b"));
    }

    #[tokio::test]
    async fn empty_list_is_a_complete_run() {
        let summary = precache(
            Vec::new(),
            Arc::new(MockImagePuller::new()),
            &PrecacheConfig::default(),
            CancellationToken::new(),
            Arc::new(PrecacheProgress::default()),
        )
        .await
        .expect("nothing to do");
        assert!(summary.is_complete());
    }

    struct SlowPuller;

    #[async_trait::async_trait]
    impl ImagePuller for SlowPuller {
        async fn pull(&self, _image: &str) -> Result<(), PrecacheError> {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_in_flight_pulls() {
        let cancel = CancellationToken::new();
        let worker_cancel = cancel.clone();
        let worker = tokio::spawn(async move {
            let config = PrecacheConfig::default();
            precache(
                images(&["a", "b"]),
                Arc::new(SlowPuller),
                &config,
                worker_cancel,
                Arc::new(PrecacheProgress::default()),
            )
            .await
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        let result = worker.await.expect("join");
        assert!(matches!(result, Err(PrecacheError::Cancelled)));
    }
}
