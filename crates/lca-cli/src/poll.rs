//! Timeout-bounded polling

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use lca_common::{Error, Result};

/// Result type for polling check functions.
///
/// - `Ok(Some(value))` - Condition met, return the value
/// - `Ok(None)` - Condition not met yet, keep polling
/// - `Err(e)` - Fatal error, stop polling immediately
pub type PollResult<T> = Result<Option<T>>;

/// Poll `check_fn` every `interval` until it yields a value, fails, or
/// `timeout` has elapsed.
pub async fn wait_with_timeout<T, F, Fut>(
    timeout: Duration,
    interval: Duration,
    description: &str,
    mut check_fn: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PollResult<T>>,
{
    let start = Instant::now();

    loop {
        if start.elapsed() > timeout {
            return Err(Error::internal_with_context(
                "wait",
                format!("timeout waiting for {description}"),
            ));
        }

        match check_fn().await? {
            Some(value) => return Ok(value),
            None => {
                debug!("Waiting for {}...", description);
                tokio::time::sleep(interval).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn returns_once_condition_holds() {
        let calls = AtomicU32::new(0);
        let value = wait_with_timeout(
            Duration::from_secs(60),
            Duration::from_secs(10),
            "third call",
            || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok((n == 3).then_some(n))
            },
        )
        .await
        .expect("condition met");
        assert_eq!(value, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_timeout() {
        let result: Result<()> = wait_with_timeout(
            Duration::from_secs(30),
            Duration::from_secs(10),
            "never",
            || async { Ok(None) },
        )
        .await;
        let err = result.expect_err("timed out");
        assert!(err.to_string().contains("timeout waiting for never"));
    }

    #[tokio::test(start_paused = true)]
    async fn check_errors_stop_polling() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = wait_with_timeout(
            Duration::from_secs(60),
            Duration::from_secs(1),
            "broken",
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::query("api down"))
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
