//! Retry wrapper around stage execution.

use std::time::Duration;

use futures::future::BoxFuture;
#[cfg(test)]
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{DtsError, Result};

/// Maximum retries of one stage execution.
pub const MAX_RETRIES: u32 = 3;
/// First backoff delay; doubles per attempt (500 ms, 1 s, 2 s).
pub const BASE_DELAY: Duration = Duration::from_millis(500);

/// Substrings that mark an error as transient.
const RETRY_HINTS: [&str; 4] = [
    "timeout",
    "temporarily",
    "connection refused",
    "deadlock detected",
];

/// Classify an error as retryable by its message text.
pub fn is_retryable(err: &DtsError) -> bool {
    if matches!(err, DtsError::Cancelled) {
        return false;
    }
    let msg = err.to_string().to_lowercase();
    RETRY_HINTS.iter().any(|hint| msg.contains(hint))
}

/// Run `op` against `ctx` with exponential backoff: up to `max_retries`
/// retries, delays of `base_delay * 2^attempt`. Cancellation aborts the
/// backoff immediately and non-retryable errors are returned as-is.
///
/// The operation borrows `ctx` mutably for each attempt, which lets the
/// stage executor retry without giving up ownership of its runtime state.
pub async fn with_retry<C, T>(
    cancel: &CancellationToken,
    max_retries: u32,
    base_delay: Duration,
    ctx: &mut C,
    mut op: impl for<'a> FnMut(&'a mut C) -> BoxFuture<'a, Result<T>>,
) -> Result<T> {
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(DtsError::Cancelled);
        }
        match op(ctx).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if !is_retryable(&e) || attempt >= max_retries {
                    return Err(e);
                }
                let delay = base_delay * 2u32.saturating_pow(attempt);
                warn!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retrying after transient error"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(DtsError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classifier_matches_hints() {
        for msg in [
            "connection timeout while reading",
            "resource temporarily unavailable",
            "Connection refused (os error 111)",
            "ERROR: deadlock detected",
        ] {
            assert!(
                is_retryable(&DtsError::Replication(msg.to_string())),
                "{msg} should be retryable"
            );
        }
    }

    #[test]
    fn test_classifier_rejects_other_errors() {
        assert!(!is_retryable(&DtsError::Validation("bad input".into())));
        assert!(!is_retryable(&DtsError::Precondition(
            "wal_level must be logical".into()
        )));
        assert!(!is_retryable(&DtsError::Cancelled));
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let cancel = CancellationToken::new();
        let mut calls = 0u32;
        let result = with_retry(&cancel, 3, Duration::from_millis(1), &mut calls, |calls| {
            async move {
                *calls += 1;
                if *calls < 3 {
                    Err(DtsError::Replication("timeout".into()))
                } else {
                    Ok(*calls)
                }
            }
            .boxed()
        })
        .await
        .unwrap();
        assert_eq!(result, 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_fast() {
        let cancel = CancellationToken::new();
        let mut calls = 0u32;
        let result: Result<()> =
            with_retry(&cancel, 3, Duration::from_millis(1), &mut calls, |calls| {
                async move {
                    *calls += 1;
                    Err(DtsError::Validation("nope".into()))
                }
                .boxed()
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_error() {
        let cancel = CancellationToken::new();
        let mut calls = 0u32;
        let result: Result<()> =
            with_retry(&cancel, 2, Duration::from_millis(1), &mut calls, |calls| {
                async move {
                    *calls += 1;
                    Err(DtsError::Replication("timeout".into()))
                }
                .boxed()
            })
            .await;
        assert!(result.is_err());
        // initial attempt + 2 retries
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_cancellation_aborts() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut calls = 0u32;
        let result: Result<()> =
            with_retry(&cancel, 3, Duration::from_millis(1), &mut calls, |calls| {
                async move {
                    *calls += 1;
                    Ok(())
                }
                .boxed()
            })
            .await;
        assert!(matches!(result, Err(DtsError::Cancelled)));
        assert_eq!(calls, 0);
    }
}
