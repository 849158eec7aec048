//! Bounded retry with a total deadline.
//!
//! A retryable failure gets reissued as a brand new request (fresh id,
//! the server sees a new logical request). Cancellation always wins over
//! a pending backoff sleep, and the total deadline wins over the
//! remaining attempt budget.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tracing::warn;

use crate::error::ClientError;

pub const RETRY_INITIAL_DELAY_MS: u64 = 150;
pub const RETRY_BACKOFF_FACTOR: u64 = 2;
pub const RETRY_MAX_DELAY_MS: u64 = 2_000;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_REQUEST_DEADLINE: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Total wall-clock budget across all attempts and backoff sleeps.
    pub deadline: Duration,
    pub initial_delay_ms: u64,
    pub backoff_factor: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            deadline: DEFAULT_REQUEST_DEADLINE,
            initial_delay_ms: RETRY_INITIAL_DELAY_MS,
            backoff_factor: RETRY_BACKOFF_FACTOR,
            max_delay_ms: RETRY_MAX_DELAY_MS,
        }
    }
}

impl RetryPolicy {
    /// Backoff before the retry following `attempt` (1-based):
    /// `initial * factor^(attempt-1)`, capped.
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let exp = self.backoff_factor.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay_ms
            .saturating_mul(exp)
            .min(self.max_delay_ms)
    }
}

// ---------------------------------------------------------------------------
// IsRetryable trait
// ---------------------------------------------------------------------------

/// Implemented by error types so the retry loop knows whether to retry.
/// Returns `Some(reason)` when the error is transient, `None` otherwise.
pub trait IsRetryable {
    fn is_retryable(&self) -> Option<String>;
}

// ---------------------------------------------------------------------------
// CancellationToken
// ---------------------------------------------------------------------------

/// Cancels an in-flight request and any pending retry sleep.
#[derive(Debug)]
pub struct CancellationToken {
    tx: watch::Sender<bool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    pub(crate) fn watch(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves once the token fires. If the token side is gone the request
/// can no longer be cancelled, so the future never resolves.
pub(crate) async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Sleep for `ms` milliseconds. Returns true if the sleep was cut short
/// by cancellation.
pub(crate) async fn sleep_cancellable(ms: u64, cancel: Option<watch::Receiver<bool>>) -> bool {
    let duration = Duration::from_millis(ms);
    let Some(mut cancel) = cancel else {
        tokio::time::sleep(duration).await;
        return false;
    };
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = wait_cancelled(&mut cancel) => true,
    }
}

// ---------------------------------------------------------------------------
// with_retry
// ---------------------------------------------------------------------------

/// Run `f` up to `policy.max_attempts` times under `policy.deadline`.
///
/// Retries only when the error reports itself retryable; the deadline
/// expiring surfaces as `Timeout` no matter how many attempts remain.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: Option<watch::Receiver<bool>>,
    mut f: F,
) -> Result<T, ClientError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ClientError>>,
{
    let attempts = async {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match f().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if attempt >= policy.max_attempts {
                        return Err(error);
                    }
                    let Some(reason) = error.is_retryable() else {
                        return Err(error);
                    };
                    let delay_ms = policy.delay_ms(attempt);
                    warn!(
                        attempt,
                        max = policy.max_attempts,
                        delay_ms,
                        reason = %reason,
                        "retrying after transient error"
                    );
                    if sleep_cancellable(delay_ms, cancel.clone()).await {
                        return Err(ClientError::Cancelled);
                    }
                }
            }
        }
    };

    match tokio::time::timeout(policy.deadline, attempts).await {
        Ok(result) => result,
        Err(_) => Err(ClientError::Timeout),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
