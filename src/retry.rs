//! Bounded retry policies shared by the HTTP client and browser navigation.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::{BrowserError, MatchError, ScrapeError};

/// Max attempts plus an explicit backoff schedule. Attempts past the end of
/// the schedule reuse its last entry.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Vec<Duration>,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, backoff: Vec<Duration>) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Single attempt, no waiting.
    pub fn none() -> Self {
        Self::fixed(1, Vec::new())
    }

    /// Delay before retry number `attempt` (1-based: the wait after the first failure is `delay_for(1)`).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if self.backoff.is_empty() || attempt == 0 {
            return Duration::ZERO;
        }
        let idx = (attempt as usize - 1).min(self.backoff.len() - 1);
        self.backoff[idx]
    }
}

/// Errors that know whether another attempt is worthwhile.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for ScrapeError {
    fn is_transient(&self) -> bool {
        ScrapeError::is_transient(self)
    }
}

impl Transient for BrowserError {
    fn is_transient(&self) -> bool {
        BrowserError::is_transient(self)
    }
}

impl Transient for MatchError {
    fn is_transient(&self) -> bool {
        match self {
            MatchError::Provider(e) => is_retryable_http(e),
            MatchError::ProviderStatus { status, .. } => matches!(status, 429 | 500..=599),
            _ => false,
        }
    }
}

/// Runs `op` until it succeeds, fails permanently, or the policy is exhausted.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T, E>
where
    E: Transient + std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(what, attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Status codes and network failures worth another attempt.
pub fn is_retryable_http(error: &reqwest::Error) -> bool {
    if let Some(status) = error.status() {
        matches!(status.as_u16(), 408 | 425 | 429 | 500..=599)
    } else {
        error.is_timeout() || error.is_connect() || error.is_request()
    }
}
