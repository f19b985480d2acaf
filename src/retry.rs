//! Bounded auto-retry for provider and network transients.
//!
//! Only codes for which [`ErrorCode::is_transient`] holds are retried. Back-off doubles from
//! `base_delay_ms` up to `max_delay_ms`; a provider `Retry-After` hint replaces the computed delay
//! (still capped). The provider and model are never switched between attempts.

use crate::agent::CancelToken;
use crate::error::{ErrorCode, ErrorInfo, Phase};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    8_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, where `attempt` starts at 1.
    pub fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let cap = Duration::from_millis(self.max_delay_ms);
        if let Some(hint) = hint {
            return hint.min(cap);
        }
        let exponent = attempt.saturating_sub(1).min(32);
        let millis = self.base_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(millis).min(cap)
    }

    pub fn should_retry(&self, attempt: u32, code: ErrorCode) -> bool {
        code.is_transient() && attempt < self.max_attempts
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or attempts run out.
///
/// `op` receives the 1-based attempt number. Back-off sleeps end early with `USER_CANCELED` when
/// `cancel` fires.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: Option<&CancelToken>,
    phase: Phase,
    mut op: F,
) -> Result<T, ErrorInfo>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ErrorInfo>>,
{
    let mut attempt = 1;
    loop {
        let err = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if !policy.should_retry(attempt, err.code()) {
            if attempt > 1 {
                warn!(attempts = attempt, code = %err.code(), "Retries exhausted");
            }
            return Err(err);
        }

        let delay = policy.delay_for(attempt, err.retry_after());
        debug!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            code = %err.code(),
            "Retry scheduled"
        );
        match cancel {
            Some(token) => {
                tokio::select! {
                    _ = token.canceled() => return Err(ErrorInfo::canceled(phase)),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            None => tokio::time::sleep(delay).await,
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 4,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 300,
        };
        assert_eq!(policy.delay_for(1, None), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2, None), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3, None), Duration::from_millis(300));
        assert_eq!(
            policy.delay_for(1, Some(Duration::from_secs(10))),
            Duration::from_millis(300)
        );
        assert_eq!(
            policy.delay_for(1, Some(Duration::from_millis(50))),
            Duration::from_millis(50)
        );
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let calls = Arc::new(Mutex::new(0u32));
        let result = with_retry(&fast(), None, Phase::Workshop, |_| {
            let calls = calls.clone();
            async move {
                let mut n = calls.lock();
                *n += 1;
                if *n < 3 {
                    Err(ErrorInfo::new(
                        ErrorCode::ProviderUnavailable,
                        Phase::Workshop,
                        "busy",
                    ))
                } else {
                    Ok("ok")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(*calls.lock(), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_error() {
        let calls = Arc::new(Mutex::new(0u32));
        let err = with_retry(&fast(), None, Phase::Workshop, |attempt| {
            let calls = calls.clone();
            async move {
                *calls.lock() += 1;
                Err::<(), _>(ErrorInfo::new(
                    ErrorCode::NetworkUnavailable,
                    Phase::Workshop,
                    format!("attempt {attempt}"),
                ))
            }
        })
        .await
        .unwrap_err();
        assert_eq!(*calls.lock(), 3);
        assert_eq!(err.detail, "attempt 3");
    }

    #[tokio::test]
    async fn test_non_transient_errors_fail_fast() {
        let calls = Arc::new(Mutex::new(0u32));
        let err = with_retry(&fast(), None, Phase::Workshop, |_| {
            let calls = calls.clone();
            async move {
                *calls.lock() += 1;
                Err::<(), _>(ErrorInfo::new(
                    ErrorCode::ProviderAuthFailed,
                    Phase::Workshop,
                    "bad key",
                ))
            }
        })
        .await
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProviderAuthFailed);
        assert_eq!(*calls.lock(), 1);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 60_000,
            max_delay_ms: 60_000,
        };
        let token = CancelToken::new();
        token.cancel();
        let err = with_retry(&policy, Some(&token), Phase::Workshop, |_| async {
            Err::<(), _>(ErrorInfo::new(
                ErrorCode::ProviderUnavailable,
                Phase::Workshop,
                "busy",
            ))
        })
        .await
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::UserCanceled);
    }
}
