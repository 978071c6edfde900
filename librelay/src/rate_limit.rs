//! Rate-limit aware wrapper for remote calls
//!
//! Every call to the remote API goes through [`RateLimitedCaller::call`]. A
//! failed attempt is classified by [`RetryPolicy::decide`] into one of three
//! terminal decisions: wait and retry, surface the error to the caller, or
//! abort the whole run. This is the only place in the crate that sleeps.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::error::{RelayError, RemoteError, RemoteResult, Result};

/// What to do when the remote reports quota exhaustion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitPolicy {
    /// Wait (for the reset hint or an exponential backoff) and retry
    #[default]
    Backoff,
    /// Give up on the run right away to save quota for the next one
    Abort,
}

impl FromStr for RateLimitPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "backoff" => Ok(RateLimitPolicy::Backoff),
            "abort" => Ok(RateLimitPolicy::Abort),
            _ => Err(format!(
                "Invalid rate limit policy: '{}'. Valid options: backoff, abort",
                s
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub on_rate_limit: RateLimitPolicy,
    /// Retries allowed after the first attempt
    pub max_retries: u32,
    pub backoff_base: f64,
    pub backoff_cap: Duration,
    /// Added to a reset-hint wait so the retry lands after the window opens
    pub reset_margin: Duration,
    /// Longest reset-hint wait honored; anything further out backs off instead
    pub max_reset_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            on_rate_limit: RateLimitPolicy::Backoff,
            max_retries: 4,
            backoff_base: 2.0,
            backoff_cap: Duration::from_secs(300),
            reset_margin: Duration::from_secs(2),
            max_reset_wait: Duration::from_secs(900),
        }
    }
}

/// Outcome of a failed attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    Retry(Duration),
    Surface,
    AbortRun,
}

impl RetryPolicy {
    /// `min(base^attempt, cap)`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let cap = self.backoff_cap.as_secs_f64();
        let secs = self
            .backoff_base
            .powi(attempt.min(i32::MAX as u32) as i32)
            .min(cap);
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Wait until `reset` plus the margin, or `None` for an implausible hint
    fn reset_wait(&self, reset: i64, now: i64) -> Option<Duration> {
        let until_reset = Duration::from_secs(reset.saturating_sub(now).max(0) as u64);
        if until_reset > self.max_reset_wait {
            warn!(
                "Ignoring rate limit reset {} ({}s away); backing off instead",
                reset,
                until_reset.as_secs()
            );
            return None;
        }
        Some(until_reset + self.reset_margin)
    }

    /// Decide what follows the `attempt`-th failure (1-based)
    ///
    /// `now` is the current unix time, used to turn a reset hint into a wait.
    pub fn decide(&self, attempt: u32, error: &RemoteError, now: i64) -> RetryDecision {
        match error {
            RemoteError::Fatal(_) => RetryDecision::Surface,
            RemoteError::RateLimited { reset_at, .. } => match self.on_rate_limit {
                RateLimitPolicy::Abort => RetryDecision::AbortRun,
                RateLimitPolicy::Backoff if attempt > self.max_retries => RetryDecision::Surface,
                RateLimitPolicy::Backoff => match reset_at {
                    Some(reset) => match self.reset_wait(*reset, now) {
                        Some(wait) => RetryDecision::Retry(wait),
                        None => RetryDecision::Retry(self.backoff(attempt)),
                    },
                    None => RetryDecision::Retry(self.backoff(attempt)),
                },
            },
            RemoteError::Network(_) if attempt > self.max_retries => RetryDecision::Surface,
            RemoteError::Network(_) => RetryDecision::Retry(self.backoff(attempt)),
        }
    }
}

/// Runs remote operations under a [`RetryPolicy`]
///
/// Attempts are strictly sequential; a retry only starts after the previous
/// wait has elapsed.
pub struct RateLimitedCaller {
    policy: RetryPolicy,
    calls: AtomicU32,
    retries: AtomicU32,
}

impl RateLimitedCaller {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            calls: AtomicU32::new(0),
            retries: AtomicU32::new(0),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Remote attempts made so far, retries included
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn retry_count(&self) -> u32 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Invoke `op` until it succeeds or the policy reaches a terminal decision
    ///
    /// # Errors
    ///
    /// - `RelayError::QuotaAbort` when rate limited under the abort policy
    /// - `RelayError::Remote` carrying the last failure otherwise
    pub async fn call<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RemoteResult<T>>,
    {
        let mut attempt = 0;

        loop {
            self.calls.fetch_add(1, Ordering::Relaxed);

            let error = match op().await {
                Ok(value) => {
                    if attempt > 0 {
                        info!("{} succeeded after {} retries", operation, attempt);
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            attempt += 1;
            match self.policy.decide(attempt, &error, Utc::now().timestamp()) {
                RetryDecision::Retry(wait) => {
                    warn!(
                        "{} failed (attempt {}/{}): {}. Retrying in {}",
                        operation,
                        attempt,
                        self.policy.max_retries + 1,
                        error,
                        humantime::format_duration(wait)
                    );
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    sleep(wait).await;
                }
                RetryDecision::AbortRun => {
                    warn!(
                        operation,
                        error = %error,
                        "Rate limited under abort policy, ending run to conserve quota"
                    );
                    return Err(RelayError::QuotaAbort(format!("{}: {}", operation, error)));
                }
                RetryDecision::Surface => {
                    if attempt > 1 {
                        warn!("{} failed after {} attempts: {}", operation, attempt, error);
                    }
                    return Err(RelayError::remote(operation, error));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn rate_limited(reset_at: Option<i64>) -> RemoteError {
        RemoteError::RateLimited {
            reset_at,
            diagnostics: "x-rate-limit-remaining=0".to_string(),
        }
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("backoff".parse::<RateLimitPolicy>().unwrap(), RateLimitPolicy::Backoff);
        assert_eq!(" ABORT ".parse::<RateLimitPolicy>().unwrap(), RateLimitPolicy::Abort);
        assert!("sometimes".parse::<RateLimitPolicy>().is_err());
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(8));
        assert_eq!(policy.backoff(9), Duration::from_secs(300));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn test_decide_fatal_surfaces_immediately() {
        let policy = RetryPolicy::default();
        let decision = policy.decide(1, &RemoteError::Fatal("401".to_string()), 0);
        assert_eq!(decision, RetryDecision::Surface);
    }

    #[test]
    fn test_decide_network_retries_then_surfaces() {
        let policy = RetryPolicy::default();
        let err = RemoteError::Network("reset".to_string());
        assert_eq!(policy.decide(1, &err, 0), RetryDecision::Retry(Duration::from_secs(2)));
        assert_eq!(policy.decide(4, &err, 0), RetryDecision::Retry(Duration::from_secs(16)));
        assert_eq!(policy.decide(5, &err, 0), RetryDecision::Surface);
    }

    #[test]
    fn test_decide_rate_limit_uses_reset_hint() {
        let policy = RetryPolicy::default();
        let decision = policy.decide(1, &rate_limited(Some(1_000_060)), 1_000_000);
        assert_eq!(decision, RetryDecision::Retry(Duration::from_secs(62)));
    }

    #[test]
    fn test_decide_rate_limit_reset_in_past() {
        let policy = RetryPolicy::default();
        let decision = policy.decide(1, &rate_limited(Some(999_000)), 1_000_000);
        assert_eq!(decision, RetryDecision::Retry(Duration::from_secs(2)));
    }

    #[test]
    fn test_decide_rate_limit_extreme_past_hint_does_not_overflow() {
        let policy = RetryPolicy::default();
        let decision = policy.decide(1, &rate_limited(Some(i64::MIN)), 1_700_000_000);
        assert_eq!(decision, RetryDecision::Retry(Duration::from_secs(2)));
    }

    #[test]
    fn test_decide_rate_limit_far_future_hint_backs_off() {
        let policy = RetryPolicy::default();
        let now = 1_700_000_000;

        let decision = policy.decide(1, &rate_limited(Some(i64::MAX)), now);
        assert_eq!(decision, RetryDecision::Retry(policy.backoff(1)));

        let decision = policy.decide(3, &rate_limited(Some(now + 86_400)), now);
        assert_eq!(decision, RetryDecision::Retry(Duration::from_secs(8)));

        // Right at the ceiling the hint is still honored
        let decision = policy.decide(1, &rate_limited(Some(now + 900)), now);
        assert_eq!(decision, RetryDecision::Retry(Duration::from_secs(902)));
    }

    #[test]
    fn test_decide_rate_limit_without_hint_backs_off() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.decide(2, &rate_limited(None), 0),
            RetryDecision::Retry(Duration::from_secs(4))
        );
        assert_eq!(policy.decide(5, &rate_limited(None), 0), RetryDecision::Surface);
    }

    #[test]
    fn test_decide_rate_limit_abort_policy() {
        let policy = RetryPolicy {
            on_rate_limit: RateLimitPolicy::Abort,
            ..Default::default()
        };
        assert_eq!(policy.decide(1, &rate_limited(Some(0)), 0), RetryDecision::AbortRun);
        // Abort only concerns quota; transport errors still back off
        assert_eq!(
            policy.decide(1, &RemoteError::Network("x".to_string()), 0),
            RetryDecision::Retry(Duration::from_secs(2))
        );
    }

    #[test]
    fn test_caller_exposes_policy() {
        let caller = RateLimitedCaller::new(RetryPolicy {
            on_rate_limit: RateLimitPolicy::Abort,
            max_retries: 1,
            ..Default::default()
        });
        assert_eq!(caller.policy().on_rate_limit, RateLimitPolicy::Abort);
        assert_eq!(caller.policy().max_retries, 1);
        assert_eq!(caller.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_retries_network_errors() {
        let caller = RateLimitedCaller::new(RetryPolicy::default());
        let failures = Mutex::new(2);

        let result = caller
            .call("list_recent_posts", || {
                let mut left = failures.lock().unwrap();
                let outcome = if *left > 0 {
                    *left -= 1;
                    Err(RemoteError::Network("connection reset".to_string()))
                } else {
                    Ok(42)
                };
                async move { outcome }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(caller.call_count(), 3);
        assert_eq!(caller.retry_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_surfaces_after_retry_ceiling() {
        let caller = RateLimitedCaller::new(RetryPolicy {
            max_retries: 2,
            ..Default::default()
        });

        let result: Result<()> = caller
            .call("upload_media", || async {
                Err(RemoteError::RateLimited {
                    reset_at: None,
                    diagnostics: "429".to_string(),
                })
            })
            .await;

        match result {
            Err(RelayError::Remote { operation, source }) => {
                assert_eq!(operation, "upload_media");
                assert!(matches!(source, RemoteError::RateLimited { .. }));
            }
            other => panic!("Expected surfaced remote error, got {:?}", other),
        }
        assert_eq!(caller.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_abort_policy_does_not_retry() {
        let caller = RateLimitedCaller::new(RetryPolicy {
            on_rate_limit: RateLimitPolicy::Abort,
            ..Default::default()
        });

        let result: Result<()> = caller
            .call("list_recent_posts", || async {
                Err(RemoteError::RateLimited {
                    reset_at: Some(0),
                    diagnostics: "x-rate-limit-remaining=0".to_string(),
                })
            })
            .await;

        assert!(result.unwrap_err().is_quota_abort());
        assert_eq!(caller.call_count(), 1);
        assert_eq!(caller.retry_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_fatal_is_not_retried() {
        let caller = RateLimitedCaller::new(RetryPolicy::default());

        let result: Result<()> = caller
            .call("publish", || async { Err(RemoteError::Fatal("HTTP 403".to_string())) })
            .await;

        assert!(matches!(result, Err(RelayError::Remote { .. })));
        assert_eq!(caller.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_waits_for_backoff() {
        let caller = RateLimitedCaller::new(RetryPolicy::default());
        let failed_once = Mutex::new(false);
        let start = tokio::time::Instant::now();

        caller
            .call("resolve_user_id", || {
                let mut failed = failed_once.lock().unwrap();
                let outcome = if *failed {
                    Ok(())
                } else {
                    *failed = true;
                    Err(RemoteError::Network("timeout".to_string()))
                };
                async move { outcome }
            })
            .await
            .unwrap();

        assert!(start.elapsed() >= Duration::from_secs(2));
    }
}
