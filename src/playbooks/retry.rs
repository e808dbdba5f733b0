use serde_json::Value as JsonValue;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::ActionError;
use crate::config::RetryDefaults;
use crate::models::RetryConfig;

/// Retry settings for one action after applying engine defaults
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPlan {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_multiplier: f64,
    pub max_backoff: Duration,
}

impl RetryPlan {
    pub fn resolve(config: &RetryConfig, defaults: &RetryDefaults) -> Self {
        let max_attempts = if config.enabled {
            config.max_attempts.unwrap_or(defaults.max_attempts).max(1)
        } else {
            1
        };

        Self {
            max_attempts,
            backoff_base: Duration::from_millis(
                config.backoff_base_ms.unwrap_or(defaults.backoff_base_ms),
            ),
            backoff_multiplier: config
                .backoff_multiplier
                .unwrap_or(defaults.backoff_multiplier)
                .max(1.0),
            max_backoff: Duration::from_millis(
                config.max_backoff_ms.unwrap_or(defaults.max_backoff_ms),
            ),
        }
    }

    /// Delay before retry `n` (1-based): `base * multiplier^(n-1)`, capped
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(63) as i32;
        let millis = self.backoff_base.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Final result of an action after all attempts
#[derive(Debug)]
pub struct RetryOutcome {
    pub result: Result<JsonValue, ActionError>,
    pub attempts: u32,
}

impl RetryOutcome {
    /// Retries beyond the first attempt
    pub fn retry_count(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Runs an action with exponential backoff inside an overall timeout budget.
///
/// Cancellation is observed between attempts only; an attempt already in flight runs until it
/// finishes or the timeout budget drops it.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    defaults: RetryDefaults,
}

impl RetryPolicy {
    pub fn new(defaults: RetryDefaults) -> Self {
        Self { defaults }
    }

    pub fn plan(&self, config: &RetryConfig) -> RetryPlan {
        RetryPlan::resolve(config, &self.defaults)
    }

    pub async fn invoke<F, Fut>(
        &self,
        mut attempt_fn: F,
        config: &RetryConfig,
        budget: Duration,
        cancel: &CancellationToken,
    ) -> RetryOutcome
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<JsonValue, ActionError>>,
    {
        let plan = self.plan(config);
        // None when the budget runs past what the clock can represent
        let deadline = Instant::now().checked_add(budget);
        let remaining = || deadline.map(|d| d.saturating_duration_since(Instant::now()));
        let mut attempts = 0;

        loop {
            let left = remaining();
            if left.is_some_and(|d| d.is_zero()) {
                return RetryOutcome {
                    result: Err(ActionError::Timeout(budget)),
                    attempts,
                };
            }

            attempts += 1;
            let result = match left {
                Some(left) => match timeout(left, attempt_fn(attempts)).await {
                    Ok(result) => result,
                    Err(_) => Err(ActionError::Timeout(budget)),
                },
                None => attempt_fn(attempts).await,
            };

            let err = match result {
                Ok(output) => {
                    return RetryOutcome {
                        result: Ok(output),
                        attempts,
                    }
                }
                Err(err) => err,
            };

            if !err.is_retryable() || attempts >= plan.max_attempts {
                return RetryOutcome {
                    result: Err(err),
                    attempts,
                };
            }

            let delay = plan.backoff(attempts);
            warn!(
                attempt = attempts,
                max_attempts = plan.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Action attempt failed, retrying"
            );

            let pause = remaining().map_or(delay, |left| delay.min(left));
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(attempt = attempts, "Cancellation observed during retry backoff");
                    return RetryOutcome {
                        result: Err(ActionError::Cancelled),
                        attempts,
                    };
                }
                _ = sleep(pause) => {}
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryDefaults::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig::attempts(max_attempts).with_backoff(10, 2.0)
    }

    #[test]
    fn test_backoff_schedule() {
        let plan = RetryPlan::resolve(&fast_retry(5), &RetryDefaults::default());
        assert_eq!(plan.backoff(1), Duration::from_millis(10));
        assert_eq!(plan.backoff(2), Duration::from_millis(20));
        assert_eq!(plan.backoff(3), Duration::from_millis(40));

        let mut capped = fast_retry(10);
        capped.max_backoff_ms = Some(25);
        let plan = RetryPlan::resolve(&capped, &RetryDefaults::default());
        assert_eq!(plan.backoff(4), Duration::from_millis(25));
    }

    #[test]
    fn test_disabled_retry_means_single_attempt() {
        let mut config = fast_retry(5);
        config.enabled = false;
        assert_eq!(RetryPlan::resolve(&config, &RetryDefaults::default()).max_attempts, 1);

        let defaults = RetryPlan::resolve(
            &RetryConfig {
                enabled: true,
                ..Default::default()
            },
            &RetryDefaults::default(),
        );
        assert_eq!(defaults.max_attempts, RetryDefaults::default().max_attempts);
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::default();
        let counter = calls.clone();

        let outcome = policy
            .invoke(
                move |attempt| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if attempt < 3 {
                            Err(ActionError::Failed("transient".to_string()))
                        } else {
                            Ok(json!({"attempt": attempt}))
                        }
                    }
                },
                &fast_retry(3),
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(outcome.result.clone().unwrap(), json!({"attempt": 3}));
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.retry_count(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let outcome = RetryPolicy::default()
            .invoke(
                |_| async { Err(ActionError::Connector("503".to_string())) },
                &fast_retry(2),
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.result.unwrap_err(), ActionError::Connector("503".to_string()));
    }

    #[tokio::test]
    async fn test_invalid_parameters_are_not_retried() {
        let outcome = RetryPolicy::default()
            .invoke(
                |_| async { Err(ActionError::InvalidParameters("ip".to_string())) },
                &fast_retry(5),
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.retry_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_budget_covers_all_attempts() {
        let outcome = RetryPolicy::default()
            .invoke(
                |_| async {
                    sleep(Duration::from_millis(200)).await;
                    Ok(json!({}))
                },
                &fast_retry(3),
                Duration::from_millis(50),
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(outcome.result, Err(ActionError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_backoff() {
        let token = CancellationToken::new();
        let trigger = token.clone();

        let outcome = RetryPolicy::default()
            .invoke(
                move |_| {
                    trigger.cancel();
                    async { Err(ActionError::Failed("down".to_string())) }
                },
                &RetryConfig::attempts(5).with_backoff(60_000, 2.0),
                Duration::from_secs(600),
                &token,
            )
            .await;

        assert_eq!(outcome.result.unwrap_err(), ActionError::Cancelled);
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn test_unbounded_budget_runs_without_deadline() {
        let outcome = RetryPolicy::default()
            .invoke(
                |attempt| async move {
                    if attempt < 2 {
                        Err(ActionError::Timeout(Duration::from_millis(1)))
                    } else {
                        Ok(json!({"attempt": attempt}))
                    }
                },
                &fast_retry(2),
                Duration::from_secs(u64::MAX),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(outcome.result.clone().unwrap(), json!({"attempt": 2}));
        assert_eq!(outcome.retry_count(), 1);
    }
}
