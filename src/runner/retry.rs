use crate::config::RetryConfig;
use crate::error::StepError;
use crate::plan::StepResult;
use futures::future::BoxFuture;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use super::backoff::delay_duration;
use super::context::StepContext;

/// Where one step execution stands inside the retry loop
#[derive(Debug)]
pub enum AttemptState {
    Attempting(u32),
    Succeeded(StepResult),
    FailedRetryable { attempt: u32, error: StepError },
    FailedTerminal(StepError),
}

/// Retries agent calls with backoff between attempts
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    attempt_timeout: Option<Duration>,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            attempt_timeout: None,
        }
    }

    /// Bound every attempt; an attempt that runs over fails with
    /// [`StepError::Timeout`] and is retried like any other failure.
    pub fn with_timeout(mut self, limit: Duration) -> Self {
        self.attempt_timeout = Some(limit);
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        delay_duration(attempt, &self.config)
    }

    /// Whether a failed `attempt` gets another try. Every error kind is
    /// retried; only the budget decides.
    pub fn should_retry(&self, attempt: u32, max_retries: u32, _error: &StepError) -> bool {
        attempt <= max_retries
    }

    /// Run `call` until it succeeds or `max_retries` retries are used up.
    ///
    /// `ctx` is shared by all attempts and is never reset. On success the
    /// result carries `attempt`, `retry_count` and `retry_successful`; on
    /// failure the last error is returned.
    pub async fn execute_with_retry<F>(
        &self,
        max_retries: u32,
        ctx: &mut StepContext,
        mut call: F,
    ) -> Result<StepResult, StepError>
    where
        F: for<'c> FnMut(&'c mut StepContext) -> BoxFuture<'c, Result<StepResult, StepError>>,
    {
        let first_attempt = ctx.retry.attempt + 1;
        let mut state = AttemptState::Attempting(first_attempt);

        loop {
            state = match state {
                AttemptState::Attempting(attempt) => {
                    ctx.retry.attempt = attempt;
                    let started = Instant::now();
                    match self.attempt(ctx, &mut call).await {
                        Ok(mut result) => {
                            let retries = attempt - first_attempt;
                            result.attempt = attempt;
                            result.retry_count = retries;
                            result.retry_successful = retries > 0;
                            if result.elapsed_ms == 0 {
                                result.elapsed_ms = started.elapsed().as_millis() as u64;
                            }
                            AttemptState::Succeeded(result)
                        }
                        Err(error) => {
                            ctx.retry.last_error = Some(error.to_string());
                            let used = attempt - first_attempt + 1;
                            if self.should_retry(used, max_retries, &error) {
                                AttemptState::FailedRetryable { attempt, error }
                            } else {
                                AttemptState::FailedTerminal(error)
                            }
                        }
                    }
                }
                AttemptState::FailedRetryable { attempt, error } => {
                    let used = attempt - first_attempt + 1;
                    let delay = self.calculate_delay(used);
                    warn!(
                        "Step {} attempt {} failed: {}. Retrying in {:?}...",
                        ctx.step_id, attempt, error, delay
                    );
                    if let Some(bus) = ctx.events() {
                        bus.step_retrying(
                            &ctx.plan_id,
                            &ctx.step_id,
                            attempt + 1,
                            delay.as_millis() as u64,
                            &error.to_string(),
                        );
                    }
                    sleep(delay).await;
                    ctx.retry.total_delay_ms += delay.as_millis() as u64;
                    AttemptState::Attempting(attempt + 1)
                }
                AttemptState::Succeeded(result) => return Ok(result),
                AttemptState::FailedTerminal(error) => {
                    warn!(
                        "Step {} failed after {} attempts: {}",
                        ctx.step_id,
                        ctx.retry.attempt - first_attempt + 1,
                        error
                    );
                    return Err(error);
                }
            };
        }
    }

    async fn attempt<F>(&self, ctx: &mut StepContext, call: &mut F) -> Result<StepResult, StepError>
    where
        F: for<'c> FnMut(&'c mut StepContext) -> BoxFuture<'c, Result<StepResult, StepError>>,
    {
        debug!("Step {} attempt {}", ctx.step_id, ctx.retry.attempt);
        match self.attempt_timeout {
            Some(limit) => timeout(limit, call(ctx))
                .await
                .unwrap_or(Err(StepError::Timeout(limit))),
            None => call(ctx).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AgentError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            base_delay: 0.001,
            max_delay: 0.01,
            jitter: false,
            ..RetryConfig::default()
        })
    }

    fn failure(msg: &str) -> StepError {
        StepError::Execution(AgentError::Failed(msg.to_string()))
    }

    #[tokio::test]
    async fn test_retry_success_first_attempt() {
        let mut ctx = StepContext::new("p", "s");
        let result = fast_policy()
            .execute_with_retry(3, &mut ctx, |_| {
                Box::pin(async { Ok::<_, StepError>(StepResult::success(0.9)) })
            })
            .await
            .unwrap();

        assert_eq!(result.attempt, 1);
        assert_eq!(result.retry_count, 0);
        assert!(!result.retry_successful);
    }

    #[tokio::test]
    async fn test_retry_all_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut ctx = StepContext::new("p", "s");

        let err = fast_policy()
            .execute_with_retry(2, &mut ctx, move |ctx| {
                let counter = counter.clone();
                Box::pin(async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    Err::<StepResult, _>(failure(&format!(
                        "failure {} at attempt {}",
                        n, ctx.retry.attempt
                    )))
                })
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err, failure("failure 3 at attempt 3"));
        assert_eq!(ctx.retry.last_error, Some(err.to_string()));
    }

    #[tokio::test]
    async fn test_retry_success_after_one_failure() {
        let mut ctx = StepContext::new("p", "s");
        let result = fast_policy()
            .execute_with_retry(2, &mut ctx, |ctx| {
                Box::pin(async move {
                    if ctx.retry.attempt == 1 {
                        Err(failure("transient"))
                    } else {
                        Ok(StepResult::success(0.8))
                    }
                })
            })
            .await
            .unwrap();

        assert_eq!(result.retry_count, 1);
        assert!(result.retry_successful);
        assert_eq!(result.attempt, 2);
    }

    #[tokio::test]
    async fn test_context_survives_failed_attempts() {
        let mut ctx = StepContext::new("p", "s");
        let result = fast_policy()
            .execute_with_retry(3, &mut ctx, |ctx| {
                Box::pin(async move {
                    ctx.notes.push(format!("attempt {}", ctx.retry.attempt));
                    if ctx.notes.len() < 3 {
                        Err(failure("not yet"))
                    } else {
                        Ok(StepResult::success(1.0).with_payload("seen", ctx.notes.len()))
                    }
                })
            })
            .await
            .unwrap();

        assert_eq!(result.payload["seen"], 3);
        assert_eq!(ctx.notes, vec!["attempt 1", "attempt 2", "attempt 3"]);
        assert!(ctx.retry.total_delay_ms <= 20);
    }

    #[tokio::test]
    async fn test_timeout_is_retried() {
        let mut ctx = StepContext::new("p", "s");
        let policy = fast_policy().with_timeout(Duration::from_millis(20));
        let result = policy
            .execute_with_retry(1, &mut ctx, |ctx| {
                Box::pin(async move {
                    if ctx.retry.attempt == 1 {
                        sleep(Duration::from_secs(5)).await;
                    }
                    Ok::<_, StepError>(StepResult::success(1.0))
                })
            })
            .await
            .unwrap();

        assert_eq!(result.retry_count, 1);
        assert!(ctx
            .retry
            .last_error
            .as_deref()
            .unwrap()
            .contains("timed out"));
    }

    #[tokio::test]
    async fn test_zero_retries_fails_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut ctx = StepContext::new("p", "s");
        let result = fast_policy()
            .execute_with_retry(0, &mut ctx, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Err::<StepResult, _>(failure("nope")) })
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_should_retry_ignores_error_kind() {
        let policy = fast_policy();
        assert!(policy.should_retry(1, 2, &StepError::Timeout(Duration::from_secs(1))));
        assert!(policy.should_retry(2, 2, &failure("x")));
        assert!(!policy.should_retry(3, 2, &failure("x")));
    }
}
