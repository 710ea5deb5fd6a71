//! Classification-aware retry with exponential backoff and jitter.
//!
//! [`RetryExecutor::execute`] wraps one collaborator call. Fatal failures are
//! returned after the first attempt; retryable ones are retried until the
//! policy's attempt ceiling, sleeping between attempts without holding any
//! lock. Each attempt can be bounded by a per-attempt timeout, and the sleep
//! between attempts is abandoned if the session is cancelled.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::command::CommandKind;
use crate::error::{CollaboratorError, ConfigError, FaultKind, PipelineError, is_retryable};
use crate::metrics::BusMetrics;

/// Backoff parameters for one class of collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first (at least 1).
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Draw each delay uniformly from `0..=delay` instead of using it exactly.
    pub jitter: bool,
    /// Deadline applied to every individual attempt.
    pub attempt_timeout_ms: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::database()
    }
}

impl RetryPolicy {
    /// Storage calls: a few patient attempts.
    pub fn database() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            jitter: true,
            attempt_timeout_ms: Some(30_000),
        }
    }

    /// Model calls: slow, expensive; fewer attempts with a long deadline.
    pub fn model() -> Self {
        Self {
            max_attempts: 2,
            initial_delay_ms: 2_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: true,
            attempt_timeout_ms: Some(120_000),
        }
    }

    pub fn retrieval() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            jitter: true,
            attempt_timeout_ms: Some(30_000),
        }
    }

    pub fn tool() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: true,
            attempt_timeout_ms: Some(60_000),
        }
    }

    /// A single attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::database()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_delays(mut self, initial_ms: u64, max_ms: u64) -> Self {
        self.initial_delay_ms = initial_ms;
        self.max_delay_ms = max_ms;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.attempt_timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    /// Un-jittered delay before retry number `retry_index` (0 = the first retry).
    pub fn delay_for(&self, retry_index: u32) -> Duration {
        let exponent = i32::try_from(retry_index).unwrap_or(i32::MAX);
        let base = self.initial_delay_ms as f64 * self.multiplier.powi(exponent);
        let capped = base.min(self.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let secs = rand::thread_rng().gen_range(0.0..=delay.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.attempt_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        let invalid = |message: String| Err(ConfigError::Invalid { message });
        if self.max_attempts == 0 {
            return invalid(format!("retry.{name}.max_attempts must be at least 1"));
        }
        if !(self.multiplier > 1.0) {
            return invalid(format!(
                "retry.{name}.multiplier must be greater than 1, got {}",
                self.multiplier
            ));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return invalid(format!(
                "retry.{name}.max_delay_ms ({}) is below initial_delay_ms ({})",
                self.max_delay_ms, self.initial_delay_ms
            ));
        }
        if self.attempt_timeout_ms == Some(0) {
            return invalid(format!("retry.{name}.attempt_timeout_ms must be positive"));
        }
        Ok(())
    }
}

/// Named policies, one per collaborator class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicies {
    pub database: RetryPolicy,
    pub model: RetryPolicy,
    pub retrieval: RetryPolicy,
    pub tool: RetryPolicy,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self {
            database: RetryPolicy::database(),
            model: RetryPolicy::model(),
            retrieval: RetryPolicy::retrieval(),
            tool: RetryPolicy::tool(),
        }
    }
}

impl RetryPolicies {
    /// The same policy for every collaborator class.
    pub fn uniform(policy: RetryPolicy) -> Self {
        Self {
            database: policy.clone(),
            model: policy.clone(),
            retrieval: policy.clone(),
            tool: policy,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.database.validate("database")?;
        self.model.validate("model")?;
        self.retrieval.validate("retrieval")?;
        self.tool.validate("tool")
    }
}

/// Why [`RetryExecutor::execute`] gave up.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RetryError {
    #[error("fatal failure on attempt {attempts_made}: {error}")]
    Fatal {
        error: CollaboratorError,
        attempts_made: u32,
    },

    #[error("retries exhausted after {attempts_made} attempts: {last}")]
    Exhausted {
        attempts_made: u32,
        last: CollaboratorError,
        history: Vec<CollaboratorError>,
    },

    #[error("cancelled after {attempts_made} attempts")]
    Cancelled {
        attempts_made: u32,
        last: Option<CollaboratorError>,
    },
}

impl RetryError {
    pub fn attempts_made(&self) -> u32 {
        match self {
            RetryError::Fatal { attempts_made, .. }
            | RetryError::Exhausted { attempts_made, .. }
            | RetryError::Cancelled { attempts_made, .. } => *attempts_made,
        }
    }

    /// Attach the stage that was running and convert into a pipeline fault.
    pub fn into_pipeline(self, command_kind: CommandKind, session_id: &str) -> PipelineError {
        match self {
            RetryError::Fatal {
                error,
                attempts_made,
            } => PipelineError::Collaborator {
                command_kind,
                source: error.with_context("attempts_made", attempts_made.to_string()),
            },
            RetryError::Exhausted {
                attempts_made,
                last,
                history,
            } => PipelineError::ExhaustedRetries {
                collaborator: last.collaborator.clone(),
                command_kind,
                attempts_made,
                last,
                history,
            },
            RetryError::Cancelled { .. } => PipelineError::Cancelled {
                session_id: session_id.to_string(),
                stage: command_kind,
            },
        }
    }
}

/// Runs collaborator calls under a [`RetryPolicy`].
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    cancel: Option<CancellationToken>,
    metrics: Option<Arc<BusMetrics>>,
}

impl RetryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Abandon backoff sleeps when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<BusMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Invoke `work` until it succeeds, fails fatally, or runs out of attempts.
    pub async fn execute<T, F, Fut>(
        &self,
        collaborator: &str,
        policy: &RetryPolicy,
        mut work: F,
    ) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CollaboratorError>>,
    {
        let max_attempts = policy.max_attempts.max(1);
        let mut history: Vec<CollaboratorError> = Vec::new();

        for attempt in 1..=max_attempts {
            let result = match policy.attempt_timeout() {
                Some(limit) => match tokio::time::timeout(limit, work()).await {
                    Ok(result) => result,
                    Err(_) => Err(CollaboratorError::timeout(collaborator, limit)),
                },
                None => work().await,
            };

            let err = match result {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(collaborator, attempt, "Call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !is_retryable(err.kind) {
                return Err(RetryError::Fatal {
                    error: err,
                    attempts_made: attempt,
                });
            }
            if attempt == max_attempts {
                return Err(RetryError::Exhausted {
                    attempts_made: attempt,
                    last: err,
                    history,
                });
            }

            let delay = self.backoff(policy, attempt - 1, &err);
            warn!(
                collaborator,
                attempt,
                max_attempts,
                backoff_ms = delay.as_millis() as u64,
                fault_kind = %err.kind,
                error = %err.sanitized_message(),
                "Retrying after transient error"
            );
            if let Some(metrics) = &self.metrics {
                metrics.record_retry();
            }
            history.push(err);

            if !self.sleep(delay).await {
                return Err(RetryError::Cancelled {
                    attempts_made: attempt,
                    last: history.pop(),
                });
            }
        }

        // The loop always returns on the final attempt.
        Err(RetryError::Cancelled {
            attempts_made: max_attempts,
            last: history.pop(),
        })
    }

    /// Policy delay, stretched to honour a server-provided retry hint.
    fn backoff(&self, policy: &RetryPolicy, retry_index: u32, err: &CollaboratorError) -> Duration {
        let computed = policy.jittered(policy.delay_for(retry_index));
        if err.kind != FaultKind::Throttled {
            return computed;
        }
        let hinted = err
            .context
            .get("retry_after_ms")
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or_default();
        computed
            .max(hinted)
            .min(Duration::from_millis(policy.max_delay_ms))
    }

    /// Returns `false` if cancelled before the delay elapsed.
    async fn sleep(&self, delay: Duration) -> bool {
        match &self.cancel {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => false,
                    _ = tokio::time::sleep(delay) => true,
                }
            }
            None => {
                tokio::time::sleep(delay).await;
                true
            }
        }
    }
}
