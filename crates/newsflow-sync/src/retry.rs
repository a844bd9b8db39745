//! Per-stage retry policy.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use newsflow_core::StageError;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extract,
    Normalize,
    Classify,
    SchemaGuard,
    Persist,
}

impl Stage {
    pub const ORDER: [Stage; 5] = [
        Self::Extract,
        Self::Normalize,
        Self::Classify,
        Self::SchemaGuard,
        Self::Persist,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Extract => "extract",
            Self::Normalize => "normalize",
            Self::Classify => "classify",
            Self::SchemaGuard => "schema_guard",
            Self::Persist => "persist",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How many times a stage may run and how long to wait between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::with_retries(1, Duration::from_secs(60))
    }
}

impl RetryPolicy {
    pub fn with_retries(retries: u32, backoff_delay: Duration) -> Self {
        Self {
            max_attempts: retries.saturating_add(1),
            backoff_delay,
        }
    }

    pub fn no_retry() -> Self {
        Self::with_retries(0, Duration::ZERO)
    }
}

/// A stage that exhausted its attempts (or hit a non-retryable error).
#[derive(Debug, Error)]
#[error("stage {stage} failed after {attempts} attempt(s): {error}")]
pub struct RunError {
    pub stage: Stage,
    pub attempts: u32,
    #[source]
    pub error: StageError,
}

#[derive(Debug)]
pub struct StageOutput<T> {
    pub value: T,
    pub attempts: u32,
}

/// Run `operation` as one whole stage, re-executing it from scratch on failure.
pub async fn run_stage<T, F, Fut>(
    stage: Stage,
    policy: RetryPolicy,
    mut operation: F,
) -> Result<StageOutput<T>, RunError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StageError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        debug!(%stage, attempt, max_attempts, "stage attempt starting");
        match operation().await {
            Ok(value) => {
                return Ok(StageOutput {
                    value,
                    attempts: attempt,
                })
            }
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                warn!(
                    %stage,
                    attempt,
                    max_attempts,
                    delay_ms = policy.backoff_delay.as_millis() as u64,
                    error = %err,
                    "stage failed; retrying after backoff"
                );
                tokio::time::sleep(policy.backoff_delay).await;
            }
            Err(err) => {
                error!(%stage, attempt, max_attempts, kind = err.kind(), error = %err, "stage failed");
                return Err(RunError {
                    stage,
                    attempts: attempt,
                    error: err,
                });
            }
        }
    }
}
