use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::RetryConfig;
use crate::metrics::Metrics;

/// Errors that may succeed on a later attempt.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

/// Top-level failure taxonomy of the block pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("transient I/O failure: {0}")]
    TransientIo(String),
    #[error("invalid block data: {0}")]
    Validation(#[from] crate::core::normalize::ValidationError),
    #[error("reorg of depth {depth} detected at height {height}, resuming from {resume_height}")]
    ReorgDetected {
        height: u64,
        depth: u64,
        resume_height: u64,
    },
    #[error("processor {processor} failed: {message}")]
    ProcessorFailure { processor: String, message: String },
    #[error("persistence failed: {0}")]
    PersistenceFailure(String),
}

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    Exhausted {
        operation: String,
        attempts: u32,
        last_error: String,
    },
    #[error("{operation} failed with a non-retryable error: {last_error}")]
    Aborted {
        operation: String,
        last_error: String,
    },
}

/// Retry/backoff and failure bookkeeping shared by the pipeline components.
#[derive(Debug)]
pub struct ErrorHandler {
    max_retries: u32,
    base_delay: Duration,
    metrics: Arc<Metrics>,
}

impl ErrorHandler {
    pub fn new(config: &RetryConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            max_retries: config.max_retries.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            metrics,
        }
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Backoff before the retry following zero-based `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }

    /// Run `operation` up to `max_retries` times, sleeping `base_delay * 2^attempt`
    /// between attempts. Non-transient errors are returned without retrying.
    pub async fn retry_with_backoff<F, Fut, T, E>(
        &self,
        mut operation: F,
        name: &str,
        correlation_id: &str,
    ) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display + Transient,
    {
        let mut attempt: u32 = 0;
        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        info!(%correlation_id, operation = name, attempts = attempt + 1, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => {
                    self.metrics.record_retry(name);
                    if !e.is_transient() {
                        error!(%correlation_id, operation = name, attempt = attempt + 1, "non-retryable error: {e}");
                        return Err(RetryError::Aborted {
                            operation: name.to_string(),
                            last_error: e.to_string(),
                        });
                    }
                    if attempt + 1 >= self.max_retries {
                        error!(%correlation_id, operation = name, attempts = self.max_retries, "giving up: {e}");
                        return Err(RetryError::Exhausted {
                            operation: name.to_string(),
                            attempts: self.max_retries,
                            last_error: e.to_string(),
                        });
                    }
                    let delay = self.delay_for(attempt);
                    warn!(
                        %correlation_id,
                        operation = name,
                        attempt = attempt + 1,
                        max = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "attempt failed: {e}"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Log a processor failure and count it. Never fails.
    pub fn handle_processor_error(
        &self,
        processor: &str,
        block_height: u64,
        correlation_id: &str,
        error_type: &str,
        message: &str,
    ) {
        error!(
            %correlation_id,
            processor,
            height = block_height,
            error_type,
            "{message}"
        );
        self.metrics.record_processor_error(processor, error_type);
    }
}
