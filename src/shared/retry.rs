//! Timeout, retry and cancellation around external service calls
//!
//! Every suspension point of a run goes through [`call_with_policy`], which
//! makes it the single place where the run's cancellation token and per-call
//! deadlines are honored.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{OcrServiceConfig, VisionServiceConfig};
use crate::error::{PipelineError, Result};

/// How one external service is called
#[derive(Debug, Clone)]
pub struct CallPolicy {
    pub service: &'static str,
    pub timeout: Duration,
    /// Additional attempts after the first
    pub max_retries: u32,
    /// Delay before the first retry, doubled per attempt
    pub backoff: Duration,
}

impl CallPolicy {
    pub fn for_ocr(config: &OcrServiceConfig, backoff_ms: u64) -> Self {
        Self {
            service: "ocr",
            timeout: Duration::from_millis(config.timeout_ms),
            max_retries: config.max_retries,
            backoff: Duration::from_millis(backoff_ms),
        }
    }

    /// Vision calls are billed: never more than one retry
    pub fn for_vision(config: &VisionServiceConfig, backoff_ms: u64) -> Self {
        Self {
            service: "vision model",
            timeout: Duration::from_millis(config.timeout_ms),
            max_retries: config.max_retries.min(1),
            backoff: Duration::from_millis(backoff_ms),
        }
    }
}

/// Run `op` under the policy's timeout, retrying retryable failures, and
/// give up immediately with [`PipelineError::Cancelled`] once `cancel` fires.
pub async fn call_with_policy<T, F, Fut>(
    policy: &CallPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            result = tokio::time::timeout(policy.timeout, op()) => match result {
                Ok(inner) => inner,
                Err(_) => Err(PipelineError::Timeout {
                    service: policy.service,
                    timeout_ms: policy.timeout.as_millis() as u64,
                }),
            },
        };

        match outcome {
            Ok(value) => {
                if attempt > 0 {
                    info!("{} call succeeded after {} retries", policy.service, attempt);
                }
                return Ok(value);
            }
            Err(err) if attempt < policy.max_retries && err.is_retryable() => {
                attempt += 1;
                let delay = policy.backoff * 2u32.saturating_pow(attempt - 1);
                warn!(
                    "{} call failed ({}), retrying in {:?} (attempt {}/{})",
                    policy.service, err, delay, attempt, policy.max_retries
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(err) => return Err(err),
        }
    }
}
