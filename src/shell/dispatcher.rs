//! Execution dispatcher: timeout policy and bounded retries around a channel.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::channel::{ChannelError, ExecRequest, ExecutionChannel, Invocation};
use super::env::SanitizedEnv;
use super::output::{ExecutionResult, OutputObserver};
use crate::error::GatewayError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub default_timeout_secs: u64,
    pub max_timeout_secs: u64,
    /// Retries after the first attempt, read-only commands only.
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub max_output_bytes: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 60,
            max_timeout_secs: 300,
            max_retries: 2,
            retry_backoff_ms: 250,
            max_output_bytes: 1024 * 1024,
        }
    }
}

pub struct Dispatcher {
    channel: Arc<dyn ExecutionChannel>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(channel: Arc<dyn ExecutionChannel>, config: DispatchConfig) -> Self {
        Self { channel, config }
    }

    /// Zero or absent means the default; anything above the ceiling is
    /// clamped to it.
    pub fn effective_timeout(&self, requested_secs: Option<u64>) -> Duration {
        let secs = match requested_secs {
            None | Some(0) => self.config.default_timeout_secs,
            Some(s) => s,
        };
        Duration::from_secs(secs.min(self.config.max_timeout_secs))
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.config.retry_backoff_ms.saturating_mul(factor))
    }

    /// Run `invocation` once, retrying transient channel failures for
    /// read-only commands. A timeout is not an error here: the result comes
    /// back with `timed_out` set.
    pub async fn dispatch(
        &self,
        invocation: Invocation,
        env: SanitizedEnv,
        timeout: Duration,
        mutating: bool,
        observer: Option<Arc<dyn OutputObserver>>,
    ) -> Result<ExecutionResult, GatewayError> {
        let request = ExecRequest {
            invocation,
            env,
            timeout,
            max_output_bytes: self.config.max_output_bytes,
            observer,
        };
        let max_attempts = if mutating { 1 } else { self.config.max_retries + 1 };

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.channel.execute(request.clone()).await {
                Ok(result) => {
                    info!(
                        "Dispatched via {} (exit {:?}, {} ms, timed_out={})",
                        self.channel.name(),
                        result.exit_code,
                        result.duration_ms,
                        result.timed_out
                    );
                    return Ok(result);
                }
                Err(ChannelError::Transient(reason)) if attempt < max_attempts => {
                    let delay = self.backoff(attempt);
                    warn!(
                        "Transient failure on {} (attempt {}/{}): {}; retrying in {:?}",
                        self.channel.name(),
                        attempt,
                        max_attempts,
                        reason,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    let reason = match e {
                        ChannelError::Transient(r) | ChannelError::Failed(r) => r,
                    };
                    return Err(GatewayError::ExecutionChannelUnavailable {
                        channel: self.channel.name().to_string(),
                        attempts: attempt,
                        reason,
                    });
                }
            }
        }
    }
}
