// ABOUTME: Wraps engine calls in retry, the per-engine circuit breaker and fallback to the light engine
// ABOUTME: Converts engine errors into gateway errors; nothing engine-specific leaves this module

pub mod breaker;
pub mod retry;

pub use breaker::{Attempt, CircuitBreaker, CircuitPhase, CircuitState, CircuitStore, Permit};
pub use retry::{retry_with_backoff, RetryPolicy};

use crate::error::{GatewayError, Result};
use crate::executors::{EngineError, ExecutionJob, ExitStatus, FailureClass, RawOutput, SandboxExecutor};
use crate::types::Engine;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry hint when the light queue stays full
const LIGHT_BUSY_RETRY_AFTER: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRun {
    pub output: RawOutput,
    pub fallback_used: bool,
}

pub struct ResilientExecutor {
    light: Arc<dyn SandboxExecutor>,
    heavy: Arc<dyn SandboxExecutor>,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
}

impl ResilientExecutor {
    pub fn new(
        light: Arc<dyn SandboxExecutor>,
        heavy: Arc<dyn SandboxExecutor>,
        breaker: CircuitBreaker,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            light,
            heavy,
            breaker,
            retry,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn executor(&self, engine: Engine) -> &Arc<dyn SandboxExecutor> {
        match engine {
            Engine::Light => &self.light,
            Engine::Heavy => &self.heavy,
        }
    }

    pub async fn execute(&self, engine: Engine, job: &ExecutionJob) -> Result<ExecutionRun> {
        match engine {
            Engine::Light => self.run_light(job, false).await,
            Engine::Heavy => self.run_heavy(job).await,
        }
    }

    async fn run_heavy(&self, job: &ExecutionJob) -> Result<ExecutionRun> {
        let attempt = self.breaker.acquire(Engine::Heavy);
        if let Permit::Reject { retry_after } = attempt.permit() {
            debug!(
                job_id = %job.id,
                retry_after_ms = retry_after.as_millis() as u64,
                "Heavy circuit open, using light engine"
            );
            return self
                .fallback(job, "heavy engine circuit open", Some(retry_after))
                .await;
        }

        let heavy = &self.heavy;
        let outcome = retry_with_backoff(&self.retry, "heavy", |_| heavy.execute(job)).await;
        match outcome {
            Ok(output) => {
                // A sandbox that killed runaway code did its job
                if matches!(output.status, ExitStatus::TimedOut | ExitStatus::MemoryExceeded) {
                    attempt.neutral();
                } else {
                    attempt.success();
                }
                Ok(ExecutionRun {
                    output,
                    fallback_used: false,
                })
            }
            Err(err) if err.class() == FailureClass::Terminal => {
                attempt.neutral();
                Err(GatewayError::Internal(err.to_string()))
            }
            Err(err) => {
                attempt.failure();
                warn!(
                    job_id = %job.id,
                    error = %err,
                    "Heavy engine failed after retries, falling back to light"
                );
                self.fallback(job, &err.to_string(), None).await
            }
        }
    }

    async fn fallback(
        &self,
        job: &ExecutionJob,
        reason: &str,
        retry_after: Option<Duration>,
    ) -> Result<ExecutionRun> {
        if !self.light.is_available().await {
            warn!(job_id = %job.id, reason = %reason, "No engine available");
            return Err(GatewayError::unavailable(
                format!("{}; light engine unavailable", reason),
                retry_after,
            ));
        }
        self.run_light(job, true).await
    }

    async fn run_light(&self, job: &ExecutionJob, fallback_used: bool) -> Result<ExecutionRun> {
        let light = &self.light;
        let policy = self.retry.once_more();
        match retry_with_backoff(&policy, "light", |_| light.execute(job)).await {
            Ok(output) => Ok(ExecutionRun {
                output,
                fallback_used,
            }),
            Err(err) => Err(light_failure(err)),
        }
    }
}

fn light_failure(err: EngineError) -> GatewayError {
    match err.class() {
        FailureClass::Terminal => GatewayError::Internal(err.to_string()),
        _ => {
            let retry_after = matches!(err, EngineError::Busy(_)).then_some(LIGHT_BUSY_RETRY_AFTER);
            GatewayError::unavailable(format!("light engine: {}", err), retry_after)
        }
    }
}
