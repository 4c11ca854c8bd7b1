// ABOUTME: Maps a finished execution or a gateway error onto the single ExecutionResult shape
// ABOUTME: Pure: the same outcome and timing always yield the same result

use crate::error::GatewayError;
use crate::executors::ExitStatus;
use crate::resilience::ExecutionRun;
use crate::types::{ErrorDetail, ErrorKind, ExecutionResult};
use std::time::Duration;

pub fn normalize(outcome: &Result<ExecutionRun, GatewayError>, elapsed: Duration) -> ExecutionResult {
    match outcome {
        Ok(run) => from_run(run, elapsed),
        Err(err) => from_error(err, elapsed),
    }
}

fn from_run(run: &ExecutionRun, elapsed: Duration) -> ExecutionResult {
    let output = &run.output;
    let (error_kind, detail) = match output.status {
        // A traceback from user code is still a successful execution
        ExitStatus::Exited(_) | ExitStatus::Signaled(_) => (ErrorKind::None, None),
        ExitStatus::TimedOut => (
            ErrorKind::Timeout,
            Some(ErrorDetail {
                message: Some("execution exceeded its time limit".to_string()),
                ..ErrorDetail::default()
            }),
        ),
        ExitStatus::MemoryExceeded => (
            ErrorKind::MemoryExceeded,
            Some(ErrorDetail {
                message: Some("execution exceeded its memory limit".to_string()),
                ..ErrorDetail::default()
            }),
        ),
    };

    ExecutionResult {
        stdout: output.stdout.clone(),
        stderr: output.stderr.clone(),
        error_kind,
        retry_after_ms: None,
        timing_ms: millis(elapsed),
        memory_peak_kb: output.memory_peak_kb,
        truncated: output.truncated,
        engine: Some(output.engine),
        exit_code: output.status.code(),
        fallback_used: run.fallback_used,
        detail,
    }
}

fn from_error(err: &GatewayError, elapsed: Duration) -> ExecutionResult {
    let detail = match err {
        GatewayError::ValidationFailed {
            rule_id,
            confidence,
            reason,
        } => ErrorDetail {
            rule_id: Some(rule_id.clone()),
            confidence: Some(*confidence),
            message: Some(reason.clone()),
            ..ErrorDetail::default()
        },
        GatewayError::RateLimited { limit_type, .. } => ErrorDetail {
            limit_type: Some(*limit_type),
            message: Some(err.to_string()),
            ..ErrorDetail::default()
        },
        GatewayError::ServiceUnavailable { reason, .. } => ErrorDetail {
            message: Some(reason.clone()),
            ..ErrorDetail::default()
        },
        GatewayError::Internal(message) => ErrorDetail {
            message: Some(message.clone()),
            ..ErrorDetail::default()
        },
    };

    ExecutionResult {
        stdout: String::new(),
        stderr: String::new(),
        error_kind: err.kind(),
        retry_after_ms: err.retry_after().map(millis),
        timing_ms: millis(elapsed),
        memory_peak_kb: None,
        truncated: false,
        engine: None,
        exit_code: None,
        fallback_used: false,
        detail: Some(detail),
    }
}

/// Whole milliseconds, rounding a non-zero remainder up
fn millis(duration: Duration) -> u64 {
    let whole = duration.as_millis() as u64;
    if duration.subsec_nanos() % 1_000_000 == 0 {
        whole
    } else {
        whole + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executors::RawOutput;
    use crate::types::{Confidence, Engine, LimitType};
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn run(status: ExitStatus) -> Result<ExecutionRun, GatewayError> {
        Ok(ExecutionRun {
            output: RawOutput {
                engine: Engine::Heavy,
                stdout: "partial\n".to_string(),
                stderr: "Traceback (most recent call last):\nZeroDivisionError: division by zero\n"
                    .to_string(),
                truncated: false,
                status,
                duration: Duration::from_millis(40),
                memory_peak_kb: Some(2048),
            },
            fallback_used: false,
        })
    }

    #[rstest]
    #[case::clean(ExitStatus::Exited(0), ErrorKind::None, Some(0))]
    #[case::traceback(ExitStatus::Exited(1), ErrorKind::None, Some(1))]
    #[case::signaled(ExitStatus::Signaled(11), ErrorKind::None, None)]
    #[case::timeout(ExitStatus::TimedOut, ErrorKind::Timeout, None)]
    #[case::memory(ExitStatus::MemoryExceeded, ErrorKind::MemoryExceeded, None)]
    fn test_exit_status_mapping(
        #[case] status: ExitStatus,
        #[case] kind: ErrorKind,
        #[case] exit_code: Option<i32>,
    ) {
        let result = normalize(&run(status), Duration::from_millis(50));
        assert_eq!(result.error_kind, kind);
        assert_eq!(result.exit_code, exit_code);
        assert_eq!(result.engine, Some(Engine::Heavy));
        assert_eq!(result.stdout, "partial\n");
    }

    #[test]
    fn test_runtime_exception_keeps_traceback() {
        let result = normalize(&run(ExitStatus::Exited(1)), Duration::from_millis(50));
        assert!(!result.error_kind.is_error());
        assert!(result.stderr.contains("ZeroDivisionError"));
        assert_eq!(result.memory_peak_kb, Some(2048));
        assert!(result.detail.is_none());
    }

    #[test]
    fn test_rate_limit_carries_retry_after() {
        let outcome = Err(GatewayError::RateLimited {
            limit_type: LimitType::Burst,
            retry_after: Duration::from_millis(6500),
        });
        let result = normalize(&outcome, Duration::from_micros(300));

        assert_eq!(result.error_kind, ErrorKind::RateLimited);
        assert_eq!(result.retry_after_ms, Some(6500));
        assert_eq!(result.timing_ms, 1);
        assert_eq!(result.detail.unwrap().limit_type, Some(LimitType::Burst));
        assert!(result.engine.is_none());
    }

    #[test]
    fn test_validation_failure_detail() {
        let outcome = Err(GatewayError::ValidationFailed {
            rule_id: "forbidden_module:subprocess".to_string(),
            confidence: Confidence::High,
            reason: "Forbidden module: subprocess (line 1)".to_string(),
        });
        let detail = normalize(&outcome, Duration::ZERO).detail.unwrap();

        assert_eq!(detail.rule_id.as_deref(), Some("forbidden_module:subprocess"));
        assert_eq!(detail.confidence, Some(Confidence::High));
    }

    #[test]
    fn test_normalization_is_idempotent() {
        let outcome = Err(GatewayError::unavailable("docker down", Some(Duration::from_secs(30))));
        let first = normalize(&outcome, Duration::from_millis(12));
        assert_eq!(normalize(&outcome, Duration::from_millis(12)), first);
        assert_eq!(first.retry_after_ms, Some(30_000));
        assert_eq!(first.error_kind, ErrorKind::ServiceUnavailable);
    }
}
