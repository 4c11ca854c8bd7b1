// ABOUTME: Sandbox executor trait shared by the light process pool and heavy container engine
// ABOUTME: Defines jobs, raw engine output and the classified engine error type

use crate::settings::TierLimits;
use crate::types::{Engine, SourceFile};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub mod heavy;
pub mod light;
pub mod output;

pub use heavy::ContainerExecutor;
pub use light::LightExecutor;
pub use output::CappedBuffer;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Engine unavailable: {0}")]
    Unavailable(String),

    #[error("Engine busy: {0}")]
    Busy(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Failed to start sandbox: {0}")]
    Spawn(String),

    #[error("Engine internal error: {0}")]
    Internal(String),

    #[error("Invalid job: {0}")]
    InvalidJob(String),
}

/// How the resilience layer treats a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Retry with backoff up to the configured limit
    Transient,
    /// Adapter fault; retry once
    Internal,
    /// Never retried
    Terminal,
}

impl EngineError {
    pub fn class(&self) -> FailureClass {
        match self {
            EngineError::Unavailable(_) | EngineError::Busy(_) | EngineError::Io(_) => {
                FailureClass::Transient
            }
            EngineError::Spawn(_) | EngineError::Internal(_) => FailureClass::Internal,
            EngineError::InvalidJob(_) => FailureClass::Terminal,
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Ceilings enforced by every engine
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxLimits {
    pub timeout: Duration,
    pub memory_mb: u64,
    pub cpu_cores: f64,
    pub output_cap_bytes: usize,
}

impl SandboxLimits {
    pub fn for_tier(limits: &TierLimits, output_cap_bytes: usize) -> Self {
        Self {
            timeout: limits.timeout(),
            memory_mb: limits.memory_mb,
            cpu_cores: limits.cpu_cores,
            output_cap_bytes,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionJob {
    pub id: Uuid,
    pub files: Vec<SourceFile>,
    pub entry_point: String,
    pub limits: SandboxLimits,
}

impl ExecutionJob {
    pub fn new(files: Vec<SourceFile>, entry_point: impl Into<String>, limits: SandboxLimits) -> Self {
        Self {
            id: Uuid::new_v4(),
            files,
            entry_point: entry_point.into(),
            limits,
        }
    }

    /// Reject paths that would escape the sandbox directory
    pub fn check_paths(&self) -> Result<()> {
        for file in &self.files {
            let path = std::path::Path::new(&file.path);
            let escapes = path.is_absolute()
                || path
                    .components()
                    .any(|c| !matches!(c, std::path::Component::Normal(_)));
            if escapes || file.path.is_empty() {
                return Err(EngineError::InvalidJob(format!(
                    "path '{}' is not a relative file path",
                    file.path
                )));
            }
        }
        if !self.files.iter().any(|f| f.path == self.entry_point) {
            return Err(EngineError::InvalidJob(format!(
                "entry point '{}' is not among the files",
                self.entry_point
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(i32),
    Signaled(i32),
    TimedOut,
    MemoryExceeded,
}

impl ExitStatus {
    pub fn code(&self) -> Option<i32> {
        match self {
            ExitStatus::Exited(code) => Some(*code),
            _ => None,
        }
    }
}

/// What an engine observed, before normalization
#[derive(Debug, Clone, PartialEq)]
pub struct RawOutput {
    pub engine: Engine,
    pub stdout: String,
    pub stderr: String,
    pub truncated: bool,
    pub status: ExitStatus,
    pub duration: Duration,
    pub memory_peak_kb: Option<u64>,
}

#[async_trait]
pub trait SandboxExecutor: Send + Sync {
    fn engine(&self) -> Engine;

    async fn is_available(&self) -> bool;

    async fn execute(&self, job: &ExecutionJob) -> Result<RawOutput>;
}

/// Stand-in for an engine that could not be started
pub struct DisabledExecutor {
    engine: Engine,
    reason: String,
}

impl DisabledExecutor {
    pub fn new(engine: Engine, reason: impl Into<String>) -> Self {
        Self {
            engine,
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl SandboxExecutor for DisabledExecutor {
    fn engine(&self) -> Engine {
        self.engine
    }

    async fn is_available(&self) -> bool {
        false
    }

    async fn execute(&self, _job: &ExecutionJob) -> Result<RawOutput> {
        Err(EngineError::Unavailable(self.reason.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> SandboxLimits {
        SandboxLimits {
            timeout: Duration::from_secs(1),
            memory_mb: 64,
            cpu_cores: 1.0,
            output_cap_bytes: 1024,
        }
    }

    #[test]
    fn test_failure_classes() {
        assert_eq!(EngineError::Busy("full".into()).class(), FailureClass::Transient);
        assert_eq!(EngineError::Unavailable("down".into()).class(), FailureClass::Transient);
        assert_eq!(EngineError::Io("pipe".into()).class(), FailureClass::Transient);
        assert_eq!(EngineError::Internal("bug".into()).class(), FailureClass::Internal);
        assert_eq!(EngineError::InvalidJob("bad".into()).class(), FailureClass::Terminal);
    }

    #[test]
    fn test_check_paths() {
        let ok = ExecutionJob::new(
            vec![SourceFile::new("main.py", ""), SourceFile::new("pkg/util.py", "")],
            "main.py",
            limits(),
        );
        assert!(ok.check_paths().is_ok());

        let traversal = ExecutionJob::new(vec![SourceFile::new("../main.py", "")], "../main.py", limits());
        assert!(matches!(traversal.check_paths(), Err(EngineError::InvalidJob(_))));

        let missing_entry = ExecutionJob::new(vec![SourceFile::new("a.py", "")], "main.py", limits());
        assert!(matches!(missing_entry.check_paths(), Err(EngineError::InvalidJob(_))));
    }

    #[tokio::test]
    async fn test_disabled_executor() {
        let executor = DisabledExecutor::new(Engine::Heavy, "docker not reachable");
        assert!(!executor.is_available().await);
        let job = ExecutionJob::new(vec![SourceFile::new("main.py", "")], "main.py", limits());
        assert_eq!(
            executor.execute(&job).await,
            Err(EngineError::Unavailable("docker not reachable".into()))
        );
    }
}
