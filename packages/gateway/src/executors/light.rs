// ABOUTME: Light engine: a bounded pool of workers running each job as a fresh interpreter process
// ABOUTME: Children get a private temp dir, a cleared environment, rlimits and (where permitted) no network

use super::output::{drain, CappedBuffer};
use super::{EngineError, ExecutionJob, ExitStatus, RawOutput, Result, SandboxExecutor};
use crate::settings::LightEngineConfig;
use crate::types::Engine;
use async_trait::async_trait;
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const SANDBOX_PATH: &str = "/usr/bin:/bin";

/// How long to wait for pipes to close after the child has exited
const DRAIN_GRACE: Duration = Duration::from_secs(1);

struct LightTask {
    job: ExecutionJob,
    reply: oneshot::Sender<Result<RawOutput>>,
}

/// Limits applied in the child between fork and exec
#[derive(Debug, Clone, Copy)]
struct ChildLimits {
    memory_bytes: u64,
    cpu_seconds: u64,
    max_processes: u64,
    max_file_bytes: u64,
    isolate_network: bool,
}

struct LightRuntime {
    interpreter: Option<PathBuf>,
    args: Vec<String>,
    isolate_network: bool,
    max_processes: u64,
    max_file_bytes: u64,
}

pub struct LightExecutor {
    queue: mpsc::Sender<LightTask>,
    runtime: Arc<LightRuntime>,
}

impl LightExecutor {
    /// Spawn the worker pool. Must be called from within a tokio runtime.
    pub fn start(config: &LightEngineConfig) -> Self {
        let interpreter = match which::which(&config.interpreter) {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(
                    interpreter = %config.interpreter,
                    error = %e,
                    "Interpreter not found, light engine unavailable"
                );
                None
            }
        };

        let runtime = Arc::new(LightRuntime {
            interpreter,
            args: config.interpreter_args.clone(),
            isolate_network: config.isolate_network,
            max_processes: config.max_processes,
            max_file_bytes: config.max_file_bytes,
        });

        let workers = config.workers.max(1);
        let (queue, receiver) = mpsc::channel(config.queue_depth.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        for worker_id in 0..workers {
            tokio::spawn(worker_loop(worker_id, receiver.clone(), runtime.clone()));
        }

        info!(
            workers,
            queue_depth = config.queue_depth,
            interpreter = ?runtime.interpreter,
            "Light engine started"
        );

        Self { queue, runtime }
    }
}

#[async_trait]
impl SandboxExecutor for LightExecutor {
    fn engine(&self) -> Engine {
        Engine::Light
    }

    async fn is_available(&self) -> bool {
        self.runtime.interpreter.is_some() && !self.queue.is_closed()
    }

    async fn execute(&self, job: &ExecutionJob) -> Result<RawOutput> {
        if self.runtime.interpreter.is_none() {
            return Err(EngineError::Unavailable(
                "no interpreter for the light engine".to_string(),
            ));
        }

        let (reply, response) = oneshot::channel();
        self.queue
            .try_send(LightTask {
                job: job.clone(),
                reply,
            })
            .map_err(|e| match e {
                TrySendError::Full(_) => EngineError::Busy("light engine queue is full".to_string()),
                TrySendError::Closed(_) => {
                    EngineError::Unavailable("light engine workers stopped".to_string())
                }
            })?;

        response
            .await
            .map_err(|_| EngineError::Internal("light worker dropped the job".to_string()))?
    }
}

async fn worker_loop(
    worker_id: usize,
    queue: Arc<Mutex<mpsc::Receiver<LightTask>>>,
    runtime: Arc<LightRuntime>,
) {
    loop {
        let task = {
            let mut receiver = queue.lock().await;
            receiver.recv().await
        };
        let Some(task) = task else {
            debug!(worker_id, "Light worker stopping");
            break;
        };

        debug!(worker_id, job_id = %task.job.id, "Light worker picked up job");
        let result = runtime.run(&task.job).await;
        if task.reply.send(result).is_err() {
            debug!(worker_id, "Caller went away before the result was ready");
        }
    }
}

impl LightRuntime {
    async fn run(&self, job: &ExecutionJob) -> Result<RawOutput> {
        let interpreter = self
            .interpreter
            .as_deref()
            .ok_or_else(|| EngineError::Unavailable("no interpreter".to_string()))?;
        job.check_paths()?;

        // Removed on drop, whatever the outcome
        let workdir = tempfile::Builder::new().prefix("codegate-").tempdir()?;
        for file in &job.files {
            let target = workdir.path().join(&file.path);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, file.content.as_bytes()).await?;
        }

        let limits = ChildLimits {
            memory_bytes: job.limits.memory_mb.saturating_mul(1024 * 1024),
            cpu_seconds: cpu_seconds_for(job.limits.timeout),
            max_processes: self.max_processes,
            max_file_bytes: self.max_file_bytes,
            isolate_network: self.isolate_network,
        };

        let memory_capped = limits.memory_bytes > 0;
        let mut command = self.command(interpreter, workdir.path(), &job.entry_point);
        // SAFETY: the hook only issues raw syscalls (unshare, getrlimit, setrlimit)
        // and touches no allocator or lock state inherited from the parent.
        unsafe {
            command.pre_exec(move || apply_child_limits(&limits));
        }

        let started = Instant::now();
        let mut child = command
            .spawn()
            .map_err(|e| EngineError::Spawn(format!("{}: {}", interpreter.display(), e)))?;
        let pid = child.id();

        let cap = job.limits.output_cap_bytes;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Internal("stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::Internal("stderr was not captured".to_string()))?;
        let stdout_task = tokio::spawn(drain(stdout, cap));
        let stderr_task = tokio::spawn(drain(stderr, cap));

        let (status, timed_out) = match tokio::time::timeout(job.limits.timeout, child.wait()).await
        {
            Ok(status) => (status?, false),
            Err(_) => {
                kill_group(pid);
                let _ = child.start_kill();
                (child.wait().await?, true)
            }
        };
        let duration = started.elapsed();

        let (stdout, out_truncated) = collect(stdout_task, cap).await.into_string();
        let (stderr, err_truncated) = collect(stderr_task, cap).await.into_string();
        let status = classify_exit(status.code(), status.signal(), timed_out, memory_capped, &stderr);

        debug!(
            job_id = %job.id,
            status = ?status,
            duration_ms = duration.as_millis() as u64,
            "Light job finished"
        );

        Ok(RawOutput {
            engine: Engine::Light,
            stdout,
            stderr,
            truncated: out_truncated || err_truncated,
            status,
            duration,
            memory_peak_kb: None,
        })
    }

    fn command(&self, interpreter: &Path, workdir: &Path, entry_point: &str) -> Command {
        let mut command = Command::new(interpreter);
        command
            .args(&self.args)
            .arg(entry_point)
            .current_dir(workdir)
            .env_clear()
            .env("PATH", SANDBOX_PATH)
            .env("HOME", workdir)
            .env("LANG", "C.UTF-8")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);
        command
    }
}

/// CPU-seconds ceiling: the wall-clock timeout rounded up, plus one second of slack
fn cpu_seconds_for(timeout: Duration) -> u64 {
    let millis = timeout.as_millis() as u64;
    millis.div_ceil(1000) + 1
}

async fn collect(mut task: JoinHandle<std::io::Result<CappedBuffer>>, cap: usize) -> CappedBuffer {
    match tokio::time::timeout(DRAIN_GRACE, &mut task).await {
        Ok(Ok(Ok(buffer))) => buffer,
        Ok(Ok(Err(e))) => {
            warn!(error = %e, "Failed reading child output");
            CappedBuffer::new(cap)
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Output reader panicked");
            CappedBuffer::new(cap)
        }
        Err(_) => {
            // A descendant outside the process group still holds the pipe
            task.abort();
            CappedBuffer::new(cap)
        }
    }
}

fn kill_group(pid: Option<u32>) {
    let Some(pid) = pid else { return };
    if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        debug!(pid, error = %e, "killpg failed, child already gone");
    }
}

/// Under an address-space ceiling a failed allocation in native code surfaces as
/// SIGSEGV or SIGABRT rather than a Python `MemoryError`
fn classify_exit(
    code: Option<i32>,
    signal: Option<i32>,
    timed_out: bool,
    memory_capped: bool,
    stderr: &str,
) -> ExitStatus {
    if timed_out {
        return ExitStatus::TimedOut;
    }
    if let Some(signal) = signal {
        if signal == Signal::SIGXCPU as i32 {
            return ExitStatus::TimedOut;
        }
        if memory_capped && (signal == Signal::SIGSEGV as i32 || signal == Signal::SIGABRT as i32) {
            return ExitStatus::MemoryExceeded;
        }
        return ExitStatus::Signaled(signal);
    }
    let code = code.unwrap_or(-1);
    if code != 0 && stderr.contains("MemoryError") {
        return ExitStatus::MemoryExceeded;
    }
    ExitStatus::Exited(code)
}

fn apply_child_limits(limits: &ChildLimits) -> std::io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use nix::sched::{unshare, CloneFlags};
        // Best effort: unprivileged user namespaces may be disabled
        if limits.isolate_network
            && unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNET).is_err()
        {
            let _ = unshare(CloneFlags::CLONE_NEWNET);
        }
    }

    lower_limit(Resource::RLIMIT_AS, limits.memory_bytes)?;
    lower_limit(Resource::RLIMIT_CPU, limits.cpu_seconds)?;
    lower_limit(Resource::RLIMIT_NPROC, limits.max_processes)?;
    lower_limit(Resource::RLIMIT_FSIZE, limits.max_file_bytes)?;
    lower_limit(Resource::RLIMIT_CORE, 0)?;
    Ok(())
}

/// Set both soft and hard limits, never above the inherited hard limit
fn lower_limit(resource: Resource, value: u64) -> nix::Result<()> {
    let (_, hard) = getrlimit(resource)?;
    let value = value.min(hard);
    setrlimit(resource, value, value)
}
