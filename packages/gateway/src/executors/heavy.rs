// ABOUTME: Heavy engine: runs each job in a throwaway Docker container via bollard
// ABOUTME: No network, read-only root, dropped capabilities, memory/CPU/pid ceilings; container removed afterwards

use super::output::CappedBuffer;
use super::{EngineError, ExecutionJob, ExitStatus, RawOutput, Result, SandboxExecutor};
use crate::settings::HeavyEngineConfig;
use crate::types::{Engine, SourceFile};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions, LogOutput,
        LogsOptions, RemoveContainerOptions, StartContainerOptions, UploadToContainerOptions,
        WaitContainerOptions,
    },
    image::CreateImageOptions,
    models::HostConfig,
    Docker,
};
use futures::StreamExt;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const LABEL_PREFIX: &str = "codegate.sandbox";

/// Unprivileged `nobody` inside the container
const SANDBOX_USER: &str = "65534:65534";

pub struct ContainerExecutor {
    client: Docker,
    config: HeavyEngineConfig,
    /// Images already confirmed present, keyed by name
    image_cache: Arc<RwLock<HashMap<String, chrono::DateTime<chrono::Utc>>>>,
}

impl ContainerExecutor {
    pub fn new(config: &HeavyEngineConfig) -> Result<Self> {
        if !config.enabled {
            return Err(EngineError::Unavailable(
                "heavy engine disabled by configuration".to_string(),
            ));
        }
        let client = Docker::connect_with_defaults()
            .map_err(|e| EngineError::Unavailable(format!("docker connection: {}", e)))?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: Docker, config: &HeavyEngineConfig) -> Self {
        Self {
            client,
            config: config.clone(),
            image_cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn ensure_image(&self) -> Result<()> {
        let image = &self.config.image;
        if self.image_cache.read().await.contains_key(image) {
            return Ok(());
        }

        match self.client.inspect_image(image).await {
            Ok(_) => {}
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => self.pull_image().await?,
            Err(e) => return Err(classify_docker_error("inspect image", e)),
        }

        self.image_cache
            .write()
            .await
            .insert(image.clone(), chrono::Utc::now());
        Ok(())
    }

    async fn pull_image(&self) -> Result<()> {
        let image = &self.config.image;
        let pull_timeout = Duration::from_secs(self.config.pull_timeout_secs);
        info!(image = %image, timeout = ?pull_timeout, "Pulling sandbox image");

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = Box::pin(self.client.create_image(Some(options), None, None));

        let pulled = tokio::time::timeout(pull_timeout, async {
            while let Some(progress) = stream.next().await {
                let progress = progress.map_err(|e| classify_docker_error("pull image", e))?;
                if let Some(error) = progress.error {
                    return Err(EngineError::Unavailable(format!(
                        "pull of {} failed: {}",
                        image, error
                    )));
                }
                if let Some(status) = progress.status {
                    debug!(image = %image, status = %status, "Pull progress");
                }
            }
            Ok(())
        })
        .await;

        match pulled {
            Ok(result) => result,
            Err(_) => Err(EngineError::Unavailable(format!(
                "timed out pulling {} after {:?}",
                image, pull_timeout
            ))),
        }
    }

    async fn run_container(&self, name: &str, job: &ExecutionJob) -> Result<RawOutput> {
        let archive = build_archive(&job.files)?;
        let upload = UploadToContainerOptions {
            path: self.config.workdir.clone(),
            ..Default::default()
        };
        self.client
            .upload_to_container(name, Some(upload), archive.into())
            .await
            .map_err(|e| classify_docker_error("upload sources", e))?;

        self.client
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| classify_docker_error("start container", e))?;
        let started = Instant::now();

        let wait_options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut wait = Box::pin(self.client.wait_container(name, Some(wait_options)));
        let (exit_code, timed_out) = match tokio::time::timeout(job.limits.timeout, wait.next()).await
        {
            Ok(Some(Ok(response))) => (Some(response.status_code), false),
            Ok(Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. }))) => {
                (Some(code), false)
            }
            Ok(Some(Err(e))) => return Err(classify_docker_error("wait for container", e)),
            Ok(None) => (None, false),
            Err(_) => {
                let kill = KillContainerOptions { signal: "SIGKILL" };
                if let Err(e) = self.client.kill_container(name, Some(kill)).await {
                    debug!(container = %name, error = %e, "Kill after timeout failed");
                }
                (None, true)
            }
        };
        let duration = started.elapsed();

        let oom_killed = match self
            .client
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(details) => details
                .state
                .and_then(|state| state.oom_killed)
                .unwrap_or(false),
            Err(e) => {
                warn!(container = %name, error = %e, "Could not inspect finished container");
                false
            }
        };

        let (stdout, stderr) = self.collect_logs(name, job.limits.output_cap_bytes).await?;
        let (stdout, out_truncated) = stdout.into_string();
        let (stderr, err_truncated) = stderr.into_string();
        let status = container_status(exit_code, oom_killed, timed_out, &stderr);

        debug!(
            container = %name,
            job_id = %job.id,
            status = ?status,
            duration_ms = duration.as_millis() as u64,
            "Heavy job finished"
        );

        Ok(RawOutput {
            engine: Engine::Heavy,
            stdout,
            stderr,
            truncated: out_truncated || err_truncated,
            status,
            duration,
            memory_peak_kb: None,
        })
    }

    async fn collect_logs(&self, name: &str, cap: usize) -> Result<(CappedBuffer, CappedBuffer)> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            ..Default::default()
        };
        let mut logs = Box::pin(self.client.logs(name, Some(options)));
        let mut stdout = CappedBuffer::new(cap);
        let mut stderr = CappedBuffer::new(cap);

        while let Some(entry) = logs.next().await {
            match entry.map_err(|e| classify_docker_error("read logs", e))? {
                LogOutput::StdOut { message } | LogOutput::Console { message } => {
                    stdout.push(&message)
                }
                LogOutput::StdErr { message } => stderr.push(&message),
                _ => continue,
            }
        }
        Ok((stdout, stderr))
    }

}

async fn remove_container(client: &Docker, name: &str) {
    let options = RemoveContainerOptions {
        force: true,
        v: true,
        ..Default::default()
    };
    if let Err(e) = client.remove_container(name, Some(options)).await {
        warn!(container = %name, error = %e, "Failed to remove sandbox container");
    }
}

/// Hands a created container to `on_abandon` if the run is dropped before cleanup finishes
struct ContainerGuard {
    name: String,
    on_abandon: Option<Box<dyn FnOnce(String) + Send>>,
}

impl ContainerGuard {
    fn new(name: impl Into<String>, on_abandon: impl FnOnce(String) + Send + 'static) -> Self {
        Self {
            name: name.into(),
            on_abandon: Some(Box::new(on_abandon)),
        }
    }

    fn disarm(mut self) {
        self.on_abandon = None;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if let Some(on_abandon) = self.on_abandon.take() {
            on_abandon(std::mem::take(&mut self.name));
        }
    }
}

/// Removal runs on a detached task; the abandoned future cannot await it
fn detached_removal(client: Docker) -> impl FnOnce(String) + Send + 'static {
    move |name| match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            warn!(container = %name, "Run abandoned, removing sandbox container");
            handle.spawn(async move { remove_container(&client, &name).await });
        }
        Err(_) => warn!(container = %name, "Run abandoned outside a runtime, container left behind"),
    }
}

#[async_trait]
impl SandboxExecutor for ContainerExecutor {
    fn engine(&self) -> Engine {
        Engine::Heavy
    }

    async fn is_available(&self) -> bool {
        if !self.config.enabled {
            return false;
        }
        match self.client.ping().await {
            Ok(_) => true,
            Err(e) => {
                warn!("Docker not available: {}", e);
                false
            }
        }
    }

    async fn execute(&self, job: &ExecutionJob) -> Result<RawOutput> {
        job.check_paths()?;
        self.ensure_image().await?;

        let name = format!("codegate-{}", job.id);
        let options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };
        self.client
            .create_container(Some(options), container_config(&self.config, job))
            .await
            .map_err(|e| classify_docker_error("create container", e))?;

        let guard = ContainerGuard::new(name.clone(), detached_removal(self.client.clone()));
        let result = self.run_container(&name, job).await;
        remove_container(&self.client, &name).await;
        guard.disarm();
        result
    }
}

fn container_config(config: &HeavyEngineConfig, job: &ExecutionJob) -> Config<String> {
    let memory_bytes = i64::try_from(job.limits.memory_mb.saturating_mul(1024 * 1024))
        .unwrap_or(i64::MAX);

    let mut labels = HashMap::new();
    labels.insert(format!("{}.managed", LABEL_PREFIX), "true".to_string());
    labels.insert(format!("{}.job", LABEL_PREFIX), job.id.to_string());

    let mut tmpfs = HashMap::new();
    tmpfs.insert(
        "/tmp".to_string(),
        format!("rw,noexec,nosuid,size={}m", config.tmpfs_size_mb),
    );

    // Anonymous volume so sources can be uploaded under a read-only root
    let mut volumes = HashMap::new();
    volumes.insert(config.workdir.clone(), HashMap::new());

    let host_config = HostConfig {
        network_mode: Some("none".to_string()),
        memory: Some(memory_bytes),
        memory_swap: Some(memory_bytes),
        nano_cpus: Some((job.limits.cpu_cores * 1_000_000_000.0) as i64),
        pids_limit: Some(config.pids_limit),
        cap_drop: Some(vec!["ALL".to_string()]),
        security_opt: Some(vec!["no-new-privileges".to_string()]),
        readonly_rootfs: Some(true),
        tmpfs: Some(tmpfs),
        ..Default::default()
    };

    Config {
        image: Some(config.image.clone()),
        cmd: Some(vec![
            config.interpreter.clone(),
            "-I".to_string(),
            "-B".to_string(),
            "-u".to_string(),
            job.entry_point.clone(),
        ]),
        env: Some(vec!["HOME=/tmp".to_string(), "LANG=C.UTF-8".to_string()]),
        user: Some(SANDBOX_USER.to_string()),
        working_dir: Some(config.workdir.clone()),
        network_disabled: Some(true),
        volumes: Some(volumes),
        labels: Some(labels),
        host_config: Some(host_config),
        ..Default::default()
    }
}

/// Tar the job's files, with explicit entries for their parent directories
fn build_archive(files: &[SourceFile]) -> std::io::Result<Vec<u8>> {
    use tar::{Builder, EntryType, Header};

    let mut archive = Builder::new(Vec::new());

    let directories: BTreeSet<String> = files
        .iter()
        .flat_map(|file| {
            let parts: Vec<&str> = file.path.split('/').collect();
            (1..parts.len())
                .map(|depth| parts[..depth].join("/"))
                .collect::<Vec<_>>()
        })
        .collect();
    for dir in &directories {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Directory);
        header.set_size(0);
        header.set_mode(0o755);
        header.set_cksum();
        archive.append_data(&mut header, dir, std::io::empty())?;
    }

    for file in files {
        let mut header = Header::new_gnu();
        header.set_size(file.content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        archive.append_data(&mut header, &file.path, file.content.as_bytes())?;
    }

    archive.into_inner()
}

fn container_status(
    exit_code: Option<i64>,
    oom_killed: bool,
    timed_out: bool,
    stderr: &str,
) -> ExitStatus {
    if timed_out {
        return ExitStatus::TimedOut;
    }
    if oom_killed {
        return ExitStatus::MemoryExceeded;
    }
    let code = exit_code.map(|c| c as i32).unwrap_or(-1);
    if code != 0 && stderr.contains("MemoryError") {
        return ExitStatus::MemoryExceeded;
    }
    ExitStatus::Exited(code)
}

fn classify_docker_error(context: &str, err: bollard::errors::Error) -> EngineError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message,
        } if status_code < 500 => EngineError::Internal(format!("{}: {}", context, message)),
        other => EngineError::Unavailable(format!("{}: {}", context, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executors::SandboxLimits;
    use rstest::rstest;

    fn job(files: Vec<SourceFile>, entry: &str) -> ExecutionJob {
        ExecutionJob::new(
            files,
            entry,
            SandboxLimits {
                timeout: Duration::from_secs(10),
                memory_mb: 256,
                cpu_cores: 1.0,
                output_cap_bytes: 65536,
            },
        )
    }

    #[test]
    fn test_container_config_is_locked_down() {
        let job = job(vec![SourceFile::new("main.py", "print(1)")], "main.py");
        let config = container_config(&HeavyEngineConfig::default(), &job);
        let host = config.host_config.clone().unwrap();

        assert_eq!(config.network_disabled, Some(true));
        assert_eq!(config.user.as_deref(), Some(SANDBOX_USER));
        assert_eq!(config.working_dir.as_deref(), Some("/sandbox"));
        assert_eq!(config.cmd.unwrap().last().map(String::as_str), Some("main.py"));
        assert_eq!(host.network_mode.as_deref(), Some("none"));
        assert_eq!(host.memory, Some(256 * 1024 * 1024));
        assert_eq!(host.memory_swap, host.memory);
        assert_eq!(host.nano_cpus, Some(1_000_000_000));
        assert_eq!(host.pids_limit, Some(64));
        assert_eq!(host.readonly_rootfs, Some(true));
        assert_eq!(host.cap_drop, Some(vec!["ALL".to_string()]));
        assert!(host.tmpfs.unwrap()["/tmp"].contains("size=16m"));
    }

    #[test]
    fn test_archive_contains_nested_files() {
        let files = vec![
            SourceFile::new("main.py", "from pkg import util"),
            SourceFile::new("pkg/util.py", "X = 1"),
        ];
        let data = build_archive(&files).unwrap();

        let mut archive = tar::Archive::new(&data[..]);
        let paths: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();

        assert_eq!(paths, vec!["pkg", "main.py", "pkg/util.py"]);
    }

    #[rstest]
    #[case::clean(Some(0), false, false, "", ExitStatus::Exited(0))]
    #[case::traceback(Some(1), false, false, "ZeroDivisionError", ExitStatus::Exited(1))]
    #[case::oom(Some(137), true, false, "", ExitStatus::MemoryExceeded)]
    #[case::memory_error(Some(1), false, false, "MemoryError", ExitStatus::MemoryExceeded)]
    #[case::timeout(None, false, true, "", ExitStatus::TimedOut)]
    fn test_container_status(
        #[case] exit_code: Option<i64>,
        #[case] oom: bool,
        #[case] timed_out: bool,
        #[case] stderr: &str,
        #[case] expected: ExitStatus,
    ) {
        assert_eq!(container_status(exit_code, oom, timed_out, stderr), expected);
    }

    #[test]
    fn test_docker_error_classification() {
        let not_found = bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "no such container".to_string(),
        };
        assert!(matches!(
            classify_docker_error("start", not_found),
            EngineError::Internal(_)
        ));

        let daemon = bollard::errors::Error::DockerResponseServerError {
            status_code: 500,
            message: "daemon error".to_string(),
        };
        assert!(matches!(
            classify_docker_error("start", daemon),
            EngineError::Unavailable(_)
        ));
    }

    #[tokio::test]
    async fn test_disabled_config_refuses_to_start() {
        let config = HeavyEngineConfig {
            enabled: false,
            ..HeavyEngineConfig::default()
        };
        assert!(matches!(
            ContainerExecutor::new(&config),
            Err(EngineError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_runs_project_in_container() {
        let Ok(executor) = ContainerExecutor::new(&HeavyEngineConfig::default()) else {
            return;
        };
        if !executor.is_available().await {
            eprintln!("Docker not available, skipping");
            return;
        }

        let job = job(
            vec![
                SourceFile::new("main.py", "from pkg import util\nprint(util.X)\n1/0\n"),
                SourceFile::new("pkg/__init__.py", ""),
                SourceFile::new("pkg/util.py", "X = 41 + 1\n"),
            ],
            "main.py",
        );
        let output = executor.execute(&job).await.unwrap();

        assert_eq!(output.stdout, "42\n");
        assert!(output.stderr.contains("ZeroDivisionError"));
        assert_eq!(output.status, ExitStatus::Exited(1));
    }

    fn recording_guard(name: &str) -> (ContainerGuard, Arc<std::sync::Mutex<Vec<String>>>) {
        let removed = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = removed.clone();
        let guard = ContainerGuard::new(name, move |name| sink.lock().unwrap().push(name));
        (guard, removed)
    }

    #[test]
    fn test_abandoned_run_hands_container_to_cleanup() {
        let (guard, removed) = recording_guard("codegate-abc");
        drop(guard);
        assert_eq!(*removed.lock().unwrap(), vec!["codegate-abc".to_string()]);
    }

    #[test]
    fn test_finished_run_skips_cleanup() {
        let (guard, removed) = recording_guard("codegate-abc");
        guard.disarm();
        assert!(removed.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_run_releases_container_once() {
        let (guard, removed) = recording_guard("codegate-slow");
        let run = async move {
            let _guard = guard;
            tokio::time::sleep(Duration::from_secs(3600)).await;
        };

        let outcome = tokio::time::timeout(Duration::from_millis(10), run).await;

        assert!(outcome.is_err());
        assert_eq!(*removed.lock().unwrap(), vec!["codegate-slow".to_string()]);
    }
}
