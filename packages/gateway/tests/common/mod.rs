// ABOUTME: Shared fixtures for gateway integration tests
// ABOUTME: Scripted executors standing in for the sandbox engines, plus a gateway wired to a manual clock

#![allow(dead_code)]

use chrono::{TimeZone, Utc};
use codegate_gateway::admission::MemoryCounterStore;
use codegate_gateway::clock::ManualClock;
use codegate_gateway::executors::{
    EngineError, ExecutionJob, ExitStatus, RawOutput, Result, SandboxExecutor,
};
use codegate_gateway::{Engine, Gateway, GatewayConfig};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

type Responder = Box<dyn Fn(&ExecutionJob) -> Result<RawOutput> + Send + Sync>;

/// Executor whose answers are fixed up front; counts every call
pub struct ScriptedExecutor {
    engine: Engine,
    available: AtomicBool,
    calls: AtomicUsize,
    respond: Responder,
}

impl ScriptedExecutor {
    pub fn new(
        engine: Engine,
        respond: impl Fn(&ExecutionJob) -> Result<RawOutput> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            engine,
            available: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
            respond: Box::new(respond),
        })
    }

    pub fn printing(engine: Engine, stdout: &str) -> Arc<Self> {
        let stdout = stdout.to_string();
        Self::new(engine, move |_| {
            Ok(output(engine, &stdout, "", ExitStatus::Exited(0)))
        })
    }

    pub fn failing(engine: Engine, error: EngineError) -> Arc<Self> {
        Self::new(engine, move |_| Err(error.clone()))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl SandboxExecutor for ScriptedExecutor {
    fn engine(&self) -> Engine {
        self.engine
    }

    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn execute(&self, job: &ExecutionJob) -> Result<RawOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.respond)(job)
    }
}

pub fn output(engine: Engine, stdout: &str, stderr: &str, status: ExitStatus) -> RawOutput {
    RawOutput {
        engine,
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
        truncated: false,
        status,
        duration: Duration::from_millis(25),
        memory_peak_kb: None,
    }
}

pub struct Harness {
    pub gateway: Gateway,
    pub light: Arc<ScriptedExecutor>,
    pub heavy: Arc<ScriptedExecutor>,
    pub clock: Arc<ManualClock>,
    pub store: Arc<MemoryCounterStore>,
}

pub fn start_time() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap()
}

pub fn harness(light: Arc<ScriptedExecutor>, heavy: Arc<ScriptedExecutor>) -> Harness {
    harness_with(GatewayConfig::default(), light, heavy)
}

pub fn harness_with(
    config: GatewayConfig,
    light: Arc<ScriptedExecutor>,
    heavy: Arc<ScriptedExecutor>,
) -> Harness {
    let clock = Arc::new(ManualClock::new(start_time()));
    let store = Arc::new(MemoryCounterStore::new());
    let gateway = Gateway::builder(config)
        .store(store.clone())
        .clock(clock.clone())
        .light_executor(light.clone())
        .heavy_executor(heavy.clone())
        .inline_monitor(true)
        .build()
        .expect("gateway should build");

    Harness {
        gateway,
        light,
        heavy,
        clock,
        store,
    }
}
