// ABOUTME: The request pipeline: shape check, admission, validation, routing, resilient execution, normalization
// ABOUTME: GatewayBuilder wires the components; every request reports one usage event to the monitor

use crate::admission::{
    AdmissionController, AdmissionError, BlockList, CounterStore, MemoryCounterStore, UsageLedger,
};
use crate::clock::{SharedClock, SystemClock};
use crate::error::{GatewayError, Result};
use crate::executors::{
    ContainerExecutor, DisabledExecutor, ExecutionJob, LightExecutor, SandboxExecutor,
    SandboxLimits,
};
use crate::monitor::{MonitorHandle, UsageEvent, UsageMonitor};
use crate::normalizer::normalize;
use crate::request::check_shape;
use crate::resilience::{
    CircuitBreaker, CircuitState, CircuitStore, ExecutionRun, ResilientExecutor, RetryPolicy,
};
use crate::router::EngineRouter;
use crate::settings::{ConfigError, GatewayConfig};
use crate::types::{Confidence, Engine, ExecutionRequest, ExecutionResult, SourceFile};
use crate::validator::{ValidationPolicy, ValidationVerdict, Validator};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineHealth {
    pub engine: Engine,
    pub available: bool,
    pub circuit: CircuitState,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// At least one engine can take work
    pub healthy: bool,
    pub engines: Vec<EngineHealth>,
    pub blocked_identities: usize,
}

enum MonitorSink {
    Channel(MonitorHandle),
    Inline,
}

pub struct Gateway {
    config: GatewayConfig,
    admission: AdmissionController,
    validator: Validator,
    policy: ValidationPolicy,
    router: EngineRouter,
    resilience: ResilientExecutor,
    monitor: Arc<UsageMonitor>,
    sink: MonitorSink,
    blocklist: BlockList,
    clock: SharedClock,
}

impl Gateway {
    pub fn builder(config: GatewayConfig) -> GatewayBuilder {
        GatewayBuilder::new(config)
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn blocklist(&self) -> &BlockList {
        &self.blocklist
    }

    pub fn monitor(&self) -> &Arc<UsageMonitor> {
        &self.monitor
    }

    /// Run one request through the whole pipeline. Never fails: every outcome is a result.
    pub async fn submit(&self, request: ExecutionRequest) -> ExecutionResult {
        let started = Instant::now();
        let identity = request.identity_key();

        let outcome = self.run(&request, &identity).await;
        let result = normalize(&outcome, started.elapsed());

        info!(
            identity = %identity,
            tier = %request.tier,
            engine = ?result.engine,
            error_kind = ?result.error_kind,
            fallback = result.fallback_used,
            timing_ms = result.timing_ms,
            "Request completed"
        );

        self.report(&request, &identity, &outcome, &result).await;
        result
    }

    async fn run(&self, request: &ExecutionRequest, identity: &str) -> Result<ExecutionRun> {
        check_shape(request, &self.config.request)?;

        self.admission
            .admit(identity, request.tier)
            .await
            .map_err(|e| match e {
                AdmissionError::Limited(exceeded) => GatewayError::RateLimited {
                    limit_type: exceeded.limit_type,
                    retry_after: exceeded.retry_after,
                },
                AdmissionError::Store(e) => {
                    error!(identity = %identity, error = %e, "Counter store failed during admission");
                    GatewayError::Internal(format!("counter store: {}", e))
                }
            })?;

        let files = request.files();
        self.screen(&files, identity)?;

        let (engine, reason) = self.router.decide(request);
        debug!(identity = %identity, engine = %engine, reason = %reason, "Routed request");

        let limits = SandboxLimits::for_tier(
            self.config.tiers.get(request.tier),
            self.config.output_cap_bytes,
        );
        let job = ExecutionJob::new(files, request.entry_point(), limits);
        self.resilience.execute(engine, &job).await
    }

    fn screen(&self, files: &[SourceFile], identity: &str) -> Result<()> {
        let verdict = self.validator.validate_files(files);
        if verdict.safe {
            return Ok(());
        }

        let rule_id = verdict.rule_id.clone().unwrap_or_default();
        let reason = verdict.reason.clone().unwrap_or_default();
        if !self.policy.rejects(&verdict) {
            warn!(
                identity = %identity,
                rule_id = %rule_id,
                reason = %reason,
                "Suspicious code allowed by validator policy"
            );
            return Ok(());
        }

        warn!(
            identity = %identity,
            rule_id = %rule_id,
            reason = %reason,
            audit = true,
            "Code rejected by validator"
        );
        Err(GatewayError::ValidationFailed {
            rule_id,
            confidence: verdict.confidence.unwrap_or(Confidence::High),
            reason,
        })
    }

    async fn report(
        &self,
        request: &ExecutionRequest,
        identity: &str,
        outcome: &Result<ExecutionRun>,
        result: &ExecutionResult,
    ) {
        let duration = match outcome {
            Ok(run) => run.output.duration,
            Err(_) => std::time::Duration::from_millis(result.timing_ms),
        };
        let event = UsageEvent {
            identity: identity.to_string(),
            tier: request.tier,
            engine: result.engine,
            error_kind: result.error_kind,
            limit_type: result.detail.as_ref().and_then(|d| d.limit_type),
            duration,
            memory_mb: self.config.tiers.get(request.tier).memory_mb,
            at: self.clock.now(),
        };

        match &self.sink {
            MonitorSink::Channel(handle) => handle.send(event),
            MonitorSink::Inline => {
                self.monitor.record(event).await;
            }
        }
    }

    /// Shape check and validator only; no quota is consumed and nothing runs
    pub fn check(&self, request: &ExecutionRequest) -> Result<ValidationVerdict> {
        check_shape(request, &self.config.request)?;
        Ok(self.validator.validate_files(&request.files()))
    }

    pub async fn health(&self) -> HealthReport {
        let mut engines = Vec::with_capacity(2);
        for engine in [Engine::Light, Engine::Heavy] {
            engines.push(EngineHealth {
                engine,
                available: self.resilience.executor(engine).is_available().await,
                circuit: self.resilience.breaker().snapshot(engine),
            });
        }
        HealthReport {
            healthy: engines.iter().any(|e| e.available),
            engines,
            blocked_identities: self.blocklist.active(self.clock.now()).len(),
        }
    }
}

pub struct GatewayBuilder {
    config: GatewayConfig,
    store: Option<Arc<dyn CounterStore>>,
    clock: Option<SharedClock>,
    light: Option<Arc<dyn SandboxExecutor>>,
    heavy: Option<Arc<dyn SandboxExecutor>>,
    circuits: Option<Arc<CircuitStore>>,
    inline_monitor: bool,
}

impl GatewayBuilder {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            store: None,
            clock: None,
            light: None,
            heavy: None,
            circuits: None,
            inline_monitor: false,
        }
    }

    pub fn store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn light_executor(mut self, executor: Arc<dyn SandboxExecutor>) -> Self {
        self.light = Some(executor);
        self
    }

    pub fn heavy_executor(mut self, executor: Arc<dyn SandboxExecutor>) -> Self {
        self.heavy = Some(executor);
        self
    }

    pub fn circuit_store(mut self, circuits: Arc<CircuitStore>) -> Self {
        self.circuits = Some(circuits);
        self
    }

    /// Record usage on the request path instead of a background task
    pub fn inline_monitor(mut self, inline: bool) -> Self {
        self.inline_monitor = inline;
        self
    }

    /// Assemble the gateway. Starts background tasks, so call from within a tokio runtime.
    pub fn build(self) -> std::result::Result<Gateway, ConfigError> {
        let config = self.config;
        config.validate()?;

        let validator = Validator::from_config(&config.validator)?;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryCounterStore::new()));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let blocklist = BlockList::new();

        let light = self
            .light
            .unwrap_or_else(|| Arc::new(LightExecutor::start(&config.light)));
        let heavy = self.heavy.unwrap_or_else(|| default_heavy(&config));

        let breaker = CircuitBreaker::new(
            self.circuits.unwrap_or_default(),
            config.breaker.clone(),
            clock.clone(),
        );
        let resilience = ResilientExecutor::new(
            light,
            heavy,
            breaker,
            RetryPolicy::from_config(&config.retry),
        );

        let monitor = Arc::new(UsageMonitor::new(
            config.monitor.clone(),
            config.cost.clone(),
            UsageLedger::new(store.clone()),
            blocklist.clone(),
        ));
        let sink = if self.inline_monitor {
            MonitorSink::Inline
        } else {
            let (handle, _task) = monitor.clone().spawn();
            MonitorSink::Channel(handle)
        };

        info!(
            rules = validator.rule_count(),
            heavy_enabled = config.heavy.enabled,
            "Gateway ready"
        );

        Ok(Gateway {
            admission: AdmissionController::new(
                store,
                config.tiers.clone(),
                blocklist.clone(),
                clock.clone(),
            ),
            policy: ValidationPolicy::from_config(&config.validator),
            router: EngineRouter::new(&config.router),
            validator,
            resilience,
            monitor,
            sink,
            blocklist,
            clock,
            config,
        })
    }
}

fn default_heavy(config: &GatewayConfig) -> Arc<dyn SandboxExecutor> {
    match ContainerExecutor::new(&config.heavy) {
        Ok(executor) => Arc::new(executor),
        Err(e) => {
            warn!(error = %e, "Heavy engine not started, requests will use the light engine");
            Arc::new(DisabledExecutor::new(Engine::Heavy, e.to_string()))
        }
    }
}
