// ABOUTME: Gateway configuration with defaults, JSON file loading and environment overrides
// ABOUTME: Covers tier quotas, breaker, retry, engines, validator policy, monitor thresholds and pricing

use crate::types::Tier;
use crate::validator::RuleSpec;
use codegate_config::constants as env_vars;
use codegate_config::env::override_from_env;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid validator rules: {0}")]
    Rules(#[from] crate::validator::ValidatorError),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Quotas and sandbox ceilings for one tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierLimits {
    pub burst: u64,
    pub hourly: u64,
    pub daily: u64,
    pub timeout_ms: u64,
    #[serde(rename = "memoryMB")]
    pub memory_mb: u64,
    pub cpu_cores: f64,
}

impl TierLimits {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierTable {
    pub anonymous: TierLimits,
    pub free: TierLimits,
    pub paid: TierLimits,
}

impl TierTable {
    pub fn get(&self, tier: Tier) -> &TierLimits {
        match tier {
            Tier::Anonymous => &self.anonymous,
            Tier::Free => &self.free,
            Tier::Paid => &self.paid,
        }
    }

    pub fn get_mut(&mut self, tier: Tier) -> &mut TierLimits {
        match tier {
            Tier::Anonymous => &mut self.anonymous,
            Tier::Free => &mut self.free,
            Tier::Paid => &mut self.paid,
        }
    }
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            anonymous: TierLimits {
                burst: 3,
                hourly: 30,
                daily: 100,
                timeout_ms: 5_000,
                memory_mb: 128,
                cpu_cores: 0.5,
            },
            free: TierLimits {
                burst: 5,
                hourly: 100,
                daily: 500,
                timeout_ms: 10_000,
                memory_mb: 256,
                cpu_cores: 1.0,
            },
            paid: TierLimits {
                burst: 20,
                hourly: 1_000,
                daily: 10_000,
                timeout_ms: 30_000,
                memory_mb: 512,
                cpu_cores: 2.0,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    pub success_threshold: u32,
}

impl BreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
            success_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestLimits {
    pub single_file_max_bytes: usize,
    pub per_file_max_bytes: usize,
    pub max_files: usize,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            single_file_max_bytes: 10 * 1024,
            per_file_max_bytes: 50 * 1024,
            max_files: 32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ValidatorConfig {
    /// Replaces the builtin rule list when present
    pub rules: Option<Vec<RuleSpec>>,
    pub reject_medium: bool,
    pub reject_low: bool,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            rules: None,
            reject_medium: true,
            reject_low: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouterConfig {
    pub heavy_threshold_bytes: usize,
    pub heavy_modules: Vec<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            heavy_threshold_bytes: 4 * 1024,
            heavy_modules: ["numpy", "pandas", "scipy", "matplotlib", "sklearn"]
                .iter()
                .map(|m| m.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LightEngineConfig {
    pub interpreter: String,
    pub interpreter_args: Vec<String>,
    pub workers: usize,
    pub queue_depth: usize,
    pub isolate_network: bool,
    pub max_processes: u64,
    pub max_file_bytes: u64,
}

impl Default for LightEngineConfig {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
            interpreter_args: vec!["-I".to_string(), "-B".to_string(), "-u".to_string()],
            workers: 4,
            queue_depth: 64,
            isolate_network: true,
            max_processes: 64,
            max_file_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeavyEngineConfig {
    pub enabled: bool,
    pub image: String,
    pub interpreter: String,
    pub pids_limit: i64,
    pub workdir: String,
    pub tmpfs_size_mb: u64,
    pub pull_timeout_secs: u64,
}

impl Default for HeavyEngineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            image: "python:3.12-slim".to_string(),
            interpreter: "python3".to_string(),
            pids_limit: 64,
            workdir: "/sandbox".to_string(),
            tmpfs_size_mb: 16,
            pull_timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MonitorConfig {
    pub max_executions_per_minute: usize,
    pub error_rate_threshold: f64,
    pub min_samples: u64,
    pub daily_cost_limit: f64,
    pub block_duration_secs: u64,
}

impl MonitorConfig {
    pub fn block_duration(&self) -> Duration {
        Duration::from_secs(self.block_duration_secs)
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            max_executions_per_minute: 60,
            error_rate_threshold: 0.8,
            min_samples: 10,
            daily_cost_limit: 5.0,
            block_duration_secs: 900,
        }
    }
}

/// Estimated spend per execution, in dollars
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CostModel {
    pub light_base: f64,
    pub heavy_base: f64,
    pub heavy_per_second: f64,
    pub heavy_per_gb_second: f64,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            light_base: 0.0,
            heavy_base: 0.0005,
            heavy_per_second: 0.0001,
            heavy_per_gb_second: 0.000_05,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayConfig {
    #[serde(rename = "tier")]
    pub tiers: TierTable,
    pub breaker: BreakerConfig,
    pub retry: RetryConfig,
    pub request: RequestLimits,
    pub validator: ValidatorConfig,
    pub router: RouterConfig,
    pub light: LightEngineConfig,
    pub heavy: HeavyEngineConfig,
    pub monitor: MonitorConfig,
    pub cost: CostModel,
    pub output_cap_bytes: usize,
    pub database_url: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            tiers: TierTable::default(),
            breaker: BreakerConfig::default(),
            retry: RetryConfig::default(),
            request: RequestLimits::default(),
            validator: ValidatorConfig::default(),
            router: RouterConfig::default(),
            light: LightEngineConfig::default(),
            heavy: HeavyEngineConfig::default(),
            monitor: MonitorConfig::default(),
            cost: CostModel::default(),
            output_cap_bytes: 64 * 1024,
            database_url: None,
        }
    }
}

impl GatewayConfig {
    /// Defaults, then the file named by `CODEGATE_CONFIG`, then environment overrides
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var(env_vars::CODEGATE_CONFIG) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(Path::new(path.trim()))?,
            _ => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json_str(&raw)?;
        info!(path = %path.display(), "Loaded gateway configuration");
        Ok(config)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn apply_env_overrides(&mut self) {
        for tier in Tier::ALL {
            let prefix = format!(
                "{}{}_",
                env_vars::CODEGATE_TIER_PREFIX,
                tier.as_str().to_ascii_uppercase()
            );
            let limits = self.tiers.get_mut(tier);
            let var = |field: &str| format!("{}{}", prefix, field);

            override_from_env(&var(env_vars::TIER_FIELD_BURST), &mut limits.burst, |v| *v > 0);
            override_from_env(&var(env_vars::TIER_FIELD_HOURLY), &mut limits.hourly, |v| *v > 0);
            override_from_env(&var(env_vars::TIER_FIELD_DAILY), &mut limits.daily, |v| *v > 0);
            override_from_env(&var(env_vars::TIER_FIELD_TIMEOUT_MS), &mut limits.timeout_ms, |v| {
                *v > 0
            });
            override_from_env(&var(env_vars::TIER_FIELD_MEMORY_MB), &mut limits.memory_mb, |v| {
                *v >= 16
            });
        }

        override_from_env(
            env_vars::CODEGATE_BREAKER_FAILURE_THRESHOLD,
            &mut self.breaker.failure_threshold,
            |v| *v > 0,
        );
        override_from_env(
            env_vars::CODEGATE_BREAKER_RESET_TIMEOUT_MS,
            &mut self.breaker.reset_timeout_ms,
            |v| *v > 0,
        );
        override_from_env(
            env_vars::CODEGATE_BREAKER_SUCCESS_THRESHOLD,
            &mut self.breaker.success_threshold,
            |v| *v > 0,
        );

        override_from_env(
            env_vars::CODEGATE_RETRY_MAX_RETRIES,
            &mut self.retry.max_retries,
            |v| *v <= 10,
        );
        override_from_env(
            env_vars::CODEGATE_RETRY_BASE_DELAY_MS,
            &mut self.retry.base_delay_ms,
            |_| true,
        );
        override_from_env(
            env_vars::CODEGATE_RETRY_MAX_DELAY_MS,
            &mut self.retry.max_delay_ms,
            |_| true,
        );

        override_from_env(
            env_vars::CODEGATE_OUTPUT_CAP_BYTES,
            &mut self.output_cap_bytes,
            |v| *v > 0,
        );
        override_from_env(env_vars::CODEGATE_PYTHON, &mut self.light.interpreter, |v: &String| {
            !v.trim().is_empty()
        });
        override_from_env(env_vars::CODEGATE_LIGHT_WORKERS, &mut self.light.workers, |v| {
            *v > 0
        });
        override_from_env(env_vars::CODEGATE_HEAVY_IMAGE, &mut self.heavy.image, |v: &String| {
            !v.trim().is_empty()
        });

        if let Ok(url) = std::env::var(env_vars::CODEGATE_DATABASE_URL) {
            if !url.trim().is_empty() {
                self.database_url = Some(url.trim().to_string());
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        for tier in Tier::ALL {
            let limits = self.tiers.get(tier);
            if limits.burst == 0 || limits.hourly == 0 || limits.daily == 0 {
                return Err(ConfigError::Invalid(format!(
                    "tier.{} quotas must be greater than zero",
                    tier
                )));
            }
            if limits.timeout_ms == 0 {
                return Err(ConfigError::Invalid(format!(
                    "tier.{}.timeoutMs must be greater than zero",
                    tier
                )));
            }
            if limits.memory_mb < 16 {
                return Err(ConfigError::Invalid(format!(
                    "tier.{}.memoryMB must be at least 16",
                    tier
                )));
            }
            if limits.cpu_cores <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "tier.{}.cpuCores must be positive",
                    tier
                )));
            }
        }

        if self.breaker.failure_threshold == 0 || self.breaker.success_threshold == 0 {
            return Err(ConfigError::Invalid(
                "breaker thresholds must be greater than zero".to_string(),
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "retry.baseDelayMs ({}) exceeds retry.maxDelayMs ({})",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            )));
        }
        if self.output_cap_bytes == 0 {
            return Err(ConfigError::Invalid(
                "outputCapBytes must be greater than zero".to_string(),
            ));
        }
        if self.light.workers == 0 || self.light.queue_depth == 0 {
            return Err(ConfigError::Invalid(
                "light.workers and light.queueDepth must be greater than zero".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.monitor.error_rate_threshold)
            || self.monitor.error_rate_threshold == 0.0
        {
            return Err(ConfigError::Invalid(format!(
                "monitor.errorRateThreshold must be in (0, 1], got {}",
                self.monitor.error_rate_threshold
            )));
        }
        if self.request.single_file_max_bytes == 0 || self.request.max_files == 0 {
            return Err(ConfigError::Invalid(
                "request size limits must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}
