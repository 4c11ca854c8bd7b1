// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names used across Codegate

// Config file
pub const CODEGATE_CONFIG: &str = "CODEGATE_CONFIG";

// HTTP server
pub const CODEGATE_HOST: &str = "CODEGATE_HOST";
pub const CODEGATE_PORT: &str = "CODEGATE_PORT";
pub const PORT: &str = "PORT"; // Legacy

// HTTP flood guard (per client IP, in front of tiered admission)
pub const CODEGATE_HTTP_RPM: &str = "CODEGATE_HTTP_RPM";
pub const CODEGATE_HTTP_BURST: &str = "CODEGATE_HTTP_BURST";

// Counter storage
pub const CODEGATE_DATABASE_URL: &str = "CODEGATE_DATABASE_URL";

// Tier limits: CODEGATE_TIER_<ANONYMOUS|FREE|PAID>_<FIELD>
pub const CODEGATE_TIER_PREFIX: &str = "CODEGATE_TIER_";
pub const TIER_FIELD_BURST: &str = "BURST";
pub const TIER_FIELD_HOURLY: &str = "HOURLY";
pub const TIER_FIELD_DAILY: &str = "DAILY";
pub const TIER_FIELD_TIMEOUT_MS: &str = "TIMEOUT_MS";
pub const TIER_FIELD_MEMORY_MB: &str = "MEMORY_MB";

// Circuit breaker
pub const CODEGATE_BREAKER_FAILURE_THRESHOLD: &str = "CODEGATE_BREAKER_FAILURE_THRESHOLD";
pub const CODEGATE_BREAKER_RESET_TIMEOUT_MS: &str = "CODEGATE_BREAKER_RESET_TIMEOUT_MS";
pub const CODEGATE_BREAKER_SUCCESS_THRESHOLD: &str = "CODEGATE_BREAKER_SUCCESS_THRESHOLD";

// Retry
pub const CODEGATE_RETRY_MAX_RETRIES: &str = "CODEGATE_RETRY_MAX_RETRIES";
pub const CODEGATE_RETRY_BASE_DELAY_MS: &str = "CODEGATE_RETRY_BASE_DELAY_MS";
pub const CODEGATE_RETRY_MAX_DELAY_MS: &str = "CODEGATE_RETRY_MAX_DELAY_MS";

// Engines
pub const CODEGATE_OUTPUT_CAP_BYTES: &str = "CODEGATE_OUTPUT_CAP_BYTES";
pub const CODEGATE_PYTHON: &str = "CODEGATE_PYTHON";
pub const CODEGATE_LIGHT_WORKERS: &str = "CODEGATE_LIGHT_WORKERS";
pub const CODEGATE_HEAVY_IMAGE: &str = "CODEGATE_HEAVY_IMAGE";

// Logging
pub const RUST_LOG: &str = "RUST_LOG";
