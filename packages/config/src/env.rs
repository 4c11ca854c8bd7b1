// ABOUTME: Environment variable parsing utilities
// ABOUTME: Typed parsing with defaults, fallbacks, and validated in-place overrides

use std::fmt::Display;
use std::str::FromStr;

/// Parse an environment variable with a fallback default value
/// Returns the parsed value or the default if the variable is not set or cannot be parsed
pub fn parse_env_or_default<T>(var_name: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(var_name)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// Parse an environment variable with fallback to another variable
/// Tries the primary variable first, then falls back to the secondary, then to the default
pub fn parse_env_with_fallback<T>(primary_var: &str, fallback_var: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(primary_var)
        .or_else(|_| std::env::var(fallback_var))
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// Overwrite `target` with the value of `var_name` when it is set, parses, and passes `validator`.
///
/// Returns `true` when the override was applied. Set-but-invalid values are logged and ignored
/// so a typo in a deployment never silently zeroes a limit.
pub fn override_from_env<T, F>(var_name: &str, target: &mut T, validator: F) -> bool
where
    T: FromStr + Display,
    F: Fn(&T) -> bool,
{
    let Ok(raw_value) = std::env::var(var_name) else {
        return false;
    };

    match raw_value.trim().parse::<T>() {
        Ok(parsed) if validator(&parsed) => {
            tracing::debug!(var = var_name, value = %parsed, "Applied environment override");
            *target = parsed;
            true
        }
        Ok(_) => {
            tracing::warn!(
                "Environment variable {} has invalid value '{}', keeping: {}",
                var_name,
                raw_value,
                target
            );
            false
        }
        Err(_) => {
            tracing::warn!(
                "Environment variable {} has unparseable value '{}', keeping: {}",
                var_name,
                raw_value,
                target
            );
            false
        }
    }
}
