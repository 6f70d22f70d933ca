// ABOUTME: Environment-derived configuration overrides
// ABOUTME: Applies well-formed BRIDGEKIT_* values to a SandboxConfig, ignoring malformed ones

use crate::error::{Result, SandboxError};
use crate::types::SandboxConfig;
use std::str::FromStr;
use tracing::{info, warn};

/// Sandbox timeout override, in seconds (must be > 0)
pub const ENV_SANDBOX_TIMEOUT: &str = "BRIDGEKIT_SANDBOX_TIMEOUT";
/// Service keepalive interval override, in seconds (0 disables)
pub const ENV_KEEPALIVE_SECS: &str = "BRIDGEKIT_KEEPALIVE_SECS";
/// Platform keepalive interval override, in seconds (0 disables)
pub const ENV_PLATFORM_KEEPALIVE_SECS: &str = "BRIDGEKIT_PLATFORM_KEEPALIVE_SECS";
/// Template reference fallback, used when the config carries none
pub const ENV_TEMPLATE_ID: &str = "BRIDGEKIT_TEMPLATE_ID";

/// Parse an override variable, keeping `current` when the variable is unset,
/// unparseable, or rejected by the validator. Malformed values are logged
/// and ignored rather than failing the caller.
fn override_from_env<T, F>(var_name: &str, current: T, validator: F) -> T
where
    T: FromStr + Copy + std::fmt::Display,
    F: Fn(T) -> bool,
{
    let raw = match std::env::var(var_name) {
        Ok(raw) => raw,
        Err(_) => return current,
    };
    match raw.parse::<T>() {
        Ok(parsed) if validator(parsed) => {
            info!("Using {} from {}", parsed, var_name);
            parsed
        }
        Ok(parsed) => {
            warn!(
                "{} has out-of-range value {}; keeping {}",
                var_name, parsed, current
            );
            current
        }
        Err(_) => {
            warn!(
                "{} has unparseable value '{}'; keeping {}",
                var_name, raw, current
            );
            current
        }
    }
}

/// Resolve the mandatory template reference: explicit config value first,
/// then the environment fallback, else failure before any backend call.
pub fn resolve_template_id(config: &SandboxConfig) -> Result<String> {
    let explicit = config.template_id.trim();
    if !explicit.is_empty() {
        return Ok(explicit.to_string());
    }
    match std::env::var(ENV_TEMPLATE_ID) {
        Ok(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        _ => Err(SandboxError::MissingTemplate),
    }
}

/// Apply every supported environment override to the configuration
pub fn apply_env_overrides(config: &mut SandboxConfig) {
    config.timeout_seconds =
        override_from_env(ENV_SANDBOX_TIMEOUT, config.timeout_seconds, |v| v > 0);
    config.keepalive_interval_secs =
        override_from_env(ENV_KEEPALIVE_SECS, config.keepalive_interval_secs, |_| true);
    config.platform_keepalive_interval_secs = override_from_env(
        ENV_PLATFORM_KEEPALIVE_SECS,
        config.platform_keepalive_interval_secs,
        |_| true,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Process environment is shared across test threads
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn env_guard() -> std::sync::MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[test]
    fn timeout_override_applied_when_valid() {
        let _guard = env_guard();
        std::env::set_var("BRIDGEKIT_SANDBOX_TIMEOUT", "600");
        let mut config = SandboxConfig::default();
        apply_env_overrides(&mut config);
        assert_eq!(config.timeout_seconds, 600);
        std::env::remove_var("BRIDGEKIT_SANDBOX_TIMEOUT");
    }

    #[test]
    fn malformed_timeout_keeps_default() {
        let _guard = env_guard();
        std::env::set_var("BRIDGEKIT_SANDBOX_TIMEOUT", "not-a-number");
        let mut config = SandboxConfig::default();
        apply_env_overrides(&mut config);
        assert_eq!(config.timeout_seconds, 3600);
        std::env::remove_var("BRIDGEKIT_SANDBOX_TIMEOUT");
    }

    #[test]
    fn zero_timeout_rejected_but_zero_keepalive_allowed() {
        let _guard = env_guard();
        std::env::set_var("BRIDGEKIT_SANDBOX_TIMEOUT", "0");
        std::env::set_var("BRIDGEKIT_KEEPALIVE_SECS", "0");
        let mut config = SandboxConfig::default();
        apply_env_overrides(&mut config);
        assert_eq!(config.timeout_seconds, 3600);
        assert_eq!(config.keepalive_interval_secs, 0);
        std::env::remove_var("BRIDGEKIT_SANDBOX_TIMEOUT");
        std::env::remove_var("BRIDGEKIT_KEEPALIVE_SECS");
    }

    #[test]
    fn template_resolution_prefers_explicit_value() {
        let config = SandboxConfig {
            template_id: "tmpl-explicit".to_string(),
            ..Default::default()
        };
        assert_eq!(resolve_template_id(&config).unwrap(), "tmpl-explicit");
    }

    #[test]
    fn template_resolution_fails_when_both_absent() {
        let _guard = env_guard();
        std::env::remove_var("BRIDGEKIT_TEMPLATE_ID");
        let config = SandboxConfig::default();
        let err = resolve_template_id(&config).unwrap_err();
        assert!(matches!(err, SandboxError::MissingTemplate));
    }
}
