//! Environment-backed configuration for `billing-smoke`.

use std::{env, error::Error, fmt};

use billing_core::{
    RetryPolicy, RuntimeConfig,
    retry::{DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_RECONNECT_STEP_MS},
};

const DEFAULT_PRODUCT_ID: &str = "premium_upgrade";
const DEFAULT_COMMAND_BUFFER: usize = 64;
const DEFAULT_EVENT_BUFFER: usize = 256;

/// Configuration used by the smoke run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BillingSmokeConfig {
    /// Runtime tuning forwarded to `spawn_runtime`.
    pub runtime: RuntimeConfig,
    /// Product the smoke flow queries, buys and consumes.
    pub product_id: String,
}

impl BillingSmokeConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let step_delay_ms = parse_optional_u64_with_default(
            "BILLING_RECONNECT_STEP_MS",
            DEFAULT_RECONNECT_STEP_MS,
            &mut lookup,
        )?;
        let max_attempts = parse_optional_u32_with_default(
            "BILLING_MAX_RECONNECT_ATTEMPTS",
            DEFAULT_MAX_RECONNECT_ATTEMPTS,
            &mut lookup,
        )?;
        let command_buffer = parse_optional_usize(
            "BILLING_COMMAND_BUFFER",
            DEFAULT_COMMAND_BUFFER,
            &mut lookup,
        )?;
        let event_buffer =
            parse_optional_usize("BILLING_EVENT_BUFFER", DEFAULT_EVENT_BUFFER, &mut lookup)?;
        let product_id = optional_trimmed_env("BILLING_SMOKE_PRODUCT_ID", &mut lookup)
            .unwrap_or_else(|| DEFAULT_PRODUCT_ID.to_owned());

        if step_delay_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "BILLING_RECONNECT_STEP_MS",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }
        if command_buffer == 0 {
            return Err(ConfigError::InvalidValue {
                key: "BILLING_COMMAND_BUFFER",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }
        if event_buffer == 0 {
            return Err(ConfigError::InvalidValue {
                key: "BILLING_EVENT_BUFFER",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }

        Ok(Self {
            runtime: RuntimeConfig {
                retry_policy: RetryPolicy::new(step_delay_ms, max_attempts),
                command_buffer,
                event_buffer,
            },
            product_id,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid {key}='{value}': {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_optional<T, F>(key: &'static str, lookup: &mut F) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    value
        .parse::<T>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_optional_u64_with_default<F>(
    key: &'static str,
    default: u64,
    lookup: &mut F,
) -> Result<u64, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    Ok(parse_optional(key, lookup)?.unwrap_or(default))
}

fn parse_optional_u32_with_default<F>(
    key: &'static str,
    default: u32,
    lookup: &mut F,
) -> Result<u32, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    Ok(parse_optional(key, lookup)?.unwrap_or(default))
}

fn parse_optional_usize<F>(
    key: &'static str,
    default: usize,
    lookup: &mut F,
) -> Result<usize, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    Ok(parse_optional(key, lookup)?.unwrap_or(default))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from_pairs(pairs: &[(&str, &str)]) -> Result<BillingSmokeConfig, ConfigError> {
        let map = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect::<HashMap<_, _>>();
        BillingSmokeConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn uses_defaults_without_environment() {
        let cfg = config_from_pairs(&[]).expect("empty config should parse");

        assert_eq!(cfg.runtime, RuntimeConfig::default());
        assert_eq!(cfg.runtime.retry_policy.step_delay_ms(), 2_000);
        assert_eq!(cfg.runtime.retry_policy.max_attempts(), 3);
        assert_eq!(cfg.product_id, DEFAULT_PRODUCT_ID);
    }

    #[test]
    fn parses_runtime_tuning_when_present() {
        let cfg = config_from_pairs(&[
            ("BILLING_RECONNECT_STEP_MS", "500"),
            ("BILLING_MAX_RECONNECT_ATTEMPTS", "5"),
            ("BILLING_COMMAND_BUFFER", "8"),
            ("BILLING_EVENT_BUFFER", " 32 "),
            ("BILLING_SMOKE_PRODUCT_ID", " gold_coins "),
        ])
        .expect("config should parse");

        assert_eq!(cfg.runtime.retry_policy, RetryPolicy::new(500, 5));
        assert_eq!(cfg.runtime.command_buffer, 8);
        assert_eq!(cfg.runtime.event_buffer, 32);
        assert_eq!(cfg.product_id, "gold_coins");
    }

    #[test]
    fn zero_attempts_disables_reconnect() {
        let cfg = config_from_pairs(&[("BILLING_MAX_RECONNECT_ATTEMPTS", "0")])
            .expect("zero attempts should parse");
        assert!(!cfg.runtime.retry_policy.should_retry(1));
    }

    #[test]
    fn rejects_invalid_numeric_values() {
        let err = config_from_pairs(&[("BILLING_RECONNECT_STEP_MS", "soon")])
            .expect_err("invalid step should fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "BILLING_RECONNECT_STEP_MS",
                ..
            }
        ));

        let err = config_from_pairs(&[("BILLING_COMMAND_BUFFER", "0")])
            .expect_err("zero buffer should fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "BILLING_COMMAND_BUFFER",
                ..
            }
        ));
    }
}
