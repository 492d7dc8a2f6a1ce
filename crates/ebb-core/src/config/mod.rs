//! Engine configuration for host applications.
//!
//! Values come from the environment (`EBB_*`), with defaults suited to a
//! desktop client. Everything is validated up front so a bad value fails at
//! startup instead of mid-sync.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::breaker::BreakerSettings;
use crate::deny_list::DenyList;
use crate::error::Error;
use crate::outbox::OutboxSettings;
use crate::protocol::MAX_PULL_LIMIT;
use crate::registry::TableRegistry;
use crate::util::{is_http_url, normalize_text_option};

pub const DEFAULT_SCOPE: &str = "default";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for Error {
    fn from(error: ConfigError) -> Self {
        Self::Config(error.to_string())
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub relay_url: Option<String>,
    pub api_token: Option<String>,
    pub scope: String,
    pub flush_interval: Duration,
    /// Used instead of `flush_interval` while the queue exceeds the threshold
    pub fast_flush_interval: Duration,
    pub backpressure_threshold: u64,
    pub pull_interval: Duration,
    pub pull_page_size: u32,
    pub push_batch_size: usize,
    pub retry_base: Duration,
    pub retry_max: Duration,
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown: Duration,
    pub registry_path: Option<PathBuf>,
    pub deny_list_path: Option<PathBuf>,
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("EngineConfig")
            .field("relay_url", &self.relay_url)
            .field("api_token", &self.api_token.as_ref().map(|_| "[REDACTED]"))
            .field("scope", &self.scope)
            .field("flush_interval", &self.flush_interval)
            .field("fast_flush_interval", &self.fast_flush_interval)
            .field("backpressure_threshold", &self.backpressure_threshold)
            .field("pull_interval", &self.pull_interval)
            .field("pull_page_size", &self.pull_page_size)
            .field("push_batch_size", &self.push_batch_size)
            .field("retry_base", &self.retry_base)
            .field("retry_max", &self.retry_max)
            .field("breaker_failure_threshold", &self.breaker_failure_threshold)
            .field("breaker_cooldown", &self.breaker_cooldown)
            .field("registry_path", &self.registry_path)
            .field("deny_list_path", &self.deny_list_path)
            .finish()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            relay_url: None,
            api_token: None,
            scope: DEFAULT_SCOPE.to_string(),
            flush_interval: Duration::from_secs(5),
            fast_flush_interval: Duration::from_secs(1),
            backpressure_threshold: 500,
            pull_interval: Duration::from_secs(30),
            pull_page_size: 200,
            push_batch_size: 100,
            retry_base: Duration::from_millis(500),
            retry_max: Duration::from_secs(300),
            breaker_failure_threshold: 5,
            breaker_cooldown: Duration::from_secs(30),
            registry_path: None,
            deny_list_path: None,
        }
    }
}

impl EngineConfig {
    /// Defaults for the given scope
    pub fn for_scope(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            ..Self::default()
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let relay_url = optional_trimmed(&lookup, "EBB_RELAY_URL")
            .map(|value| value.trim_end_matches('/').to_string());
        let api_token = optional_trimmed(&lookup, "EBB_API_TOKEN");
        let scope = value_or_default(&lookup, "EBB_SCOPE", DEFAULT_SCOPE);

        let config = Self {
            relay_url,
            api_token,
            scope,
            flush_interval: Duration::from_secs(parse_in_range(
                &lookup,
                "EBB_FLUSH_INTERVAL_SECS",
                defaults.flush_interval.as_secs(),
                1..=3_600,
            )?),
            fast_flush_interval: Duration::from_secs(parse_in_range(
                &lookup,
                "EBB_FAST_FLUSH_INTERVAL_SECS",
                defaults.fast_flush_interval.as_secs(),
                1..=3_600,
            )?),
            backpressure_threshold: parse_in_range(
                &lookup,
                "EBB_BACKPRESSURE_THRESHOLD",
                defaults.backpressure_threshold,
                1..=1_000_000,
            )?,
            pull_interval: Duration::from_secs(parse_in_range(
                &lookup,
                "EBB_PULL_INTERVAL_SECS",
                defaults.pull_interval.as_secs(),
                1..=86_400,
            )?),
            pull_page_size: parse_in_range(
                &lookup,
                "EBB_PULL_PAGE_SIZE",
                defaults.pull_page_size,
                1..=MAX_PULL_LIMIT,
            )?,
            push_batch_size: parse_in_range(
                &lookup,
                "EBB_PUSH_BATCH_SIZE",
                defaults.push_batch_size,
                1..=1_000,
            )?,
            retry_base: Duration::from_millis(parse_in_range(
                &lookup,
                "EBB_RETRY_BASE_MS",
                500,
                10..=60_000,
            )?),
            retry_max: Duration::from_secs(parse_in_range(
                &lookup,
                "EBB_RETRY_MAX_SECS",
                defaults.retry_max.as_secs(),
                1..=86_400,
            )?),
            breaker_failure_threshold: parse_in_range(
                &lookup,
                "EBB_BREAKER_FAILURE_THRESHOLD",
                defaults.breaker_failure_threshold,
                1..=100,
            )?,
            breaker_cooldown: Duration::from_secs(parse_in_range(
                &lookup,
                "EBB_BREAKER_COOLDOWN_SECS",
                defaults.breaker_cooldown.as_secs(),
                1..=3_600,
            )?),
            registry_path: optional_trimmed(&lookup, "EBB_REGISTRY_PATH").map(PathBuf::from),
            deny_list_path: optional_trimmed(&lookup, "EBB_DENY_LIST_PATH").map(PathBuf::from),
        };
        config.validate()?;
        Ok(config)
    }

    /// Cross-field checks; also run by the engine for hand-built configs
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scope.trim().is_empty() {
            return Err(ConfigError::Invalid("EBB_SCOPE must not be empty".to_string()));
        }
        if let Some(url) = self.relay_url.as_deref() {
            if !is_http_url(url) {
                return Err(ConfigError::Invalid(
                    "EBB_RELAY_URL must start with http:// or https://".to_string(),
                ));
            }
        }
        if self.fast_flush_interval > self.flush_interval {
            return Err(ConfigError::Invalid(
                "EBB_FAST_FLUSH_INTERVAL_SECS must not exceed EBB_FLUSH_INTERVAL_SECS".to_string(),
            ));
        }
        if self.retry_base > self.retry_max {
            return Err(ConfigError::Invalid(
                "EBB_RETRY_BASE_MS must not exceed EBB_RETRY_MAX_SECS".to_string(),
            ));
        }
        if self.push_batch_size == 0 || self.pull_page_size == 0 {
            return Err(ConfigError::Invalid(
                "batch and page sizes must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Relay URL and token, both required to talk to a relay
    pub fn remote_credentials(&self) -> Result<(&str, &str), ConfigError> {
        let url = self
            .relay_url
            .as_deref()
            .ok_or(ConfigError::MissingVar("EBB_RELAY_URL"))?;
        let token = self
            .api_token
            .as_deref()
            .ok_or(ConfigError::MissingVar("EBB_API_TOKEN"))?;
        Ok((url, token))
    }

    /// Host registry if configured, otherwise the built-in tables
    pub fn load_registry(&self) -> crate::Result<TableRegistry> {
        match &self.registry_path {
            Some(path) => TableRegistry::from_path(path),
            None => Ok(TableRegistry::builtin()),
        }
    }

    /// Built-in deny rules plus any host rules
    pub fn load_deny_list(&self) -> crate::Result<DenyList> {
        let mut deny_list = DenyList::builtin();
        if let Some(path) = &self.deny_list_path {
            deny_list.extend(DenyList::from_path(path)?);
        }
        Ok(deny_list)
    }

    pub const fn outbox_settings(&self) -> OutboxSettings {
        OutboxSettings {
            batch_size: self.push_batch_size,
            retry_base: self.retry_base,
            retry_max: self.retry_max,
        }
    }

    pub fn breaker_settings(&self) -> BreakerSettings {
        BreakerSettings {
            failure_threshold: self.breaker_failure_threshold,
            cooldown: self.breaker_cooldown,
            max_cooldown: self.breaker_cooldown.saturating_mul(16).min(Duration::from_secs(3_600)),
        }
    }
}

fn parse_in_range<T>(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
    range: RangeInclusive<T>,
) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + fmt::Display + Copy,
{
    let invalid = || {
        ConfigError::Invalid(format!(
            "{name} must be an integer in [{}, {}]",
            range.start(),
            range.end()
        ))
    };
    let value = match optional_trimmed(lookup, name) {
        Some(raw) => raw.parse::<T>().map_err(|_| invalid())?,
        None => default,
    };
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(invalid())
    }
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    normalize_text_option(lookup(name))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(pairs: &[(&str, &str)]) -> Result<EngineConfig, ConfigError> {
        let map: HashMap<&str, &str> = pairs.iter().copied().collect();
        EngineConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string()))
    }

    #[test]
    fn defaults_apply_without_environment() {
        let config = config(&[]).unwrap();
        assert_eq!(config.scope, DEFAULT_SCOPE);
        assert_eq!(config.flush_interval, Duration::from_secs(5));
        assert_eq!(config.fast_flush_interval, Duration::from_secs(1));
        assert_eq!(config.pull_page_size, 200);
        assert!(config.relay_url.is_none());
        assert!(config.remote_credentials().is_err());
    }

    #[test]
    fn environment_defaults_match_programmatic_defaults() {
        assert_eq!(config(&[]).unwrap(), EngineConfig::default());
        assert_eq!(
            config(&[("EBB_SCOPE", "work")]).unwrap(),
            EngineConfig::for_scope("work")
        );
    }

    #[test]
    fn reads_and_trims_values() {
        let config = config(&[
            ("EBB_RELAY_URL", " https://relay.example.com/ "),
            ("EBB_API_TOKEN", "token-1"),
            ("EBB_SCOPE", "work"),
            ("EBB_PULL_PAGE_SIZE", "50"),
            ("EBB_RETRY_BASE_MS", "250"),
        ])
        .unwrap();
        assert_eq!(
            config.remote_credentials().unwrap(),
            ("https://relay.example.com", "token-1")
        );
        assert_eq!(config.scope, "work");
        assert_eq!(config.pull_page_size, 50);
        assert_eq!(config.retry_base, Duration::from_millis(250));
    }

    #[test]
    fn rejects_out_of_range_and_inconsistent_values() {
        let err = config(&[("EBB_PULL_PAGE_SIZE", "5000")]).unwrap_err();
        assert!(err.to_string().contains("EBB_PULL_PAGE_SIZE"));

        let err = config(&[("EBB_FLUSH_INTERVAL_SECS", "abc")]).unwrap_err();
        assert!(err.to_string().contains("EBB_FLUSH_INTERVAL_SECS"));

        let err = config(&[
            ("EBB_FLUSH_INTERVAL_SECS", "2"),
            ("EBB_FAST_FLUSH_INTERVAL_SECS", "10"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("EBB_FAST_FLUSH_INTERVAL_SECS"));

        let err = config(&[("EBB_RELAY_URL", "relay.example.com")]).unwrap_err();
        assert!(err.to_string().contains("EBB_RELAY_URL"));
    }

    #[test]
    fn debug_redacts_token() {
        let config = config(&[("EBB_API_TOKEN", "sensitive-token")]).unwrap();
        let debug_output = format!("{config:?}");
        assert!(!debug_output.contains("sensitive-token"));
        assert!(debug_output.contains("[REDACTED]"));
    }

    #[test]
    fn loads_builtin_registry_and_deny_list_by_default() {
        let config = EngineConfig::for_scope("s");
        assert!(config.load_registry().unwrap().contains("threads"));
        assert!(config.load_deny_list().unwrap().denies_key("kv", "cache.x"));
    }
}
