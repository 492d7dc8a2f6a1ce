use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use ebb_core::protocol::MAX_PULL_LIMIT;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub db_path: PathBuf,
    /// Bearer token to identity
    pub api_tokens: HashMap<String, String>,
    pub rate_limit_window: Duration,
    pub push_rate_limit_per_window: u32,
    pub pull_rate_limit_per_window: u32,
    pub rate_limit_max_identities: usize,
    pub pull_max_limit: u32,
    pub gc_interval: Duration,
    pub registry_path: Option<PathBuf>,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut identities: Vec<&str> = self.api_tokens.values().map(String::as_str).collect();
        identities.sort_unstable();
        formatter
            .debug_struct("AppConfig")
            .field("bind_addr", &self.bind_addr)
            .field("db_path", &self.db_path)
            .field("api_tokens", &format!("[REDACTED; {} tokens]", self.api_tokens.len()))
            .field("identities", &identities)
            .field("rate_limit_window", &self.rate_limit_window)
            .field(
                "push_rate_limit_per_window",
                &self.push_rate_limit_per_window,
            )
            .field(
                "pull_rate_limit_per_window",
                &self.pull_rate_limit_per_window,
            )
            .field("rate_limit_max_identities", &self.rate_limit_max_identities)
            .field("pull_max_limit", &self.pull_max_limit)
            .field("gc_interval", &self.gc_interval)
            .field("registry_path", &self.registry_path)
            .finish()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = value_or_default(&lookup, "EBB_RELAY_BIND_ADDR", "127.0.0.1:8080");
        let db_path = PathBuf::from(value_or_default(
            &lookup,
            "EBB_RELAY_DB_PATH",
            "ebb-relay.db",
        ));

        let raw_tokens = required_trimmed(&lookup, "EBB_RELAY_API_TOKENS")?;
        let api_tokens = parse_api_tokens(&raw_tokens)?;

        let rate_limit_window_secs =
            parse_in_range(&lookup, "RATE_LIMIT_WINDOW_SECS", 60_u64, 10, 3_600)?;
        let push_rate_limit_per_window =
            parse_in_range(&lookup, "PUSH_RATE_LIMIT_PER_WINDOW", 120_u32, 1, 10_000)?;
        let pull_rate_limit_per_window =
            parse_in_range(&lookup, "PULL_RATE_LIMIT_PER_WINDOW", 240_u32, 1, 10_000)?;
        let rate_limit_max_identities =
            parse_in_range(&lookup, "RATE_LIMIT_MAX_IDENTITIES", 10_000_usize, 16, 1_000_000)?;
        let pull_max_limit =
            parse_in_range(&lookup, "PULL_MAX_LIMIT", 500_u32, 1, MAX_PULL_LIMIT)?;
        let gc_interval_secs = parse_in_range(&lookup, "GC_INTERVAL_SECS", 300_u64, 10, 86_400)?;

        let registry_path = optional_trimmed(&lookup, "EBB_REGISTRY_PATH").map(PathBuf::from);

        Ok(Self {
            bind_addr,
            db_path,
            api_tokens,
            rate_limit_window: Duration::from_secs(rate_limit_window_secs),
            push_rate_limit_per_window,
            pull_rate_limit_per_window,
            rate_limit_max_identities,
            pull_max_limit,
            gc_interval: Duration::from_secs(gc_interval_secs),
            registry_path,
        })
    }
}

/// `token=identity` pairs separated by commas
fn parse_api_tokens(raw: &str) -> Result<HashMap<String, String>, ConfigError> {
    let mut tokens = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
        let (token, identity) = entry
            .split_once('=')
            .map(|(token, identity)| (token.trim(), identity.trim()))
            .filter(|(token, identity)| !token.is_empty() && !identity.is_empty())
            .ok_or_else(|| {
                ConfigError::Invalid(
                    "EBB_RELAY_API_TOKENS entries must look like `token=identity`".to_string(),
                )
            })?;
        if tokens
            .insert(token.to_string(), identity.to_string())
            .is_some()
        {
            return Err(ConfigError::Invalid(
                "EBB_RELAY_API_TOKENS contains a duplicate token".to_string(),
            ));
        }
    }
    if tokens.is_empty() {
        return Err(ConfigError::MissingVar("EBB_RELAY_API_TOKENS"));
    }
    Ok(tokens)
}

fn parse_in_range<T>(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
    min: T,
    max: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialOrd + fmt::Display + Copy,
{
    let value = match optional_trimmed(lookup, name) {
        Some(raw) => raw.parse::<T>().map_err(|_| {
            ConfigError::Invalid(format!("{name} must be an integer in [{min}, {max}]"))
        })?,
        None => default,
    };
    if value < min || value > max {
        return Err(ConfigError::Invalid(format!(
            "{name} must be in [{min}, {max}]"
        )));
    }
    Ok(value)
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn required_trimmed(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    optional_trimmed(lookup, name).ok_or(ConfigError::MissingVar(name))
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(map: &HashMap<&str, &str>) -> Result<AppConfig, ConfigError> {
        AppConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string()))
    }

    #[test]
    fn config_requires_api_tokens() {
        let map: HashMap<&str, &str> = HashMap::new();
        let err = config(&map).unwrap_err();
        assert!(err.to_string().contains("EBB_RELAY_API_TOKENS"));
    }

    #[test]
    fn config_applies_defaults() {
        let map = HashMap::from([("EBB_RELAY_API_TOKENS", "tok-a=alice, tok-b=bob")]);
        let config = config(&map).unwrap();

        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.api_tokens.get("tok-b").map(String::as_str), Some("bob"));
        assert_eq!(config.pull_max_limit, 500);
        assert_eq!(config.rate_limit_window, Duration::from_secs(60));
        assert!(config.registry_path.is_none());
    }

    #[test]
    fn config_rejects_out_of_range_values() {
        let map = HashMap::from([
            ("EBB_RELAY_API_TOKENS", "tok=alice"),
            ("PULL_MAX_LIMIT", "5000"),
        ]);
        let err = config(&map).unwrap_err();
        assert!(err.to_string().contains("PULL_MAX_LIMIT must be in [1, 1000]"));

        let map = HashMap::from([
            ("EBB_RELAY_API_TOKENS", "tok=alice"),
            ("RATE_LIMIT_WINDOW_SECS", "soon"),
        ]);
        assert!(config(&map).is_err());
    }

    #[test]
    fn config_rejects_malformed_tokens() {
        for raw in ["tok", "=alice", "tok=", "tok=a,tok=b"] {
            let map = HashMap::from([("EBB_RELAY_API_TOKENS", raw)]);
            assert!(config(&map).is_err(), "{raw} should be rejected");
        }
    }

    #[test]
    fn config_redacts_sensitive_debug_fields() {
        let map = HashMap::from([("EBB_RELAY_API_TOKENS", "sensitive-token=alice")]);
        let config = config(&map).unwrap();

        let debug_output = format!("{config:?}");
        assert!(!debug_output.contains("sensitive-token"));
        assert!(debug_output.contains("[REDACTED"));
        assert!(debug_output.contains("alice"));
    }
}
