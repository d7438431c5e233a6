//! Environment configuration helpers.
//!
//! Every service reads its settings once at start-up through these helpers
//! and fails fast with a [`ConfigError`] naming the offending keys.

use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable(s): {}", .0.join(", "))]
    Missing(Vec<String>),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },

    #[error("duplicate value '{value}' for {}", .keys.join(", "))]
    Duplicate { value: String, keys: Vec<String> },
}

/// Read a variable that must be present and non-empty
pub fn required_env(key: &str) -> Result<String, ConfigError> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::Missing(vec![key.to_string()])),
    }
}

/// Read a variable, falling back to `default` when unset
pub fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Parse a variable, falling back to `default` when unset
pub fn env_parse_or<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                key: key.to_string(),
                reason: e.to_string(),
            })
        }
        _ => Ok(default),
    }
}

/// Parse a boolean flag (`true`/`false`/`1`/`0`/`yes`/`no`)
pub fn env_flag(key: &str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => parse_flag(raw.trim()).ok_or_else(|| {
            ConfigError::Invalid {
                key: key.to_string(),
                reason: format!("expected true or false, got '{raw}'"),
            }
        }),
        _ => Ok(default),
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}
