//! Environment-driven configuration.
//!
//! | Variable | Default |
//! |---|---|
//! | `DATABASE_URL` | unset (only the Postgres store needs it) |
//! | `STOCKLEDGER_MAX_CONNECTIONS` | `10` |
//! | `STOCKLEDGER_ACQUIRE_TIMEOUT_SECS` | `5` |
//! | `STOCKLEDGER_REQUIRE_DEDUP_KEY` | `false` |
//! | `STOCKLEDGER_RECENT_ENTRIES_LIMIT` | `50` (at most 500) |

use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_RECENT_ENTRIES_LIMIT: u32 = 50;
pub const MAX_RECENT_ENTRIES_LIMIT: u32 = 500;

/// What to do when a caller sends a blank deduplication key.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum DedupKeyPolicy {
    /// Generate `auto:<uuid>` and flag the outcome. The call is not retry-safe.
    #[default]
    Synthesize,
    /// Reject with `MissingDeduplicationKey`.
    Require,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} is not set")]
    Missing { name: &'static str },

    #[error("{name} has invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub dedup_key_policy: DedupKeyPolicy,
    pub recent_entries_limit: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
            dedup_key_policy: DedupKeyPolicy::default(),
            recent_entries_limit: DEFAULT_RECENT_ENTRIES_LIMIT,
        }
    }
}

impl LedgerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let max_connections = match get("STOCKLEDGER_MAX_CONNECTIONS") {
            Some(v) => parse::<u32>("STOCKLEDGER_MAX_CONNECTIONS", &v)?,
            None => DEFAULT_MAX_CONNECTIONS,
        };
        if max_connections == 0 {
            return Err(invalid("STOCKLEDGER_MAX_CONNECTIONS", "0", "must be at least 1"));
        }

        let acquire_timeout_secs = match get("STOCKLEDGER_ACQUIRE_TIMEOUT_SECS") {
            Some(v) => parse::<u64>("STOCKLEDGER_ACQUIRE_TIMEOUT_SECS", &v)?,
            None => DEFAULT_ACQUIRE_TIMEOUT_SECS,
        };

        let require_key = match get("STOCKLEDGER_REQUIRE_DEDUP_KEY") {
            Some(v) => parse_bool("STOCKLEDGER_REQUIRE_DEDUP_KEY", &v)?,
            None => false,
        };

        let recent_entries_limit = match get("STOCKLEDGER_RECENT_ENTRIES_LIMIT") {
            Some(v) => parse::<u32>("STOCKLEDGER_RECENT_ENTRIES_LIMIT", &v)?,
            None => DEFAULT_RECENT_ENTRIES_LIMIT,
        };
        if recent_entries_limit == 0 || recent_entries_limit > MAX_RECENT_ENTRIES_LIMIT {
            return Err(invalid(
                "STOCKLEDGER_RECENT_ENTRIES_LIMIT",
                &recent_entries_limit.to_string(),
                &format!("must be between 1 and {MAX_RECENT_ENTRIES_LIMIT}"),
            ));
        }

        Ok(Self {
            database_url: get("DATABASE_URL"),
            max_connections,
            acquire_timeout: Duration::from_secs(acquire_timeout_secs),
            dedup_key_policy: if require_key {
                DedupKeyPolicy::Require
            } else {
                DedupKeyPolicy::Synthesize
            },
            recent_entries_limit,
        })
    }

    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::Missing {
                name: "DATABASE_URL",
            })
    }
}

fn invalid(name: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        name,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse<T>(name: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| invalid(name, value, &e.to_string()))
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(name, value, "expected a boolean")),
    }
}
