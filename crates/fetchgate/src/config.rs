//! Coordinator configuration.
//!
//! Defaults come from the environment so deployments can retune limits
//! without a config file:
//! - `FETCHGATE_CONCURRENCY` (default 5)
//! - `FETCHGATE_DEADLINE_MS` (default 5000)
//! - `FETCHGATE_MAX_ROUNDS` (default 10)
//! - `FETCHGATE_MIN_CONCURRENCY` (default 1)

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::driver::ConcurrencyPolicy;
use crate::error::ConfigError;

const DEFAULT_CONCURRENCY: usize = 5;
const DEFAULT_DEADLINE_MS: u64 = 5_000;
const DEFAULT_MAX_ROUNDS: usize = 10;
const DEFAULT_MIN_CONCURRENCY: usize = 1;
const DEFAULT_SHRINK_DIVISOR: usize = 10;

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(var = name, value = %raw, "Ignoring unparsable environment override");
            default
        }),
        Err(_) => default,
    }
}

/// Submission-rate ceiling: at most `permits` submissions per `period`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub permits: usize,
    #[serde(rename = "period_ms", with = "millis")]
    pub period: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Permits for the first round; later rounds never exceed it.
    pub concurrency: usize,
    /// Per-registration timeout.
    #[serde(rename = "deadline_ms", with = "millis")]
    pub deadline: Duration,
    /// Round ceiling, first round included.
    #[serde(alias = "max_retries")]
    pub max_rounds: usize,
    /// Lower bound for the adaptive shrink.
    pub min_concurrency: usize,
    /// Timed-out items per extra permit in the retry heuristic.
    pub shrink_divisor: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitConfig>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            concurrency: env_or("FETCHGATE_CONCURRENCY", DEFAULT_CONCURRENCY),
            deadline: Duration::from_millis(env_or("FETCHGATE_DEADLINE_MS", DEFAULT_DEADLINE_MS)),
            max_rounds: env_or("FETCHGATE_MAX_ROUNDS", DEFAULT_MAX_ROUNDS),
            min_concurrency: env_or("FETCHGATE_MIN_CONCURRENCY", DEFAULT_MIN_CONCURRENCY),
            shrink_divisor: DEFAULT_SHRINK_DIVISOR,
            rate_limit: None,
        }
    }
}

impl CoordinatorConfig {
    /// Parse a JSON config; missing fields fall back to [`Default`].
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(invalid("concurrency", "must be at least 1"));
        }
        if self.deadline.is_zero() {
            return Err(invalid("deadline_ms", "must be positive"));
        }
        if self.max_rounds == 0 {
            return Err(invalid("max_rounds", "must be at least 1"));
        }
        if self.min_concurrency == 0 || self.min_concurrency > self.concurrency {
            return Err(invalid(
                "min_concurrency",
                format!("must be between 1 and concurrency ({})", self.concurrency),
            ));
        }
        if self.shrink_divisor == 0 {
            return Err(invalid("shrink_divisor", "must be at least 1"));
        }
        if let Some(rate) = &self.rate_limit {
            if rate.permits == 0 {
                return Err(invalid("rate_limit.permits", "must be at least 1"));
            }
            if rate.period.is_zero() {
                return Err(invalid("rate_limit.period_ms", "must be positive"));
            }
        }
        Ok(())
    }

    pub fn policy(&self) -> ConcurrencyPolicy {
        ConcurrencyPolicy::new(self.concurrency, self.min_concurrency, self.shrink_divisor)
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
