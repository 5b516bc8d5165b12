//! Engine configuration loaded from TOML.
//!
//! Every section is optional; missing keys take their defaults:
//!
//! ```toml
//! [rate_limit]
//! max_calls = 30
//! period_secs = 60
//!
//! [circuit_breaker]
//! failure_threshold = 3
//! cooldown_secs = 300
//! reset_per_run = false    # true: every run starts with closed circuits
//!
//! [retry]
//! max_backoff_secs = 3600   # 0 disables the cap
//! attempts_per_run = 3
//!
//! [pool]
//! workers = 1
//!
//! [store]
//! path = "checkpoints/failed_portfolios.json"
//!
//! [output]
//! dir = "reports"
//! ```

use reportbatch_core::{CircuitBreakerConfig, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Upper bound on concurrent in-flight calls.
pub const MAX_WORKERS: usize = 5;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub rate_limit: RateLimitSection,
    pub circuit_breaker: CircuitBreakerSection,
    pub retry: RetrySection,
    pub pool: PoolSection,
    pub store: StoreSection,
    pub output: OutputSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    pub max_calls: usize,
    pub period_secs: u64,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            max_calls: 30,
            period_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSection {
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
    pub cooldown_multiplier: f64,
    pub max_cooldown_secs: u64,
    /// Close every circuit at the start of each run of an orchestrator.
    pub reset_per_run: bool,
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_secs: 300,
            cooldown_multiplier: 2.0,
            max_cooldown_secs: 3600,
            reset_per_run: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    /// Cap on cross-run backoff. Zero disables the cap.
    pub max_backoff_secs: u64,
    /// Calls per portfolio within one run before its failure is recorded.
    pub attempts_per_run: u32,
    /// Delay before the second in-run attempt; doubles afterwards.
    pub in_run_base_delay_ms: u64,
    /// Random extra delay as a fraction of the computed delay.
    pub in_run_jitter: f64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_backoff_secs: 3600,
            attempts_per_run: 3,
            in_run_base_delay_ms: 2000,
            in_run_jitter: 0.3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    pub workers: usize,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self { workers: 1 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub path: PathBuf,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("checkpoints/failed_portfolios.json"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSection {
    pub dir: PathBuf,
}

impl Default for OutputSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("reports"),
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rate_limit.max_calls == 0 {
            return Err(ConfigError::Invalid("rate_limit.max_calls must be > 0".into()));
        }
        if self.rate_limit.period_secs == 0 {
            return Err(ConfigError::Invalid("rate_limit.period_secs must be > 0".into()));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "circuit_breaker.failure_threshold must be > 0".into(),
            ));
        }
        if !(self.circuit_breaker.cooldown_multiplier >= 1.0
            && self.circuit_breaker.cooldown_multiplier.is_finite())
        {
            return Err(ConfigError::Invalid(
                "circuit_breaker.cooldown_multiplier must be a finite value >= 1.0".into(),
            ));
        }
        if self.retry.attempts_per_run == 0 {
            return Err(ConfigError::Invalid("retry.attempts_per_run must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.retry.in_run_jitter) {
            return Err(ConfigError::Invalid("retry.in_run_jitter must be in [0, 1]".into()));
        }
        Ok(())
    }

    /// Worker count clamped to `1..=MAX_WORKERS`.
    pub fn workers(&self) -> usize {
        self.pool.workers.clamp(1, MAX_WORKERS)
    }

    pub fn rate_period(&self) -> Duration {
        Duration::from_secs(self.rate_limit.period_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        match self.retry.max_backoff_secs {
            0 => RetryPolicy::uncapped(),
            secs => RetryPolicy::capped(Duration::from_secs(secs)),
        }
    }

    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit_breaker.failure_threshold,
            cooldown: Duration::from_secs(self.circuit_breaker.cooldown_secs),
            cooldown_multiplier: self.circuit_breaker.cooldown_multiplier,
            max_cooldown: Duration::from_secs(self.circuit_breaker.max_cooldown_secs),
        }
    }

    pub fn in_run_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry.in_run_base_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = EngineConfig::from_toml("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.rate_limit.max_calls, 30);
        assert_eq!(config.workers(), 1);
        assert_eq!(
            config.retry_policy().max_backoff,
            Some(Duration::from_secs(3600))
        );
    }

    #[test]
    fn partial_sections_merge_with_defaults() {
        let config = EngineConfig::from_toml(
            r#"
[pool]
workers = 12

[retry]
max_backoff_secs = 0

[circuit_breaker]
cooldown_secs = 30
"#,
        )
        .unwrap();
        assert_eq!(config.workers(), MAX_WORKERS);
        assert_eq!(config.retry_policy(), RetryPolicy::uncapped());
        assert_eq!(config.retry.attempts_per_run, 3);
        let cb = config.circuit_breaker_config();
        assert_eq!(cb.cooldown, Duration::from_secs(30));
        assert_eq!(cb.failure_threshold, 3);
        assert!(!config.circuit_breaker.reset_per_run);
    }

    #[test]
    fn rejects_invalid_values() {
        for doc in [
            "[rate_limit]\nmax_calls = 0\n",
            "[rate_limit]\nperiod_secs = 0\n",
            "[circuit_breaker]\nfailure_threshold = 0\n",
            "[circuit_breaker]\ncooldown_multiplier = 0.5\n",
            "[retry]\nattempts_per_run = 0\n",
            "[retry]\nin_run_jitter = 1.5\n",
        ] {
            assert!(
                matches!(EngineConfig::from_toml(doc), Err(ConfigError::Invalid(_))),
                "{doc}"
            );
        }
    }

    #[test]
    fn unknown_toml_is_a_parse_error() {
        assert!(matches!(
            EngineConfig::from_toml("[pool]\nworkers = \"many\"\n"),
            Err(ConfigError::Parse(_))
        ));
    }
}
