//! Configuration management for slidelimit.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::error::{LimiterError, Result};
use crate::ratelimit::{PolicyTable, DEFAULT_STATS_WINDOW_SECS, SCOPE_SEPARATOR};

/// Prefix for environment variable overrides, e.g. `SLIDELIMIT__LIMITER__POLICY_MODE`.
const ENV_PREFIX: &str = "SLIDELIMIT";

/// Main configuration for the limiter process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlidelimitConfig {
    /// Limiter configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Idle-key reaper configuration
    #[serde(default)]
    pub reaper: ReaperConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Named policies, keyed by scope
    #[serde(default)]
    pub policies: PolicyTable,
}

/// The policy table alone, parsed with its keys untouched.
#[derive(Debug, Default, Deserialize)]
struct PolicySection {
    #[serde(default)]
    policies: PolicyTable,
}

/// How the limiter treats the policy supplied on each call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    /// Every call is evaluated against the policy it supplies.
    #[default]
    Latest,
    /// The first policy seen for a key is bound to it until the key is cleared.
    Bound,
}

/// Limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Number of independently locked shards in the key map.
    /// Must be a power of two greater than one; `None` lets the map decide.
    #[serde(default)]
    pub shard_amount: Option<usize>,

    /// Policy handling for repeated calls on the same key
    #[serde(default)]
    pub policy_mode: PolicyMode,

    /// Window used by stats queries that do not name one
    #[serde(default = "default_stats_window")]
    pub stats_window_secs: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            shard_amount: None,
            policy_mode: PolicyMode::default(),
            stats_window_secs: default_stats_window(),
        }
    }
}

fn default_stats_window() -> u64 {
    DEFAULT_STATS_WINDOW_SECS
}

/// Idle-key reaper configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperConfig {
    /// Whether the host process should run the reaper task
    #[serde(default)]
    pub enabled: bool,

    /// Seconds between sweeps
    #[serde(default = "default_reap_interval")]
    pub interval_secs: u64,

    /// Keys whose newest request is older than this are removed
    #[serde(default = "default_idle_horizon")]
    pub idle_horizon_secs: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_reap_interval(),
            idle_horizon_secs: default_idle_horizon(),
        }
    }
}

fn default_reap_interval() -> u64 {
    30
}

fn default_idle_horizon() -> u64 {
    3600
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl SlidelimitConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: SlidelimitConfig =
            serde_yaml::from_str(yaml).map_err(|e| LimiterError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional YAML file layered under
    /// `SLIDELIMIT__*` environment overrides.
    ///
    /// The `config` crate lowercases map keys, so the policy table is read
    /// from the file with `serde_yaml` to keep scope names as written.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(
                config::File::from(path).format(config::FileFormat::Yaml),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let mut config: SlidelimitConfig = builder.build()?.try_deserialize()?;

        if let Some(path) = path {
            let contents = std::fs::read_to_string(path)?;
            let section: PolicySection =
                serde_yaml::from_str(&contents).map_err(|e| LimiterError::Config(e.to_string()))?;
            config.policies = section.policies;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the limiter cannot run with.
    pub fn validate(&self) -> Result<()> {
        if let Some(shards) = self.limiter.shard_amount {
            if shards < 2 || !shards.is_power_of_two() {
                return Err(LimiterError::Config(format!(
                    "limiter.shard_amount must be a power of two greater than 1, got {}",
                    shards
                )));
            }
        }

        for scope in self.policies.scopes() {
            if scope.is_empty() || scope.contains(SCOPE_SEPARATOR) {
                return Err(LimiterError::Config(format!(
                    "policy scope '{}' must be non-empty and must not contain '{}'",
                    scope, SCOPE_SEPARATOR
                )));
            }
        }

        if self.reaper.enabled && self.reaper.interval_secs == 0 {
            return Err(LimiterError::Config(
                "reaper.interval_secs must be positive when the reaper is enabled".to_string(),
            ));
        }

        Ok(())
    }
}
