use crate::error::ConfigError;
use chrono::Duration;
use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use getset::CopyGetters;
use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;
use std::path::Path;

/// Configuration for call deduplication
///
/// Record TTL, sweep period and dispatch spacing are separate knobs; none of
/// them stands in for another.
#[serde_inline_default]
#[derive(Clone, Debug, Serialize, Deserialize, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct DedupeConfig {
    /// Whether deduplication is enabled
    #[serde_inline_default(true)]
    enabled: bool,
    /// Default time-to-live of a call record, in milliseconds
    #[serde_inline_default(10_000)]
    expire_in_ms: u64,
    /// How often the sweeper purges expired records, in milliseconds
    #[serde_inline_default(30_000)]
    sweep_interval_ms: u64,
    /// Minimum spacing between two dispatches, in milliseconds. Zero disables throttling
    #[serde_inline_default(100)]
    dispatch_interval_ms: u64,
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            expire_in_ms: 10_000,
            sweep_interval_ms: 30_000,
            dispatch_interval_ms: 100,
        }
    }
}

impl DedupeConfig {
    /// Create a new deduplication configuration
    pub fn new(expire_in_ms: u64, sweep_interval_ms: u64, dispatch_interval_ms: u64) -> Self {
        Self {
            enabled: true,
            expire_in_ms,
            sweep_interval_ms,
            dispatch_interval_ms,
        }
    }

    /// Load configuration from a YAML file, overridden by `DEDUPE_*` environment variables
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config: DedupeConfig = Figment::new()
            .merge(Yaml::file(path.as_ref()))
            .merge(Env::prefixed("DEDUPE_"))
            .extract()?;

        config.validate()?;
        log::info!(
            "Loaded deduplication config from {} (TTL: {}ms, sweep: {}ms, dispatch: {}ms)",
            path.as_ref().display(),
            config.expire_in_ms,
            config.sweep_interval_ms,
            config.dispatch_interval_ms
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sweep_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "sweep_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Default record TTL
    pub fn expire_in(&self) -> Duration {
        millis(self.expire_in_ms)
    }

    /// Sweeper period, never shorter than one millisecond
    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    pub fn dispatch_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.dispatch_interval_ms)
    }
}

/// Options for a single deduplicated call
#[derive(Clone, Debug, Default)]
pub struct CallOptions {
    /// Discard any existing record for the key before proceeding
    pub force_call: bool,
    /// Record TTL, falls back to [`DedupeConfig::expire_in`]
    pub expire_in: Option<Duration>,
    /// Namespace mixed into the key
    pub scope: Option<String>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn force_call(mut self, force_call: bool) -> Self {
        self.force_call = force_call;
        self
    }

    pub fn expire_in(mut self, expire_in: Duration) -> Self {
        self.expire_in = Some(expire_in);
        self
    }

    pub fn expire_in_ms(self, expire_in_ms: u64) -> Self {
        self.expire_in(millis(expire_in_ms))
    }

    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }
}

fn millis(ms: u64) -> Duration {
    i64::try_from(ms)
        .ok()
        .and_then(Duration::try_milliseconds)
        .unwrap_or(Duration::MAX)
}
