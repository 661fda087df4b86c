//! Runtime configuration.
//!
//! The determinism override is read once from `GPURT_DETERMINISTIC_OPS` and
//! cached for the lifetime of the process. A configuration can additionally
//! request determinism on its own; either source is sufficient.

use std::time::Duration;

use once_cell::sync::Lazy;

/// Environment variable that forces deterministic algorithm selection.
pub const DETERMINISTIC_OPS_ENV: &str = "GPURT_DETERMINISTIC_OPS";

/// Default memory-space color used for host-resident buffers.
pub const DEFAULT_HOST_MEMORY_SPACE: i64 = 5;

/// Default window within which autotune timings are considered equivalent.
pub const DEFAULT_MEASUREMENT_ERROR: Duration = Duration::from_micros(2);

static DETERMINISM_OVERRIDE: Lazy<bool> = Lazy::new(|| {
    let value = std::env::var(DETERMINISTIC_OPS_ENV).ok();
    let enabled = parse_bool_flag(value.as_deref());
    if enabled {
        tracing::info!(env = DETERMINISTIC_OPS_ENV, "Deterministic ops forced by environment");
    }
    enabled
});

fn parse_bool_flag(value: Option<&str>) -> bool {
    match value {
        Some(v) => matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        None => false,
    }
}

/// Returns the cached process-wide determinism override.
pub fn determinism_override() -> bool {
    *DETERMINISM_OVERRIDE
}

/// Returns true if deterministic selection is required, either by the
/// process-wide override or by the configuration.
pub fn require_determinism(config: &RuntimeConfig) -> bool {
    determinism_override() || config.deterministic_ops
}

/// Configuration shared by the selection, rewrite and execution layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Pick the first viable autotune candidate instead of the fastest.
    pub deterministic_ops: bool,
    /// Timings within this window of the fastest are considered equivalent.
    pub measurement_error: Duration,
    /// Memory-space color of host-resident buffers.
    pub host_memory_space: i64,
    /// Number of auxiliary streams used for asynchronous collectives.
    pub num_async_streams: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            deterministic_ops: false,
            measurement_error: DEFAULT_MEASUREMENT_ERROR,
            host_memory_space: DEFAULT_HOST_MEMORY_SPACE,
            num_async_streams: 2,
        }
    }
}

impl RuntimeConfig {
    /// Creates a configuration that always selects deterministically.
    #[must_use]
    pub fn deterministic() -> Self {
        Self {
            deterministic_ops: true,
            ..Self::default()
        }
    }

    /// Returns a builder seeded with the default configuration.
    #[must_use]
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }
}

/// Builder for [`RuntimeConfig`].
#[derive(Debug, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Creates a new builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables deterministic selection.
    #[must_use]
    pub fn with_deterministic_ops(mut self, enabled: bool) -> Self {
        self.config.deterministic_ops = enabled;
        self
    }

    /// Sets the measurement-error window.
    #[must_use]
    pub fn with_measurement_error(mut self, window: Duration) -> Self {
        self.config.measurement_error = window;
        self
    }

    /// Sets the host memory-space color.
    #[must_use]
    pub fn with_host_memory_space(mut self, color: i64) -> Self {
        self.config.host_memory_space = color;
        self
    }

    /// Sets the number of auxiliary async streams.
    #[must_use]
    pub fn with_async_streams(mut self, count: usize) -> Self {
        self.config.num_async_streams = count;
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> RuntimeConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = RuntimeConfig::default();
        assert!(!config.deterministic_ops);
        assert_eq!(config.measurement_error, Duration::from_micros(2));
        assert_eq!(config.host_memory_space, 5);
        assert_eq!(config.num_async_streams, 2);
    }

    #[test]
    fn test_config_builder() {
        let config = RuntimeConfig::builder()
            .with_deterministic_ops(true)
            .with_measurement_error(Duration::from_micros(5))
            .with_host_memory_space(7)
            .with_async_streams(4)
            .build();

        assert!(config.deterministic_ops);
        assert_eq!(config.measurement_error, Duration::from_micros(5));
        assert_eq!(config.host_memory_space, 7);
        assert_eq!(config.num_async_streams, 4);
    }

    #[test]
    fn test_deterministic_config_requires_determinism() {
        assert!(require_determinism(&RuntimeConfig::deterministic()));
    }

    #[test]
    fn test_parse_bool_flag() {
        assert!(parse_bool_flag(Some("1")));
        assert!(parse_bool_flag(Some("TRUE")));
        assert!(parse_bool_flag(Some(" yes ")));
        assert!(!parse_bool_flag(Some("0")));
        assert!(!parse_bool_flag(Some("false")));
        assert!(!parse_bool_flag(None));
    }
}
