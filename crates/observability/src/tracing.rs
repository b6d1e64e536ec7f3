//! Tracing/logging initialization.
//!
//! Filters come from `RUST_LOG` when set, otherwise from the configured default.

use tracing_subscriber::EnvFilter;

/// Subscriber options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservabilityConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub default_filter: String,
    /// JSON lines (services) or human-readable output (local runs).
    pub json: bool,
    pub with_target: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            default_filter: "info".to_string(),
            json: true,
            with_target: false,
        }
    }
}

impl ObservabilityConfig {
    pub fn pretty() -> Self {
        Self {
            json: false,
            with_target: true,
            ..Self::default()
        }
    }

    pub fn with_default_filter(mut self, filter: impl Into<String>) -> Self {
        self.default_filter = filter.into();
        self
    }
}

fn filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Initialize tracing/logging for the process with the default configuration.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    init_with(&ObservabilityConfig::default());
}

/// Initialize tracing/logging with explicit options.
pub fn init_with(config: &ObservabilityConfig) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter(&config.default_filter))
        .with_target(config.with_target);

    // A global subscriber may already be installed; keep the first one.
    let _ = if config.json {
        builder
            .json()
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .try_init()
    } else {
        builder.try_init()
    };
}

/// Route events through the test harness' captured output.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter("debug"))
        .with_test_writer()
        .try_init();
}
