//! Shared tracing configuration for the fulcrum workspace.
//!
//! Every binary, integration test and benchmark that wants log output installs
//! its subscriber through this crate, so filter resolution and output format
//! stay identical across the workspace.
//!
//! ```rust
//! use fulcrum_tracing::{build_subscriber, TracingConfig};
//!
//! let config = TracingConfig::for_ci();
//! let _subscriber = build_subscriber(&config).expect("valid default directives");
//! ```

pub mod performance;

#[macro_use]
pub mod macros;

use std::env;

pub use tracing::{debug, error, info, trace, warn};

// macro paths, so callers need no direct `tracing` dependency
#[doc(hidden)]
pub use tracing as __tracing;

use tracing::Subscriber;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt as tracing_fmt, EnvFilter, Registry};

/// Environment variable selecting a preset (`local`, `ci`, `performance`).
pub const ENV_PROFILE: &str = "FULCRUM_TRACING_PROFILE";
/// Environment variable overriding the filter directives.
pub const ENV_DIRECTIVES: &str = "FULCRUM_TRACING_DIRECTIVES";
/// Environment variable overriding the output format.
pub const ENV_FORMAT: &str = "FULCRUM_TRACING_FORMAT";
/// Environment variable toggling performance spans.
pub const ENV_PERF: &str = "FULCRUM_PERF_TRACING";
/// Environment variable holding the performance-span threshold in microseconds.
pub const ENV_PERF_THRESHOLD: &str = "FULCRUM_PERF_THRESHOLD_US";

/// How the shared subscriber should behave.
#[derive(Clone, Debug)]
pub struct TracingConfig {
    /// Filter directives such as `fulcrum_backends=debug,info`. When absent the
    /// filter comes from `RUST_LOG`, then from `default_directive`.
    pub directives: Option<String>,
    pub default_directive: String,
    /// Print event targets (module paths).
    pub include_targets: bool,
    pub ansi: bool,
    pub span_events: FmtSpan,
    pub output: TracingOutput,
    /// When false, [`performance::PerformanceSpan`] guards log nothing.
    pub enable_performance_tracing: bool,
    /// Performance spans shorter than this are dropped silently.
    pub performance_threshold_us: Option<u64>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::for_local()
    }
}

impl TracingConfig {
    /// Pretty, colourised output for a developer terminal.
    pub fn for_local() -> Self {
        Self {
            directives: None,
            default_directive: "info".to_string(),
            include_targets: true,
            ansi: true,
            span_events: FmtSpan::NONE,
            output: TracingOutput::Pretty,
            enable_performance_tracing: cfg!(debug_assertions),
            performance_threshold_us: None,
        }
    }

    /// JSON lines without colour codes, for log collectors.
    pub fn for_ci() -> Self {
        Self {
            directives: None,
            default_directive: "info".to_string(),
            include_targets: true,
            ansi: false,
            span_events: FmtSpan::NONE,
            output: TracingOutput::Json,
            enable_performance_tracing: false,
            performance_threshold_us: None,
        }
    }

    /// Debug-level backend logs with span close events and performance spans on.
    pub fn for_performance() -> Self {
        Self {
            directives: Some("fulcrum_backends=debug,info".to_string()),
            default_directive: "info".to_string(),
            include_targets: true,
            ansi: false,
            span_events: FmtSpan::CLOSE,
            output: TracingOutput::Json,
            enable_performance_tracing: true,
            performance_threshold_us: None,
        }
    }

    /// Build a configuration from the `FULCRUM_TRACING_*` / `FULCRUM_PERF_*`
    /// environment variables, starting from the preset named by
    /// [`ENV_PROFILE`].
    pub fn from_env() -> Self {
        let profile = env::var(ENV_PROFILE)
            .unwrap_or_else(|_| "local".to_string())
            .to_ascii_lowercase();

        let mut config = match profile.as_str() {
            "ci" => Self::for_ci(),
            "performance" => Self::for_performance(),
            _ => Self::for_local(),
        };

        if let Ok(directives) = env::var(ENV_DIRECTIVES) {
            if !directives.trim().is_empty() {
                config.directives = Some(directives);
            }
        }

        if let Ok(format) = env::var(ENV_FORMAT) {
            if let Some(parsed) = TracingOutput::from_env_value(&format) {
                config.output = parsed;
                if config.output == TracingOutput::Json {
                    config.ansi = false;
                }
            }
        }

        if let Ok(flag) = env::var(ENV_PERF) {
            config.enable_performance_tracing = parse_flag(&flag);
        }

        if let Ok(threshold) = env::var(ENV_PERF_THRESHOLD) {
            if let Ok(us) = threshold.trim().parse::<u64>() {
                config.performance_threshold_us = Some(us);
            }
        }

        config
    }

    fn resolve_filter(&self) -> Result<EnvFilter, TracingSetupError> {
        match &self.directives {
            Some(directives) => {
                EnvFilter::try_new(directives).map_err(|err| TracingSetupError::InvalidFilter(err.to_string()))
            }
            None => Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.default_directive))),
        }
    }
}

/// Accepts `1`, `true`, `yes`, `on` (case-insensitive).
pub fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// Errors raised while installing the subscriber.
#[derive(Debug, thiserror::Error)]
pub enum TracingSetupError {
    #[error("invalid tracing directive: {0}")]
    InvalidFilter(String),

    /// Usually means another subscriber is already installed.
    #[error("failed to install global tracing subscriber: {0}")]
    SubscriberInit(#[from] tracing_subscriber::util::TryInitError),
}

/// Build a subscriber for `config` without installing it.
pub fn build_subscriber(config: &TracingConfig) -> Result<impl Subscriber + Send + Sync, TracingSetupError> {
    let (filter, fmt_layer) = subscriber_layers(config)?;
    Ok(Registry::default().with(fmt_layer).with(filter))
}

/// Filter and formatting layers, for callers composing their own subscriber.
pub fn subscriber_layers(
    config: &TracingConfig,
) -> Result<(EnvFilter, Box<dyn Layer<Registry> + Send + Sync>), TracingSetupError> {
    let filter = config.resolve_filter()?;
    let span_events = config.span_events.clone();

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.output {
        TracingOutput::Compact => Box::new(
            tracing_fmt::layer()
                .compact()
                .with_target(config.include_targets)
                .with_ansi(config.ansi)
                .with_span_events(span_events),
        ),
        TracingOutput::Pretty => Box::new(
            tracing_fmt::layer()
                .pretty()
                .with_target(config.include_targets)
                .with_ansi(config.ansi)
                .with_span_events(span_events),
        ),
        TracingOutput::Json => Box::new(
            tracing_fmt::layer()
                .json()
                .with_target(config.include_targets)
                .with_span_events(span_events)
                .with_ansi(false),
        ),
    };

    Ok((filter, layer))
}

/// Install the configured subscriber as the process-wide default and apply
/// the performance-span settings.
pub fn init_global_tracing(config: &TracingConfig) -> Result<(), TracingSetupError> {
    performance::configure(config.enable_performance_tracing, config.performance_threshold_us);
    build_subscriber(config)?.try_init()?;
    Ok(())
}

/// Install a subscriber from the environment, ignoring "already installed".
///
/// Integration tests call this at the top of every test; only the first call
/// in the process installs anything.
pub fn init_for_tests() {
    let config = TracingConfig {
        default_directive: "warn".to_string(),
        output: TracingOutput::Compact,
        ansi: false,
        ..TracingConfig::from_env()
    };
    let _ = init_global_tracing(&config);
}

/// Output format of the formatter layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TracingOutput {
    Compact,
    Pretty,
    Json,
}

impl TracingOutput {
    fn from_env_value(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Some(Self::Compact),
            "pretty" => Some(Self::Pretty),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn reset_env() {
        for key in [ENV_PROFILE, ENV_DIRECTIVES, ENV_FORMAT, ENV_PERF, ENV_PERF_THRESHOLD, "RUST_LOG"] {
            env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn rejects_invalid_directive() {
        reset_env();
        let config = TracingConfig {
            directives: Some("=::invalid".to_string()),
            ..TracingConfig::default()
        };
        assert!(matches!(build_subscriber(&config), Err(TracingSetupError::InvalidFilter(_))));
    }

    #[test]
    #[serial]
    fn builds_with_defaults() {
        reset_env();
        assert!(build_subscriber(&TracingConfig::default()).is_ok());
    }

    #[test]
    #[serial]
    fn from_env_respects_profile_and_format() {
        reset_env();
        env::set_var(ENV_PROFILE, "ci");
        env::set_var(ENV_FORMAT, "compact");
        env::set_var(ENV_DIRECTIVES, "fulcrum_backends=trace");

        let config = TracingConfig::from_env();
        assert_eq!(config.directives.as_deref(), Some("fulcrum_backends=trace"));
        assert!(!config.ansi);
        assert_eq!(config.output, TracingOutput::Compact);
        reset_env();
    }

    #[test]
    #[serial]
    fn from_env_reads_performance_settings() {
        reset_env();
        env::set_var(ENV_PERF, "yes");
        env::set_var(ENV_PERF_THRESHOLD, "250");

        let config = TracingConfig::from_env();
        assert!(config.enable_performance_tracing);
        assert_eq!(config.performance_threshold_us, Some(250));
        reset_env();
    }

    #[test]
    fn performance_preset() {
        let config = TracingConfig::for_performance();
        assert!(config.enable_performance_tracing);
        assert_eq!(config.output, TracingOutput::Json);
        assert!(!config.ansi);
    }

    #[test]
    fn flag_parsing() {
        assert!(parse_flag("TRUE"));
        assert!(parse_flag(" 1 "));
        assert!(parse_flag("on"));
        assert!(!parse_flag("0"));
        assert!(!parse_flag("nope"));
    }
}
