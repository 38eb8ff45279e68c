//! Shared tracing setup for the CAL runtime workspace.
//!
//! Binaries, tests and the FFI surface install their `tracing` subscriber through this
//! crate so that every consumer gets the same filter resolution, output formats and
//! performance-span behavior.
//!
//! Filter resolution order: explicit directives, then `RUST_LOG`, then
//! [`TracingConfig::default_directive`].

pub mod performance;

#[macro_use]
pub mod macros;

use std::env;

pub use tracing::{debug, error, info, trace, warn};

use tracing::Subscriber;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt as tracing_fmt, EnvFilter, Registry};

/// How the shared subscriber formats and filters events.
#[derive(Clone, Debug)]
pub struct TracingConfig {
    /// Filter directives (e.g. `cal_runtime=debug,info`). Falls back to `RUST_LOG`, then
    /// [`Self::default_directive`].
    pub directives: Option<String>,
    /// Directive used when nothing else resolves.
    pub default_directive: String,
    /// Show event targets (module paths).
    pub include_targets: bool,
    /// ANSI colour codes.
    pub ansi: bool,
    /// Span lifecycle events to emit.
    pub span_events: FmtSpan,
    pub output: TracingOutput,
    /// Emit [`performance::PerformanceSpan`] timings.
    pub enable_performance_tracing: bool,
    /// Only log performance spans at least this long.
    pub performance_threshold_us: Option<u64>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::for_local()
    }
}

impl TracingConfig {
    /// Pretty, ANSI-enabled output for local development.
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

    /// JSON without ANSI for CI and log collection.
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

    /// JSON with span enter/exit/close events and debug logging for the runtime crates.
    pub fn for_performance() -> Self {
        Self {
            directives: Some("cal_runtime=debug,cal_ffi=debug,cal_hostmem=debug".to_string()),
            default_directive: "info".to_string(),
            include_targets: true,
            ansi: false,
            span_events: FmtSpan::ENTER | FmtSpan::EXIT | FmtSpan::CLOSE,
            output: TracingOutput::Json,
            enable_performance_tracing: true,
            performance_threshold_us: None,
        }
    }

    /// Build a configuration from environment hints.
    ///
    /// # Environment Variables
    ///
    /// - `CAL_TRACING_PROFILE` - `local` (default), `ci` or `performance`
    /// - `CAL_TRACING_DIRECTIVES` - Filter directives
    /// - `CAL_TRACING_FORMAT` - `pretty`, `compact` or `json`
    /// - `CAL_PERF_TRACING` - `true`, `1` or `yes` enables performance spans
    /// - `CAL_PERF_THRESHOLD_US` - Minimum span duration to log
    pub fn from_env() -> Self {
        let profile = env::var("CAL_TRACING_PROFILE")
            .unwrap_or_else(|_| "local".to_string())
            .to_ascii_lowercase();

        let mut config = match profile.as_str() {
            "ci" => Self::for_ci(),
            "performance" => Self::for_performance(),
            _ => Self::for_local(),
        };

        if let Ok(directives) = env::var("CAL_TRACING_DIRECTIVES") {
            if !directives.trim().is_empty() {
                config.directives = Some(directives);
            }
        }

        if let Some(output) = env::var("CAL_TRACING_FORMAT")
            .ok()
            .and_then(|value| TracingOutput::from_env_value(&value))
        {
            config.output = output;
            if output == TracingOutput::Json {
                config.ansi = false;
            }
        }

        if let Ok(flag) = env::var("CAL_PERF_TRACING") {
            config.enable_performance_tracing =
                flag.eq_ignore_ascii_case("true") || flag == "1" || flag.eq_ignore_ascii_case("yes");
        }

        if let Some(threshold) = env::var("CAL_PERF_THRESHOLD_US")
            .ok()
            .and_then(|value| value.trim().parse::<u64>().ok())
        {
            config.performance_threshold_us = Some(threshold);
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

/// Formatter used by the subscriber.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TracingOutput {
    Pretty,
    Compact,
    Json,
}

impl TracingOutput {
    fn from_env_value(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pretty" => Some(Self::Pretty),
            "compact" => Some(Self::Compact),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Errors raised while installing the shared subscriber.
#[derive(Debug, thiserror::Error)]
pub enum TracingSetupError {
    #[error("invalid tracing directive: {0}")]
    InvalidFilter(String),

    /// Usually means a global subscriber is already installed.
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
    let base = tracing_fmt::layer()
        .with_target(config.include_targets)
        .with_span_events(config.span_events.clone());

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.output {
        TracingOutput::Compact => Box::new(base.compact().with_ansi(config.ansi)),
        TracingOutput::Pretty => Box::new(base.pretty().with_ansi(config.ansi)),
        TracingOutput::Json => Box::new(base.json().with_ansi(false)),
    };

    Ok((filter, layer))
}

/// Install the configured subscriber globally and apply its performance settings.
pub fn init_global_tracing(config: &TracingConfig) -> Result<(), TracingSetupError> {
    build_subscriber(config)?.try_init()?;
    performance::configure(config.enable_performance_tracing, config.performance_threshold_us);
    Ok(())
}
