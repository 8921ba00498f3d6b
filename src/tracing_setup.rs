//! Tracing infrastructure
//!
//! Structured logging for the capture crates, built on `tracing-subscriber`:
//! - Environment-based filtering (`RUST_LOG` overrides the configured level)
//! - Pretty, compact and JSON output
//! - Thread names on by default, since pool growth and selection run on
//!   dedicated threads
//!
//! # Example
//! ```no_run
//! use rust_capture::{config::CaptureConfig, tracing_setup};
//! use tracing::info;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CaptureConfig::load()?;
//! tracing_setup::init_from_config(&config)?;
//! info!(pool = %config.pool.name, "capture session starting");
//! # Ok(())
//! # }
//! ```

use crate::config::CaptureConfig;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter, Layer,
};

/// Output format for tracing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Pretty-printed format with colors (for development)
    Pretty,
    /// Compact format without colors (for production)
    Compact,
    /// JSON format for structured logging (for log aggregation)
    Json,
}

/// Tracing configuration options
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: Level,
    /// Output format
    pub format: OutputFormat,
    /// Whether to include span events (NEW, CLOSE)
    pub with_span_events: bool,
    /// Whether to include file and line numbers
    pub with_file_and_line: bool,
    /// Whether to include thread IDs
    pub with_thread_ids: bool,
    /// Whether to include thread names
    pub with_thread_names: bool,
    /// Whether to enable ANSI colors (only for Pretty format)
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Pretty,
            with_span_events: false,
            with_file_and_line: true,
            with_thread_ids: false,
            with_thread_names: true,
            with_ansi: true,
        }
    }
}

impl TracingConfig {
    /// Create tracing config from the capture configuration
    pub fn from_capture_config(config: &CaptureConfig) -> Result<Self, String> {
        let level = parse_log_level(&config.application.log_level)?;
        Ok(Self {
            level,
            ..Default::default()
        })
    }

    /// Create tracing config with custom settings
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Set output format
    #[must_use]
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable span events
    #[must_use]
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    /// Enable or disable ANSI colors
    #[must_use]
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Initialize tracing from the capture configuration
pub fn init_from_config(config: &CaptureConfig) -> Result<(), String> {
    init(TracingConfig::from_capture_config(config)?)
}

/// Initialize tracing with custom configuration
///
/// Idempotent: if a global subscriber is already installed this returns
/// `Ok(())`, so tests and embedding applications can call it freely.
///
/// # Example
/// ```no_run
/// use rust_capture::tracing_setup::{self, OutputFormat, TracingConfig};
/// use tracing::Level;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = TracingConfig::new(Level::DEBUG).with_format(OutputFormat::Json);
/// tracing_setup::init(config)?;
/// # Ok(())
/// # }
/// ```
pub fn init(config: TracingConfig) -> Result<(), String> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));

    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let result = match config.format {
        OutputFormat::Pretty => tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .pretty()
                    .with_span_events(span_events)
                    .with_file(config.with_file_and_line)
                    .with_line_number(config.with_file_and_line)
                    .with_thread_ids(config.with_thread_ids)
                    .with_thread_names(config.with_thread_names)
                    .with_ansi(config.with_ansi)
                    .with_filter(env_filter),
            )
            .try_init(),
        OutputFormat::Compact => tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .compact()
                    .with_span_events(span_events)
                    .with_file(config.with_file_and_line)
                    .with_line_number(config.with_file_and_line)
                    .with_thread_ids(config.with_thread_ids)
                    .with_thread_names(config.with_thread_names)
                    .with_ansi(false)
                    .with_filter(env_filter),
            )
            .try_init(),
        OutputFormat::Json => tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(span_events)
                    .with_file(config.with_file_and_line)
                    .with_line_number(config.with_file_and_line)
                    .with_thread_ids(config.with_thread_ids)
                    .with_thread_names(config.with_thread_names)
                    .with_filter(env_filter),
            )
            .try_init(),
    };

    tolerate_existing(result)
}

fn tolerate_existing(result: Result<(), TryInitError>) -> Result<(), String> {
    match result {
        Ok(()) => Ok(()),
        // Expected in tests and when several components initialize tracing.
        Err(e) if e.to_string().contains("global default trace dispatcher") => Ok(()),
        Err(e) => Err(format!("Failed to initialize tracing: {e}")),
    }
}

/// Parse log level string into tracing Level
pub fn parse_log_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(format!(
            "Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error"
        )),
    }
}
