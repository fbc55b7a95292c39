//! Tracing subscriber setup for the command-line front end
//!
//! The library only emits events and spans. Binaries call
//! [`TracingConfig::init`] once at startup to decide where those events go.

use tracing::{Level, Span};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Environment variable that overrides the verbosity-derived filter
pub const FILTER_ENV: &str = "BGREMOVE_PIPELINE_LOG";

/// How events are rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracingFormat {
    /// Colored human-readable output (default for the CLI)
    Console,
    /// Plain single-line output for CI logs
    Compact,
    /// One JSON object per event
    #[cfg(feature = "tracing-json")]
    Json,
}

/// Where events are written
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TracingOutput {
    /// Standard error
    Console,
    /// A log file, written by a background worker
    #[cfg(feature = "tracing-files")]
    File(std::path::PathBuf),
}

/// Keeps buffered log writers alive; drop it only when the program exits
#[derive(Debug, Default)]
#[must_use = "dropping the guard stops buffered log output"]
pub struct TracingGuard {
    #[cfg(feature = "tracing-files")]
    _worker: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Subscriber configuration
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Number of `-v` flags
    pub verbosity: u8,
    pub format: TracingFormat,
    pub output: TracingOutput,
    /// Explicit filter directive; wins over verbosity and the environment
    pub env_filter: Option<String>,
    /// Identifier attached to the session span
    pub session_id: Option<String>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            verbosity: 0,
            format: TracingFormat::Console,
            output: TracingOutput::Console,
            env_filter: None,
            session_id: None,
        }
    }
}

impl TracingConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    #[must_use]
    pub fn with_format(mut self, format: TracingFormat) -> Self {
        self.format = format;
        self
    }

    #[must_use]
    pub fn with_output(mut self, output: TracingOutput) -> Self {
        self.output = output;
        self
    }

    #[must_use]
    pub fn with_env_filter<S: Into<String>>(mut self, filter: S) -> Self {
        self.env_filter = Some(filter.into());
        self
    }

    #[must_use]
    pub fn with_session_id<S: Into<String>>(mut self, session_id: S) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Filter directive for the configured verbosity
    ///
    /// `-v` turns on debug output for this crate only; `-vv` and above
    /// trace everything.
    #[must_use]
    pub fn verbosity_to_filter(&self) -> &'static str {
        match self.verbosity {
            0 => "info",
            1 => "info,bgremove_pipeline=debug",
            _ => "trace",
        }
    }

    /// Filter actually applied: explicit directive, then the environment,
    /// then verbosity
    ///
    /// # Errors
    /// - The explicit or environment directive does not parse
    pub fn build_filter(&self) -> anyhow::Result<EnvFilter> {
        if let Some(directive) = &self.env_filter {
            return Ok(EnvFilter::try_new(directive)?);
        }
        match std::env::var(FILTER_ENV) {
            Ok(directive) if !directive.trim().is_empty() => Ok(EnvFilter::try_new(directive)?),
            _ => Ok(EnvFilter::try_new(self.verbosity_to_filter())?),
        }
    }

    /// Install the global subscriber
    ///
    /// # Errors
    /// - Invalid filter directive
    /// - A global subscriber is already installed
    pub fn init(self) -> anyhow::Result<TracingGuard> {
        let filter = self.build_filter()?;
        let registry = Registry::default().with(filter);
        let guard = TracingGuard::default();

        match (&self.format, &self.output) {
            (TracingFormat::Console, TracingOutput::Console) => {
                registry
                    .with(fmt::layer().with_writer(std::io::stderr).with_target(false).compact())
                    .try_init()?;
            },
            (TracingFormat::Compact, TracingOutput::Console) => {
                registry
                    .with(
                        fmt::layer()
                            .with_writer(std::io::stderr)
                            .with_ansi(false)
                            .with_target(false)
                            .compact(),
                    )
                    .try_init()?;
            },
            #[cfg(feature = "tracing-json")]
            (TracingFormat::Json, TracingOutput::Console) => {
                registry
                    .with(
                        fmt::layer()
                            .json()
                            .with_writer(std::io::stderr)
                            .with_current_span(true)
                            .with_span_list(true),
                    )
                    .try_init()?;
            },
            #[cfg(feature = "tracing-files")]
            (format, TracingOutput::File(path)) => {
                let directory = path.parent().unwrap_or_else(|| std::path::Path::new("."));
                let file_name = path
                    .file_name()
                    .unwrap_or_else(|| std::ffi::OsStr::new("bgremove-pipeline.log"));
                let (writer, worker) =
                    tracing_appender::non_blocking(tracing_appender::rolling::never(directory, file_name));

                match format {
                    TracingFormat::Console | TracingFormat::Compact => {
                        registry
                            .with(fmt::layer().with_writer(writer).with_ansi(false).compact())
                            .try_init()?;
                    },
                    #[cfg(feature = "tracing-json")]
                    TracingFormat::Json => {
                        registry
                            .with(fmt::layer().json().with_writer(writer).with_current_span(true))
                            .try_init()?;
                    },
                }
                return Ok(TracingGuard { _worker: Some(worker) });
            },
        }

        if let Some(session_id) = &self.session_id {
            tracing::debug!(session_id = %session_id, "tracing initialized");
        }
        Ok(guard)
    }
}

/// Console tracing tagged with the invocation's session id
///
/// # Errors
/// - See [`TracingConfig::init`]
pub fn init_cli_tracing(verbosity: u8, session_id: &str) -> anyhow::Result<TracingGuard> {
    TracingConfig::new()
        .with_verbosity(verbosity)
        .with_session_id(session_id)
        .init()
}

/// Span helpers shared by the binary
pub mod spans {
    use super::{Level, Span};

    /// Whole CLI invocation
    pub fn session(session_id: &str, model_name: &str, backend: &str) -> Span {
        tracing::span!(
            Level::INFO,
            "session",
            session_id = %session_id,
            model_name = %model_name,
            backend = %backend
        )
    }

    /// One batch run
    pub fn batch(file_count: usize) -> Span {
        tracing::span!(Level::INFO, "batch", file_count)
    }

    /// Writing one result to disk
    pub fn output(path: &std::path::Path) -> Span {
        tracing::span!(Level::DEBUG, "output", path = %path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_mapping() {
        assert_eq!(TracingConfig::new().with_verbosity(0).verbosity_to_filter(), "info");
        assert_eq!(
            TracingConfig::new().with_verbosity(1).verbosity_to_filter(),
            "info,bgremove_pipeline=debug"
        );
        assert_eq!(TracingConfig::new().with_verbosity(2).verbosity_to_filter(), "trace");
        assert_eq!(TracingConfig::new().with_verbosity(9).verbosity_to_filter(), "trace");
    }

    #[test]
    fn test_explicit_filter_wins() {
        let config = TracingConfig::new().with_verbosity(2).with_env_filter("warn");
        assert_eq!(config.build_filter().unwrap().to_string(), "warn");
    }

    #[test]
    fn test_invalid_filter_is_rejected() {
        let config = TracingConfig::new().with_env_filter("bgremove_pipeline=[");
        assert!(config.build_filter().is_err());
    }

    #[test]
    fn test_builder_defaults() {
        let config = TracingConfig::default();
        assert_eq!(config.verbosity, 0);
        assert_eq!(config.format, TracingFormat::Console);
        assert_eq!(config.output, TracingOutput::Console);
        assert!(config.env_filter.is_none());

        let config = config.with_format(TracingFormat::Compact).with_session_id("abc");
        assert_eq!(config.format, TracingFormat::Compact);
        assert_eq!(config.session_id.as_deref(), Some("abc"));
    }
}
