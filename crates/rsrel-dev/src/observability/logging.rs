//! Structured logging configuration.
//!
//! Sandbox crates (`rsrel_dev`, `rsrel_domain`, `rsrel_storage`) log at the
//! configured level; everything else is limited to warnings. `RUST_LOG`
//! replaces the whole filter when set.
//!
//! # Log Format
//!
//! When JSON formatting is enabled, log entries are output as JSON objects:
//!
//! ```json
//! {"timestamp":"2026-01-15T10:30:00.000Z","level":"ERROR","target":"rsrel_dev::classify","fields":{"message":"internal dispatch error in sandbox","scope":"5f0c…"}}
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use rsrel_dev::observability::{init_logging, LoggingConfig};
//!
//! init_logging(LoggingConfig::text().with_level(tracing::Level::DEBUG));
//! ```

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    prelude::*,
    EnvFilter,
};

const SANDBOX_TARGETS: &[&str] = &["rsrel_dev", "rsrel_domain", "rsrel_storage"];

/// Configuration for structured logging.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Whether to use JSON format (true) or text format (false)
    pub json_format: bool,
    /// Level for the sandbox crates if RUST_LOG is not set
    pub default_level: Level,
    /// Whether to log span close events with their timings
    pub include_spans: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            json_format: false,
            default_level: Level::INFO,
            include_spans: false,
        }
    }
}

impl LoggingConfig {
    pub fn json() -> Self {
        Self {
            json_format: true,
            ..Default::default()
        }
    }

    pub fn text() -> Self {
        Self {
            json_format: false,
            ..Default::default()
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.default_level = level;
        self
    }

    pub fn with_spans(mut self) -> Self {
        self.include_spans = true;
        self
    }

    /// Filter directives used when RUST_LOG is not set.
    pub fn directives(&self) -> String {
        let level = self.default_level.to_string().to_lowercase();
        std::iter::once("warn".to_string())
            .chain(SANDBOX_TARGETS.iter().map(|target| format!("{target}={level}")))
            .collect::<Vec<_>>()
            .join(",")
    }

    fn span_events(&self) -> FmtSpan {
        if self.include_spans {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }
}

/// Initialize the logging subsystem with the given configuration.
///
/// Returns false when a global subscriber was already installed, in which
/// case the call has no effect.
pub fn init_logging(config: LoggingConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.directives()));

    if config.json_format {
        let subscriber = tracing_subscriber::registry().with(filter).with(
            fmt::layer()
                .json()
                .with_span_events(config.span_events())
                .with_current_span(true)
                .with_target(true),
        );
        tracing::subscriber::set_global_default(subscriber).is_ok()
    } else {
        let subscriber = tracing_subscriber::registry().with(filter).with(
            fmt::layer()
                .compact()
                .with_span_events(config.span_events())
                .with_target(true),
        );
        tracing::subscriber::set_global_default(subscriber).is_ok()
    }
}

/// Creates a JSON subscriber writing to `writer`, for capturing logs in tests.
pub fn create_json_layer<W>(writer: W) -> impl tracing::Subscriber + Send + Sync
where
    W: for<'writer> tracing_subscriber::fmt::MakeWriter<'writer> + Send + Sync + 'static,
{
    tracing_subscriber::registry()
        .with(EnvFilter::new("trace"))
        .with(
            fmt::layer()
                .json()
                .with_writer(writer)
                .with_target(true)
                .with_current_span(true),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use rsrel_domain::dispatch::DispatchError;

    use crate::classify::{rewrite_dispatch_error, EvaluationScope, TracingReporter};

    /// A writer that captures output to a shared buffer.
    #[derive(Clone, Default)]
    struct CaptureWriter {
        buffer: Arc<Mutex<Vec<u8>>>,
    }

    impl CaptureWriter {
        fn output(&self) -> String {
            String::from_utf8_lossy(&self.buffer.lock().unwrap()).to_string()
        }
    }

    impl std::io::Write for CaptureWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.buffer.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CaptureWriter {
        type Writer = CaptureWriter;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn test_logging_config_builders() {
        let config = LoggingConfig::default();
        assert!(!config.json_format);
        assert_eq!(config.default_level, Level::INFO);
        assert!(!config.include_spans);

        assert!(LoggingConfig::json().json_format);
        assert!(!LoggingConfig::text().json_format);
        assert!(LoggingConfig::text().with_spans().include_spans);
    }

    #[test]
    fn test_directives_scope_level_to_sandbox_crates() {
        let directives = LoggingConfig::text().with_level(Level::DEBUG).directives();
        assert_eq!(
            directives,
            "warn,rsrel_dev=debug,rsrel_domain=debug,rsrel_storage=debug"
        );
        assert!(EnvFilter::try_new(directives).is_ok());
    }

    /// Internal classifier errors are logged as JSON carrying the scope id.
    #[test]
    fn test_reported_errors_are_json_with_scope() {
        let writer = CaptureWriter::default();
        let subscriber = create_json_layer(writer.clone());
        let scope = EvaluationScope::new();

        tracing::subscriber::with_default(subscriber, || {
            rewrite_dispatch_error(DispatchError::AlwaysFail, &TracingReporter, &scope);
        });

        let output = writer.output();
        let line = output
            .lines()
            .find(|line| !line.is_empty())
            .expect("should have captured a log line");
        let json: serde_json::Value = serde_json::from_str(line).unwrap();
        assert_eq!(json["level"], "ERROR");
        assert_eq!(json["target"], "rsrel_dev::classify");
        assert_eq!(json["fields"]["scope"], scope.id().to_string());
        assert_eq!(json["fields"]["error"], "always fail");
    }
}
