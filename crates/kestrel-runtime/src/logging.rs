//! Logging setup for the Kestrel runtime.
//!
//! A single `tracing-subscriber` registry with an [`EnvFilter`] and one fmt
//! layer. The layer's format and writer are picked at runtime from
//! [`LoggingConfig`], so every combination goes through the same init path.
//!
//! ```rust,ignore
//! use kestrel_runtime::logging::{LoggingBuilder, SpanEvents};
//!
//! LoggingBuilder::new()
//!     .directive("kestrel_core=debug")
//!     .span_events(SpanEvents::LIFECYCLE)
//!     .init();
//! ```

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use tracing::warn;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::Registry;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use crate::config::{LogFormat, LogOutput, LoggingConfig, SpanEventConfig};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Which span lifecycle events are written as log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpanEvents {
    pub new: bool,
    pub enter: bool,
    pub exit: bool,
    pub close: bool,
}

impl SpanEvents {
    pub const NONE: Self = Self {
        new: false,
        enter: false,
        exit: false,
        close: false,
    };

    /// Creation and close. Shows each dispatch span once with its timing.
    pub const LIFECYCLE: Self = Self {
        new: true,
        enter: false,
        exit: false,
        close: true,
    };

    pub const FULL: Self = Self {
        new: true,
        enter: true,
        exit: true,
        close: true,
    };

    fn to_fmt_span(self) -> fmt::format::FmtSpan {
        let mut span = fmt::format::FmtSpan::NONE;
        if self.new {
            span |= fmt::format::FmtSpan::NEW;
        }
        if self.enter {
            span |= fmt::format::FmtSpan::ENTER;
        }
        if self.exit {
            span |= fmt::format::FmtSpan::EXIT;
        }
        if self.close {
            span |= fmt::format::FmtSpan::CLOSE;
        }
        span
    }
}

impl From<&SpanEventConfig> for SpanEvents {
    fn from(config: &SpanEventConfig) -> Self {
        Self {
            new: config.new,
            enter: config.enter,
            exit: config.exit,
            close: config.close,
        }
    }
}

/// Initializes logging from configuration. A second call is a no-op.
pub fn init_from_config(config: &LoggingConfig) {
    let _ = LoggingBuilder::from_config(config).try_init();
}

// =============================================================================
// LoggingBuilder
// =============================================================================

#[derive(Debug)]
pub struct LoggingBuilder {
    directives: Vec<String>,
    level: tracing::Level,
    span_events: SpanEvents,
    format: LogFormat,
    output: LogOutput,
    with_target: bool,
    with_thread_ids: bool,
    with_file_location: bool,
    file_path: Option<PathBuf>,
}

impl Default for LoggingBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LoggingBuilder {
    pub fn new() -> Self {
        Self {
            directives: Vec::new(),
            level: tracing::Level::INFO,
            span_events: SpanEvents::NONE,
            format: LogFormat::Compact,
            output: LogOutput::Stdout,
            with_target: true,
            with_thread_ids: false,
            with_file_location: false,
            file_path: None,
        }
    }

    pub fn from_config(config: &LoggingConfig) -> Self {
        let mut builder = Self::new()
            .with_level(config.level.to_tracing_level())
            .format(config.format)
            .output(config.output)
            .span_events(SpanEvents::from(&config.span_events))
            .with_thread_ids(config.thread_ids)
            .with_file_location(config.file_location);
        builder.file_path.clone_from(&config.file_path);

        let mut filters: Vec<_> = config.filters.iter().collect();
        filters.sort();
        for (module, level) in filters {
            builder = builder.directive(&format!("{module}={}", level.to_lowercase()));
        }
        builder
    }

    pub fn with_level(mut self, level: tracing::Level) -> Self {
        self.level = level;
        self
    }

    /// Adds an `EnvFilter` directive such as `kestrel_core=trace`.
    pub fn directive(mut self, directive: &str) -> Self {
        self.directives.push(directive.to_string());
        self
    }

    pub fn span_events(mut self, events: SpanEvents) -> Self {
        self.span_events = events;
        self
    }

    pub fn format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn output(mut self, output: LogOutput) -> Self {
        self.output = output;
        self
    }

    pub fn with_target(mut self, enabled: bool) -> Self {
        self.with_target = enabled;
        self
    }

    pub fn with_thread_ids(mut self, enabled: bool) -> Self {
        self.with_thread_ids = enabled;
        self
    }

    pub fn with_file_location(mut self, enabled: bool) -> Self {
        self.with_file_location = enabled;
        self
    }

    pub fn file_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    /// `RUST_LOG` when set, otherwise the configured level; directives are
    /// added on top. Unparsable directives are dropped.
    fn build_filter(&self) -> EnvFilter {
        let base = self.level.to_string().to_lowercase();
        let mut filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&base));
        for directive in &self.directives {
            if let Ok(d) = directive.parse() {
                filter = filter.add_directive(d);
            }
        }
        filter
    }

    /// Returns the writer and whether a requested file output fell back to stdout.
    fn build_writer(&self) -> (BoxMakeWriter, bool) {
        match (self.output, &self.file_path) {
            (LogOutput::Stdout, _) => (BoxMakeWriter::new(std::io::stdout), false),
            (LogOutput::Stderr, _) => (BoxMakeWriter::new(std::io::stderr), false),
            (LogOutput::File, Some(path)) => {
                let appender = tracing_appender::rolling::never(
                    path.parent().unwrap_or_else(|| Path::new(".")),
                    path.file_name().unwrap_or_else(|| OsStr::new("kestrel.log")),
                );
                (BoxMakeWriter::new(appender), false)
            }
            (LogOutput::File, None) => (BoxMakeWriter::new(std::io::stdout), true),
        }
    }

    fn build_layer(&self, writer: BoxMakeWriter) -> BoxedLayer {
        let span_events = self.span_events.to_fmt_span();
        let base = fmt::layer()
            .with_span_events(span_events)
            .with_target(self.with_target)
            .with_thread_ids(self.with_thread_ids)
            .with_file(self.with_file_location)
            .with_line_number(self.with_file_location)
            .with_writer(writer);

        match self.format {
            #[cfg(feature = "json-log")]
            LogFormat::Json => base.json().boxed(),
            LogFormat::Full => base.boxed(),
            LogFormat::Pretty => base.pretty().boxed(),
            _ => base.compact().boxed(),
        }
    }

    pub fn init(self) {
        let _ = self.try_init();
    }

    pub fn try_init(self) -> Result<(), TryInitError> {
        let filter = self.build_filter();
        let (writer, file_fallback) = self.build_writer();
        let layer = self.build_layer(writer);

        tracing_subscriber::registry()
            .with(layer)
            .with(filter)
            .try_init()?;

        if file_fallback {
            warn!("File output requested but no file path configured, falling back to stdout");
        }
        #[cfg(not(feature = "json-log"))]
        if self.format == LogFormat::Json {
            warn!("JSON log format requires the json-log feature, using compact");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::config::LogLevel;

    #[test]
    fn test_from_config_maps_settings() {
        let config = LoggingConfig {
            level: LogLevel::Debug,
            format: LogFormat::Pretty,
            output: LogOutput::Stderr,
            filters: HashMap::from([
                ("kestrel_runtime".to_string(), "TRACE".to_string()),
                ("kestrel_core".to_string(), "warn".to_string()),
            ]),
            span_events: SpanEventConfig {
                new: true,
                close: true,
                ..Default::default()
            },
            ..Default::default()
        };

        let builder = LoggingBuilder::from_config(&config);
        assert_eq!(builder.level, tracing::Level::DEBUG);
        assert_eq!(builder.format, LogFormat::Pretty);
        assert_eq!(builder.output, LogOutput::Stderr);
        assert_eq!(builder.span_events, SpanEvents::LIFECYCLE);
        assert_eq!(
            builder.directives,
            vec!["kestrel_core=warn", "kestrel_runtime=trace"]
        );
    }

    #[test]
    fn test_file_output_without_path_falls_back() {
        let builder = LoggingBuilder::new().output(LogOutput::File);
        let (_, fallback) = builder.build_writer();
        assert!(fallback);

        let dir = tempfile::tempdir().unwrap();
        let builder = LoggingBuilder::new()
            .output(LogOutput::File)
            .file_path(dir.path().join("bot.log"));
        let (_, fallback) = builder.build_writer();
        assert!(!fallback);
    }

    #[test]
    fn test_span_events_flags() {
        assert_eq!(SpanEvents::NONE.to_fmt_span(), fmt::format::FmtSpan::NONE);
        assert_eq!(SpanEvents::FULL.to_fmt_span(), fmt::format::FmtSpan::FULL);
    }
}
