//! Configuration schema definitions.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct KestrelConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub plugins: PluginsConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub contacts: ContactsConfig,
}

// =============================================================================
// Logging
// =============================================================================

/// Log verbosity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub const NAMES: [&'static str; 5] = ["trace", "debug", "info", "warn", "error"];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    pub fn to_tracing_level(self) -> tracing::Level {
        match self {
            Self::Trace => tracing::Level::TRACE,
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warn => tracing::Level::WARN,
            Self::Error => tracing::Level::ERROR,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Log line layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Full,
    Pretty,
    /// Requires the `json-log` feature; falls back to `compact` otherwise.
    Json,
}

/// Where log lines are written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Stdout,
    Stderr,
    File,
}

/// Which span lifecycle events are logged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanEventConfig {
    #[serde(default)]
    pub new: bool,
    #[serde(default)]
    pub enter: bool,
    #[serde(default)]
    pub exit: bool,
    #[serde(default)]
    pub close: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,

    #[serde(default)]
    pub format: LogFormat,

    #[serde(default)]
    pub output: LogOutput,

    /// Log file, used when `output = "file"`.
    #[serde(default)]
    pub file_path: Option<PathBuf>,

    /// Per-module levels, e.g. `kestrel_core = "debug"`.
    #[serde(default)]
    pub filters: HashMap<String, String>,

    #[serde(default)]
    pub span_events: SpanEventConfig,

    #[serde(default)]
    pub thread_ids: bool,

    /// Include file name and line number.
    #[serde(default)]
    pub file_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Compact,
            output: LogOutput::Stdout,
            file_path: None,
            filters: HashMap::new(),
            span_events: SpanEventConfig::default(),
            thread_ids: false,
            file_location: false,
        }
    }
}

// =============================================================================
// Plugins
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PluginsConfig {
    /// Root directory; every immediate subdirectory is one container.
    #[serde(default = "default_plugin_directory")]
    pub directory: PathBuf,

    /// Load the built-in host artifacts (the `help` command).
    #[serde(default = "default_true")]
    pub builtin: bool,

    /// Per-plugin settings sections, keyed by plugin name.
    #[serde(default)]
    pub settings: HashMap<String, serde_json::Value>,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            directory: default_plugin_directory(),
            builtin: true,
            settings: HashMap::new(),
        }
    }
}

fn default_plugin_directory() -> PathBuf {
    PathBuf::from("plugins")
}

fn default_true() -> bool {
    true
}

// =============================================================================
// Dispatch
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchConfig {
    /// Text starting with this prefix is a command.
    #[serde(default = "default_command_prefix")]
    pub command_prefix: String,

    /// Send a failure response when a command fails.
    #[serde(default = "default_true")]
    pub reply_errors: bool,

    /// Users that always act with root authority.
    #[serde(default)]
    pub root_users: Vec<String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            command_prefix: default_command_prefix(),
            reply_errors: true,
            root_users: Vec::new(),
        }
    }
}

fn default_command_prefix() -> String {
    "/".to_string()
}

// =============================================================================
// Contacts
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContactsConfig {
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
}

impl ContactsConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}

impl Default for ContactsConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_refresh_interval_secs(),
        }
    }
}

fn default_refresh_interval_secs() -> u64 {
    300
}
