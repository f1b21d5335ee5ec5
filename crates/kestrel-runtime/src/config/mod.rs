//! Configuration for the Kestrel runtime.
//!
//! Settings are layered with figment (defaults, profile file, main file,
//! `KESTREL_*` environment variables, programmatic overrides) and validated
//! once after extraction.

pub mod error;
pub mod loader;
pub mod schema;
pub mod validation;

pub use error::{ConfigError, ConfigResult};
pub use loader::{ConfigLoader, Profile, load_config, load_config_from_file};
pub use schema::{
    ContactsConfig, DispatchConfig, KestrelConfig, LogFormat, LogLevel, LogOutput,
    LoggingConfig, PluginsConfig, SpanEventConfig,
};
pub use validation::validate_config;
