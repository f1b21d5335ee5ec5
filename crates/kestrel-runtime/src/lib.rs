//! Kestrel Runtime - the host process around `kestrel-core`.
//!
//! This crate provides:
//! - Layered configuration (`ConfigLoader`, `KestrelConfig`)
//! - Logging setup (`LoggingBuilder`)
//! - Plugin directory scanning: one container per subdirectory, one
//!   artifact per `*.toml` manifest
//! - The built-in `help` command
//! - [`KestrelRuntime`], which loads containers and routes inbound messages
//!   to waiting conversations, commands or message hooks
//!
//! ```ignore
//! use kestrel_runtime::KestrelRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = KestrelRuntime::builder()
//!         .transport(Arc::new(MyTransport::connect().await?))
//!         .artifact(Artifact::new("dice", "1.0.0").plugin::<Dice>())
//!         .build()?;
//!
//!     // Run until Ctrl+C
//!     runtime.run().await?;
//!     Ok(())
//! }
//! ```

pub mod builtin;
pub mod config;
pub mod error;
pub mod logging;
pub mod runtime;
pub mod scan;
pub mod settings;

pub use builtin::{HELP_ARTIFACT, HelpPlugin};
pub use config::{ConfigError, ConfigLoader, ConfigResult, KestrelConfig};
pub use error::{RuntimeError, RuntimeResult};
pub use logging::{LoggingBuilder, SpanEvents};
pub use runtime::{KestrelRuntime, Routed, RuntimeBuilder, RuntimeStats};
pub use settings::PluginSettings;

// Re-export tracing for use by plugin crates
pub use tracing;
pub use tracing_subscriber;

/// Logging macros for plugin code.
pub mod prelude {
    pub use tracing::{Level, debug, error, info, instrument, span, trace, warn};
}
