//! Configuration loader using figment.
//!
//! # Feature Flags
//!
//! TOML files (`kestrel.toml`, `config.toml`) are always searched. The
//! `yaml-config` feature adds `kestrel.yaml` / `kestrel.yml`.
//!
//! # Configuration Priority (lowest to highest)
//!
//! 1. Built-in defaults
//! 2. Programmatic base configuration ([`ConfigLoader::merge`])
//! 3. Profile-specific config file (`kestrel.{profile}.toml`)
//! 4. Main config file (`kestrel.toml`)
//! 5. Environment variables (`KESTREL_*`)
//!
//! # Environment Variable Mapping
//!
//! - `KESTREL_LOGGING__LEVEL=debug` → `logging.level = "debug"`
//! - `KESTREL_DISPATCH__COMMAND_PREFIX=!` → `dispatch.command_prefix = "!"`
//! - `KESTREL_PLUGINS__DIRECTORY=/srv/bot/plugins` → `plugins.directory`
//!
//! # Example
//!
//! ```rust,ignore
//! use kestrel_runtime::config::ConfigLoader;
//!
//! let config = ConfigLoader::new()
//!     .profile("production")
//!     .file("./config/kestrel.toml")
//!     .load()?;
//! ```

use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
#[cfg(feature = "yaml-config")]
use figment::providers::Yaml;
use tracing::{debug, info, trace, warn};

use super::error::{ConfigError, ConfigResult};
use super::schema::KestrelConfig;
use super::validation::validate_config;

const ENV_PREFIX: &str = "KESTREL_";
const PROFILE_VAR: &str = "KESTREL_PROFILE";

/// Configuration profile for environment-specific settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Profile {
    #[default]
    Development,
    Production,
    Custom(String),
}

impl Profile {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Custom(name) => name,
        }
    }

    fn parse(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "production" | "prod" => Self::Production,
            "development" | "dev" => Self::Development,
            other => Self::Custom(other.to_string()),
        }
    }

    /// Reads `KESTREL_PROFILE`, defaulting to Development.
    pub fn from_env() -> Self {
        std::env::var(PROFILE_VAR)
            .map(|p| Self::parse(&p))
            .unwrap_or_default()
    }
}

impl std::fmt::Display for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Configuration loader with figment-based multi-source support.
pub struct ConfigLoader {
    figment: Figment,
    profile: Profile,
    search_paths: Vec<PathBuf>,
    load_env: bool,
    config_file: Option<PathBuf>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            figment: Figment::new(),
            profile: Profile::from_env(),
            search_paths: Vec::new(),
            load_env: true,
            config_file: None,
        }
    }

    pub fn profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = Profile::parse(&profile.into());
        self
    }

    /// Adds a search path for configuration files.
    pub fn search_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.search_paths.push(path.as_ref().to_path_buf());
        self
    }

    pub fn with_current_dir(self) -> Self {
        if let Ok(cwd) = std::env::current_dir() {
            self.search_path(cwd)
        } else {
            self
        }
    }

    /// Adds `<user config dir>/kestrel` to the search paths.
    pub fn with_user_config_dir(self) -> Self {
        if let Some(config_dir) = dirs::config_dir() {
            self.search_path(config_dir.join("kestrel"))
        } else {
            self
        }
    }

    /// Loads exactly this file instead of searching.
    pub fn file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_env(mut self) -> Self {
        self.load_env = true;
        self
    }

    pub fn without_env(mut self) -> Self {
        self.load_env = false;
        self
    }

    /// Merges a programmatic base configuration over the built-in defaults.
    /// Files and environment variables still override it.
    pub fn merge(mut self, config: KestrelConfig) -> Self {
        self.figment = self.figment.merge(Serialized::defaults(config));
        self
    }

    /// Loads, validates and returns the configuration.
    pub fn load(self) -> ConfigResult<KestrelConfig> {
        let profile = self.profile.clone();
        let figment = self.build_figment()?;

        let config: KestrelConfig = figment.extract().map_err(|e| {
            ConfigError::ParseError(format!("Failed to extract configuration: {e}"))
        })?;
        validate_config(&config)?;

        debug!(
            profile        = %profile,
            logging_level  = %config.logging.level,
            plugins        = %config.plugins.directory.display(),
            command_prefix = %config.dispatch.command_prefix,
            "Configuration loaded successfully"
        );

        Ok(config)
    }

    fn build_figment(mut self) -> ConfigResult<Figment> {
        let mut figment = Figment::from(Serialized::defaults(KestrelConfig::default()));

        let user_figment = std::mem::take(&mut self.figment);
        figment = figment.merge(user_figment);

        if let Some(path) = &self.config_file {
            if !path.exists() {
                return Err(ConfigError::FileNotFound(path.clone()));
            }
            info!(path = %path.display(), "Loading configuration file");
            figment = Self::merge_config_file(figment, path)?;
        } else {
            figment = self.load_config_files(figment);
        }

        if self.load_env {
            trace!("Loading environment variables with {ENV_PREFIX} prefix");
            figment = figment.merge(
                Env::prefixed(ENV_PREFIX)
                    .ignore(&["PROFILE"])
                    .split("__"),
            );
        }

        Ok(figment)
    }

    fn merge_config_file(figment: Figment, path: &Path) -> ConfigResult<Figment> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        match ext {
            "toml" => Ok(figment.merge(Toml::file(path))),
            #[cfg(feature = "yaml-config")]
            "yaml" | "yml" => Ok(figment.merge(Yaml::file(path))),
            _ => Err(ConfigError::ParseError(format!(
                "Unsupported or disabled configuration file format: .{ext}"
            ))),
        }
    }

    fn resolve_search_paths(&self) -> Vec<PathBuf> {
        if self.search_paths.is_empty() {
            let mut paths = Vec::new();
            if let Ok(cwd) = std::env::current_dir() {
                paths.push(cwd);
            }
            if let Some(config_dir) = dirs::config_dir() {
                paths.push(config_dir.join("kestrel"));
            }
            paths
        } else {
            self.search_paths.clone()
        }
    }

    /// Tries `search_paths × base_names`, merging a profile-specific
    /// variant before the base file. Stops at the first base file found.
    fn load_format_files<F>(
        &self,
        mut figment: Figment,
        search_paths: &[PathBuf],
        base_names: &[&str],
        merge_fn: F,
    ) -> (Figment, bool)
    where
        F: Fn(Figment, &Path) -> Figment,
    {
        for search_path in search_paths {
            for base_name in base_names {
                let Some((stem, ext)) = base_name.rsplit_once('.') else {
                    continue;
                };

                let profile_path =
                    search_path.join(format!("{stem}.{}.{ext}", self.profile.as_str()));
                if profile_path.exists() {
                    debug!(path = %profile_path.display(), "Loading profile-specific config");
                    figment = merge_fn(figment, &profile_path);
                }

                let base_path = search_path.join(base_name);
                if base_path.exists() {
                    info!(path = %base_path.display(), "Loading configuration file");
                    figment = merge_fn(figment, &base_path);
                    return (figment, true);
                }
            }
        }
        (figment, false)
    }

    fn load_config_files(&self, figment: Figment) -> Figment {
        let search_paths = self.resolve_search_paths();

        #[allow(unused_mut)]
        let (mut figment, mut found) = self.load_format_files(
            figment,
            &search_paths,
            &["kestrel.toml", "config.toml"],
            |fig, path| fig.merge(Toml::file(path)),
        );

        #[cfg(feature = "yaml-config")]
        {
            let (f, ok) = self.load_format_files(
                figment,
                &search_paths,
                &["kestrel.yaml", "kestrel.yml"],
                |fig, path| fig.merge(Yaml::file(path)),
            );
            figment = f;
            found |= ok;
        }

        if !found {
            warn!("No configuration file found, using defaults");
        }
        figment
    }
}

/// Loads configuration from the current directory and the user config
/// directory, with environment overrides.
pub fn load_config() -> ConfigResult<KestrelConfig> {
    ConfigLoader::new().load()
}

/// Loads configuration from one file, with environment overrides.
pub fn load_config_from_file(path: impl AsRef<Path>) -> ConfigResult<KestrelConfig> {
    ConfigLoader::new().file(path).load()
}

// =============================================================================
// Tests
// =============================================================================
