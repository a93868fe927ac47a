//! core::config
//!
//! Configuration schema and loading.
//!
//! # Overview
//!
//! Stratus has two configuration scopes:
//! - **Global**: User-level settings
//! - **Project**: Overrides stored next to the configuration being run
//!
//! # Precedence
//!
//! Configuration values are resolved in this order (later overrides earlier):
//! 1. Default values
//! 2. Global config file
//! 3. Project config file
//! 4. Environment (`STRATUS_TOKEN`, `STRATUS_FORCE_LOCAL_BACKEND`)
//! 5. CLI flags (not handled here)
//!
//! # Global Config Locations
//!
//! Searched in order:
//! 1. `$STRATUS_CONFIG` if set
//! 2. `$XDG_CONFIG_HOME/stratus/config.toml`
//! 3. `~/.stratus/config.toml`
//!
//! # Project Config Location
//!
//! `<config dir>/.stratus/config.toml`
//!
//! # Example
//!
//! ```no_run
//! use stratus::core::config::Config;
//! use std::path::Path;
//!
//! let config = Config::load(Some(Path::new("./infra"))).unwrap();
//! println!("Host: {}", config.hostname());
//! println!("Lock timeout: {:?}", config.lock_timeout());
//! ```

pub mod schema;

pub use schema::{FileConfig, LocalConfig, PollConfig};

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

/// Default runs API hostname.
pub const DEFAULT_HOSTNAME: &str = "app.stratus.dev";

/// Default program used for local execution.
pub const DEFAULT_LOCAL_PROGRAM: &str = "tofu";

/// Default polling backoff bounds.
pub const DEFAULT_POLL_MIN: Duration = Duration::from_millis(1000);
pub const DEFAULT_POLL_MAX: Duration = Duration::from_millis(3000);

/// Errors from configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file '{path}': {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

/// Merged configuration from all sources.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub global: FileConfig,
    pub project: Option<FileConfig>,
    pub(crate) global_path: Option<PathBuf>,
    pub(crate) project_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from default locations.
    ///
    /// If `project_dir` is provided, also loads its project config.
    ///
    /// # Errors
    ///
    /// Returns an error if config files exist but cannot be parsed.
    /// Missing config files are not an error (defaults are used).
    pub fn load(project_dir: Option<&Path>) -> Result<Self, ConfigError> {
        let (global, global_path) = Self::load_global()?;

        let (project, project_path) = match project_dir {
            Some(dir) => {
                let path = Self::project_config_path(dir);
                if path.exists() {
                    (Some(Self::read_file(&path)?), Some(path))
                } else {
                    (None, None)
                }
            }
            None => (None, None),
        };

        global.validate()?;
        if let Some(ref p) = project {
            p.validate()?;
        }

        tracing::debug!(?global_path, ?project_path, "configuration loaded");
        Ok(Config {
            global,
            project,
            global_path,
            project_path,
        })
    }

    fn load_global() -> Result<(FileConfig, Option<PathBuf>), ConfigError> {
        // 1. Check $STRATUS_CONFIG
        if let Ok(path) = std::env::var("STRATUS_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                let config = Self::read_file(&path)?;
                return Ok((config, Some(path)));
            }
        }

        // 2. Check $XDG_CONFIG_HOME/stratus/config.toml
        if let Ok(xdg_home) = std::env::var("XDG_CONFIG_HOME") {
            let path = PathBuf::from(xdg_home).join("stratus/config.toml");
            if path.exists() {
                let config = Self::read_file(&path)?;
                return Ok((config, Some(path)));
            }
        }

        // 3. Check ~/.stratus/config.toml
        if let Some(home) = dirs::home_dir() {
            let path = home.join(".stratus/config.toml");
            if path.exists() {
                let config = Self::read_file(&path)?;
                return Ok((config, Some(path)));
            }
        }

        Ok((FileConfig::default(), None))
    }

    fn read_file(path: &Path) -> Result<FileConfig, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&contents).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Path of the project config for a configuration directory.
    pub fn project_config_path(dir: &Path) -> PathBuf {
        dir.join(".stratus/config.toml")
    }

    // =========================================================================
    // Accessor methods with precedence
    // =========================================================================

    fn pick<T: Clone>(&self, f: impl Fn(&FileConfig) -> Option<T>) -> Option<T> {
        self.project.as_ref().and_then(&f).or_else(|| f(&self.global))
    }

    pub fn hostname(&self) -> String {
        self.pick(|c| c.hostname.clone())
            .unwrap_or_else(|| DEFAULT_HOSTNAME.to_string())
    }

    pub fn organization(&self) -> Option<String> {
        self.pick(|c| c.organization.clone())
    }

    pub fn workspace(&self) -> Option<String> {
        self.pick(|c| c.workspace.clone())
    }

    /// API token: `STRATUS_TOKEN` first, then config files.
    pub fn token(&self) -> Option<String> {
        std::env::var("STRATUS_TOKEN")
            .ok()
            .filter(|t| !t.is_empty())
            .or_else(|| self.pick(|c| c.token.clone()))
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.pick(|c| c.lock_timeout_secs).unwrap_or(0))
    }

    pub fn poll_min(&self) -> Duration {
        self.pick(|c| c.poll.as_ref().and_then(|p| p.min_interval_ms))
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_POLL_MIN)
    }

    pub fn poll_max(&self) -> Duration {
        self.pick(|c| c.poll.as_ref().and_then(|p| p.max_interval_ms))
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_POLL_MAX)
            .max(self.poll_min())
    }

    pub fn ignore_version_conflict(&self) -> bool {
        self.pick(|c| c.ignore_version_conflict).unwrap_or(false)
    }

    pub fn local_program(&self) -> String {
        self.pick(|c| c.local.as_ref().and_then(|l| l.program.clone()))
            .unwrap_or_else(|| DEFAULT_LOCAL_PROGRAM.to_string())
    }

    /// Whether `STRATUS_FORCE_LOCAL_BACKEND` requests local execution.
    pub fn force_local() -> bool {
        std::env::var("STRATUS_FORCE_LOCAL_BACKEND")
            .map(|v| !v.is_empty())
            .unwrap_or(false)
    }

    pub fn global_config_loaded_from(&self) -> Option<&Path> {
        self.global_path.as_deref()
    }

    pub fn project_config_loaded_from(&self) -> Option<&Path> {
        self.project_path.as_deref()
    }
}
