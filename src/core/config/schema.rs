//! core::config::schema
//!
//! Configuration schema types.
//!
//! The same schema is used for the global file and the project file; project
//! values override global ones key by key.
//!
//! # Validation
//!
//! Values are validated after parsing (e.g. poll bounds must be ordered).

use serde::{Deserialize, Serialize};

use super::ConfigError;

/// A configuration file.
///
/// # Example
///
/// ```toml
/// hostname = "app.stratus.dev"
/// organization = "acme"
/// workspace = "prod"
/// lock_timeout_secs = 30
///
/// [poll]
/// min_interval_ms = 500
/// max_interval_ms = 3000
///
/// [local]
/// program = "tofu"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    /// Runs API hostname.
    pub hostname: Option<String>,

    /// Organization owning the workspaces.
    pub organization: Option<String>,

    /// Default workspace name.
    pub workspace: Option<String>,

    /// API token. `STRATUS_TOKEN` takes precedence.
    pub token: Option<String>,

    /// Default state lock timeout in seconds.
    pub lock_timeout_secs: Option<u64>,

    /// Proceed with a warning when local and remote versions conflict.
    pub ignore_version_conflict: Option<bool>,

    /// Polling backoff settings.
    pub poll: Option<PollConfig>,

    /// Local execution settings.
    pub local: Option<LocalConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PollConfig {
    pub min_interval_ms: Option<u64>,
    pub max_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LocalConfig {
    /// Program run for local execution.
    pub program: Option<String>,
}

impl FileConfig {
    /// Validate the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if any value is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(host) = &self.hostname {
            if host.is_empty() || host.contains('/') || host.contains(char::is_whitespace) {
                return Err(ConfigError::InvalidValue(format!(
                    "invalid hostname '{}'",
                    host
                )));
            }
        }

        if let Some(org) = &self.organization {
            if org.trim().is_empty() {
                return Err(ConfigError::InvalidValue(
                    "organization cannot be empty".into(),
                ));
            }
        }

        if let Some(ws) = &self.workspace {
            crate::core::types::WorkspaceName::new(ws.clone())
                .map_err(|e| ConfigError::InvalidValue(e.to_string()))?;
        }

        if let Some(poll) = &self.poll {
            if poll.min_interval_ms == Some(0) {
                return Err(ConfigError::InvalidValue(
                    "poll.min_interval_ms must be positive".into(),
                ));
            }
            if let (Some(min), Some(max)) = (poll.min_interval_ms, poll.max_interval_ms) {
                if max < min {
                    return Err(ConfigError::InvalidValue(format!(
                        "poll.max_interval_ms ({}) is below poll.min_interval_ms ({})",
                        max, min
                    )));
                }
            }
        }

        if let Some(local) = &self.local {
            if matches!(&local.program, Some(p) if p.trim().is_empty()) {
                return Err(ConfigError::InvalidValue(
                    "local.program cannot be empty".into(),
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full() {
        let cfg: FileConfig = toml::from_str(
            r#"
            hostname = "app.stratus.dev"
            organization = "acme"
            workspace = "prod"
            lock_timeout_secs = 30

            [poll]
            min_interval_ms = 500
            max_interval_ms = 3000

            [local]
            program = "tofu"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.organization.as_deref(), Some("acme"));
        assert_eq!(cfg.poll.as_ref().unwrap().max_interval_ms, Some(3000));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn invalid_hostname_rejected() {
        let cfg = FileConfig {
            hostname: Some("https://app.stratus.dev".into()),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn invalid_workspace_rejected() {
        let cfg = FileConfig {
            workspace: Some("not valid".into()),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn unordered_poll_bounds_rejected() {
        let cfg = FileConfig {
            poll: Some(PollConfig {
                min_interval_ms: Some(1000),
                max_interval_ms: Some(10),
            }),
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("poll.max_interval_ms"));
    }
}
