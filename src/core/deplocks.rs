//! core::deplocks
//!
//! Dependency lock set: which provider versions a configuration is pinned to.
//!
//! The lock set lives next to the configuration in `.stratus-lock.toml`:
//!
//! ```toml
//! [providers."registry.stratus.dev/hashicorp/null"]
//! version = "3.2.1"
//! hashes = ["h1:abc="]
//! ```
//!
//! Providers replaced by local development overrides are marked
//! "overridden". A remote run cannot see those overrides, so the engine
//! warns before submitting.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// File name of the lock set inside a configuration directory.
pub const LOCK_FILE_NAME: &str = ".stratus-lock.toml";

/// Registry host assumed when an address omits it.
pub const DEFAULT_REGISTRY_HOST: &str = "registry.stratus.dev";

#[derive(Debug, Error)]
pub enum DepLockError {
    #[error("invalid provider address: {0}")]
    InvalidAddress(String),

    #[error("failed to read dependency lock file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse dependency lock file: {0}")]
    Parse(String),
}

/// Fully qualified provider source address (`host/namespace/type`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProviderAddr {
    pub hostname: String,
    pub namespace: String,
    pub name: String,
}

impl ProviderAddr {
    /// Parse `namespace/type` or `host/namespace/type`.
    pub fn parse(s: &str) -> Result<Self, DepLockError> {
        let parts: Vec<&str> = s.split('/').collect();
        let valid = |p: &&str| {
            !p.is_empty()
                && p.chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        };
        if !parts.iter().all(valid) {
            return Err(DepLockError::InvalidAddress(s.to_string()));
        }
        match parts.as_slice() {
            [ns, name] => Ok(Self {
                hostname: DEFAULT_REGISTRY_HOST.to_string(),
                namespace: ns.to_lowercase(),
                name: name.to_lowercase(),
            }),
            [host, ns, name] => Ok(Self {
                hostname: host.to_lowercase(),
                namespace: ns.to_lowercase(),
                name: name.to_lowercase(),
            }),
            _ => Err(DepLockError::InvalidAddress(s.to_string())),
        }
    }
}

impl fmt::Display for ProviderAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.hostname, self.namespace, self.name)
    }
}

/// One locked provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderLock {
    pub version: String,
    pub hashes: Vec<String>,
    /// Replaced locally by a development override.
    pub overridden: bool,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct LockFile {
    #[serde(default)]
    providers: BTreeMap<String, LockFileEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct LockFileEntry {
    version: String,
    #[serde(default)]
    hashes: Vec<String>,
}

/// The set of provider locks for a configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyLocks {
    providers: BTreeMap<ProviderAddr, ProviderLock>,
}

impl DependencyLocks {
    /// Load the lock set from a configuration directory.
    ///
    /// A missing lock file yields an empty set.
    pub fn load(config_dir: &Path) -> Result<Self, DepLockError> {
        let path = config_dir.join(LOCK_FILE_NAME);
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(&path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, DepLockError> {
        let file: LockFile =
            toml::from_str(contents).map_err(|e| DepLockError::Parse(e.to_string()))?;
        let mut locks = Self::default();
        for (addr, entry) in file.providers {
            locks.insert(
                ProviderAddr::parse(&addr)?,
                ProviderLock {
                    version: entry.version,
                    hashes: entry.hashes,
                    overridden: false,
                },
            );
        }
        Ok(locks)
    }

    pub fn insert(&mut self, addr: ProviderAddr, lock: ProviderLock) {
        self.providers.insert(addr, lock);
    }

    pub fn get(&self, addr: &ProviderAddr) -> Option<&ProviderLock> {
        self.providers.get(addr)
    }

    /// Mark a provider as replaced by a local development override.
    ///
    /// Providers not present in the set are added with an empty version.
    pub fn mark_overridden(&mut self, addr: ProviderAddr) {
        self.providers
            .entry(addr)
            .or_insert_with(|| ProviderLock {
                version: String::new(),
                hashes: Vec::new(),
                overridden: false,
            })
            .overridden = true;
    }

    /// Providers currently replaced by development overrides.
    pub fn overridden(&self) -> Vec<&ProviderAddr> {
        self.providers
            .iter()
            .filter(|(_, lock)| lock.overridden)
            .map(|(addr, _)| addr)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
