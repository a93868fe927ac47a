//! engine::version
//!
//! Local/remote tool version compatibility.
//!
//! Remote runs use the workspace's own tool version, so the check only
//! matters when a workspace that normally executes remotely is forced to
//! run locally: the local tool would then write state that the remote
//! version must read back.

use semver::{Version, VersionReq};
use thiserror::Error;

use crate::runs::Workspace;

/// Workspace version value meaning "whatever is newest".
const LATEST: &str = "latest";

/// Version of the local tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalVersion {
    pub version: String,
}

impl LocalVersion {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
        }
    }
}

impl Default for LocalVersion {
    fn default() -> Self {
        Self::new(env!("CARGO_PKG_VERSION"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionError {
    #[error(
        "The local tool version ({local}) does not match the version required by \
         remote workspace {workspace} ({remote})"
    )]
    Mismatch {
        local: String,
        remote: String,
        workspace: String,
    },

    #[error(
        "Could not compare the local tool version ({local}) with the version of \
         remote workspace {workspace} ({remote})"
    )]
    Unparsable {
        local: String,
        remote: String,
        workspace: String,
    },
}

/// Outcome of the version check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionVerdict {
    Proceed,
    Warn(VersionError),
    Reject(VersionError),
}

impl VersionVerdict {
    pub fn is_reject(&self) -> bool {
        matches!(self, VersionVerdict::Reject(_))
    }
}

/// Decide whether `local` may operate on `workspace`'s state.
pub fn check_version(
    local: &LocalVersion,
    workspace: &Workspace,
    force_local: bool,
    ignore_conflict: bool,
) -> VersionVerdict {
    if !workspace.execution_mode.runs_remotely() {
        return VersionVerdict::Proceed;
    }
    if !force_local {
        return VersionVerdict::Proceed;
    }

    let remote = workspace.tool_version.trim();
    if remote.is_empty() || remote == LATEST {
        return VersionVerdict::Proceed;
    }

    let name = format!("{}/{}", workspace.organization, workspace.name);
    let error = |unparsable: bool| {
        let (local, remote, workspace) = (local.version.clone(), remote.to_string(), name.clone());
        if unparsable {
            VersionError::Unparsable {
                local,
                remote,
                workspace,
            }
        } else {
            VersionError::Mismatch {
                local,
                remote,
                workspace,
            }
        }
    };

    let Ok(local_version) = Version::parse(local.version.trim()) else {
        return VersionVerdict::Warn(error(true));
    };
    // Prerelease builds of a release count as that release.
    let core = Version::new(local_version.major, local_version.minor, local_version.patch);

    let compatible = match Version::parse(remote) {
        Ok(exact) => exact.major == core.major && exact.minor == core.minor && exact.patch == core.patch,
        Err(_) => match VersionReq::parse(remote) {
            Ok(req) => req.matches(&core),
            Err(_) => return VersionVerdict::Warn(error(true)),
        },
    };

    if compatible {
        VersionVerdict::Proceed
    } else if ignore_conflict {
        tracing::warn!(local = %local.version, remote, "ignoring tool version conflict");
        VersionVerdict::Warn(error(false))
    } else {
        VersionVerdict::Reject(error(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runs::mock::MockRunsApi;
    use crate::runs::ExecutionMode;

    fn workspace(mode: ExecutionMode, version: &str) -> Workspace {
        let mock = MockRunsApi::new();
        let mut ws = mock.add_workspace("acme", "prod");
        ws.execution_mode = mode;
        ws.tool_version = version.to_string();
        ws
    }

    #[test]
    fn remote_execution_always_proceeds() {
        let ws = workspace(ExecutionMode::Remote, "0.13.5");
        let verdict = check_version(&LocalVersion::new("0.14.0"), &ws, false, false);
        assert_eq!(verdict, VersionVerdict::Proceed);
    }

    #[test]
    fn local_execution_mode_proceeds() {
        let ws = workspace(ExecutionMode::Local, "0.13.5");
        let verdict = check_version(&LocalVersion::new("0.14.0"), &ws, true, false);
        assert_eq!(verdict, VersionVerdict::Proceed);
    }

    #[test]
    fn prerelease_matches_release() {
        let ws = workspace(ExecutionMode::Remote, "0.14.0");
        let local = LocalVersion::new("0.14.0-acme-provider-bundle");
        assert_eq!(check_version(&local, &ws, true, false), VersionVerdict::Proceed);
    }

    #[test]
    fn identical_versions_proceed() {
        let ws = workspace(ExecutionMode::Remote, "1.6.0");
        assert_eq!(
            check_version(&LocalVersion::new("1.6.0"), &ws, true, false),
            VersionVerdict::Proceed
        );
    }

    #[test]
    fn constraint_versions_are_matched() {
        let ws = workspace(ExecutionMode::Remote, "~> 1.6.0");
        assert_eq!(
            check_version(&LocalVersion::new("1.6.3"), &ws, true, false),
            VersionVerdict::Proceed
        );
    }

    #[test]
    fn mismatch_under_force_local_rejects() {
        let ws = workspace(ExecutionMode::Remote, "0.13.5");
        let verdict = check_version(&LocalVersion::new("0.14.0"), &ws, true, false);
        assert!(verdict.is_reject());
        if let VersionVerdict::Reject(e) = verdict {
            assert!(e.to_string().contains("acme/prod"));
        }
    }

    #[test]
    fn mismatch_with_ignore_warns() {
        let ws = workspace(ExecutionMode::Remote, "0.13.5");
        let verdict = check_version(&LocalVersion::new("0.14.0"), &ws, true, true);
        assert!(matches!(verdict, VersionVerdict::Warn(VersionError::Mismatch { .. })));
    }

    #[test]
    fn unparsable_version_warns() {
        let ws = workspace(ExecutionMode::Remote, "not-a-version!");
        let verdict = check_version(&LocalVersion::new("0.14.0"), &ws, true, false);
        assert!(matches!(verdict, VersionVerdict::Warn(VersionError::Unparsable { .. })));
    }

    #[test]
    fn latest_proceeds() {
        let ws = workspace(ExecutionMode::Remote, "latest");
        assert_eq!(
            check_version(&LocalVersion::new("0.12.0"), &ws, true, false),
            VersionVerdict::Proceed
        );
    }
}
