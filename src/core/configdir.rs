//! core::configdir
//!
//! The configuration directory an operation uploads.
//!
//! # Responsibilities
//!
//! - Detect whether a directory holds any configuration files
//! - Resolve the upload root when the workspace declares a working directory
//! - Build the gzip-compressed tar archive sent to the runs API
//!
//! Parsing the configuration language is out of scope; a directory "has
//! configuration" when it contains at least one file with a configuration
//! extension.

use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use thiserror::Error;

/// Extensions recognized as configuration files.
pub const CONFIG_EXTENSIONS: &[&str] = &[".tf", ".tf.json"];

/// Directory names never included in the upload archive.
const EXCLUDED_DIRS: &[&str] = &[".git", ".stratus"];

#[derive(Debug, Error)]
pub enum ConfigDirError {
    #[error("No configuration files found in {0}")]
    NoConfigFiles(PathBuf),

    #[error("configuration directory does not exist: {0}")]
    NotFound(PathBuf),

    #[error(
        "the remote workspace expects configuration at '{working_dir}', \
         but {config_dir} is not inside a matching directory"
    )]
    WorkingDirectoryMismatch {
        working_dir: String,
        config_dir: PathBuf,
    },

    #[error("failed to archive configuration: {0}")]
    Archive(#[from] std::io::Error),
}

/// An opened configuration directory.
#[derive(Debug, Clone)]
pub struct ConfigDir {
    path: PathBuf,
    has_config_files: bool,
}

impl ConfigDir {
    /// Open a configuration directory.
    ///
    /// When `require_files` is set, a directory without configuration files
    /// is rejected with [`ConfigDirError::NoConfigFiles`]. Destroy operations
    /// open with `require_files = false`.
    pub fn open(path: &Path, require_files: bool) -> Result<Self, ConfigDirError> {
        if !path.is_dir() {
            return Err(ConfigDirError::NotFound(path.to_path_buf()));
        }
        let path = path.canonicalize()?;
        let has_config_files = fs::read_dir(&path)?
            .filter_map(Result::ok)
            .filter(|e| e.path().is_file())
            .any(|e| is_config_file(&e.file_name().to_string_lossy()));

        if require_files && !has_config_files {
            return Err(ConfigDirError::NoConfigFiles(path));
        }
        Ok(Self {
            path,
            has_config_files,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn has_config_files(&self) -> bool {
        self.has_config_files
    }

    /// Directory to upload given the workspace's working directory.
    ///
    /// With no working directory the configuration directory itself is
    /// uploaded. Otherwise the configuration directory must end with the
    /// working directory's components, and the prefix before them is the root.
    pub fn upload_root(&self, working_dir: Option<&str>) -> Result<PathBuf, ConfigDirError> {
        let working_dir = match working_dir.map(str::trim).filter(|w| !w.is_empty()) {
            None => return Ok(self.path.clone()),
            Some(w) => w,
        };

        let wanted: Vec<Component<'_>> = Path::new(working_dir)
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .collect();
        let have: Vec<Component<'_>> = self.path.components().collect();

        if wanted.is_empty() || wanted.len() > have.len() {
            return Err(self.mismatch(working_dir));
        }
        let split = have.len() - wanted.len();
        if have[split..] != wanted[..] {
            return Err(self.mismatch(working_dir));
        }
        Ok(have[..split].iter().collect())
    }

    fn mismatch(&self, working_dir: &str) -> ConfigDirError {
        ConfigDirError::WorkingDirectoryMismatch {
            working_dir: working_dir.to_string(),
            config_dir: self.path.clone(),
        }
    }

    /// Build a `.tar.gz` archive of `root`.
    pub fn archive(root: &Path) -> Result<Vec<u8>, ConfigDirError> {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        append_dir(&mut builder, root, Path::new(""))?;
        let mut encoder = builder.into_inner()?;
        encoder.flush()?;
        Ok(encoder.finish()?)
    }
}

fn is_config_file(name: &str) -> bool {
    CONFIG_EXTENSIONS.iter().any(|ext| name.ends_with(ext))
}

fn append_dir<W: Write>(
    builder: &mut tar::Builder<W>,
    dir: &Path,
    prefix: &Path,
) -> std::io::Result<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)?.filter_map(Result::ok).collect();
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name();
        let path = entry.path();
        let rel = prefix.join(&name);
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            if EXCLUDED_DIRS.iter().any(|d| name == *d) {
                continue;
            }
            builder.append_dir(&rel, &path)?;
            append_dir(builder, &path, &rel)?;
        } else if file_type.is_file() {
            builder.append_path_with_name(&path, &rel)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use tempfile::TempDir;

    fn config_dir_with_main() -> TempDir {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("main.tf"), "resource \"null_resource\" \"hello\" {}").unwrap();
        temp
    }

    #[test]
    fn open_requires_config_files() {
        let temp = TempDir::new().unwrap();
        let err = ConfigDir::open(temp.path(), true).unwrap_err();
        assert!(err.to_string().contains("No configuration files found"));
    }

    #[test]
    fn open_without_requirement_allows_empty() {
        let temp = TempDir::new().unwrap();
        let dir = ConfigDir::open(temp.path(), false).unwrap();
        assert!(!dir.has_config_files());
    }

    #[test]
    fn open_detects_json_config() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("main.tf.json"), "{}").unwrap();
        let dir = ConfigDir::open(temp.path(), true).unwrap();
        assert!(dir.has_config_files());
    }

    #[test]
    fn open_missing_directory() {
        let temp = TempDir::new().unwrap();
        let err = ConfigDir::open(&temp.path().join("nope"), false).unwrap_err();
        assert!(matches!(err, ConfigDirError::NotFound(_)));
    }

    #[test]
    fn upload_root_without_working_dir() {
        let temp = config_dir_with_main();
        let dir = ConfigDir::open(temp.path(), true).unwrap();
        assert_eq!(dir.upload_root(None).unwrap(), dir.path());
        assert_eq!(dir.upload_root(Some("  ")).unwrap(), dir.path());
    }

    #[test]
    fn upload_root_strips_working_dir() {
        let temp = TempDir::new().unwrap();
        let nested = temp.path().join("infra/prod");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("main.tf"), "").unwrap();

        let dir = ConfigDir::open(&nested, true).unwrap();
        let root = dir.upload_root(Some("infra/prod")).unwrap();
        assert_eq!(root, temp.path().canonicalize().unwrap());
    }

    #[test]
    fn upload_root_mismatch() {
        let temp = config_dir_with_main();
        let dir = ConfigDir::open(temp.path(), true).unwrap();
        let err = dir.upload_root(Some("infra/staging")).unwrap_err();
        assert!(matches!(err, ConfigDirError::WorkingDirectoryMismatch { .. }));
    }

    #[test]
    fn archive_skips_excluded_dirs() {
        let temp = config_dir_with_main();
        fs::create_dir_all(temp.path().join(".git")).unwrap();
        fs::write(temp.path().join(".git/HEAD"), "ref").unwrap();
        fs::create_dir_all(temp.path().join("modules/net")).unwrap();
        fs::write(temp.path().join("modules/net/net.tf"), "").unwrap();

        let bytes = ConfigDir::archive(temp.path()).unwrap();
        let mut archive = tar::Archive::new(GzDecoder::new(&bytes[..]));
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();

        assert!(names.iter().any(|n| n == "main.tf"));
        assert!(names.iter().any(|n| n.ends_with("net.tf")));
        assert!(!names.iter().any(|n| n.starts_with(".git")));
    }
}
