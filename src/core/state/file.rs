//! core::state::file
//!
//! Local state file guarded by an OS-level exclusive lock.
//!
//! # Storage
//!
//! - `<dir>/state.json` - Latest [`StateSnapshot`]
//! - `<dir>/state.lock` - Lock file held with `fs2` while locked
//! - `<dir>/state.lock.info` - JSON [`LockInfo`] of the current holder
//!
//! Lock attempts never block: a held lock yields [`StateError::Locked`]
//! with the holder's info when it can be read.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use fs2::FileExt;

use super::{LockId, LockInfo, StateError, StateManager, StateSnapshot};

#[derive(Debug)]
pub struct FileStateManager {
    dir: PathBuf,
    held: Mutex<Option<(LockId, File)>>,
}

impl FileStateManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            held: Mutex::new(None),
        }
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.join("state.json")
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.join("state.lock")
    }

    fn info_path(&self) -> PathBuf {
        self.dir.join("state.lock.info")
    }

    /// Write a new snapshot atomically (temp file, then rename).
    pub fn write_state(&self, snapshot: &StateSnapshot) -> Result<(), StateError> {
        fs::create_dir_all(&self.dir).map_err(backend)?;
        let contents = serde_json::to_vec_pretty(snapshot).map_err(backend)?;
        let temp = self.dir.join("state.json.tmp");
        fs::write(&temp, contents).map_err(backend)?;
        fs::rename(&temp, self.state_path()).map_err(backend)
    }

    fn read_holder(path: &Path) -> Option<Box<LockInfo>> {
        let contents = fs::read_to_string(path).ok()?;
        serde_json::from_str(&contents).ok().map(Box::new)
    }
}

fn backend(e: impl std::fmt::Display) -> StateError {
    StateError::Backend(e.to_string())
}

#[async_trait]
impl StateManager for FileStateManager {
    async fn lock(&self, info: &LockInfo) -> Result<LockId, StateError> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| StateError::Backend("lock state poisoned".into()))?;
        if held.is_some() {
            return Err(StateError::Locked {
                holder: Self::read_holder(&self.info_path()),
            });
        }

        fs::create_dir_all(&self.dir).map_err(backend)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.lock_path())
            .map_err(backend)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                let json = serde_json::to_vec(info).map_err(backend)?;
                fs::write(self.info_path(), json).map_err(backend)?;
                *held = Some((info.id.clone(), file));
                Ok(info.id.clone())
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(StateError::Locked {
                holder: Self::read_holder(&self.info_path()),
            }),
            Err(e) => Err(backend(e)),
        }
    }

    async fn unlock(&self, id: &LockId) -> Result<(), StateError> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| StateError::Backend("lock state poisoned".into()))?;
        match held.take() {
            None => Err(StateError::NotLocked),
            Some((held_id, file)) if &held_id != id => {
                let found = held_id.to_string();
                *held = Some((held_id, file));
                Err(StateError::LockMismatch {
                    expected: id.to_string(),
                    found,
                })
            }
            Some((_, file)) => {
                let _ = fs::remove_file(self.info_path());
                fs2::FileExt::unlock(&file).map_err(backend)
            }
        }
    }

    async fn read_state(&self) -> Result<Option<StateSnapshot>, StateError> {
        let path = self.state_path();
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path).map_err(backend)?;
        serde_json::from_str(&contents).map(Some).map_err(backend)
    }
}
