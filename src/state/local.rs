//! Local file-based drift store.
//!
//! The drift state is a single JSON document replaced through a temporary
//! file and a rename. The lock is a sibling file created exclusively, so a
//! second process sees `AlreadyExists` instead of overwriting it.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{ConvergentError, Result, StateError};

use super::lock::{generate_holder_id, LockInfo};
use super::store::StateStore;
use super::types::DriftState;

/// Default state directory name.
pub const STATE_DIR: &str = ".convergent";

const STATE_FILE: &str = "drift.json";
const LOCK_FILE: &str = "drift.lock";

/// Attempts at creating the lock file when an expired lock is in the way.
const LOCK_ATTEMPTS: usize = 2;

/// Drift store backed by a JSON file and a sibling lock file.
#[derive(Debug)]
pub struct LocalStateStore {
    state_path: PathBuf,
    lock_path: PathBuf,
}

fn corrupted(path: &Path, e: impl std::fmt::Display) -> ConvergentError {
    StateError::Corrupted {
        message: format!("{}: {e}", path.display()),
    }
    .into()
}

fn lock_failed(e: impl std::fmt::Display) -> ConvergentError {
    StateError::LockFailed {
        message: e.to_string(),
    }
    .into()
}

/// Reads and parses a JSON file; a missing file is `None`.
async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(corrupted(path, e)),
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| corrupted(path, e))
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec_pretty(value).map_err(|e| StateError::serialization(e.to_string()).into())
}

async fn write_synced(file: &mut File, bytes: &[u8]) -> std::io::Result<()> {
    file.write_all(bytes).await?;
    file.sync_all().await
}

/// Removes `path`; returns whether there was anything to remove.
async fn remove_if_present(path: &Path) -> std::io::Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

impl LocalStateStore {
    /// Creates a store keeping `drift.json` and `drift.lock` in `base_dir`.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self::with_state_path(base_dir.into().join(STATE_FILE))
    }

    /// Creates a store from a custom state file path; the lock file lives
    /// next to it.
    #[must_use]
    pub fn with_state_path(state_path: impl Into<PathBuf>) -> Self {
        let state_path = state_path.into();
        let lock_path = state_path.with_file_name(LOCK_FILE);
        Self {
            state_path,
            lock_path,
        }
    }

    /// Path of the state file.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    fn dir(&self) -> &Path {
        self.state_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
    }

    async fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(self.dir())
            .await
            .map_err(|e| StateError::write(format!("{}: {e}", self.dir().display())).into())
    }

    /// Creates the lock file, failing with `AlreadyExists` if it is there.
    async fn create_lock_file(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
            .await?;
        write_synced(&mut file, bytes).await
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self) -> Result<Option<DriftState>> {
        debug!("Loading drift state from: {}", self.state_path.display());
        read_json(&self.state_path).await
    }

    async fn save(&self, state: &DriftState) -> Result<()> {
        self.ensure_dir().await?;
        let bytes = to_json(state)?;

        let temp_path = self.state_path.with_extension("tmp");
        let written = async {
            let mut file = File::create(&temp_path).await?;
            write_synced(&mut file, &bytes).await?;
            fs::rename(&temp_path, &self.state_path).await
        };
        written
            .await
            .map_err(|e| StateError::write(format!("{}: {e}", self.state_path.display())))?;

        debug!("Saved {} drift record(s)", state.len());
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        if remove_if_present(&self.state_path)
            .await
            .map_err(|e| StateError::write(e.to_string()))?
        {
            info!("Deleted drift state: {}", self.state_path.display());
        }
        remove_if_present(&self.lock_path)
            .await
            .map_err(lock_failed)?;
        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        Ok(fs::try_exists(&self.state_path).await?)
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        self.ensure_dir().await?;

        let holder = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };
        let lock_info = LockInfo::new(&holder);
        let bytes = to_json(&lock_info)?;

        for _ in 0..LOCK_ATTEMPTS {
            match self.create_lock_file(&bytes).await {
                Ok(()) => {
                    debug!("Acquired state lock {} for {}", lock_info.lock_id, holder);
                    return Ok(lock_info);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(lock_failed(e)),
            }

            match self.get_lock_info().await? {
                Some(existing) if !existing.is_expired() => {
                    return Err(StateError::LockedByOther {
                        holder: existing.holder,
                        since: existing.acquired_at.to_rfc3339(),
                    }
                    .into());
                }
                Some(existing) => {
                    debug!("Taking over expired lock held by {}", existing.holder);
                    remove_if_present(&self.lock_path)
                        .await
                        .map_err(lock_failed)?;
                }
                None => {}
            }
        }

        Err(lock_failed("lock file reappeared while taking it over"))
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        match self.get_lock_info().await? {
            Some(existing) if existing.lock_id == lock_id => {
                remove_if_present(&self.lock_path)
                    .await
                    .map_err(lock_failed)?;
                debug!("Released state lock: {lock_id}");
            }
            Some(existing) => debug!("Not releasing lock {}: held as {}", lock_id, existing.lock_id),
            None => {}
        }
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        read_json(&self.lock_path).await
    }

    async fn is_locked(&self) -> Result<bool> {
        Ok(self
            .get_lock_info()
            .await?
            .is_some_and(|lock_info| !lock_info.is_expired()))
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}
