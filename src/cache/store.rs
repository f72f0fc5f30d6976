//! Shared key-value stores for cached settings.
//!
//! [`FileStore`] shares settings between processes on one host through a
//! directory: one file per key, atomic temp file + rename writes, and a lock
//! file created with `create_new`. [`MemoryStore`] shares within a process.

use crate::cache::format::{LockState, LOCK_KEY};
use crate::AdapterError;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};

/// Store holding settings, their timestamp, and the refresh lock.
pub trait SharedStore: Send + Sync {
    /// Read a key; `None` if it was never written.
    fn read(&self, key: &str) -> Result<Option<String>, AdapterError>;

    /// Replace a key's value.
    fn write(&self, key: &str, value: &str) -> Result<(), AdapterError>;

    /// Take the refresh lock. Returns `false` if another holder has it.
    ///
    /// A lock held for longer than `stale_after` is treated as abandoned and
    /// taken over.
    fn try_lock(&self, stale_after: Duration) -> Result<bool, AdapterError>;

    /// Release the refresh lock. Releasing a free lock is not an error.
    fn unlock(&self) -> Result<(), AdapterError>;

    /// Current refresh lock state.
    fn lock_state(&self) -> Result<LockState, AdapterError>;
}

/// Directory-backed store.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Create a store for `account`.
    ///
    /// Files live under `<location>/<account>/`, or under
    /// `dirs::data_dir()/queuegate/<account>/` when no location is given.
    pub fn new(location: Option<&Path>, account: &str) -> Result<Self, AdapterError> {
        let base_dir = match location {
            Some(location) => location.to_path_buf(),
            None => dirs::data_dir()
                .ok_or_else(|| AdapterError::CacheIO("Could not find data directory".to_string()))?
                .join("queuegate"),
        };

        Self::with_path(base_dir.join(account))
    }

    /// Create a store directly in `dir`.
    pub fn with_path(dir: PathBuf) -> Result<Self, AdapterError> {
        fs::create_dir_all(&dir)
            .map_err(|e| AdapterError::CacheIO(format!("Failed to create cache dir: {}", e)))?;
        Ok(Self { dir })
    }

    /// Store directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    fn lock_path(&self) -> PathBuf {
        self.key_path(LOCK_KEY)
    }

    fn create_lock_file(&self) -> Result<bool, AdapterError> {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.lock_path())
        {
            Ok(mut file) => {
                file.write_all(LockState::Locked.as_str().as_bytes())
                    .map_err(|e| AdapterError::CacheIO(format!("Failed to write lock: {}", e)))?;
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(AdapterError::CacheIO(format!("Failed to create lock: {}", e))),
        }
    }

    /// Move an abandoned lock aside and take a fresh one.
    ///
    /// Only the taker whose rename moves the abandoned file may create the new
    /// lock. A lock that turns out to be live once moved is linked back.
    fn take_over_lock(&self, stale_after: Duration) -> Result<bool, AdapterError> {
        let tombstone = self
            .dir
            .join(format!("{}.{}.stale", LOCK_KEY, unique_suffix()));

        match fs::rename(self.lock_path(), &tombstone) {
            Ok(()) => {}
            // Another taker moved it first.
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(AdapterError::CacheIO(format!("Failed to move lock: {}", e))),
        }

        if !lock_file_is_abandoned(&tombstone, stale_after)? {
            match fs::hard_link(&tombstone, self.lock_path()) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => {
                    tracing::warn!(error = %e, "failed to restore settings lock");
                }
            }
            remove_tombstone(&tombstone);
            return Ok(false);
        }

        tracing::warn!(dir = %self.dir.display(), "taking over abandoned settings lock");
        remove_tombstone(&tombstone);
        self.create_lock_file()
    }
}

/// Process id plus a per-process counter, unique among concurrent writers.
fn unique_suffix() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    format!(
        "{}.{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

fn remove_tombstone(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        tracing::warn!(path = %path.display(), error = %e, "failed to remove old settings lock");
    }
}

/// Whether the lock file at `path` was released or outlived `stale_after`.
fn lock_file_is_abandoned(path: &Path, stale_after: Duration) -> Result<bool, AdapterError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(AdapterError::CacheIO(format!("Failed to read lock: {}", e))),
    };
    if LockState::parse(Some(&contents)) == LockState::Unlocked {
        return Ok(true);
    }

    let modified = match fs::metadata(path).and_then(|m| m.modified()) {
        Ok(modified) => modified,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(AdapterError::CacheIO(format!("Failed to stat lock: {}", e))),
    };

    let held_for = SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO);
    Ok(held_for > stale_after)
}

impl SharedStore for FileStore {
    fn read(&self, key: &str) -> Result<Option<String>, AdapterError> {
        match fs::read_to_string(self.key_path(key)) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AdapterError::CacheIO(format!("Failed to read {}: {}", key, e))),
        }
    }

    fn write(&self, key: &str, value: &str) -> Result<(), AdapterError> {
        let target_path = self.key_path(key);
        let temp_path = self
            .dir
            .join(format!("{}.{}.tmp", key, unique_suffix()));

        fs::write(&temp_path, value)
            .map_err(|e| AdapterError::CacheIO(format!("Failed to write temp file: {}", e)))?;

        fs::rename(&temp_path, &target_path)
            .map_err(|e| AdapterError::CacheIO(format!("Failed to rename {}: {}", key, e)))?;

        Ok(())
    }

    fn try_lock(&self, stale_after: Duration) -> Result<bool, AdapterError> {
        if self.create_lock_file()? {
            return Ok(true);
        }

        if !lock_file_is_abandoned(&self.lock_path(), stale_after)? {
            return Ok(false);
        }

        self.take_over_lock(stale_after)
    }

    fn unlock(&self) -> Result<(), AdapterError> {
        match fs::remove_file(self.lock_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AdapterError::CacheIO(format!("Failed to release lock: {}", e))),
        }
    }

    fn lock_state(&self) -> Result<LockState, AdapterError> {
        Ok(LockState::parse(self.read(LOCK_KEY)?.as_deref()))
    }
}

/// In-process store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
    locked_at: Mutex<Option<Instant>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn values(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.values.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn locked_at(&self) -> MutexGuard<'_, Option<Instant>> {
        self.locked_at.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SharedStore for MemoryStore {
    fn read(&self, key: &str) -> Result<Option<String>, AdapterError> {
        Ok(self.values().get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> Result<(), AdapterError> {
        self.values().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn try_lock(&self, stale_after: Duration) -> Result<bool, AdapterError> {
        let mut locked_at = self.locked_at();
        if let Some(since) = *locked_at {
            if since.elapsed() <= stale_after {
                return Ok(false);
            }
            tracing::warn!("taking over abandoned settings lock");
        }
        *locked_at = Some(Instant::now());
        Ok(true)
    }

    fn unlock(&self) -> Result<(), AdapterError> {
        *self.locked_at() = None;
        Ok(())
    }

    fn lock_state(&self) -> Result<LockState, AdapterError> {
        Ok(if self.locked_at().is_some() {
            LockState::Locked
        } else {
            LockState::Unlocked
        })
    }
}
