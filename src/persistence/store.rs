//! Durable key -> record storage for cache snapshots.

use crate::error::PersistenceError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Storage holding one serialized snapshot record per key.
#[async_trait]
pub trait SnapshotStore: Send + Sync + 'static {
    /// Read the record stored under `key`, if any.
    async fn read(&self, key: &str) -> Result<Option<String>, PersistenceError>;

    /// Replace the record stored under `key`.
    async fn write(&self, key: &str, record: String) -> Result<(), PersistenceError>;
}

/// Stores each record as `<dir>/<key>.json`.
///
/// Writes go to `<key>.json.tmp` first and are renamed into place, so a
/// crash mid-write never leaves a truncated record behind.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    /// Open (and create if needed) a store in `dir`, removing temp files
    /// left by an interrupted write.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Self::cleanup_temp_files(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the record for `key`.
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize(key)))
    }

    fn cleanup_temp_files(dir: &Path) -> Result<(), PersistenceError> {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "tmp") {
                debug!(path = %path.display(), "Removing orphaned temp file");
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %e, "Failed to remove temp file");
                }
            }
        }
        Ok(())
    }
}

/// Keep keys usable as file names.
fn sanitize(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect()
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn read(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PersistenceError::Read(e.to_string())),
        }
    }

    async fn write(&self, key: &str, record: String) -> Result<(), PersistenceError> {
        let final_path = self.path_for(key);
        let mut temp = final_path.clone().into_os_string();
        temp.push(".tmp");
        let temp_path = PathBuf::from(temp);

        tokio::fs::write(&temp_path, record.as_bytes())
            .await
            .map_err(|e| PersistenceError::Write(e.to_string()))?;

        if let Err(e) = tokio::fs::rename(&temp_path, &final_path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(PersistenceError::Write(e.to_string()));
        }
        Ok(())
    }
}

/// In-process store, for tests and for hosts without durable storage.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    records: Mutex<HashMap<String, String>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a raw record.
    pub fn insert(&self, key: impl Into<String>, record: impl Into<String>) {
        self.records.lock().insert(key.into(), record.into());
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.records.lock().get(key).cloned()
    }

    /// Make subsequent reads fail.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent writes fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn read(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(PersistenceError::Read("storage unavailable".to_string()));
        }
        Ok(self.get(key))
    }

    async fn write(&self, key: &str, record: String) -> Result<(), PersistenceError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PersistenceError::Write("storage quota exceeded".to_string()));
        }
        self.records.lock().insert(key.to_string(), record);
        Ok(())
    }
}
