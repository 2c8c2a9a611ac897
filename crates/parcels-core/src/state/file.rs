// # File State Store
//
// File-based implementation of StateStore with crash recovery.
//
// ## Purpose
//
// Provides persistent tracking state across daemon restarts and crashes.
//
// ## Crash Recovery
//
// - Atomic writes: Uses write-then-rename for atomicity
// - Corruption detection: Validates JSON on load
// - Automatic backup: Keeps .backup of last known good state
// - Recovery: Falls back to backup if corruption detected
//
// ## File Format
//
// ```json
// {
//   "version": "1.0",
//   "records": {
//     "ABC123": {
//       "tracking_id": "ABC123",
//       "display_name": null,
//       "status": "pending",
//       "correlation_token": "u1",
//       "token_issued_at": "2025-01-09T12:00:00Z",
//       ...
//     }
//   }
// }
// ```

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::Error;
use crate::config::StateStoreConfig;
use crate::record::RecordSet;
use crate::traits::state_store::{StateStore, StateStoreFactory};

/// State file format version
/// Used for future migration if format changes
const STATE_FILE_VERSION: &str = "1.0";

/// File-based state store with crash recovery
///
/// # Crash Recovery
///
/// - **Atomic writes**: New state written to temporary file, then renamed
/// - **Backup**: Last known good state kept in `.backup` file
/// - **Corruption detection**: JSON validation on load
/// - **Automatic recovery**: Falls back to backup if main file corrupted
///
/// # Example
///
/// ```rust,no_run
/// use parcels_core::state::FileStateStore;
/// use parcels_core::{ShipmentRecord, StateStore};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = FileStateStore::new("/var/lib/parcels/state.json").await?;
///
///     let mut records = store.load().await?;
///     records.insert("ABC123".to_string(), ShipmentRecord::new("ABC123"));
///     store.save(&records).await?;
///
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct FileStateStore {
    path: PathBuf,
    /// Serializes writers so temp file and backup never interleave
    write_lock: Mutex<()>,
}

/// Serializable state file format
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct StateFileFormat {
    version: String,
    records: RecordSet,
}

impl FileStateStore {
    /// Create a file state store
    ///
    /// Creates parent directories if needed. Nothing is read until `load()`.
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            fs::create_dir_all(parent).await.map_err(|e| {
                Error::config(format!(
                    "Failed to create state directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    /// Path of the main state file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load state from file with automatic recovery
    ///
    /// Recovery strategy:
    /// 1. Try to load main state file
    /// 2. If it is corrupt, try loading backup and restore it over the main file
    /// 3. If backup also fails, start with empty state
    async fn load_state_with_recovery(path: &Path) -> Result<RecordSet, Error> {
        let err = match Self::load_state(path).await {
            Ok(records) => {
                tracing::debug!("Loaded state from file: {} records", records.len());
                return Ok(records);
            }
            Err(e) => e,
        };

        // Only corruption is recoverable; read failures propagate
        if !matches!(err, Error::Parse(_)) {
            return Err(err);
        }

        tracing::warn!(
            "State file appears corrupted: {}. Attempting recovery from backup.",
            err
        );

        let backup_path = Self::backup_path(path);
        if !backup_path.exists() {
            tracing::warn!("No backup file found. Starting with empty state.");
            return Ok(RecordSet::new());
        }

        match Self::load_state(&backup_path).await {
            Ok(records) => {
                tracing::info!("Recovered state from backup: {} records", records.len());

                if let Err(restore_err) = Self::restore_from_backup(path, &backup_path).await {
                    tracing::error!("Failed to restore state file from backup: {}", restore_err);
                }

                Ok(records)
            }
            Err(backup_err) => {
                tracing::error!(
                    "Backup also corrupted: {}. Starting with empty state.",
                    backup_err
                );
                Ok(RecordSet::new())
            }
        }
    }

    /// Load state from file
    async fn load_state(path: &Path) -> Result<RecordSet, Error> {
        if !path.exists() {
            tracing::debug!("State file does not exist: {}", path.display());
            return Ok(RecordSet::new());
        }

        let content = fs::read_to_string(path).await.map_err(|e| {
            Error::state_store(format!(
                "Failed to read state file {}: {}",
                path.display(),
                e
            ))
        })?;

        let state_file: StateFileFormat = serde_json::from_str(&content).map_err(|e| {
            Error::parse(format!(
                "Failed to parse state file {}: {}",
                path.display(),
                e
            ))
        })?;

        if state_file.version != STATE_FILE_VERSION {
            tracing::warn!(
                "State file version mismatch: expected {}, got {}. \
                Attempting to load anyway.",
                STATE_FILE_VERSION,
                state_file.version
            );
        }

        // Keys are authoritative; repair records whose embedded id drifted
        let records = state_file
            .records
            .into_iter()
            .map(|(tracking_id, mut record)| {
                if record.tracking_id != tracking_id {
                    tracing::warn!(
                        "Record keyed {} carried tracking id {}; using key",
                        tracking_id,
                        record.tracking_id
                    );
                    record.tracking_id = tracking_id.clone();
                }
                (tracking_id, record)
            })
            .collect();

        Ok(records)
    }

    /// Write state to file atomically
    async fn write_state(&self, records: &RecordSet) -> Result<(), Error> {
        let _guard = self.write_lock.lock().await;

        let state_file = StateFileFormat {
            version: STATE_FILE_VERSION.to_string(),
            records: records.clone(),
        };

        let json = serde_json::to_string_pretty(&state_file)
            .map_err(|e| Error::state_store(format!("Failed to serialize state: {}", e)))?;

        // Write to temporary file first
        let temp_path = self.temp_path();
        {
            let mut file = fs::File::create(&temp_path).await.map_err(|e| {
                Error::state_store(format!(
                    "Failed to create temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;

            file.write_all(json.as_bytes()).await.map_err(|e| {
                Error::state_store(format!(
                    "Failed to write to temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;

            file.sync_all().await.map_err(|e| {
                Error::state_store(format!(
                    "Failed to sync temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
        }

        // Create backup of current file (if it exists)
        if self.path.exists() {
            let backup_path = Self::backup_path(&self.path);
            if let Err(e) = fs::copy(&self.path, &backup_path).await {
                tracing::warn!("Failed to create backup: {}", e);
            }
        }

        // Atomic rename (temp -> actual)
        fs::rename(&temp_path, &self.path).await.map_err(|e| {
            Error::state_store(format!(
                "Failed to rename {} to {}: {}",
                temp_path.display(),
                self.path.display(),
                e
            ))
        })?;

        tracing::trace!("State written to file: {}", self.path.display());
        Ok(())
    }

    /// Restore state file from backup
    async fn restore_from_backup(path: &Path, backup_path: &Path) -> Result<(), Error> {
        fs::copy(backup_path, path).await.map_err(|e| {
            Error::state_store(format!(
                "Failed to restore from backup {} to {}: {}",
                backup_path.display(),
                path.display(),
                e
            ))
        })?;

        tracing::info!("Restored state file from backup");
        Ok(())
    }

    /// Get path to temporary file for atomic writes
    fn temp_path(&self) -> PathBuf {
        let mut temp = self.path.clone();
        temp.set_extension("tmp");
        temp
    }

    /// Get path to backup file
    fn backup_path(path: &Path) -> PathBuf {
        let mut backup = path.to_path_buf();
        backup.set_extension("backup");
        backup
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self) -> Result<RecordSet, Error> {
        Self::load_state_with_recovery(&self.path).await
    }

    async fn save(&self, records: &RecordSet) -> Result<(), Error> {
        self.write_state(records).await
    }
}

/// Factory for creating file state stores
pub struct FileStateStoreFactory;

#[async_trait]
impl StateStoreFactory for FileStateStoreFactory {
    async fn create(&self, config: &StateStoreConfig) -> Result<Box<dyn StateStore>, Error> {
        match config {
            StateStoreConfig::File { path } => Ok(Box::new(FileStateStore::new(path).await?)),
            _ => Err(Error::config("Invalid config for file state store")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{ShipmentRecord, ShipmentStatus};
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    fn record_with_token(id: &str, token: &str) -> ShipmentRecord {
        let mut record = ShipmentRecord::new(id);
        record.apply_token(token, Utc.with_ymd_and_hms(2025, 1, 9, 12, 0, 0).unwrap());
        record
    }

    fn single(record: ShipmentRecord) -> RecordSet {
        let mut records = RecordSet::new();
        records.insert(record.tracking_id.clone(), record);
        records
    }

    #[tokio::test]
    async fn test_file_store_basic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = FileStateStore::new(&path).await.unwrap();

        // Initially empty
        assert!(store.load().await.unwrap().is_empty());

        let records = single(record_with_token("ABC123", "u1"));
        store.save(&records).await.unwrap();
        assert!(path.exists());

        // Load new instance and verify persistence
        let store2 = FileStateStore::new(&path).await.unwrap();
        assert_eq!(store2.load().await.unwrap(), records);
    }

    #[tokio::test]
    async fn test_timestamp_written_as_iso8601() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = FileStateStore::new(&path).await.unwrap();
        store
            .save(&single(record_with_token("ABC123", "u1")))
            .await
            .unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).await.unwrap()).unwrap();
        assert_eq!(raw["version"], "1.0");
        assert_eq!(
            raw["records"]["ABC123"]["token_issued_at"],
            "2025-01-09T12:00:00Z"
        );
        assert_eq!(raw["records"]["ABC123"]["status"], "pending");
    }

    #[tokio::test]
    async fn test_file_store_corruption_recovery() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = FileStateStore::new(&path).await.unwrap();
        let first = single(record_with_token("ABC123", "u1"));
        store.save(&first).await.unwrap();

        // Write again to ensure backup is created
        let mut second = first.clone();
        if let Some(record) = second.get_mut("ABC123") {
            record.status = ShipmentStatus::Delivered;
        }
        store.save(&second).await.unwrap();

        let backup_path = FileStateStore::backup_path(&path);
        assert!(backup_path.exists(), "Backup file should exist after write");

        // Corrupt the state file
        fs::write(&path, b"corrupted json data").await.unwrap();

        let recovered = store.load().await.unwrap();
        // Backup holds the state before the last write
        assert_eq!(recovered, first, "Backup should contain previous state");

        // Main file was restored from the backup
        let reloaded = FileStateStore::new(&path).await.unwrap().load().await.unwrap();
        assert_eq!(reloaded, first);
    }

    #[tokio::test]
    async fn test_corrupt_without_backup_starts_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, b"{ not json").await.unwrap();

        let store = FileStateStore::new(&path).await.unwrap();
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_key_overrides_embedded_tracking_id() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut records = RecordSet::new();
        records.insert("ABC123".to_string(), ShipmentRecord::new("WRONG"));
        FileStateStore::new(&path).await.unwrap().save(&records).await.unwrap();

        let loaded = FileStateStore::new(&path).await.unwrap().load().await.unwrap();
        assert_eq!(loaded["ABC123"].tracking_id, "ABC123");
    }

    #[tokio::test]
    async fn test_creates_parent_directories() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("deeper").join("state.json");

        let store = FileStateStore::new(&path).await.unwrap();
        store.save(&RecordSet::new()).await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_factory_rejects_other_config() {
        let result = FileStateStoreFactory.create(&StateStoreConfig::Memory).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
