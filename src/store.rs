/*!
 * Durable storage for server registrations
 *
 * The registry writes through to a [`RegistryStore`] on register and
 * deregister only. Health and latency updates are never persisted; records
 * come back with their health reset to `unknown` and the monitor re-probes
 * them.
 */

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::debug;

use crate::registry::{HealthState, ServerRecord};

/// On-disk format version
pub const STORE_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Corrupt registry file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unsupported registry file version {found} (expected {expected})")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Load-at-startup, write-through-on-change persistence
pub trait RegistryStore: Send + Sync {
    /// All persisted records, health reset to unknown
    fn load(&self) -> Result<Vec<ServerRecord>, StoreError>;

    fn upsert(&self, record: &ServerRecord) -> Result<(), StoreError>;

    /// Remove a record; removing an unknown id is not an error
    fn remove(&self, id: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    servers: Vec<ServerRecord>,
}

fn reset_health(mut record: ServerRecord) -> ServerRecord {
    record.health = HealthState::Unknown;
    record.last_health_check = None;
    record
}

/// JSON file store, rewritten atomically on every change
pub struct JsonFileStore {
    path: PathBuf,
    records: Mutex<BTreeMap<String, ServerRecord>>,
}

impl JsonFileStore {
    /// Open the store, reading existing records if the file exists
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let records = Self::read_file(&path)?
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_file(path: &Path) -> Result<Vec<ServerRecord>, StoreError> {
        let data = match fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        if data.trim().is_empty() {
            return Ok(Vec::new());
        }
        let file: StoreFile = serde_json::from_str(&data).map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        })?;
        if file.version != STORE_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: STORE_VERSION,
                found: file.version,
            });
        }
        Ok(file.servers)
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, ServerRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write temp file next to the target, then rename over it
    fn persist(&self, records: &BTreeMap<String, ServerRecord>) -> Result<(), StoreError> {
        let file = StoreFile {
            version: STORE_VERSION,
            servers: records.values().cloned().collect(),
        };
        let json = serde_json::to_string_pretty(&file)?;

        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, json).map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)?;
        debug!(path = %self.path.display(), servers = records.len(), "Registry file written");
        Ok(())
    }
}

impl RegistryStore for JsonFileStore {
    fn load(&self) -> Result<Vec<ServerRecord>, StoreError> {
        Ok(self.lock().values().cloned().map(reset_health).collect())
    }

    fn upsert(&self, record: &ServerRecord) -> Result<(), StoreError> {
        let mut records = self.lock();
        let previous = records.insert(record.id.clone(), record.clone());
        if let Err(e) = self.persist(&records) {
            match previous {
                Some(prev) => records.insert(prev.id.clone(), prev),
                None => records.remove(&record.id),
            };
            return Err(e);
        }
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<(), StoreError> {
        let mut records = self.lock();
        let Some(previous) = records.remove(id) else {
            return Ok(());
        };
        if let Err(e) = self.persist(&records) {
            records.insert(previous.id.clone(), previous);
            return Err(e);
        }
        Ok(())
    }
}

/// In-memory store for tests and ephemeral gateways
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<String, ServerRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RegistryStore for MemoryStore {
    fn load(&self) -> Result<Vec<ServerRecord>, StoreError> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records.values().cloned().map(reset_health).collect())
    }

    fn upsert(&self, record: &ServerRecord) -> Result<(), StoreError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<(), StoreError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ServerSpec;
    use tempfile::TempDir;

    fn record(id: &str) -> ServerRecord {
        ServerSpec::new("tcp://127.0.0.1:9000")
            .with_id(id)
            .with_capability("search")
            .into_record()
            .unwrap()
    }

    #[test]
    fn test_json_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");

        let store = JsonFileStore::open(&path).unwrap();
        let mut a = record("a");
        a.health = HealthState::Healthy;
        store.upsert(&a).unwrap();
        store.upsert(&record("b")).unwrap();
        store.remove("b").unwrap();
        assert!(!path.with_extension("json.tmp").exists());

        let reopened = JsonFileStore::open(&path).unwrap();
        let loaded = reopened.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "a");
        assert_eq!(loaded[0].health, HealthState::Unknown);
        assert!(loaded[0].capabilities.contains("search"));
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path().join("nested/registry.json")).unwrap();
        assert!(store.load().unwrap().is_empty());
        store.upsert(&record("a")).unwrap();
        assert!(dir.path().join("nested/registry.json").exists());
    }

    #[test]
    fn test_corrupt_file_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            JsonFileStore::open(&path),
            Err(StoreError::Corrupt { .. })
        ));

        fs::write(&path, r#"{"version": 99, "servers": []}"#).unwrap();
        assert!(matches!(
            JsonFileStore::open(&path),
            Err(StoreError::VersionMismatch { found: 99, .. })
        ));
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        store.upsert(&record("a")).unwrap();
        store.remove("missing").unwrap();
        assert_eq!(store.len(), 1);
        store.remove("a").unwrap();
        assert!(store.is_empty());
    }
}
