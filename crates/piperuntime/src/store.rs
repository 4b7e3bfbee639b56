use async_trait::async_trait;
use pipecore::{Format, StorageError, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;

/// Pluggable persistence for target values.
///
/// Each unit owns its own output slot, so there is no write
/// contention between different targets; the adapter only needs to be
/// safe for concurrent use across distinct names.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Persist a value and return its storage location.
    async fn store(
        &self,
        name: &str,
        value: &Value,
        format: Format,
    ) -> Result<String, StorageError>;

    /// Retrieve a value from a location produced by `store`.
    async fn load(&self, location: &str, format: Format) -> Result<Value, StorageError>;

    /// Probe whether an externally mutable artifact changed since it
    /// was stored.
    async fn changed(&self, location: &str) -> Result<bool, StorageError>;
}

/// Storage adapter writing JSON objects under a root directory, with
/// a digest sidecar backing the `changed` probe.
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, name: &str) -> PathBuf {
        // Branch names carry a '#' separator; keep paths flat and safe.
        self.root.join(format!("{}.json", name.replace(['#', '/'], "_")))
    }

    fn digest_path(location: &str) -> PathBuf {
        PathBuf::from(format!("{location}.digest"))
    }
}

#[async_trait]
impl StorageAdapter for LocalFileStore {
    async fn store(
        &self,
        name: &str,
        value: &Value,
        _format: Format,
    ) -> Result<String, StorageError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| StorageError::Persist {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        let path = self.object_path(name);
        let bytes = serde_json::to_vec_pretty(value).map_err(|e| StorageError::Persist {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        let digest = blake3::hash(&bytes).to_hex().to_string();

        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| StorageError::Persist {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        let location = path.to_string_lossy().to_string();
        tokio::fs::write(Self::digest_path(&location), digest)
            .await
            .map_err(|e| StorageError::Persist {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        Ok(location)
    }

    async fn load(&self, location: &str, _format: Format) -> Result<Value, StorageError> {
        let bytes = tokio::fs::read(location).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::Missing(location.to_string())
            } else {
                StorageError::Retrieve {
                    location: location.to_string(),
                    reason: e.to_string(),
                }
            }
        })?;
        serde_json::from_slice(&bytes).map_err(|e| StorageError::Retrieve {
            location: location.to_string(),
            reason: e.to_string(),
        })
    }

    async fn changed(&self, location: &str) -> Result<bool, StorageError> {
        let bytes = match tokio::fs::read(location).await {
            Ok(bytes) => bytes,
            Err(_) => return Ok(true),
        };
        let current = blake3::hash(&bytes).to_hex().to_string();
        let stored = tokio::fs::read_to_string(Self::digest_path(location))
            .await
            .unwrap_or_default();
        Ok(current != stored)
    }
}

/// In-memory storage adapter for tests and transient runs.
pub struct MemoryStore {
    objects: RwLock<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageAdapter for MemoryStore {
    async fn store(
        &self,
        name: &str,
        value: &Value,
        _format: Format,
    ) -> Result<String, StorageError> {
        self.objects
            .write()
            .await
            .insert(name.to_string(), value.clone());
        Ok(format!("mem://{name}"))
    }

    async fn load(&self, location: &str, _format: Format) -> Result<Value, StorageError> {
        let name = location.strip_prefix("mem://").unwrap_or(location);
        self.objects
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::Missing(location.to_string()))
    }

    async fn changed(&self, _location: &str) -> Result<bool, StorageError> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_store_round_trips_and_probes_changes() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFileStore::new(dir.path());

        let value = Value::from(vec![1i64, 2, 3]);
        let location = store.store("data", &value, Format::Json).await.unwrap();
        assert_eq!(store.load(&location, Format::Json).await.unwrap(), value);
        assert!(!store.changed(&location).await.unwrap());

        // External mutation flips the probe.
        tokio::fs::write(&location, b"{\"type\":\"Null\"}")
            .await
            .unwrap();
        assert!(store.changed(&location).await.unwrap());
    }

    #[tokio::test]
    async fn memory_store_reports_missing_objects() {
        let store = MemoryStore::new();
        let err = store.load("mem://ghost", Format::Json).await.unwrap_err();
        assert!(matches!(err, StorageError::Missing(_)));
    }
}
