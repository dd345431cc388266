//! Durable per-upload session checkpoints.
//!
//! One record is kept per cache key (`bucket/object[/generation]`), holding
//! the session URI and the fingerprint of the first bytes pushed into that
//! session. The whole store serializes to a single JSON document so a later
//! process can resume an interrupted upload.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::{internal_error, UploadResult};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_chunk: Option<Vec<u8>>,
}

impl CheckpointRecord {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            first_chunk: None,
        }
    }

    pub fn with_first_chunk(mut self, first_chunk: Vec<u8>) -> Self {
        self.first_chunk = Some(first_chunk);
        self
    }
}

/// Abstraction over the persistence layer used to store upload checkpoints.
///
/// Implementations must make each of the three operations atomic at the
/// record level; concurrent uploads always use distinct cache keys.
#[async_trait::async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get(&self, cache_key: &str) -> UploadResult<Option<CheckpointRecord>>;
    async fn set(&self, cache_key: &str, record: CheckpointRecord) -> UploadResult<()>;
    async fn delete(&self, cache_key: &str) -> UploadResult<()>;
}

/// In-memory checkpoint store for tests and callers that opt out of
/// persistence across processes.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    inner: Mutex<HashMap<String, CheckpointRecord>>,
}

#[async_trait::async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn get(&self, cache_key: &str) -> UploadResult<Option<CheckpointRecord>> {
        Ok(self.inner.lock().unwrap().get(cache_key).cloned())
    }

    async fn set(&self, cache_key: &str, record: CheckpointRecord) -> UploadResult<()> {
        self.inner.lock().unwrap().insert(cache_key.to_string(), record);
        Ok(())
    }

    async fn delete(&self, cache_key: &str) -> UploadResult<()> {
        self.inner.lock().unwrap().remove(cache_key);
        Ok(())
    }
}

/// File-backed checkpoint store, the default for desktop environments.
pub struct FileCheckpointStore {
    path: PathBuf,
    inner: Mutex<HashMap<String, CheckpointRecord>>,
}

impl FileCheckpointStore {
    pub fn new(path: PathBuf) -> UploadResult<Self> {
        let records = if path.exists() {
            Self::load_records(&path)?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            inner: Mutex::new(records),
        })
    }

    /// Opens the store at the conventional per-user config location.
    pub fn with_default_path() -> UploadResult<Self> {
        Self::new(default_config_path())
    }

    fn load_records(path: &PathBuf) -> UploadResult<HashMap<String, CheckpointRecord>> {
        let data = fs::read(path)
            .map_err(|err| internal_error(format!("failed to read checkpoint file: {err}")))?;
        serde_json::from_slice(&data)
            .map_err(|err| internal_error(format!("failed to parse checkpoint file as JSON: {err}")))
    }

    fn persist(&self, records: &HashMap<String, CheckpointRecord>) -> UploadResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| internal_error(format!("failed to create checkpoint directory: {err}")))?;
        }
        let serialized = serde_json::to_vec_pretty(records)
            .map_err(|err| internal_error(format!("failed to serialize checkpoints: {err}")))?;
        // Replace the document via a sibling temp file so a reader never
        // observes a torn write.
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serialized)
            .map_err(|err| internal_error(format!("failed to write checkpoint file: {err}")))?;
        fs::rename(&tmp, &self.path)
            .map_err(|err| internal_error(format!("failed to replace checkpoint file: {err}")))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn get(&self, cache_key: &str) -> UploadResult<Option<CheckpointRecord>> {
        Ok(self.inner.lock().unwrap().get(cache_key).cloned())
    }

    async fn set(&self, cache_key: &str, record: CheckpointRecord) -> UploadResult<()> {
        let mut records = self.inner.lock().unwrap();
        records.insert(cache_key.to_string(), record);
        self.persist(&records)
    }

    async fn delete(&self, cache_key: &str) -> UploadResult<()> {
        let mut records = self.inner.lock().unwrap();
        if records.remove(cache_key).is_some() {
            self.persist(&records)?;
        }
        Ok(())
    }
}

static DEFAULT_CONFIG_PATH: Lazy<PathBuf> = Lazy::new(|| {
    let base = env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
        .unwrap_or_else(env::temp_dir);
    base.join("gcs-resumable-upload.json")
});

/// `$XDG_CONFIG_HOME/gcs-resumable-upload.json`, falling back to
/// `~/.config/gcs-resumable-upload.json`, matching the location the Node.js
/// module keeps its configstore document.
pub fn default_config_path() -> PathBuf {
    DEFAULT_CONFIG_PATH.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn unique_temp_path() -> PathBuf {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        std::env::temp_dir().join(format!(
            "gcs-resumable-upload-checkpoints-{}-{}.json",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::SeqCst)
        ))
    }

    #[tokio::test(flavor = "current_thread")]
    async fn memory_store_roundtrips_records() {
        let store = InMemoryCheckpointStore::default();
        assert_eq!(store.get("photos/vacation.jpg").await.unwrap(), None);

        let record = CheckpointRecord::new("https://session-uri").with_first_chunk(vec![1, 2, 3]);
        store.set("photos/vacation.jpg", record.clone()).await.unwrap();
        assert_eq!(store.get("photos/vacation.jpg").await.unwrap(), Some(record));

        store.delete("photos/vacation.jpg").await.unwrap();
        assert_eq!(store.get("photos/vacation.jpg").await.unwrap(), None);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn file_store_persists_across_instances() {
        let path = unique_temp_path();

        let store = FileCheckpointStore::new(path.clone()).unwrap();
        store
            .set("bucket/object", CheckpointRecord::new("https://s1"))
            .await
            .unwrap();
        store
            .set(
                "bucket/object/42",
                CheckpointRecord::new("https://s2").with_first_chunk(b"prefix".to_vec()),
            )
            .await
            .unwrap();
        drop(store);

        let reopened = FileCheckpointStore::new(path.clone()).unwrap();
        assert_eq!(
            reopened.get("bucket/object").await.unwrap().unwrap().uri,
            "https://s1"
        );
        assert_eq!(
            reopened
                .get("bucket/object/42")
                .await
                .unwrap()
                .unwrap()
                .first_chunk,
            Some(b"prefix".to_vec())
        );

        reopened.delete("bucket/object").await.unwrap();
        drop(reopened);

        let reopened = FileCheckpointStore::new(path.clone()).unwrap();
        assert_eq!(reopened.get("bucket/object").await.unwrap(), None);
        assert!(reopened.get("bucket/object/42").await.unwrap().is_some());

        let _ = fs::remove_file(path);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn deleting_a_missing_key_is_a_noop() {
        let path = unique_temp_path();
        let store = FileCheckpointStore::new(path.clone()).unwrap();
        store.delete("never/stored").await.unwrap();
        assert!(!path.exists());
    }
}
