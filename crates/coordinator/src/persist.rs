use crate::batch::BatchRecord;
use crate::error::{CoordinatorError, Result};
use async_trait::async_trait;
use ingest_protocol::Manifest;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

const BATCHES_DIR: &str = "batches";

/// Durable storage for batch records and their manifests.
///
/// `save` must replace the previous record atomically: a reader sees either
/// the old or the new document, never a torn one.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, batch_id: &str) -> Result<Option<BatchRecord>>;

    async fn save(&self, record: &BatchRecord) -> Result<()>;

    async fn delete(&self, batch_id: &str) -> Result<()>;

    async fn list(&self) -> Result<Vec<BatchRecord>>;

    async fn put_manifest(&self, key: &str, manifest: &Manifest) -> Result<()>;

    async fn get_manifest(&self, key: &str) -> Result<Option<Manifest>>;

    async fn delete_manifest(&self, key: &str) -> Result<()>;
}

/// One pretty-printed JSON document per batch under `<root>/batches/`, and
/// manifests at their blob key under `<root>`.
#[derive(Debug, Clone)]
pub struct FsStateStore {
    root: PathBuf,
}

impl FsStateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, batch_id: &str) -> PathBuf {
        self.root.join(BATCHES_DIR).join(format!("{batch_id}.json"))
    }

    fn manifest_path(&self, key: &str) -> Result<PathBuf> {
        let mut path = self.root.clone();
        for component in Path::new(key.trim_start_matches('/')).components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::CurDir => {}
                _ => {
                    return Err(CoordinatorError::Persist(format!(
                        "manifest key escapes the state root: {key}"
                    )))
                }
            }
        }
        Ok(path)
    }
}

async fn write_json_atomic(path: &Path, bytes: Vec<u8>) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

async fn remove_optional(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

#[async_trait]
impl StateStore for FsStateStore {
    async fn load(&self, batch_id: &str) -> Result<Option<BatchRecord>> {
        match read_optional(&self.record_path(batch_id)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, record: &BatchRecord) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(record)?;
        write_json_atomic(&self.record_path(&record.batch_id), bytes).await
    }

    async fn delete(&self, batch_id: &str) -> Result<()> {
        remove_optional(&self.record_path(batch_id)).await
    }

    async fn list(&self) -> Result<Vec<BatchRecord>> {
        let dir = self.root.join(BATCHES_DIR);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<BatchRecord>(&bytes) {
                Ok(record) => records.push(record),
                Err(err) => log::warn!("skipping unreadable batch record {}: {err}", path.display()),
            }
        }
        records.sort_by(|a, b| a.batch_id.cmp(&b.batch_id));
        Ok(records)
    }

    async fn put_manifest(&self, key: &str, manifest: &Manifest) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(manifest)?;
        write_json_atomic(&self.manifest_path(key)?, bytes).await
    }

    async fn get_manifest(&self, key: &str) -> Result<Option<Manifest>> {
        match read_optional(&self.manifest_path(key)?).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn delete_manifest(&self, key: &str) -> Result<()> {
        remove_optional(&self.manifest_path(key)?).await
    }
}

/// Process-local state store. Records round-trip through JSON so tests see
/// exactly what a durable store would hand back.
#[derive(Default)]
pub struct MemoryStateStore {
    records: Mutex<HashMap<String, Vec<u8>>>,
    manifests: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn locked<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, batch_id: &str) -> Result<Option<BatchRecord>> {
        match locked(&self.records).get(batch_id) {
            Some(bytes) => Ok(Some(serde_json::from_slice(bytes)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, record: &BatchRecord) -> Result<()> {
        let bytes = serde_json::to_vec(record)?;
        locked(&self.records).insert(record.batch_id.clone(), bytes);
        Ok(())
    }

    async fn delete(&self, batch_id: &str) -> Result<()> {
        locked(&self.records).remove(batch_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<BatchRecord>> {
        let mut records = locked(&self.records)
            .values()
            .map(|bytes| serde_json::from_slice::<BatchRecord>(bytes))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        records.sort_by(|a, b| a.batch_id.cmp(&b.batch_id));
        Ok(records)
    }

    async fn put_manifest(&self, key: &str, manifest: &Manifest) -> Result<()> {
        let bytes = serde_json::to_vec(manifest)?;
        locked(&self.manifests).insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get_manifest(&self, key: &str) -> Result<Option<Manifest>> {
        match locked(&self.manifests).get(key) {
            Some(bytes) => Ok(Some(serde_json::from_slice(bytes)?)),
            None => Ok(None),
        }
    }

    async fn delete_manifest(&self, key: &str) -> Result<()> {
        locked(&self.manifests).remove(key);
        Ok(())
    }
}
