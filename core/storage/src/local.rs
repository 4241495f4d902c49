//! Local filesystem stores.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::provider::{compare_and_set, DurableStore, RemoteStore, WriteRequest};
use showsync_common::{EntityId, Error, Result, VersionedEntity};

/// Write `data` to `path` via a temp file and rename, so readers never see
/// a half-written file.
async fn write_atomic(path: &Path, data: &str) -> Result<()> {
    let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4()));
    fs::write(&tmp, data).await?;
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(Error::Io(e));
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name.contains("..")
    {
        return Err(Error::InvalidInput(format!("Invalid storage name: {}", name)));
    }
    Ok(())
}

/// Durable store keeping one JSON blob per key in a directory.
pub struct FileDurableStore {
    root: PathBuf,
}

impl FileDurableStore {
    /// Create a store rooted at `root`.
    ///
    /// # Postconditions
    /// - Root directory is created if it doesn't exist
    ///
    /// # Errors
    /// - Permission denied
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn blob_path(&self, key: &str) -> Result<PathBuf> {
        validate_name(key)?;
        Ok(self.root.join(format!("{}.json", key)))
    }
}

#[async_trait]
impl DurableStore for FileDurableStore {
    async fn write_blob(&self, key: &str, data: &str) -> Result<()> {
        let path = self.blob_path(key)?;
        write_atomic(&path, data).await?;
        debug!("Persisted {} ({} bytes)", path.display(), data.len());
        Ok(())
    }

    async fn read_blob(&self, key: &str) -> Result<Option<String>> {
        let path = self.blob_path(key)?;
        match fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn remove_blob(&self, key: &str) -> Result<()> {
        let path = self.blob_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

/// Remote store backed by a directory of JSON entity files.
///
/// Stands in for a real document store in the CLI and in tests; writes are
/// serialized through a lock so compare-and-set holds within one process.
pub struct FileRemoteStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FileRemoteStore {
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    fn entity_path(&self, id: &EntityId) -> Result<PathBuf> {
        validate_name(id.as_str())?;
        Ok(self.root.join(format!("{}.json", id)))
    }

    async fn load(&self, id: &EntityId) -> Result<Option<VersionedEntity>> {
        let path = self.entity_path(id)?;
        match fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

#[async_trait]
impl RemoteStore for FileRemoteStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn read(&self, id: &EntityId) -> Result<VersionedEntity> {
        self.load(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Entity not found: {}", id)))
    }

    async fn write(&self, request: &WriteRequest) -> Result<VersionedEntity> {
        let _guard = self.write_lock.lock().await;
        let existing = self.load(&request.entity_id).await?;
        let next = compare_and_set(existing.as_ref(), request)?;
        let json = serde_json::to_string_pretty(&next)?;
        write_atomic(&self.entity_path(&request.entity_id)?, &json).await?;
        Ok(next)
    }
}
