//! Write-once object storage for reconciliation pre-images.

use crate::{StorageError, StorageResult};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

/// Immutable object store addressed by URL.
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// Store `body` under `key` and return its stable URL. Keys are write-once.
    async fn put_object(&self, key: &str, content_type: &str, body: Vec<u8>)
        -> StorageResult<String>;
}

fn validate_key(key: &str) -> StorageResult<()> {
    let valid = !key.is_empty()
        && !key.starts_with('/')
        && key.split('/').all(|part| !part.is_empty() && part != "." && part != "..")
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'));
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidInput(format!("invalid archive key '{key}'")))
    }
}

/// Archive kept in process memory, addressed as `memory://<key>`.
#[derive(Debug, Default)]
pub struct InMemoryArchiveStore {
    objects: RwLock<BTreeMap<String, (String, Vec<u8>)>>,
}

impl InMemoryArchiveStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch an object by the URL returned from `put_object`.
    pub async fn get(&self, url: &str) -> Option<Vec<u8>> {
        let key = url.strip_prefix("memory://")?;
        self.objects
            .read()
            .await
            .get(key)
            .map(|(_, body)| body.clone())
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl ArchiveStore for InMemoryArchiveStore {
    async fn put_object(
        &self,
        key: &str,
        content_type: &str,
        body: Vec<u8>,
    ) -> StorageResult<String> {
        validate_key(key)?;
        let mut objects = self.objects.write().await;
        if objects.contains_key(key) {
            return Err(StorageError::Conflict(format!("archive object {key} exists")));
        }
        objects.insert(key.to_string(), (content_type.to_string(), body));
        Ok(format!("memory://{key}"))
    }
}

/// Archive on a local or mounted filesystem, addressed as `file://<path>`.
#[derive(Debug, Clone)]
pub struct FsArchiveStore {
    root: PathBuf,
}

impl FsArchiveStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ArchiveStore for FsArchiveStore {
    async fn put_object(
        &self,
        key: &str,
        content_type: &str,
        body: Vec<u8>,
    ) -> StorageResult<String> {
        validate_key(key)?;
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::Backend(format!("archive mkdir failed: {e}")))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => {
                    StorageError::Conflict(format!("archive object {key} exists"))
                }
                _ => StorageError::Backend(format!("archive open failed: {e}")),
            })?;
        file.write_all(&body)
            .await
            .map_err(|e| StorageError::Backend(format!("archive write failed: {e}")))?;
        file.sync_all()
            .await
            .map_err(|e| StorageError::Backend(format!("archive sync failed: {e}")))?;

        tracing::debug!(key, content_type, bytes = body.len(), "archived object");
        let absolute = tokio::fs::canonicalize(&path)
            .await
            .map_err(|e| StorageError::Backend(format!("archive path failed: {e}")))?;
        Ok(format!("file://{}", absolute.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_archive_is_write_once() {
        let archive = InMemoryArchiveStore::new();
        let url = archive
            .put_object("ratings/REP/run-1.jsonl", "application/x-ndjson", b"{}\n".to_vec())
            .await
            .unwrap();
        assert_eq!(url, "memory://ratings/REP/run-1.jsonl");
        assert_eq!(archive.get(&url).await.unwrap(), b"{}\n".to_vec());

        let again = archive
            .put_object("ratings/REP/run-1.jsonl", "application/x-ndjson", vec![])
            .await;
        assert!(matches!(again, Err(StorageError::Conflict(_))));
    }

    #[tokio::test]
    async fn keys_cannot_escape_the_root() {
        let archive = InMemoryArchiveStore::new();
        for key in ["../etc/passwd", "/abs", "a//b", "a b"] {
            assert!(matches!(
                archive.put_object(key, "text/plain", vec![]).await,
                Err(StorageError::InvalidInput(_))
            ));
        }
    }

    #[tokio::test]
    async fn fs_archive_writes_file_url() {
        let root = std::env::temp_dir().join(format!("credit-archive-{}", uuid::Uuid::new_v4()));
        let archive = FsArchiveStore::new(&root);
        let url = archive
            .put_object("votes/run-1.jsonl", "application/x-ndjson", b"line\n".to_vec())
            .await
            .unwrap();
        assert!(url.starts_with("file://"));
        assert!(url.ends_with("votes/run-1.jsonl"));
        let stored = tokio::fs::read(root.join("votes/run-1.jsonl")).await.unwrap();
        assert_eq!(stored, b"line\n".to_vec());
        let _ = tokio::fs::remove_dir_all(&root).await;
    }
}
