use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, warn};

/// Check if an I/O error is due to disk space exhaustion (ENOSPC)
fn is_disk_full_error(err: &std::io::Error) -> bool {
    if err.kind() == ErrorKind::StorageFull {
        return true;
    }

    #[cfg(unix)]
    if err.raw_os_error() == Some(28) {
        return true;
    }

    let error_msg = err.to_string().to_lowercase();
    error_msg.contains("no space left") || error_msg.contains("disk full")
}

fn io_context(err: std::io::Error, action: &str, path: &Path) -> anyhow::Error {
    if is_disk_full_error(&err) {
        error!("DISK_FULL: {} {:?} - disk space exhausted", action, path);
        return anyhow!("DISK_FULL: No space left on device while {} {:?}", action, path);
    }
    anyhow::Error::new(err).context(format!("Failed {} {:?}", action, path))
}

/// Response-level metadata stored beside each blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobMeta {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub content_length: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u64>,
    /// Origin response headers worth replaying (whole-file entries only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<(String, String)>,
    pub stored_at: DateTime<Utc>,
}

impl BlobMeta {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            content_type: None,
            content_length: 0,
            chunk_index: None,
            chunk_size: None,
            headers: Vec::new(),
            stored_at: Utc::now(),
        }
    }

    pub fn with_content_type(mut self, content_type: Option<String>) -> Self {
        self.content_type = content_type;
        self
    }

    pub fn with_chunk(mut self, index: u64, chunk_size: u64) -> Self {
        self.chunk_index = Some(index);
        self.chunk_size = Some(chunk_size);
        self
    }

    pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers = headers;
        self
    }
}

/// A fully committed blob read back from disk.
#[derive(Debug, Clone)]
pub struct CachedBlob {
    pub meta: BlobMeta,
    pub data: Bytes,
}

/// Directory-backed blob cache.
///
/// Layout: `<root>/blobs/<sha256(key)>.bin` holds the bytes and a `.json`
/// sidecar holds [`BlobMeta`]. Writers stage both under `<root>/tmp/` and
/// publish by rename; the data rename is the commit point, so readers never
/// see a partially written blob. Anything here may vanish underneath us and a
/// missing blob simply means "not cached".
#[derive(Debug, Clone)]
pub struct BlobStore {
    blobs_dir: PathBuf,
    tmp_dir: PathBuf,
}

impl BlobStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let store = Self {
            blobs_dir: root.join("blobs"),
            tmp_dir: root.join("tmp"),
        };
        store.ensure_dirs().await?;

        // Staging files from a crashed writer are never published
        if let Err(e) = fs::remove_dir_all(&store.tmp_dir).await
            && e.kind() != ErrorKind::NotFound
        {
            warn!("Failed to sweep blob staging dir {:?}: {}", store.tmp_dir, e);
        }
        store.ensure_dirs().await?;

        Ok(store)
    }

    async fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.blobs_dir)
            .await
            .map_err(|e| io_context(e, "creating", &self.blobs_dir))?;
        fs::create_dir_all(&self.tmp_dir)
            .await
            .map_err(|e| io_context(e, "creating", &self.tmp_dir))?;
        Ok(())
    }

    fn hashed(key: &str) -> String {
        hex::encode(Sha256::digest(key.as_bytes()))
    }

    fn data_path(&self, key: &str) -> PathBuf {
        self.blobs_dir.join(format!("{}.bin", Self::hashed(key)))
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.blobs_dir.join(format!("{}.json", Self::hashed(key)))
    }

    /// Start a staged write for `key`. Nothing is visible until
    /// [`BlobWriter::commit`].
    pub async fn begin(&self, key: &str) -> Result<BlobWriter> {
        let staging = uuid::Uuid::new_v4().simple().to_string();
        let tmp_data = self.tmp_dir.join(format!("{staging}.bin"));
        let tmp_meta = self.tmp_dir.join(format!("{staging}.json"));

        let file = match File::create(&tmp_data).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                // Staging dir was purged underneath us
                self.ensure_dirs().await?;
                File::create(&tmp_data)
                    .await
                    .map_err(|e| io_context(e, "creating", &tmp_data))?
            }
            Err(e) => return Err(io_context(e, "creating", &tmp_data)),
        };

        Ok(BlobWriter {
            key: key.to_string(),
            file: Some(file),
            tmp_data,
            tmp_meta,
            data_path: self.data_path(key),
            meta_path: self.meta_path(key),
            written: 0,
            committed: false,
        })
    }

    /// Store `data` under `key` in one shot.
    pub async fn put(&self, key: &str, data: &[u8], meta: BlobMeta) -> Result<()> {
        let mut writer = self.begin(key).await?;
        writer.write(data).await?;
        writer.commit(meta).await
    }

    /// Whether a committed blob exists for `key`.
    pub async fn contains(&self, key: &str) -> bool {
        fs::try_exists(self.data_path(key)).await.unwrap_or(false)
    }

    /// Metadata only. `content_length` always reflects the bytes on disk.
    pub async fn head(&self, key: &str) -> Result<Option<BlobMeta>> {
        let data_path = self.data_path(key);
        let len = match fs::metadata(&data_path).await {
            Ok(stat) => stat.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_context(e, "reading metadata of", &data_path)),
        };

        let mut meta = self.read_meta(key).await;
        meta.content_length = len;
        Ok(Some(meta))
    }

    /// Full blob, or `None` when it was never stored or has been evicted.
    pub async fn get(&self, key: &str) -> Result<Option<CachedBlob>> {
        let data_path = self.data_path(key);
        let data = match fs::read(&data_path).await {
            Ok(data) => Bytes::from(data),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_context(e, "reading", &data_path)),
        };

        let mut meta = self.read_meta(key).await;
        meta.content_length = data.len() as u64;
        Ok(Some(CachedBlob { meta, data }))
    }

    async fn read_meta(&self, key: &str) -> BlobMeta {
        let meta_path = self.meta_path(key);
        match fs::read(&meta_path).await {
            Ok(raw) => match serde_json::from_slice::<BlobMeta>(&raw) {
                Ok(meta) => meta,
                Err(e) => {
                    warn!("Ignoring corrupt blob sidecar {:?}: {}", meta_path, e);
                    BlobMeta::new(key)
                }
            },
            Err(_) => BlobMeta::new(key),
        }
    }

    /// Remove a blob. Missing blobs are not an error.
    pub async fn delete(&self, key: &str) -> Result<()> {
        for path in [self.data_path(key), self.meta_path(key)] {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(io_context(e, "removing", &path)),
            }
        }
        debug!("Deleted blob {}", key);
        Ok(())
    }

    /// Drop every blob, including in-flight staging files.
    pub async fn clear(&self) -> Result<()> {
        for dir in [&self.blobs_dir, &self.tmp_dir] {
            match fs::remove_dir_all(dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(io_context(e, "clearing", dir)),
            }
        }
        self.ensure_dirs().await
    }
}

/// Staged write of a single blob; dropped without commit leaves no trace.
pub struct BlobWriter {
    key: String,
    file: Option<File>,
    tmp_data: PathBuf,
    tmp_meta: PathBuf,
    data_path: PathBuf,
    meta_path: PathBuf,
    written: u64,
    committed: bool,
}

impl BlobWriter {
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| anyhow!("Blob writer for {} already closed", self.key))?;
        file.write_all(data)
            .await
            .map_err(|e| io_context(e, "writing", &self.tmp_data))?;
        self.written += data.len() as u64;
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Publish the blob. `meta.content_length` is overwritten with the
    /// number of bytes actually written.
    pub async fn commit(mut self, mut meta: BlobMeta) -> Result<()> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| anyhow!("Blob writer for {} already closed", self.key))?;
        file.flush()
            .await
            .map_err(|e| io_context(e, "flushing", &self.tmp_data))?;
        file.sync_all()
            .await
            .map_err(|e| io_context(e, "syncing", &self.tmp_data))?;
        drop(file);

        meta.key = self.key.clone();
        meta.content_length = self.written;
        let sidecar = serde_json::to_vec(&meta).context("Failed to serialize blob metadata")?;
        fs::write(&self.tmp_meta, sidecar)
            .await
            .map_err(|e| io_context(e, "writing", &self.tmp_meta))?;

        if let Some(parent) = self.data_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| io_context(e, "creating", parent))?;
        }
        fs::rename(&self.tmp_meta, &self.meta_path)
            .await
            .map_err(|e| io_context(e, "publishing", &self.meta_path))?;
        fs::rename(&self.tmp_data, &self.data_path)
            .await
            .map_err(|e| io_context(e, "publishing", &self.data_path))?;

        self.committed = true;
        debug!("Committed blob {} ({} bytes)", self.key, self.written);
        Ok(())
    }
}

impl Drop for BlobWriter {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.tmp_data);
            let _ = std::fs::remove_file(&self.tmp_meta);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store() -> (TempDir, BlobStore) {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::open(dir.path()).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_put_get_with_sidecar() {
        let (_dir, store) = store().await;
        let meta = BlobMeta::new("k")
            .with_content_type(Some("audio/mpeg".to_string()))
            .with_chunk(2, 5);

        store.put("k", b"hello", meta).await.unwrap();

        let blob = store.get("k").await.unwrap().unwrap();
        assert_eq!(&blob.data[..], b"hello");
        assert_eq!(blob.meta.content_length, 5);
        assert_eq!(blob.meta.content_type.as_deref(), Some("audio/mpeg"));
        assert_eq!(blob.meta.chunk_index, Some(2));
        assert_eq!(blob.meta.chunk_size, Some(5));

        let head = store.head("k").await.unwrap().unwrap();
        assert_eq!(head.content_length, 5);
    }

    #[tokio::test]
    async fn test_uncommitted_writer_is_invisible_and_cleaned_up() {
        let (dir, store) = store().await;

        let mut writer = store.begin("k").await.unwrap();
        writer.write(b"partial").await.unwrap();
        assert!(!store.contains("k").await);
        assert!(store.get("k").await.unwrap().is_none());
        drop(writer);

        let leftovers = std::fs::read_dir(dir.path().join("tmp")).unwrap().count();
        assert_eq!(leftovers, 0);
        assert!(!store.contains("k").await);
    }

    #[tokio::test]
    async fn test_overwrite_replaces_content() {
        let (_dir, store) = store().await;
        store.put("k", b"one", BlobMeta::new("k")).await.unwrap();
        store.put("k", b"second", BlobMeta::new("k")).await.unwrap();

        let blob = store.get("k").await.unwrap().unwrap();
        assert_eq!(&blob.data[..], b"second");
    }

    #[tokio::test]
    async fn test_missing_sidecar_falls_back_to_defaults() {
        let (_dir, store) = store().await;
        store
            .put("k", b"abc", BlobMeta::new("k").with_content_type(Some("x/y".into())))
            .await
            .unwrap();
        std::fs::remove_file(store.meta_path("k")).unwrap();

        let blob = store.get("k").await.unwrap().unwrap();
        assert_eq!(blob.meta.content_type, None);
        assert_eq!(blob.meta.content_length, 3);
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let (_dir, store) = store().await;
        store.put("a", b"1", BlobMeta::new("a")).await.unwrap();
        store.put("b", b"2", BlobMeta::new("b")).await.unwrap();

        store.delete("a").await.unwrap();
        store.delete("a").await.unwrap();
        assert!(!store.contains("a").await);
        assert!(store.contains("b").await);

        store.clear().await.unwrap();
        assert!(!store.contains("b").await);

        // Still usable after a clear
        store.put("c", b"3", BlobMeta::new("c")).await.unwrap();
        assert!(store.contains("c").await);
    }

    #[tokio::test]
    async fn test_external_purge_reads_as_miss() {
        let (dir, store) = store().await;
        store.put("k", b"data", BlobMeta::new("k")).await.unwrap();

        std::fs::remove_dir_all(dir.path().join("blobs")).unwrap();
        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.head("k").await.unwrap().is_none());

        // Writers recover from a purged staging dir too
        std::fs::remove_dir_all(dir.path().join("tmp")).unwrap();
        store.put("k", b"again", BlobMeta::new("k")).await.unwrap();
        assert!(store.contains("k").await);
    }
}
