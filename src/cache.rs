use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Mutex,
};

use bytes::Bytes;
use tokio::io::AsyncWriteExt;

use crate::error::MediaSDKError;

pub const THUMBNAIL_CACHE_NAME: &str = "thumbs";

/// A key to blob store that survives the session, used for decrypted thumbnails.
#[async_trait::async_trait]
pub trait BlobCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, MediaSDKError>;

    async fn put(&self, key: &str, data: Bytes) -> Result<(), MediaSDKError>;
}

/// One file per key inside a cache directory.
pub struct DiskBlobCache {
    dir: PathBuf,
}

impl DiskBlobCache {
    pub async fn open(base_dir: impl AsRef<Path>, name: &str) -> Result<Self, MediaSDKError> {
        let dir = base_dir.as_ref().join(name);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // Keys are file ids in practice, anything else is hex encoded to stay a valid file name.
        let is_plain = !key.is_empty()
            && key.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if is_plain {
            self.dir.join(key)
        } else {
            self.dir.join(format!("x{}", hex::encode(key)))
        }
    }
}

#[async_trait::async_trait]
impl BlobCache for DiskBlobCache {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, MediaSDKError> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(MediaSDKError::CacheError { err_str: e.to_string() }),
        }
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<(), MediaSDKError> {
        // Write to a temporary name first so readers never observe a half written entry.
        let path = self.path_for(key);
        let tmp_path = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));

        let result = write_then_rename(&tmp_path, &path, &data).await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(&tmp_path).await;
        }
        result.map_err(MediaSDKError::from)
    }
}

async fn write_then_rename(tmp_path: &Path, path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(tmp_path).await?;
    file.write_all(data).await?;
    file.flush().await?;
    drop(file);

    tokio::fs::rename(tmp_path, path).await
}

#[derive(Default)]
pub struct MemoryBlobCache {
    blobs: Mutex<HashMap<String, Bytes>>,
}

impl MemoryBlobCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl BlobCache for MemoryBlobCache {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, MediaSDKError> {
        let blobs = self.blobs.lock().map_err(|e| MediaSDKError::CacheError { err_str: e.to_string() })?;
        Ok(blobs.get(key).cloned())
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<(), MediaSDKError> {
        let mut blobs = self.blobs.lock().map_err(|e| MediaSDKError::CacheError { err_str: e.to_string() })?;
        blobs.insert(key.to_string(), data);
        Ok(())
    }
}
