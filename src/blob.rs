use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use bytes::Bytes;

pub const BLOB_URL_PREFIX: &str = "blob:mediasdk/";

#[derive(Clone)]
pub(crate) struct StoredBlob {
    pub data: Bytes,
    pub mime_type: Option<String>,
}

/// In-memory store of plaintext blobs addressed by `blob:` URLs, the native counterpart of
/// browser object URLs. URLs handed out by the download manager stay valid for the session and
/// callers should not revoke them.
#[derive(uniffi::Object, Default)]
pub struct BlobRegistry {
    blobs: Mutex<HashMap<String, StoredBlob>>,
}

impl BlobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_url(&self, data: Bytes, mime_type: Option<String>) -> String {
        let url = format!("{}{}", BLOB_URL_PREFIX, uuid::Uuid::new_v4());
        self.lock().insert(url.clone(), StoredBlob { data, mime_type });
        url
    }

    pub fn resolve(&self, url: &str) -> Option<Bytes> {
        self.lock().get(url).map(|blob| blob.data.clone())
    }

    pub(crate) fn get(&self, url: &str) -> Option<StoredBlob> {
        self.lock().get(url).cloned()
    }

    pub(crate) fn get_by_id(&self, id: &str) -> Option<StoredBlob> {
        self.get(&format!("{}{}", BLOB_URL_PREFIX, id))
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, StoredBlob>> {
        self.blobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[uniffi::export]
impl BlobRegistry {
    pub fn read(&self, url: String) -> Option<Vec<u8>> {
        self.resolve(&url).map(|data| data.to_vec())
    }

    pub fn mime_type(&self, url: String) -> Option<String> {
        self.lock().get(&url).and_then(|blob| blob.mime_type.clone())
    }

    pub fn size(&self, url: String) -> Option<u64> {
        self.lock().get(&url).map(|blob| blob.data.len() as u64)
    }

    pub fn revoke(&self, url: String) {
        self.lock().remove(&url);
    }
}

/// The id part of a blob URL, used as the path of the local blob server.
pub fn blob_id(url: &str) -> Option<&str> {
    url.strip_prefix(BLOB_URL_PREFIX)
}
