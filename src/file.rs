use serde_repr::{Deserialize_repr, Serialize_repr};

/// Type of the media stored in a file, encoded on the wire as its integer code.
#[derive(uniffi::Enum)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum FileType {
    Image = 0,
    Video = 1,
    LivePhoto = 2,
    Other = 3,
}

/// The parts of a catalog entry the download manager needs. Owned by the caller, the manager
/// only borrows it for the duration of a request and never persists the key.
#[derive(uniffi::Record, Clone)]
pub struct MediaFile {
    pub id: i64,
    pub file_type: FileType,
    /// Original file name, used as a hint by the converters.
    pub title: String,
    pub key: Vec<u8>,
    pub file_decryption_header: Vec<u8>,
    pub thumbnail_decryption_header: Vec<u8>,
    /// Declared size of the original, if the catalog knows it.
    pub file_size: Option<u64>,
}

impl MediaFile {
    pub fn cache_key(&self) -> String {
        self.id.to_string()
    }

    pub fn blob_ref(&self, kind: RequestKind) -> EncryptedBlobRef {
        EncryptedBlobRef { file_id: self.id, kind }
    }
}

impl std::fmt::Debug for MediaFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaFile")
            .field("id", &self.id)
            .field("file_type", &self.file_type)
            .field("title", &self.title)
            .field("file_size", &self.file_size)
            .finish_non_exhaustive()
    }
}

/// Which remote resource of a file a request is for.
#[derive(uniffi::Enum)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Thumbnail,
    File,
    StreamingPreview,
}

/// Reference to a remote ciphertext, pure data without ownership of anything.
#[derive(uniffi::Record)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EncryptedBlobRef {
    pub file_id: i64,
    pub kind: RequestKind,
}
