uniffi::setup_scaffolding!();

pub mod blob;
pub mod cache;
pub mod coalesce;
pub mod config;
pub mod convert;
pub mod crypto;
pub mod download;
pub mod download_stream;
pub mod error;
pub mod file;
pub mod httpclient;
pub mod httpserver;
pub mod progress;
pub mod video;

pub use blob::BlobRegistry;
pub use config::DownloadManagerConfig;
pub use download::{DownloadManager, SourceDescriptor, SourceType, SourceURL};
pub use download_stream::DecryptedFileStream;
pub use error::MediaSDKError;
pub use file::{FileType, MediaFile};
pub use httpserver::{BlobServer, BlobServerConfig};
