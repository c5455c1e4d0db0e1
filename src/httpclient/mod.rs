mod endpoints;
pub mod download_client;
pub mod httpclient;

pub use download_client::{create_download_client, PhotosDownloadClient, PublicAlbumsDownloadClient};
pub use endpoints::{string_url, Endpoints, FileURL};
pub use httpclient::{retry_async_operation, ByteStream, FileStreamResponse, OnDownloadProgress};

use bytes::Bytes;

use crate::{error::MediaSDKError, file::MediaFile};

/// Fetches ciphertext for files. One implementation per deployment mode, picked at init.
#[async_trait::async_trait]
pub trait DownloadClient: Send + Sync {
    /// Replaces the credentials used by subsequent requests. `password_token` is only meaningful
    /// for password protected public links.
    fn update_tokens(&self, token: String, password_token: Option<String>);

    async fn download_thumbnail(&self, file: &MediaFile) -> Result<Bytes, MediaSDKError>;

    async fn download_file(
        &self,
        file: &MediaFile,
        on_progress: OnDownloadProgress<'_>,
    ) -> Result<Bytes, MediaSDKError>;

    async fn download_file_stream(&self, file: &MediaFile) -> Result<FileStreamResponse, MediaSDKError>;
}
