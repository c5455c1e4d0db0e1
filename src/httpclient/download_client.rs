use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use reqwest::RequestBuilder;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    endpoints::{string_url, FileURL},
    httpclient::{
        download_into_memory, download_streamed, download_with_progress, retry_async_operation,
        FileStreamResponse, OnDownloadProgress,
    },
    DownloadClient,
};
use crate::{
    config::DownloadManagerConfig,
    error::MediaSDKError,
    file::{EncryptedBlobRef, MediaFile, RequestKind},
};

#[derive(Default)]
struct Credentials {
    token: Option<String>,
    password_token: Option<String>,
}

/// What both deployment modes share: the HTTP client, the origin and the retry policy.
struct Transport {
    client: reqwest::Client,
    custom_origin: Option<String>,
    timeout: Duration,
    retry_delays: Vec<Duration>,
    cancel: CancellationToken,
    credentials: Mutex<Credentials>,
}

impl Transport {
    fn new(
        config: &DownloadManagerConfig,
        cancel: CancellationToken,
        credentials: Credentials,
    ) -> Result<Self, MediaSDKError> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            custom_origin: config.custom_origin().map(str::to_string),
            timeout: config.timeout(),
            retry_delays: config.retry_delays(),
            cancel,
            credentials: Mutex::new(credentials),
        })
    }

    fn update_tokens(&self, token: String, password_token: Option<String>) {
        let mut credentials = self.credentials.lock().unwrap_or_else(|e| e.into_inner());
        credentials.token = Some(token).filter(|t| !t.is_empty());
        credentials.password_token = password_token.filter(|t| !t.is_empty());
    }

    /// Current tokens, read for every attempt so a refresh applies to retries too.
    fn tokens(&self) -> Result<(String, Option<String>), MediaSDKError> {
        let credentials = self.credentials.lock().unwrap_or_else(|e| e.into_inner());
        let token = credentials.token.clone().ok_or(MediaSDKError::TokenMissing)?;
        Ok((token, credentials.password_token.clone()))
    }

    async fn retry<T, F, Fut>(&self, operation: F) -> Result<T, MediaSDKError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, MediaSDKError>>,
    {
        retry_async_operation(&self.retry_delays, &self.cancel, operation).await
    }
}

/*
[Passing credentials to a custom origin]

A custom origin answers file requests with a redirect to object storage. Custom headers are not
forwarded across that redirect, so for custom origins the credentials travel as query parameters.
The hosted endpoints take them as headers.
*/

/// Transport of a signed in user.
pub struct PhotosDownloadClient {
    transport: Transport,
}

impl PhotosDownloadClient {
    pub fn new(
        token: String,
        config: &DownloadManagerConfig,
        cancel: CancellationToken,
    ) -> Result<Self, MediaSDKError> {
        let credentials = Credentials {
            token: Some(token).filter(|t| !t.is_empty()),
            password_token: None,
        };
        Ok(Self {
            transport: Transport::new(config, cancel, credentials)?,
        })
    }

    fn request(&self, blob: EncryptedBlobRef) -> Result<RequestBuilder, MediaSDKError> {
        let (token, _) = self.transport.tokens()?;
        let origin = self.transport.custom_origin.as_deref();
        let mut url = string_url(&FileURL::Photos, &blob, origin)?;

        Ok(match origin {
            Some(_) => {
                url.query_pairs_mut().append_pair("token", &token);
                self.transport.client.get(url)
            }
            None => self.transport.client.get(url).header("X-Auth-Token", token),
        })
    }
}

#[async_trait::async_trait]
impl DownloadClient for PhotosDownloadClient {
    fn update_tokens(&self, token: String, _password_token: Option<String>) {
        self.transport.update_tokens(token, None);
    }

    async fn download_thumbnail(&self, file: &MediaFile) -> Result<Bytes, MediaSDKError> {
        let this = self;
        self.transport
            .retry(move || async move {
                let request = this.request(file.blob_ref(RequestKind::Thumbnail))?;
                download_into_memory(request.timeout(this.transport.timeout)).await
            })
            .await
    }

    async fn download_file(
        &self,
        file: &MediaFile,
        on_progress: OnDownloadProgress<'_>,
    ) -> Result<Bytes, MediaSDKError> {
        let this = self;
        self.transport
            .retry(move || async move {
                let request = this.request(file.blob_ref(RequestKind::File))?;
                download_with_progress(request.timeout(this.transport.timeout), on_progress).await
            })
            .await
    }

    async fn download_file_stream(&self, file: &MediaFile) -> Result<FileStreamResponse, MediaSDKError> {
        let this = self;
        self.transport
            .retry(move || async move {
                download_streamed(this.request(file.blob_ref(RequestKind::File))?).await
            })
            .await
    }
}

/// Transport of a public link. The access token arrives through `update_tokens` once the link
/// has been resolved, together with the JWT of a password protected link.
pub struct PublicAlbumsDownloadClient {
    transport: Transport,
}

impl PublicAlbumsDownloadClient {
    pub fn new(config: &DownloadManagerConfig, cancel: CancellationToken) -> Result<Self, MediaSDKError> {
        Ok(Self {
            transport: Transport::new(config, cancel, Credentials::default())?,
        })
    }

    fn request(&self, blob: EncryptedBlobRef) -> Result<RequestBuilder, MediaSDKError> {
        let (access_token, access_token_jwt) = self.transport.tokens()?;
        let origin = self.transport.custom_origin.as_deref();
        let mut url = string_url(&FileURL::PublicAlbums, &blob, origin)?;

        if origin.is_some() {
            {
                let mut params = url.query_pairs_mut();
                params.append_pair("accessToken", &access_token);
                if let Some(jwt) = &access_token_jwt {
                    params.append_pair("accessTokenJWT", jwt);
                }
            }
            return Ok(self.transport.client.get(url));
        }

        let mut request = self
            .transport
            .client
            .get(url)
            .header("X-Auth-Access-Token", access_token);
        if let Some(jwt) = access_token_jwt {
            request = request.header("X-Auth-Access-Token-JWT", jwt);
        }
        Ok(request)
    }
}

#[async_trait::async_trait]
impl DownloadClient for PublicAlbumsDownloadClient {
    fn update_tokens(&self, token: String, password_token: Option<String>) {
        self.transport.update_tokens(token, password_token);
    }

    // Single attempt, a failed public thumbnail is retried by the next render instead.
    async fn download_thumbnail(&self, file: &MediaFile) -> Result<Bytes, MediaSDKError> {
        let request = self.request(file.blob_ref(RequestKind::Thumbnail))?;
        download_into_memory(request.timeout(self.transport.timeout)).await
    }

    async fn download_file(
        &self,
        file: &MediaFile,
        on_progress: OnDownloadProgress<'_>,
    ) -> Result<Bytes, MediaSDKError> {
        let this = self;
        self.transport
            .retry(move || async move {
                let request = this.request(file.blob_ref(RequestKind::File))?;
                download_with_progress(request.timeout(this.transport.timeout), on_progress).await
            })
            .await
    }

    async fn download_file_stream(&self, file: &MediaFile) -> Result<FileStreamResponse, MediaSDKError> {
        let this = self;
        self.transport
            .retry(move || async move {
                download_streamed(this.request(file.blob_ref(RequestKind::File))?).await
            })
            .await
    }
}

/// Picks the transport for a deployment mode: signed in when a token is given, public link
/// otherwise.
pub fn create_download_client(
    token: Option<String>,
    config: &DownloadManagerConfig,
    cancel: CancellationToken,
) -> Result<Arc<dyn DownloadClient>, MediaSDKError> {
    match token.filter(|t| !t.is_empty()) {
        Some(token) => {
            debug!("Using the signed in download client");
            Ok(Arc::new(PhotosDownloadClient::new(token, config, cancel)?))
        }
        None => {
            debug!("Using the public link download client");
            Ok(Arc::new(PublicAlbumsDownloadClient::new(config, cancel)?))
        }
    }
}
