use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    blob::BlobRegistry,
    cache::{BlobCache, DiskBlobCache, THUMBNAIL_CACHE_NAME},
    coalesce::CoalescingCache,
    config::DownloadManagerConfig,
    convert::{LivePhoto, MediaConverter, PassthroughConverter, Renderable},
    crypto::{decrypt_stream_bytes, AeadMediaCrypto, MediaCrypto},
    download_stream::{bytes_stream, DecryptedByteStream, DecryptedFileStream, DecryptionPipeline},
    error::MediaSDKError,
    file::{FileType, MediaFile},
    httpclient::{create_download_client, DownloadClient},
    progress::{ProgressObserver, ProgressSubscription, ProgressTracker},
    video::{
        hls_playlist_data_for_file, FileDataClient, HLSPlaylistData, LoggingVideoProcessor, OfferOutcome,
        QueueOptions, UploadItem, VideoProcessingQueue, VideoProcessor,
    },
};

/// Builds the transport for a session: token (if any), config, session cancellation.
pub type ClientFactory = Arc<
    dyn Fn(Option<String>, &DownloadManagerConfig, CancellationToken) -> Result<Arc<dyn DownloadClient>, MediaSDKError>
        + Send
        + Sync,
>;

#[derive(uniffi::Enum)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceType {
    Normal,
    LivePhoto,
}

#[derive(uniffi::Enum)]
#[derive(Debug, Clone)]
pub enum SourceURL {
    Normal { url: String },
    LivePhoto { live_photo: Arc<LivePhotoSourceURL> },
}

/// What the host needs to display a file.
#[derive(uniffi::Record)]
#[derive(Debug, Clone)]
pub struct SourceDescriptor {
    pub url: SourceURL,
    /// The url points at the original, unconverted data.
    pub is_original: bool,
    /// The host is expected to be able to render the url.
    pub is_renderable: bool,
    pub source_type: SourceType,
    pub mime_type: Option<String>,
    /// An explicit conversion could still help, offered for originals that look playable but
    /// might not be.
    pub can_force_convert: bool,
}

impl SourceDescriptor {
    pub fn normal_url(&self) -> Option<&str> {
        match &self.url {
            SourceURL::Normal { url } => Some(url),
            SourceURL::LivePhoto { .. } => None,
        }
    }
}

/// The two halves of a live photo, each converted on first use. A component that cannot be made
/// renderable resolves to `None` without affecting the other one.
#[derive(uniffi::Object)]
pub struct LivePhotoSourceURL {
    live_photo: LivePhoto,
    converter: Arc<dyn MediaConverter>,
    blobs: Arc<BlobRegistry>,
    components: CoalescingCache<LivePhotoComponent, Option<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum LivePhotoComponent {
    Image,
    Video,
}

impl std::fmt::Debug for LivePhotoSourceURL {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LivePhotoSourceURL")
            .field("image_file_name", &self.live_photo.image_file_name)
            .field("video_file_name", &self.live_photo.video_file_name)
            .finish_non_exhaustive()
    }
}

#[uniffi::export(async_runtime = "tokio")]
impl LivePhotoSourceURL {
    pub async fn image(&self) -> Option<String> {
        let live_photo = self.live_photo.clone();
        let converter = self.converter.clone();
        let blobs = self.blobs.clone();

        let url = self.components.get_or_start(LivePhotoComponent::Image, move || async move {
            let converted = converter
                .renderable_image(&live_photo.image_file_name, live_photo.image_data.clone())
                .await;
            Ok(component_url(&blobs, live_photo.image_data, converted, "image"))
        });
        url.await.ok().flatten()
    }

    pub async fn video(&self) -> Option<String> {
        let live_photo = self.live_photo.clone();
        let converter = self.converter.clone();
        let blobs = self.blobs.clone();

        let url = self.components.get_or_start(LivePhotoComponent::Video, move || async move {
            let converted = converter
                .playable_video(&live_photo.video_file_name, live_photo.video_data.clone(), false)
                .await;
            Ok(component_url(&blobs, live_photo.video_data, converted, "video"))
        });
        url.await.ok().flatten()
    }
}

fn component_url(
    blobs: &BlobRegistry,
    original: Bytes,
    converted: Result<Option<Renderable>, MediaSDKError>,
    component: &str,
) -> Option<String> {
    match converted {
        Ok(Some(Renderable::Original { mime_type })) => Some(blobs.create_url(original, mime_type)),
        Ok(Some(Renderable::Converted(blob))) => Some(blobs.create_url(blob.data, blob.mime_type)),
        Ok(None) => None,
        Err(err) => {
            warn!(component, error = %err, "Failed to convert live photo component");
            None
        }
    }
}

/// Everything that lives between `init` and `reset`.
struct DownloadSession {
    client: Arc<dyn DownloadClient>,
    crypto: Arc<dyn MediaCrypto>,
    converter: Arc<dyn MediaConverter>,
    thumbnail_cache: Option<Arc<dyn BlobCache>>,
    is_desktop: bool,

    /// File id to blob URL of its decrypted thumbnail, `None` when only the cache was consulted.
    thumbnail_urls: CoalescingCache<i64, Option<String>>,
    /// File id to blob URL of its original, which may not be renderable.
    file_urls: CoalescingCache<i64, String>,
    file_conversions: CoalescingCache<i64, SourceDescriptor>,

    progress: Arc<ProgressTracker>,
    blobs: Arc<BlobRegistry>,
    video_queue: VideoProcessingQueue,
    cancel: CancellationToken,
}

impl DownloadSession {
    async fn thumbnail_data(&self, file: &MediaFile, cached_only: bool) -> Result<Option<Bytes>, MediaSDKError> {
        let key = file.cache_key();

        if let Some(cache) = &self.thumbnail_cache {
            match cache.get(&key).await {
                Ok(Some(data)) => return Ok(Some(data)),
                Ok(None) => {}
                // An unreadable entry is a miss, the next download overwrites it.
                Err(err) => warn!(file_id = file.id, error = %err, "Failed to read cached thumbnail"),
            }
        }

        if cached_only {
            return Ok(None);
        }

        let thumbnail = self.download_thumbnail(file).await?;
        if let Some(cache) = &self.thumbnail_cache {
            if let Err(err) = cache.put(&key, thumbnail.clone()).await {
                warn!(file_id = file.id, error = %err, "Failed to cache thumbnail");
            }
        }

        Ok(Some(thumbnail))
    }

    async fn download_thumbnail(&self, file: &MediaFile) -> Result<Bytes, MediaSDKError> {
        let encrypted = self.client.download_thumbnail(file).await?;
        Ok(self
            .crypto
            .decrypt_whole(&encrypted, &file.thumbnail_decryption_header, &file.key)?)
    }

    async fn renderable_thumbnail_url(
        self: &Arc<Self>,
        file: &MediaFile,
        cached_only: bool,
    ) -> Result<Option<String>, MediaSDKError> {
        loop {
            let this = self.clone();
            let owned_file = file.clone();
            let thumbnail = self
                .thumbnail_urls
                .get_or_start(file.id, move || async move {
                    let data = this.thumbnail_data(&owned_file, cached_only).await?;
                    Ok(data.map(|data| this.blobs.create_url(data, None)))
                })
                .await?;

            if cached_only || thumbnail.is_some() {
                return Ok(thumbnail);
            }

            // A `None` left behind by a cached only call, fetch for real this time.
            self.thumbnail_urls.invalidate_if(&file.id, Option::is_none);
        }
    }

    /// Blob URL of the decrypted original, downloaded once per session.
    async fn file_url(self: &Arc<Self>, file: &MediaFile) -> Result<String, MediaSDKError> {
        let this = self.clone();
        let owned_file = file.clone();

        self.file_urls
            .get_or_start(file.id, move || async move {
                let stream = DecryptedFileStream::new(this.download_file(&owned_file).await?);
                let data = stream.collect().await?;
                let mime_type = mime_guess::from_path(&owned_file.title).first().map(|m| m.to_string());
                Ok(this.blobs.create_url(data, mime_type))
            })
            .await
    }

    async fn file_stream(self: &Arc<Self>, file: &MediaFile) -> Result<DecryptedFileStream, MediaSDKError> {
        if let Some(cached) = self.file_urls.get(&file.id) {
            let data = cached.await.and_then(|url| {
                self.blobs.resolve(&url).ok_or_else(|| MediaSDKError::CacheError {
                    err_str: format!("Blob {} is gone", url),
                })
            });
            match data {
                Ok(data) => return Ok(DecryptedFileStream::from_bytes(data)),
                Err(err) => {
                    warn!(file_id = file.id, error = %err, "Failed to use cached file URL");
                    self.file_urls.invalidate(&file.id);
                }
            }
        }

        // Not memoized, a fresh download is streamed straight to the caller.
        Ok(DecryptedFileStream::new(self.download_file(file).await?))
    }

    async fn download_file(&self, file: &MediaFile) -> Result<DecryptedByteStream, MediaSDKError> {
        info!(file_id = file.id, "download attempted");
        let progress = self.progress.reporter(file.id, file.file_size);

        match file.file_type {
            FileType::Image | FileType::LivePhoto => {
                let on_progress = |loaded: u64, total: u64| progress.report(loaded, total);
                let encrypted = self.client.download_file(file, &on_progress).await;
                progress.clear();

                let decrypted = decrypt_stream_bytes(
                    self.crypto.as_ref(),
                    &encrypted?,
                    &file.file_decryption_header,
                    &file.key,
                )?;
                Ok(bytes_stream(decrypted))
            }
            FileType::Video | FileType::Other => {
                let response = match self.client.download_file_stream(file).await {
                    Ok(response) => response,
                    Err(err) => {
                        progress.clear();
                        return Err(err);
                    }
                };
                let pipeline = DecryptionPipeline::new(
                    self.crypto.as_ref(),
                    &file.file_decryption_header,
                    &file.key,
                    response,
                    Some(progress),
                    self.cancel.child_token(),
                )?;
                Ok(pipeline.into_stream())
            }
        }
    }

    async fn file_for_preview(
        self: &Arc<Self>,
        file: &MediaFile,
        force_convert: bool,
    ) -> Result<SourceDescriptor, MediaSDKError> {
        let this = self.clone();
        let owned_file = file.clone();
        let producer = move || async move { this.renderable_source(&owned_file, force_convert).await };

        let result = if force_convert {
            self.file_conversions.force_start(file.id, producer).await
        } else {
            self.file_conversions.get_or_start(file.id, producer).await
        };

        if let Err(err) = &result {
            error!(file_id = file.id, error = %err, "Failed to get file for preview");
        }
        result
    }

    async fn renderable_source(
        self: &Arc<Self>,
        file: &MediaFile,
        force_convert: bool,
    ) -> Result<SourceDescriptor, MediaSDKError> {
        let original_url = self.file_url(file).await?;
        let original = self.blobs.resolve(&original_url).ok_or_else(|| MediaSDKError::CacheError {
            err_str: format!("Blob {} is gone", original_url),
        })?;

        let descriptor = match file.file_type {
            FileType::Image => {
                let converted = self.converter.renderable_image(&file.title, original).await?;
                self.converted_descriptor(original_url, converted)
            }
            FileType::Video => {
                let converted = self
                    .converter
                    .playable_video(&file.title, original, force_convert)
                    .await?;
                let mut descriptor = self.converted_descriptor(original_url, converted);
                descriptor.can_force_convert =
                    self.is_desktop && !force_convert && descriptor.is_original && descriptor.is_renderable;
                descriptor
            }
            FileType::LivePhoto => {
                let live_photo = self.converter.decode_live_photo(&file.title, original).await?;
                SourceDescriptor {
                    url: SourceURL::LivePhoto {
                        live_photo: Arc::new(LivePhotoSourceURL {
                            live_photo,
                            converter: self.converter.clone(),
                            blobs: self.blobs.clone(),
                            components: CoalescingCache::new(),
                        }),
                    },
                    is_original: false,
                    is_renderable: false,
                    source_type: SourceType::LivePhoto,
                    mime_type: None,
                    can_force_convert: false,
                }
            }
            FileType::Other => original_descriptor(original_url),
        };

        Ok(descriptor)
    }

    fn converted_descriptor(&self, original_url: String, converted: Option<Renderable>) -> SourceDescriptor {
        match converted {
            Some(Renderable::Original { mime_type }) => SourceDescriptor {
                is_renderable: true,
                mime_type,
                ..original_descriptor(original_url)
            },
            Some(Renderable::Converted(blob)) => SourceDescriptor {
                url: SourceURL::Normal {
                    url: self.blobs.create_url(blob.data, blob.mime_type.clone()),
                },
                is_original: false,
                is_renderable: true,
                source_type: SourceType::Normal,
                mime_type: blob.mime_type,
                can_force_convert: false,
            },
            // Unsupported format, hand out the original and let the host decide.
            None => original_descriptor(original_url),
        }
    }

    fn shutdown(&self) {
        self.cancel.cancel();
        self.video_queue.reset();
        self.thumbnail_urls.clear();
        self.file_urls.clear();
        self.file_conversions.clear();
        self.progress.clear_all();
        self.blobs.clear();
    }
}

fn original_descriptor(original_url: String) -> SourceDescriptor {
    SourceDescriptor {
        url: SourceURL::Normal { url: original_url },
        is_original: true,
        is_renderable: false,
        source_type: SourceType::Normal,
        mime_type: None,
        can_force_convert: false,
    }
}

/// Retrieves, decrypts and caches the media of files for display.
///
/// Nothing works before [`DownloadManager::init`]. Concurrent requests for the same file share
/// one download, and results live until [`DownloadManager::reset`].
#[derive(uniffi::Object)]
pub struct DownloadManager {
    config: DownloadManagerConfig,
    crypto: Arc<dyn MediaCrypto>,
    converter: Arc<dyn MediaConverter>,
    video_processor: Arc<dyn VideoProcessor>,
    thumbnail_cache: Option<Arc<dyn BlobCache>>,
    client_factory: ClientFactory,
    session: RwLock<Option<Arc<DownloadSession>>>,
}

pub struct DownloadManagerBuilder {
    config: DownloadManagerConfig,
    crypto: Arc<dyn MediaCrypto>,
    converter: Arc<dyn MediaConverter>,
    video_processor: Arc<dyn VideoProcessor>,
    thumbnail_cache: Option<Arc<dyn BlobCache>>,
    client_factory: ClientFactory,
}

impl DownloadManagerBuilder {
    pub fn new(config: DownloadManagerConfig) -> Self {
        Self {
            config,
            crypto: Arc::new(AeadMediaCrypto),
            converter: Arc::new(PassthroughConverter),
            video_processor: Arc::new(LoggingVideoProcessor),
            thumbnail_cache: None,
            client_factory: Arc::new(create_download_client),
        }
    }

    pub fn crypto(mut self, crypto: Arc<dyn MediaCrypto>) -> Self {
        self.crypto = crypto;
        self
    }

    pub fn converter(mut self, converter: Arc<dyn MediaConverter>) -> Self {
        self.converter = converter;
        self
    }

    pub fn video_processor(mut self, processor: Arc<dyn VideoProcessor>) -> Self {
        self.video_processor = processor;
        self
    }

    /// Used instead of the disk cache of `thumbnail_cache_dir`.
    pub fn thumbnail_cache(mut self, cache: Arc<dyn BlobCache>) -> Self {
        self.thumbnail_cache = Some(cache);
        self
    }

    pub fn client_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(Option<String>, &DownloadManagerConfig, CancellationToken) -> Result<Arc<dyn DownloadClient>, MediaSDKError>
            + Send
            + Sync
            + 'static,
    {
        self.client_factory = Arc::new(factory);
        self
    }

    pub fn build(self) -> DownloadManager {
        DownloadManager {
            config: self.config,
            crypto: self.crypto,
            converter: self.converter,
            video_processor: self.video_processor,
            thumbnail_cache: self.thumbnail_cache,
            client_factory: self.client_factory,
            session: RwLock::new(None),
        }
    }
}

impl DownloadManager {
    pub fn builder(config: DownloadManagerConfig) -> DownloadManagerBuilder {
        DownloadManagerBuilder::new(config)
    }

    fn session(&self) -> Result<Arc<DownloadSession>, MediaSDKError> {
        self.session
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or_else(MediaSDKError::not_initialized)
    }

    pub fn is_initialized(&self) -> bool {
        self.session().is_ok()
    }

    async fn open_thumbnail_cache(&self) -> Option<Arc<dyn BlobCache>> {
        if let Some(cache) = &self.thumbnail_cache {
            return Some(cache.clone());
        }

        let dir = self.config.thumbnail_cache_dir.as_ref()?;
        match DiskBlobCache::open(dir, THUMBNAIL_CACHE_NAME).await {
            Ok(cache) => Some(Arc::new(cache)),
            Err(err) => {
                error!(error = %err, "Failed to open thumbnail cache, will continue without it");
                None
            }
        }
    }

    /// Thumbnail bytes, from the persistent cache or downloaded. `None` only when `cached_only`
    /// is set and the cache has no entry, which lets scrolling avoid a flood of requests.
    pub async fn thumbnail_data(&self, file: &MediaFile, cached_only: bool) -> Result<Option<Bytes>, MediaSDKError> {
        self.session()?.thumbnail_data(file, cached_only).await
    }

    /// Blob URL of the thumbnail. Handed out URLs are cached for the session and must not be
    /// revoked by the caller.
    pub async fn renderable_thumbnail_url(
        &self,
        file: &MediaFile,
        cached_only: bool,
    ) -> Result<Option<String>, MediaSDKError> {
        self.session()?.renderable_thumbnail_url(file, cached_only).await
    }

    /// `force_convert` is set when the user explicitly asks for a conversion, it bypasses and
    /// replaces the cached result.
    pub async fn file_for_preview(
        &self,
        file: &MediaFile,
        force_convert: bool,
    ) -> Result<SourceDescriptor, MediaSDKError> {
        self.session()?.file_for_preview(file, force_convert).await
    }

    /// The file's plaintext. Served from the cached original when there is one, otherwise
    /// downloaded without caching the result.
    pub async fn file_stream(&self, file: &MediaFile) -> Result<DecryptedFileStream, MediaSDKError> {
        self.session()?.file_stream(file).await
    }

    pub async fn file_blob(&self, file: &MediaFile) -> Result<Bytes, MediaSDKError> {
        self.file_stream(file).await?.collect().await
    }

    pub fn progress(&self) -> Result<Arc<ProgressTracker>, MediaSDKError> {
        Ok(self.session()?.progress.clone())
    }

    pub fn blobs(&self) -> Result<Arc<BlobRegistry>, MediaSDKError> {
        Ok(self.session()?.blobs.clone())
    }

    pub fn video_queue_len(&self) -> Result<usize, MediaSDKError> {
        Ok(self.session()?.video_queue.len())
    }

    pub fn is_processing_videos(&self) -> Result<bool, MediaSDKError> {
        Ok(self.session()?.video_queue.is_processing())
    }

    pub async fn hls_playlist_data(
        &self,
        file: &MediaFile,
        file_data: &dyn FileDataClient,
    ) -> Result<Option<HLSPlaylistData>, MediaSDKError> {
        let session = self.session()?;
        hls_playlist_data_for_file(file_data, session.crypto.as_ref(), file).await
    }
}

#[uniffi::export(async_runtime = "tokio")]
impl DownloadManager {
    #[uniffi::constructor]
    pub fn new(config: DownloadManagerConfig) -> Self {
        DownloadManagerBuilder::new(config).build()
    }

    /// Starts a session. With a token the signed in transport is used, without one the public
    /// link transport. Calling it again while initialized does nothing.
    pub async fn init(&self, token: Option<String>) -> Result<(), MediaSDKError> {
        if self.is_initialized() {
            info!("DownloadManager already initialized");
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let client = (self.client_factory)(token, &self.config, cancel.clone())?;
        let thumbnail_cache = self.open_thumbnail_cache().await;

        let session = Arc::new(DownloadSession {
            client,
            crypto: self.crypto.clone(),
            converter: self.converter.clone(),
            thumbnail_cache,
            is_desktop: self.config.is_desktop,
            thumbnail_urls: CoalescingCache::new(),
            file_urls: CoalescingCache::new(),
            file_conversions: CoalescingCache::new(),
            progress: Arc::new(ProgressTracker::new()),
            blobs: Arc::new(BlobRegistry::new()),
            video_queue: VideoProcessingQueue::new(
                self.video_processor.clone(),
                QueueOptions {
                    enabled: self.config.video_processing_enabled,
                    is_desktop: self.config.is_desktop,
                    capacity: self.config.backfill_queue_capacity as usize,
                },
                cancel.clone(),
            ),
            cancel,
        });

        let mut current = self.session.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if current.is_some() {
            // Lost a race against a concurrent init.
            session.shutdown();
            return Ok(());
        }
        *current = Some(session);
        Ok(())
    }

    /// Ends the session. In flight work is cancelled and everything cached is dropped.
    pub fn reset(&self) {
        let session = self
            .session
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(session) = session {
            session.shutdown();
        }
    }

    /// Swaps the transport's credentials, caches are kept.
    pub fn update_credentials(&self, token: String, password_token: Option<String>) -> Result<(), MediaSDKError> {
        self.session()?.client.update_tokens(token, password_token);
        Ok(())
    }

    pub async fn get_thumbnail(&self, file: MediaFile, cached_only: bool) -> Result<Option<Vec<u8>>, MediaSDKError> {
        Ok(self.thumbnail_data(&file, cached_only).await?.map(|data| data.to_vec()))
    }

    pub async fn get_renderable_thumbnail_url(
        &self,
        file: MediaFile,
        cached_only: bool,
    ) -> Result<Option<String>, MediaSDKError> {
        self.renderable_thumbnail_url(&file, cached_only).await
    }

    pub async fn get_file_for_preview(
        &self,
        file: MediaFile,
        force_convert: bool,
    ) -> Result<SourceDescriptor, MediaSDKError> {
        self.file_for_preview(&file, force_convert).await
    }

    pub async fn get_file_stream(&self, file: MediaFile) -> Result<Arc<DecryptedFileStream>, MediaSDKError> {
        Ok(Arc::new(self.file_stream(&file).await?))
    }

    pub async fn get_file_blob(&self, file: MediaFile) -> Result<Vec<u8>, MediaSDKError> {
        Ok(self.file_blob(&file).await?.to_vec())
    }

    pub fn blob_registry(&self) -> Result<Arc<BlobRegistry>, MediaSDKError> {
        self.blobs()
    }

    pub fn download_progress(&self) -> Result<HashMap<i64, u8>, MediaSDKError> {
        Ok((*self.session()?.progress.snapshot()).clone())
    }

    pub fn subscribe_progress(
        &self,
        observer: Arc<dyn ProgressObserver>,
    ) -> Result<Arc<ProgressSubscription>, MediaSDKError> {
        Ok(Arc::new(self.session()?.progress.subscribe_observer(observer)))
    }

    /// Hands a just uploaded video to background processing, if the backlog allows.
    pub fn process_video_new_upload(
        &self,
        file: MediaFile,
        upload_item: UploadItem,
    ) -> Result<OfferOutcome, MediaSDKError> {
        self.session()?.video_queue.offer(file, upload_item)
    }
}
