#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::{Cursor, Write};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;
    use mediasdk::cache::{BlobCache, MemoryBlobCache};
    use mediasdk::convert::{MediaConverter, PassthroughConverter, Renderable, RenderableBlob};
    use mediasdk::crypto::{encrypt_stream_bytes, encrypt_whole, generate_rand_key, CHUNK_SIZE};
    use mediasdk::download::{SourceType, SourceURL};
    use mediasdk::httpclient::{DownloadClient, FileStreamResponse, OnDownloadProgress};
    use mediasdk::{BlobServer, BlobServerConfig, DownloadManager, DownloadManagerConfig, FileType, MediaFile, MediaSDKError};
    use test_context::test_context;
    use test_context::AsyncTestContext;

    struct StoredFile {
        thumbnail: Bytes,
        file: Bytes,
    }

    #[derive(Default)]
    struct MockClient {
        files: std::sync::Mutex<HashMap<i64, StoredFile>>,
        thumbnail_requests: AtomicUsize,
        file_requests: AtomicUsize,
        stream_requests: AtomicUsize,
    }

    impl MockClient {
        fn file(&self, id: i64) -> Result<Bytes, MediaSDKError> {
            self.files.lock().unwrap().get(&id).map(|f| f.file.clone()).ok_or(MediaSDKError::TransportError {
                err_str: "not found".to_string(),
                status: Some(404),
            })
        }
    }

    #[async_trait::async_trait]
    impl DownloadClient for MockClient {
        fn update_tokens(&self, _token: String, _password_token: Option<String>) {}

        async fn download_thumbnail(&self, file: &MediaFile) -> Result<Bytes, MediaSDKError> {
            self.thumbnail_requests.fetch_add(1, Ordering::SeqCst);
            let thumbnail = self.files.lock().unwrap().get(&file.id).map(|f| f.thumbnail.clone());
            thumbnail.ok_or(MediaSDKError::TransportError { err_str: "not found".to_string(), status: Some(404) })
        }

        async fn download_file(
            &self,
            file: &MediaFile,
            on_progress: OnDownloadProgress<'_>,
        ) -> Result<Bytes, MediaSDKError> {
            self.file_requests.fetch_add(1, Ordering::SeqCst);
            // Long enough for concurrent callers to pile up on the same key
            tokio::time::sleep(Duration::from_millis(20)).await;
            let data = self.file(file.id)?;
            let total = data.len() as u64;
            on_progress(total / 2, total);
            on_progress(total, total);
            Ok(data)
        }

        async fn download_file_stream(&self, file: &MediaFile) -> Result<FileStreamResponse, MediaSDKError> {
            self.stream_requests.fetch_add(1, Ordering::SeqCst);
            let data = self.file(file.id)?;
            let parts: Vec<Result<Bytes, MediaSDKError>> =
                data.chunks(64 * 1024).map(|part| Ok(Bytes::copy_from_slice(part))).collect();
            Ok(FileStreamResponse {
                content_length: Some(data.len() as u64),
                body: Box::pin(futures::stream::iter(parts)),
            })
        }
    }

    /// Passthrough that counts its calls and transcodes videos when forced.
    #[derive(Default)]
    struct CountingConverter {
        image_conversions: AtomicUsize,
        video_conversions: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl MediaConverter for CountingConverter {
        async fn renderable_image(&self, file_name: &str, data: Bytes) -> Result<Option<Renderable>, MediaSDKError> {
            self.image_conversions.fetch_add(1, Ordering::SeqCst);
            PassthroughConverter.renderable_image(file_name, data).await
        }

        async fn playable_video(
            &self,
            file_name: &str,
            data: Bytes,
            force: bool,
        ) -> Result<Option<Renderable>, MediaSDKError> {
            self.video_conversions.fetch_add(1, Ordering::SeqCst);
            if force {
                return Ok(Some(Renderable::Converted(RenderableBlob {
                    data: Bytes::from_static(b"transcoded"),
                    mime_type: Some("video/mp4".to_string()),
                })));
            }
            PassthroughConverter.playable_video(file_name, data, force).await
        }

        async fn decode_live_photo(
            &self,
            file_name: &str,
            data: Bytes,
        ) -> Result<mediasdk::convert::LivePhoto, MediaSDKError> {
            PassthroughConverter.decode_live_photo(file_name, data).await
        }
    }

    struct DownloadTestContext {
        manager: DownloadManager,
        client: Arc<MockClient>,
        converter: Arc<CountingConverter>,
        cache: Arc<MemoryBlobCache>,
    }

    impl DownloadTestContext {
        /// Encrypts `thumbnail` and `file` and makes them downloadable under a new file.
        fn add_file(&self, id: i64, file_type: FileType, title: &str, thumbnail: &[u8], file: &[u8]) -> MediaFile {
            let key = generate_rand_key().unwrap();
            let (thumbnail_header, thumbnail_ct) = encrypt_whole(thumbnail, &key).unwrap();
            let (file_header, file_ct) = encrypt_stream_bytes(file, &key, CHUNK_SIZE).unwrap();

            self.client.files.lock().unwrap().insert(
                id,
                StoredFile {
                    thumbnail: Bytes::from(thumbnail_ct),
                    file: Bytes::from(file_ct),
                },
            );

            MediaFile {
                id,
                file_type,
                title: title.to_string(),
                key: key.to_vec(),
                file_decryption_header: file_header,
                thumbnail_decryption_header: thumbnail_header,
                file_size: Some(file.len() as u64),
            }
        }
    }

    impl AsyncTestContext for DownloadTestContext {
        async fn setup() -> Self {
            let _ = tracing_subscriber::fmt().with_test_writer().try_init();

            let client = Arc::new(MockClient::default());
            let converter = Arc::new(CountingConverter::default());
            let cache = Arc::new(MemoryBlobCache::new());

            let config = DownloadManagerConfig {
                is_desktop: true,
                ..Default::default()
            };
            let factory_client = client.clone();
            let manager = DownloadManager::builder(config)
                .converter(converter.clone())
                .thumbnail_cache(cache.clone())
                .client_factory(move |_, _, _| Ok(factory_client.clone() as Arc<dyn DownloadClient>))
                .build();
            manager.init(Some("token".to_string())).await.unwrap();

            DownloadTestContext {
                manager,
                client,
                converter,
                cache,
            }
        }

        async fn teardown(self) {
            self.manager.reset();
            assert!(!self.manager.is_initialized());
        }
    }

    fn random_bytes(len: usize) -> Vec<u8> {
        (0..len).map(|_| rand::random::<u8>()).collect()
    }

    fn sha256(data: &[u8]) -> String {
        hex::encode(ring::digest::digest(&ring::digest::SHA256, data).as_ref())
    }

    fn live_photo_zip(image: &[u8], video: &[u8]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = zip::write::FileOptions::default();
        writer.start_file("IMG_0001.JPG", options).unwrap();
        writer.write_all(image).unwrap();
        writer.start_file("IMG_0001.MOV", options).unwrap();
        writer.write_all(video).unwrap();
        writer.finish().unwrap().into_inner()
    }

    #[test_context(DownloadTestContext)]
    #[tokio::test]
    async fn test_thumbnail_cached_only(ctx: &mut DownloadTestContext) {
        let file = ctx.add_file(1, FileType::Image, "a.jpg", b"thumbnail", b"original");

        // Nothing cached yet, and nothing fetched
        assert_eq!(ctx.manager.thumbnail_data(&file, true).await.unwrap(), None);
        assert_eq!(ctx.client.thumbnail_requests.load(Ordering::SeqCst), 0);

        let data = ctx.manager.thumbnail_data(&file, false).await.unwrap();
        assert_eq!(data, Some(Bytes::from_static(b"thumbnail")));
        assert_eq!(ctx.client.thumbnail_requests.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.cache.len(), 1);

        let data = ctx.manager.thumbnail_data(&file, true).await.unwrap();
        assert_eq!(data, Some(Bytes::from_static(b"thumbnail")));
        assert_eq!(ctx.client.thumbnail_requests.load(Ordering::SeqCst), 1);
    }

    #[test_context(DownloadTestContext)]
    #[tokio::test]
    async fn test_renderable_thumbnail_url(ctx: &mut DownloadTestContext) {
        let file = ctx.add_file(2, FileType::Image, "b.png", b"small", b"big");

        assert_eq!(ctx.manager.renderable_thumbnail_url(&file, true).await.unwrap(), None);

        // The `None` of the cached only call does not stick
        let url = ctx.manager.renderable_thumbnail_url(&file, false).await.unwrap().unwrap();
        assert!(url.starts_with("blob:"));
        assert_eq!(ctx.manager.blobs().unwrap().resolve(&url), Some(Bytes::from_static(b"small")));

        let again = ctx.manager.renderable_thumbnail_url(&file, true).await.unwrap();
        assert_eq!(again, Some(url));
        assert_eq!(ctx.client.thumbnail_requests.load(Ordering::SeqCst), 1);
    }

    #[test_context(DownloadTestContext)]
    #[tokio::test]
    async fn test_file_for_preview_is_coalesced(ctx: &mut DownloadTestContext) {
        let file = ctx.add_file(3, FileType::Image, "photo.jpg", b"t", b"jpeg bytes");

        let (a, b, c) = futures::join!(
            ctx.manager.file_for_preview(&file, false),
            ctx.manager.file_for_preview(&file, false),
            ctx.manager.file_for_preview(&file, false),
        );
        let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());

        assert_eq!(ctx.client.file_requests.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.converter.image_conversions.load(Ordering::SeqCst), 1);
        assert_eq!(a.normal_url(), b.normal_url());
        assert_eq!(b.normal_url(), c.normal_url());

        assert!(a.is_original);
        assert!(a.is_renderable);
        assert_eq!(a.mime_type.as_deref(), Some("image/jpeg"));
        let url = a.normal_url().unwrap();
        assert_eq!(ctx.manager.blobs().unwrap().resolve(url), Some(Bytes::from_static(b"jpeg bytes")));

        // Progress is gone once the download finished
        assert!(ctx.manager.download_progress().unwrap().is_empty());
    }

    #[test_context(DownloadTestContext)]
    #[tokio::test]
    async fn test_force_convert_replaces_cached_result(ctx: &mut DownloadTestContext) {
        let file = ctx.add_file(4, FileType::Video, "clip.mov", b"t", b"quicktime bytes");

        let original = ctx.manager.file_for_preview(&file, false).await.unwrap();
        assert!(original.is_original);
        assert!(original.can_force_convert);
        assert_eq!(original.mime_type.as_deref(), Some("video/quicktime"));

        let forced = ctx.manager.file_for_preview(&file, true).await.unwrap();
        assert!(!forced.is_original);
        assert!(!forced.can_force_convert);
        assert_eq!(forced.mime_type.as_deref(), Some("video/mp4"));
        let url = forced.normal_url().unwrap();
        assert_eq!(ctx.manager.blobs().unwrap().resolve(url), Some(Bytes::from_static(b"transcoded")));

        // The forced result is what later callers get
        let cached = ctx.manager.file_for_preview(&file, false).await.unwrap();
        assert_eq!(cached.normal_url(), forced.normal_url());
        assert_eq!(ctx.converter.video_conversions.load(Ordering::SeqCst), 2);

        // The original itself was only downloaded once
        assert_eq!(ctx.client.stream_requests.load(Ordering::SeqCst), 1);
    }

    #[test_context(DownloadTestContext)]
    #[tokio::test]
    async fn test_video_blob_is_streamed(ctx: &mut DownloadTestContext) {
        let plaintext = random_bytes(3 * CHUNK_SIZE + 12345);
        let file = ctx.add_file(5, FileType::Video, "long.mp4", b"t", &plaintext);

        let stream = ctx.manager.file_stream(&file).await.unwrap();
        let mut chunks = 0;
        let mut received = Vec::new();
        while let Some(chunk) = stream.chunk().await.unwrap() {
            assert!(chunk.len() <= CHUNK_SIZE);
            received.extend_from_slice(&chunk);
            chunks += 1;
        }

        assert_eq!(chunks, 4);
        assert_eq!(sha256(&received), sha256(&plaintext));
        assert_eq!(ctx.client.stream_requests.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.client.file_requests.load(Ordering::SeqCst), 0);
        assert!(ctx.manager.download_progress().unwrap().is_empty());

        // Streams are not memoized
        let blob = ctx.manager.file_blob(&file).await.unwrap();
        assert_eq!(sha256(&blob), sha256(&plaintext));
        assert_eq!(ctx.client.stream_requests.load(Ordering::SeqCst), 2);
    }

    #[test_context(DownloadTestContext)]
    #[tokio::test]
    async fn test_file_stream_reuses_preview_download(ctx: &mut DownloadTestContext) {
        let plaintext = random_bytes(CHUNK_SIZE + 1);
        let file = ctx.add_file(6, FileType::Image, "scan.png", b"t", &plaintext);

        ctx.manager.file_for_preview(&file, false).await.unwrap();
        let blob = ctx.manager.file_blob(&file).await.unwrap();

        assert_eq!(sha256(&blob), sha256(&plaintext));
        assert_eq!(ctx.client.file_requests.load(Ordering::SeqCst), 1);
    }

    #[test_context(DownloadTestContext)]
    #[tokio::test]
    async fn test_live_photo_components(ctx: &mut DownloadTestContext) {
        let archive = live_photo_zip(b"still", b"motion");
        let file = ctx.add_file(7, FileType::LivePhoto, "IMG_0001.HEIC", b"t", &archive);

        let descriptor = ctx.manager.file_for_preview(&file, false).await.unwrap();
        assert_eq!(descriptor.source_type, SourceType::LivePhoto);
        let SourceURL::LivePhoto { live_photo } = descriptor.url else {
            panic!("expected a live photo source");
        };

        let blobs = ctx.manager.blobs().unwrap();
        let image = live_photo.image().await.unwrap();
        let video = live_photo.video().await.unwrap();
        assert_eq!(blobs.resolve(&image), Some(Bytes::from_static(b"still")));
        assert_eq!(blobs.resolve(&video), Some(Bytes::from_static(b"motion")));
        assert_eq!(blobs.mime_type(video.clone()).as_deref(), Some("video/quicktime"));

        // Components are resolved once
        assert_eq!(live_photo.image().await, Some(image));
        assert_eq!(ctx.converter.image_conversions.load(Ordering::SeqCst), 1);
    }

    #[test_context(DownloadTestContext)]
    #[tokio::test]
    async fn test_missing_file_is_not_cached(ctx: &mut DownloadTestContext) {
        let file = ctx.add_file(8, FileType::Image, "gone.jpg", b"t", b"data");
        ctx.client.files.lock().unwrap().clear();

        let err = ctx.manager.file_for_preview(&file, false).await.unwrap_err();
        assert!(matches!(err, MediaSDKError::TransportError { status: Some(404), .. }));

        // A failure is evicted, the next call downloads again
        let _ = ctx.manager.file_for_preview(&file, false).await;
        assert_eq!(ctx.client.file_requests.load(Ordering::SeqCst), 2);
    }

    #[test_context(DownloadTestContext)]
    #[tokio::test]
    async fn test_preview_served_over_http(ctx: &mut DownloadTestContext) {
        let plaintext = random_bytes(100_000);
        let file = ctx.add_file(9, FileType::Video, "clip.mp4", b"t", &plaintext);
        let descriptor = ctx.manager.file_for_preview(&file, false).await.unwrap();

        let server = BlobServer::new(ctx.manager.blobs().unwrap(), BlobServerConfig::default());
        server.start().await.unwrap();
        let url = server.http_url(descriptor.normal_url().unwrap().to_string()).unwrap();

        let response = reqwest::Client::new()
            .get(&url)
            .header("Range", "bytes=1000-1999")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 206);
        assert_eq!(response.headers()["content-type"], "video/mp4");
        assert_eq!(response.bytes().await.unwrap(), Bytes::copy_from_slice(&plaintext[1000..2000]));

        server.stop();
    }

    #[test_context(DownloadTestContext, skip_teardown)]
    #[tokio::test]
    async fn test_reset_drops_session(ctx: DownloadTestContext) {
        let file = ctx.add_file(10, FileType::Image, "a.jpg", b"thumbnail", b"original");
        let url = ctx.manager.renderable_thumbnail_url(&file, false).await.unwrap().unwrap();
        let blobs = ctx.manager.blobs().unwrap();

        ctx.manager.reset();

        assert!(blobs.resolve(&url).is_none());
        assert!(matches!(
            ctx.manager.thumbnail_data(&file, false).await,
            Err(MediaSDKError::PreconditionFailed { .. })
        ));
        assert!(matches!(ctx.manager.blobs(), Err(MediaSDKError::PreconditionFailed { .. })));

        // A new session starts empty but keeps the persistent thumbnail cache
        ctx.manager.init(Some("token".to_string())).await.unwrap();
        assert_eq!(ctx.manager.thumbnail_data(&file, true).await.unwrap(), Some(Bytes::from_static(b"thumbnail")));
        assert_eq!(ctx.client.thumbnail_requests.load(Ordering::SeqCst), 1);
        ctx.manager.reset();
    }

    #[tokio::test]
    async fn test_uninitialized_manager() {
        let manager = DownloadManager::new(DownloadManagerConfig::default());
        let file = MediaFile {
            id: 1,
            file_type: FileType::Image,
            title: "a.jpg".to_string(),
            key: vec![0; 32],
            file_decryption_header: vec![],
            thumbnail_decryption_header: vec![],
            file_size: None,
        };

        assert!(!manager.is_initialized());
        assert!(matches!(
            manager.file_blob(&file).await,
            Err(MediaSDKError::PreconditionFailed { .. })
        ));
        assert!(matches!(
            manager.file_for_preview(&file, false).await,
            Err(MediaSDKError::PreconditionFailed { .. })
        ));
        assert!(manager.download_progress().is_err());
        assert!(manager.update_credentials("t".to_string(), None).is_err());

        // Reset without a session is a no-op
        manager.reset();

        // Public link mode, init twice is harmless
        manager.init(None).await.unwrap();
        manager.init(None).await.unwrap();
        assert!(manager.is_initialized());
        manager.reset();
    }

    /// In-memory cache whose first read fails, like an entry that cannot be read back.
    #[derive(Default)]
    struct CorruptOnceCache {
        inner: MemoryBlobCache,
        failed: AtomicBool,
        writes: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl BlobCache for CorruptOnceCache {
        async fn get(&self, key: &str) -> Result<Option<Bytes>, MediaSDKError> {
            if !self.failed.swap(true, Ordering::SeqCst) {
                return Err(MediaSDKError::CacheError { err_str: "truncated entry".to_string() });
            }
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, data: Bytes) -> Result<(), MediaSDKError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.inner.put(key, data).await
        }
    }

    fn image_file(client: &MockClient, id: i64, thumbnail: &[u8]) -> MediaFile {
        let key = generate_rand_key().unwrap();
        let (header, ciphertext) = encrypt_whole(thumbnail, &key).unwrap();
        client.files.lock().unwrap().insert(
            id,
            StoredFile {
                thumbnail: Bytes::from(ciphertext),
                file: Bytes::new(),
            },
        );
        MediaFile {
            id,
            file_type: FileType::Image,
            title: "a.jpg".to_string(),
            key: key.to_vec(),
            file_decryption_header: vec![],
            thumbnail_decryption_header: header,
            file_size: None,
        }
    }

    #[tokio::test]
    async fn test_unreadable_cache_entry_is_refetched() {
        let client = Arc::new(MockClient::default());
        let cache = Arc::new(CorruptOnceCache::default());
        let file = image_file(&client, 1, b"fresh");
        cache.inner.put(&file.cache_key(), Bytes::from_static(b"stale")).await.unwrap();

        let factory_client = client.clone();
        let manager = DownloadManager::builder(DownloadManagerConfig::default())
            .thumbnail_cache(cache.clone())
            .client_factory(move |_, _, _| Ok(factory_client.clone() as Arc<dyn DownloadClient>))
            .build();
        manager.init(Some("token".to_string())).await.unwrap();

        let data = manager.thumbnail_data(&file, false).await.unwrap();
        assert_eq!(data, Some(Bytes::from_static(b"fresh")));
        assert_eq!(client.thumbnail_requests.load(Ordering::SeqCst), 1);
        assert_eq!(cache.writes.load(Ordering::SeqCst), 1);

        // The entry was overwritten and is served from the cache now
        let cached = manager.thumbnail_data(&file, true).await.unwrap();
        assert_eq!(cached, Some(Bytes::from_static(b"fresh")));
        assert_eq!(client.thumbnail_requests.load(Ordering::SeqCst), 1);
        manager.reset();
    }

    #[tokio::test]
    async fn test_init_survives_unusable_cache_dir() {
        // A regular file where the cache directory should go
        let blocker = std::env::temp_dir().join(format!("mediasdk-blocker-{}", uuid::Uuid::new_v4()));
        std::fs::write(&blocker, b"not a directory").unwrap();

        let client = Arc::new(MockClient::default());
        let file = image_file(&client, 2, b"thumb");
        let config = DownloadManagerConfig {
            thumbnail_cache_dir: Some(blocker.to_string_lossy().to_string()),
            ..Default::default()
        };
        let factory_client = client.clone();
        let manager = DownloadManager::builder(config)
            .client_factory(move |_, _, _| Ok(factory_client.clone() as Arc<dyn DownloadClient>))
            .build();

        manager.init(Some("token".to_string())).await.unwrap();
        assert!(manager.is_initialized());

        // Works without a persistent cache, nothing is remembered across calls
        assert_eq!(manager.thumbnail_data(&file, false).await.unwrap(), Some(Bytes::from_static(b"thumb")));
        assert_eq!(manager.thumbnail_data(&file, true).await.unwrap(), None);

        manager.reset();
        std::fs::remove_file(&blocker).unwrap();
    }
}
