use std::pin::Pin;

use bytes::{Bytes, BytesMut};
use futures::{lock::Mutex, Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    crypto::{DecryptionSession, MediaCrypto, CHUNK_SIZE},
    error::MediaSDKError,
    httpclient::{ByteStream, FileStreamResponse},
    progress::ProgressReporter,
};

/// Plaintext of a file, in the order it was encrypted.
pub type DecryptedByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, MediaSDKError>> + Send>>;

/*
Pull based decryption of a ciphertext stream.

Ciphertext is buffered until a full chunk is available, each pull decrypts and returns exactly one
chunk. Nothing more is read from upstream while a full chunk is buffered, so at most one chunk plus
one upstream read sits in memory. When upstream ends the remainder, if any, is decrypted as the
final and possibly shorter chunk.
*/
pub struct DecryptionPipeline {
    upstream: ByteStream,
    session: Option<Box<dyn DecryptionSession>>,
    chunk_size: usize,
    leftover: BytesMut,
    upstream_done: bool,
    finished: bool,
    downloaded: u64,
    content_length: u64,
    progress: Option<ProgressReporter>,
    cancel: CancellationToken,
}

impl DecryptionPipeline {
    /// The session is derived here, before anything is pulled, so a bad header or key fails
    /// without touching the network body.
    pub fn new(
        crypto: &dyn MediaCrypto,
        header: &[u8],
        key: &[u8],
        response: FileStreamResponse,
        progress: Option<ProgressReporter>,
        cancel: CancellationToken,
    ) -> Result<Self, MediaSDKError> {
        let session = crypto.init_stream_decryption(header, key)?;
        Ok(Self::with_session(session, response, progress, cancel))
    }

    pub fn with_session(
        session: Box<dyn DecryptionSession>,
        response: FileStreamResponse,
        progress: Option<ProgressReporter>,
        cancel: CancellationToken,
    ) -> Self {
        let chunk_size = session.chunk_size().max(1);
        Self {
            upstream: response.body,
            session: Some(session),
            chunk_size,
            leftover: BytesMut::new(),
            upstream_done: false,
            finished: false,
            downloaded: 0,
            content_length: response.content_length.unwrap_or(0),
            progress,
            cancel,
        }
    }

    /// Next plaintext chunk, `None` once the stream is complete. After an error the pipeline is
    /// finished and keeps returning `None`.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, MediaSDKError> {
        loop {
            if self.finished {
                return Ok(None);
            }

            if self.leftover.len() >= self.chunk_size {
                let chunk = self.leftover.split_to(self.chunk_size);
                return self.decrypt(&chunk).map(Some);
            }

            if self.upstream_done {
                let remainder = self.leftover.split();
                let last = if remainder.is_empty() {
                    Ok(None)
                } else {
                    self.decrypt(&remainder).map(Some)
                };
                self.finish();
                return last;
            }

            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Some(Err(MediaSDKError::Cancelled)),
                next = self.upstream.next() => next,
            };

            match next {
                Some(Ok(data)) => {
                    self.downloaded += data.len() as u64;
                    if let Some(progress) = &self.progress {
                        progress.report(self.downloaded, self.content_length);
                    }
                    self.leftover.extend_from_slice(&data);
                }
                Some(Err(err)) => return Err(self.fail(err)),
                None => self.upstream_done = true,
            }
        }
    }

    /// Bytes received but not decrypted yet.
    pub fn buffered_len(&self) -> usize {
        self.leftover.len()
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded
    }

    pub fn into_stream(mut self) -> DecryptedByteStream {
        Box::pin(async_stream::stream! {
            loop {
                match self.next_chunk().await {
                    Ok(Some(chunk)) => yield Ok(chunk),
                    Ok(None) => break,
                    Err(err) => {
                        yield Err(err);
                        break;
                    }
                }
            }
        })
    }

    fn decrypt(&mut self, chunk: &[u8]) -> Result<Bytes, MediaSDKError> {
        let Some(session) = self.session.as_mut() else {
            return Err(self.fail(MediaSDKError::StreamEnded));
        };
        match session.decrypt_chunk(chunk) {
            Ok(plaintext) => Ok(plaintext),
            Err(err) => Err(self.fail(err.into())),
        }
    }

    fn fail(&mut self, err: MediaSDKError) -> MediaSDKError {
        warn!(error = %err, downloaded = self.downloaded, "Streamed decryption failed");
        self.finish();
        err
    }

    fn finish(&mut self) {
        self.finished = true;
        self.session = None;
        self.leftover = BytesMut::new();
        if let Some(progress) = self.progress.take() {
            debug!(file_id = progress.file_id(), downloaded = self.downloaded, "Stream finished");
            progress.clear();
        }
    }
}

impl Drop for DecryptionPipeline {
    fn drop(&mut self) {
        // An abandoned stream is not in flight anymore.
        if let Some(progress) = self.progress.take() {
            progress.clear();
        }
    }
}

/// Serves already decrypted bytes through the same stream interface, in bounded slices.
pub fn bytes_stream(data: Bytes) -> DecryptedByteStream {
    let chunks: Vec<Result<Bytes, MediaSDKError>> = (0..data.len())
        .step_by(CHUNK_SIZE)
        .map(|start| Ok(data.slice(start..(start + CHUNK_SIZE).min(data.len()))))
        .collect();
    Box::pin(futures::stream::iter(chunks))
}

/// A file's plaintext for foreign callers, pulled one chunk at a time.
#[derive(uniffi::Object)]
pub struct DecryptedFileStream {
    internal_stream: Mutex<DecryptedByteStream>,
}

impl DecryptedFileStream {
    pub fn new(stream: DecryptedByteStream) -> Self {
        Self {
            internal_stream: Mutex::new(stream),
        }
    }

    pub fn from_pipeline(pipeline: DecryptionPipeline) -> Self {
        Self::new(pipeline.into_stream())
    }

    pub fn from_bytes(data: Bytes) -> Self {
        Self::new(bytes_stream(data))
    }

    pub async fn chunk(&self) -> Result<Option<Bytes>, MediaSDKError> {
        let mut stream = self.internal_stream.lock().await;
        stream.as_mut().next().await.transpose()
    }

    /// Drains the rest of the stream into one buffer.
    pub async fn collect(&self) -> Result<Bytes, MediaSDKError> {
        let mut data = BytesMut::new();
        while let Some(chunk) = self.chunk().await? {
            data.extend_from_slice(&chunk);
        }
        Ok(data.freeze())
    }
}

#[uniffi::export(async_runtime = "tokio")]
impl DecryptedFileStream {
    /// Next chunk of plaintext, `StreamEnded` once everything has been read.
    pub async fn next(&self) -> Result<Vec<u8>, MediaSDKError> {
        match self.chunk().await? {
            Some(chunk) => Ok(chunk.to_vec()),
            None => Err(MediaSDKError::StreamEnded),
        }
    }

    pub async fn read_all(&self) -> Result<Vec<u8>, MediaSDKError> {
        Ok(self.collect().await?.to_vec())
    }
}
