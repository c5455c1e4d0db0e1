use std::{future::Future, pin::Pin, time::Duration};

use bytes::{Bytes, BytesMut};
use futures::{Stream, TryStreamExt};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::MediaSDKError;

/// Ciphertext as it arrives from the network.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, MediaSDKError>> + Send>>;

pub struct FileStreamResponse {
    /// Value of the Content-Length header, if the server sent a usable one.
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

pub type OnDownloadProgress<'a> = &'a (dyn Fn(u64, u64) + Send + Sync);

/*
Runs `operation` until it succeeds, fails with an error that is not worth retrying, or runs out of
attempts. There is one attempt more than there are delays. Cancelling the token aborts both the
attempt in flight and the wait before the next one.
*/
pub async fn retry_async_operation<T, F, Fut>(
    delays: &[Duration],
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, MediaSDKError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, MediaSDKError>>,
{
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(MediaSDKError::Cancelled);
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(MediaSDKError::Cancelled),
            result = operation() => result,
        };

        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) => err,
        };

        let Some(delay) = delays.get(attempt) else {
            return Err(err);
        };
        attempt += 1;
        warn!(attempt, error = %err, "Request failed, retrying in {:?}", delay);

        tokio::select! {
            _ = cancel.cancelled() => return Err(MediaSDKError::Cancelled),
            _ = tokio::time::sleep(*delay) => {}
        }
    }
}

/// Sends the request and turns non success statuses into errors carrying the status.
pub async fn send_request(request: reqwest::RequestBuilder) -> Result<reqwest::Response, MediaSDKError> {
    let response = request.send().await?;
    Ok(response.error_for_status()?)
}

pub async fn download_into_memory(request: reqwest::RequestBuilder) -> Result<Bytes, MediaSDKError> {
    let response = send_request(request).await?;
    Ok(response.bytes().await?)
}

/// Collects the body while reporting bytes loaded against the declared length (0 if unknown).
pub async fn download_with_progress(
    request: reqwest::RequestBuilder,
    on_progress: OnDownloadProgress<'_>,
) -> Result<Bytes, MediaSDKError> {
    let mut response = send_request(request).await?;
    let total = response.content_length().unwrap_or(0);

    let mut data = BytesMut::with_capacity(total as usize);
    while let Some(chunk) = response.chunk().await? {
        data.extend_from_slice(&chunk);
        on_progress(data.len() as u64, total);
    }

    Ok(data.freeze())
}

pub async fn download_streamed(request: reqwest::RequestBuilder) -> Result<FileStreamResponse, MediaSDKError> {
    let response = send_request(request).await?;
    let content_length = response.content_length().filter(|len| *len > 0);

    Ok(FileStreamResponse {
        content_length,
        body: Box::pin(response.bytes_stream().map_err(MediaSDKError::from)),
    })
}
