pub mod playlist;

pub use playlist::{hls_playlist_data_for_file, EncryptedBlob, FileDataClient, FileDataType, HLSPlaylistData};

use std::{
    any::Any,
    collections::VecDeque,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, MutexGuard},
};

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    error::MediaSDKError,
    file::{FileType, MediaFile},
};

/// The data of a file that was just uploaded, as the uploader still holds it.
#[derive(uniffi::Enum)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadItem {
    Path { path: String },
    Data { data: Vec<u8> },
}

#[derive(Debug, Clone)]
pub struct VideoProcessingItem {
    pub file: MediaFile,
    pub upload_item: UploadItem,
}

/// Generates the streaming variant of a new video.
#[async_trait::async_trait]
pub trait VideoProcessor: Send + Sync {
    async fn process(&self, item: VideoProcessingItem) -> Result<(), MediaSDKError>;
}

/// Placeholder processor for hosts without a streaming encoder, items are only logged.
pub struct LoggingVideoProcessor;

#[async_trait::async_trait]
impl VideoProcessor for LoggingVideoProcessor {
    async fn process(&self, item: VideoProcessingItem) -> Result<(), MediaSDKError> {
        debug!(file_id = item.file.id, "gen-hls");
        Ok(())
    }
}

#[derive(uniffi::Enum)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    Enqueued,
    /// Backlog full, the file is left for a later backfill.
    Dropped,
    /// Not a video, or processing is off.
    Ignored,
}

struct QueueState {
    items: VecDeque<VideoProcessingItem>,
    worker_active: bool,
    cancel: CancellationToken,
}

pub struct QueueOptions {
    pub enabled: bool,
    pub is_desktop: bool,
    pub capacity: usize,
}

/*
Bounded queue of new uploads waiting for video processing, drained by at most one worker.

Uploads do not wait for processing, so the queue sheds load instead of growing: holding on to
many large video blobs would exhaust memory. Whatever is dropped here gets picked up by a later
backfill. The queue and the worker flag live under one lock so the worker cannot exit while an
item it did not see is being added.
*/
pub struct VideoProcessingQueue {
    state: Arc<Mutex<QueueState>>,
    processor: Arc<dyn VideoProcessor>,
    options: QueueOptions,
    parent_cancel: CancellationToken,
}

impl VideoProcessingQueue {
    pub fn new(
        processor: Arc<dyn VideoProcessor>,
        options: QueueOptions,
        parent_cancel: CancellationToken,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState {
                items: VecDeque::new(),
                worker_active: false,
                cancel: parent_cancel.child_token(),
            })),
            processor,
            options,
            parent_cancel,
        }
    }

    /// Offers a new upload. Needs to be called from within a tokio runtime, which runs the
    /// worker.
    pub fn offer(&self, file: MediaFile, upload_item: UploadItem) -> Result<OfferOutcome, MediaSDKError> {
        // Processing large videos is only viable with the native encoder of the desktop app.
        if !self.options.enabled || !self.options.is_desktop {
            return Ok(OfferOutcome::Ignored);
        }
        if file.file_type != FileType::Video {
            return Ok(OfferOutcome::Ignored);
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|e| MediaSDKError::PreconditionFailed {
            reason: format!("Video processing needs a tokio runtime: {}", e),
        })?;

        let mut state = lock(&self.state);
        if state.items.len() >= self.options.capacity {
            info!(file_id = file.id, "Will process new video upload later (backlog too big)");
            return Ok(OfferOutcome::Dropped);
        }

        state.items.push_back(VideoProcessingItem { file, upload_item });

        if !state.worker_active {
            state.worker_active = true;
            runtime.spawn(run_worker(
                self.state.clone(),
                self.processor.clone(),
                state.cancel.clone(),
            ));
        }

        Ok(OfferOutcome::Enqueued)
    }

    pub fn is_processing(&self) -> bool {
        lock(&self.state).worker_active
    }

    pub fn len(&self) -> usize {
        lock(&self.state).items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops the worker and discards pending items. The queue stays usable.
    pub fn reset(&self) {
        let mut state = lock(&self.state);
        state.cancel.cancel();
        state.cancel = self.parent_cancel.child_token();
        state.items.clear();
        state.worker_active = false;
    }
}

/// Clears the worker flag if the worker goes away without draining the queue, so the next
/// offer starts a new one.
struct WorkerGuard {
    state: Arc<Mutex<QueueState>>,
    cancel: CancellationToken,
    armed: bool,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        // A reset swapped the token and owns the flag now.
        if self.armed && !self.cancel.is_cancelled() {
            lock(&self.state).worker_active = false;
        }
    }
}

async fn run_worker(
    state: Arc<Mutex<QueueState>>,
    processor: Arc<dyn VideoProcessor>,
    cancel: CancellationToken,
) {
    let mut guard = WorkerGuard {
        state: state.clone(),
        cancel: cancel.clone(),
        armed: true,
    };

    loop {
        let item = {
            let mut state = lock(&state);
            if cancel.is_cancelled() {
                return;
            }
            match state.items.pop_front() {
                Some(item) => item,
                None => {
                    state.worker_active = false;
                    guard.armed = false;
                    return;
                }
            }
        };

        let file_id = item.file.id;
        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            result = AssertUnwindSafe(processor.process(item)).catch_unwind() => {
                result.unwrap_or_else(|panic| Err(MediaSDKError::UnknownError {
                    err_str: format!("Video processor panicked: {}", panic_message(panic.as_ref())),
                }))
            }
        };

        // One failing video must not block the rest of the queue.
        if let Err(err) = result {
            error!(file_id, error = %err, "Video processing failed");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown cause"
    }
}

fn lock(state: &Mutex<QueueState>) -> MutexGuard<'_, QueueState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
