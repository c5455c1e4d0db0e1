use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Weak},
};

/// File id to percentage (0-99) of its active download.
pub type ProgressState = HashMap<i64, u8>;

pub type ProgressListener = Arc<dyn Fn(&Arc<ProgressState>) + Send + Sync>;

struct Inner {
    snapshot: Arc<ProgressState>,
    listeners: Vec<(u64, ProgressListener)>,
    next_listener_id: u64,
}

/// Tracks the progress of streamed downloads so a UI can observe them.
///
/// Every mutation swaps in a fresh immutable snapshot, so a snapshot handed out earlier never
/// changes underneath its holder. Listeners are called synchronously, in the order they
/// subscribed, after each mutation.
pub struct ProgressTracker {
    inner: Mutex<Inner>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                snapshot: Arc::new(HashMap::new()),
                listeners: Vec::new(),
                next_listener_id: 0,
            }),
        }
    }

    pub fn subscribe(
        self: &Arc<Self>,
        listener: impl Fn(&Arc<ProgressState>) + Send + Sync + 'static,
    ) -> ProgressSubscription {
        let mut inner = self.lock();
        let id = inner.next_listener_id;
        inner.next_listener_id += 1;
        inner.listeners.push((id, Arc::new(listener)));

        ProgressSubscription {
            id,
            tracker: Arc::downgrade(self),
        }
    }

    pub fn snapshot(&self) -> Arc<ProgressState> {
        self.lock().snapshot.clone()
    }

    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    /// Returns a reporter bound to one file. `declared_size` is the fallback used whenever the
    /// transport does not know the total.
    pub fn reporter(self: &Arc<Self>, file_id: i64, declared_size: Option<u64>) -> ProgressReporter {
        ProgressReporter {
            tracker: self.clone(),
            file_id,
            declared_size: declared_size.filter(|s| *s > 0),
        }
    }

    pub(crate) fn set(&self, file_id: i64, loaded: u64, total: u64) {
        self.mutate(|progress| {
            if loaded >= total {
                progress.remove(&file_id);
            } else {
                // Rounded, but never 100 while bytes are still outstanding.
                let percent = ((loaded as f64 * 100.0) / total as f64).round().min(99.0);
                progress.insert(file_id, percent as u8);
            }
        });
    }

    pub fn clear(&self, file_id: i64) {
        if !self.lock().snapshot.contains_key(&file_id) {
            return;
        }
        self.mutate(|progress| {
            progress.remove(&file_id);
        });
    }

    pub(crate) fn clear_all(&self) {
        let mut inner = self.lock();
        inner.snapshot = Arc::new(HashMap::new());
        inner.listeners.clear();
    }

    fn mutate(&self, f: impl FnOnce(&mut ProgressState)) {
        let (snapshot, listeners) = {
            let mut inner = self.lock();
            let mut progress = (*inner.snapshot).clone();
            f(&mut progress);
            inner.snapshot = Arc::new(progress);

            let listeners: Vec<ProgressListener> =
                inner.listeners.iter().map(|(_, l)| l.clone()).collect();
            (inner.snapshot.clone(), listeners)
        };

        // Called outside the lock so a listener may read the snapshot or unsubscribe.
        for listener in listeners {
            listener(&snapshot);
        }
    }

    fn unsubscribe(&self, id: u64) {
        self.lock().listeners.retain(|(listener_id, _)| *listener_id != id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A listener panicking must not take progress tracking down with it.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Receives progress snapshots on the host side.
#[uniffi::export(with_foreign)]
pub trait ProgressObserver: Send + Sync {
    fn on_progress_changed(&self, progress: HashMap<i64, u8>);
}

impl ProgressTracker {
    pub fn subscribe_observer(self: &Arc<Self>, observer: Arc<dyn ProgressObserver>) -> ProgressSubscription {
        self.subscribe(move |snapshot| observer.on_progress_changed((**snapshot).clone()))
    }
}

#[derive(uniffi::Object)]
pub struct ProgressSubscription {
    id: u64,
    tracker: Weak<ProgressTracker>,
}

#[uniffi::export]
impl ProgressSubscription {
    /// Stops notifications. Calling it again, or after the tracker is gone, does nothing.
    pub fn unsubscribe(&self) {
        if let Some(tracker) = self.tracker.upgrade() {
            tracker.unsubscribe(self.id);
        }
    }
}

#[derive(Clone)]
pub struct ProgressReporter {
    tracker: Arc<ProgressTracker>,
    file_id: i64,
    declared_size: Option<u64>,
}

impl ProgressReporter {
    pub fn file_id(&self) -> i64 {
        self.file_id
    }

    /// Records `loaded` of `total` bytes. A zero total falls back to the declared size, and
    /// without either the update is dropped.
    pub fn report(&self, loaded: u64, total: u64) {
        let total = match (total, self.declared_size) {
            (0, Some(declared)) => declared,
            (0, None) => return,
            (total, _) => total,
        };
        self.tracker.set(self.file_id, loaded, total);
    }

    pub fn clear(&self) {
        self.tracker.clear(self.file_id);
    }
}
