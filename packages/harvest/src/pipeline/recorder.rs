//! Background usage recorder.
//!
//! Failure-path usage records are written off the request path so a
//! cancelled or failed request still leaves its zero-charge record behind.
//! The recorder owns its cancellation token; cancelling a request never
//! touches it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::RecorderConfig;
use crate::traits::store::UsageStore;
use crate::types::{UsageInsight, UsageRecord};

/// A usage record and its optional insight.
#[derive(Debug, Clone)]
pub struct UsageEntry {
    pub record: UsageRecord,
    pub insight: Option<UsageInsight>,
}

/// Bounded queue in front of the usage store.
///
/// When the queue is full the entry is dropped, counted and logged at
/// error level; submitting never blocks the caller.
pub struct UsageRecorder {
    tx: mpsc::Sender<UsageEntry>,
    dropped: Arc<AtomicU64>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl UsageRecorder {
    /// Start the writer task. Must be called within a Tokio runtime.
    pub fn spawn(store: Arc<dyn UsageStore>, config: RecorderConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_writer(store, rx, cancel.clone()));

        Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
            cancel,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Queue an entry. Returns false if it was dropped.
    pub fn submit(&self, entry: UsageEntry) -> bool {
        match self.tx.try_send(entry) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(entry)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                error!(
                    usage_id = %entry.record.id,
                    user_id = %entry.record.user_id,
                    dropped,
                    "Usage queue full; dropping usage record"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(entry)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                error!(
                    usage_id = %entry.record.id,
                    user_id = %entry.record.user_id,
                    "Usage recorder stopped; dropping usage record"
                );
                false
            }
        }
    }

    /// Entries dropped because the queue was full or closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop accepting entries and wait until everything queued is written.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Usage recorder task failed");
            }
        }
    }
}

async fn run_writer(
    store: Arc<dyn UsageStore>,
    mut rx: mpsc::Receiver<UsageEntry>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            entry = rx.recv() => match entry {
                Some(entry) => write_entry(store.as_ref(), entry).await,
                None => break,
            },
            _ = cancel.cancelled() => {
                rx.close();
                while let Some(entry) = rx.recv().await {
                    write_entry(store.as_ref(), entry).await;
                }
                break;
            }
        }
    }
    debug!("Usage recorder stopped");
}

async fn write_entry(store: &dyn UsageStore, entry: UsageEntry) {
    if let Err(e) = store.record_usage(&entry.record).await {
        error!(usage_id = %entry.record.id, error = %e, "Failed to write usage record");
        return;
    }
    if let Some(insight) = entry.insight {
        if let Err(e) = store.record_insight(&insight).await {
            warn!(usage_id = %insight.usage_id, error = %e, "Failed to write usage insight");
        }
    }
}
