//! Memory-budgeted queue of blobs waiting to reach disk
//!
//! Accepted writes are served from memory while a background task persists
//! them. The budget slot is released when that task ends, whether it
//! succeeded, failed or panicked.

use crate::error::Result;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

#[derive(Debug)]
pub struct QueuedWrite {
    pub key: String,
    pub content_type: String,
    pub data: Bytes,
    pub created_at: DateTime<Utc>,
    /// Bytes charged against the queue budget
    pub buffer_size: u64,
}

impl QueuedWrite {
    pub fn new(key: impl Into<String>, content_type: impl Into<String>, data: Bytes) -> Self {
        let buffer_size = data.len() as u64;
        Self {
            key: key.into(),
            content_type: content_type.into(),
            data,
            created_at: Utc::now(),
            buffer_size,
        }
    }
}

#[derive(Debug)]
pub enum QueueResult {
    Enqueued,
    /// A write for the same key is already in flight
    AlreadyPresent(Arc<QueuedWrite>),
    QueueFull,
}

#[derive(Default)]
struct QueueState {
    writes: HashMap<String, Arc<QueuedWrite>>,
    queued_bytes: u64,
}

/// Returns a write's budget to the queue when dropped
struct QueueSlot {
    state: Arc<Mutex<QueueState>>,
    key: String,
    size: u64,
}

impl Drop for QueueSlot {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.writes.remove(&self.key);
        state.queued_bytes -= self.size;
    }
}

pub struct WriteQueue {
    state: Arc<Mutex<QueueState>>,
    max_bytes: u64,
    tasks: TaskTracker,
}

impl WriteQueue {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            max_bytes,
            tasks: TaskTracker::new(),
        }
    }

    /// Accept `write` and run `on_complete` for it in the background.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn queue<F, Fut>(&self, write: Arc<QueuedWrite>, on_complete: F) -> QueueResult
    where
        F: FnOnce(Arc<QueuedWrite>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let slot = {
            let mut state = self.state.lock();
            if let Some(existing) = state.writes.get(&write.key) {
                return QueueResult::AlreadyPresent(existing.clone());
            }
            if state.queued_bytes + write.buffer_size > self.max_bytes {
                debug!(
                    key = %write.key,
                    size = write.buffer_size,
                    queued = state.queued_bytes,
                    "Write queue full"
                );
                return QueueResult::QueueFull;
            }
            state.writes.insert(write.key.clone(), write.clone());
            state.queued_bytes += write.buffer_size;
            QueueSlot {
                state: self.state.clone(),
                key: write.key.clone(),
                size: write.buffer_size,
            }
        };

        self.tasks.spawn(async move {
            let _slot = slot;
            let key = write.key.clone();
            if let Err(e) = on_complete(write).await {
                warn!(key = %key, error = %e, "Queued write failed");
            }
        });

        QueueResult::Enqueued
    }

    pub fn get(&self, key: &str) -> Option<Arc<QueuedWrite>> {
        self.state.lock().writes.get(key).cloned()
    }

    pub fn queued_bytes(&self) -> u64 {
        self.state.lock().queued_bytes
    }

    pub fn len(&self) -> usize {
        self.state.lock().writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `task` on the writer tasks so [`await_all`](Self::await_all) covers it.
    /// It keeps running if the returned handle is dropped.
    pub fn track<Fut>(&self, task: Fut) -> JoinHandle<Fut::Output>
    where
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        self.tasks.spawn(task)
    }

    /// Wait until every write accepted so far has finished
    pub async fn await_all(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }
}
