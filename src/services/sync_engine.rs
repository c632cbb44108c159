//! src/services/sync_engine.rs
//!
//! Bounded-concurrency object copier. A `SyncManager` owns a fixed pool of
//! workers pulling from a bounded queue; `send` applies backpressure once every
//! worker is busy and the queue is full. Callers close the queue, then
//! `wait_done` until every sent object has been copied or has failed.

use crate::services::object_store::{ObjectStore, ObjectStoreError};
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};
use thiserror::Error;
use tokio::{
    sync::{Notify, mpsc},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("sync queue is closed")]
    Closed,
    #[error("sync was cancelled")]
    Cancelled,
    #[error("read from source failed: {0}")]
    Source(ObjectStoreError),
    #[error("write to target failed: {0}")]
    Target(ObjectStoreError),
}

pub type SyncResult<T> = Result<T, SyncError>;

/// One object queued for copying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncObject {
    pub key: String,
    pub size: i64,
}

#[derive(Debug, Clone)]
pub struct SyncFailure {
    pub key: String,
    pub error: String,
}

/// Per-object outcomes observed so far.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub succeeded: usize,
    pub failed: Vec<SyncFailure>,
}

impl SyncReport {
    pub fn processed(&self) -> usize {
        self.succeeded + self.failed.len()
    }
}

struct Inner {
    source: Arc<dyn ObjectStore>,
    source_bucket: String,
    target: Arc<dyn ObjectStore>,
    target_bucket: String,
    rx: tokio::sync::Mutex<mpsc::Receiver<SyncObject>>,
    pending: AtomicUsize,
    done: Notify,
    report: Mutex<SyncReport>,
    cancel: CancellationToken,
}

impl Inner {
    async fn copy(&self, object: &SyncObject) -> SyncResult<()> {
        let body = self
            .source
            .get_object(&self.source_bucket, &object.key)
            .await
            .map_err(SyncError::Source)?;
        self.target
            .put_object(&self.target_bucket, &object.key, body, object.size)
            .await
            .map_err(SyncError::Target)
    }

    fn record(&self, key: String, result: SyncResult<()>) {
        if let Ok(mut report) = self.report.lock() {
            match result {
                Ok(()) => report.succeeded += 1,
                Err(err) => {
                    warn!(key = %key, error = %err, "object sync failed");
                    report.failed.push(SyncFailure {
                        key,
                        error: err.to_string(),
                    });
                }
            }
        }
    }

    fn finish_one(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.done.notify_waiters();
        }
    }

    async fn next(&self) -> Option<SyncObject> {
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            item = async { self.rx.lock().await.recv().await } => item,
        }
    }

    async fn run_worker(self: Arc<Self>, worker: usize) {
        while let Some(object) = self.next().await {
            let result = tokio::select! {
                _ = self.cancel.cancelled() => Err(SyncError::Cancelled),
                result = self.copy(&object) => result,
            };
            self.record(object.key, result);
            self.finish_one();
        }
        debug!(worker, "sync worker stopped");
    }
}

/// Copies objects from a source bucket to a target bucket with at most
/// `limit` copies in flight.
pub struct SyncManager {
    limit: usize,
    inner: Arc<Inner>,
    tx: Mutex<Option<mpsc::Sender<SyncObject>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncManager {
    /// A `limit` of zero is treated as one.
    pub fn new(
        limit: usize,
        source: Arc<dyn ObjectStore>,
        source_bucket: impl Into<String>,
        target: Arc<dyn ObjectStore>,
        target_bucket: impl Into<String>,
    ) -> Self {
        Self::with_cancellation(
            limit,
            source,
            source_bucket,
            target,
            target_bucket,
            CancellationToken::new(),
        )
    }

    /// Like [`SyncManager::new`], stopping when `cancel` fires.
    pub fn with_cancellation(
        limit: usize,
        source: Arc<dyn ObjectStore>,
        source_bucket: impl Into<String>,
        target: Arc<dyn ObjectStore>,
        target_bucket: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        let limit = limit.max(1);
        let (tx, rx) = mpsc::channel(limit);
        Self {
            limit,
            inner: Arc::new(Inner {
                source,
                source_bucket: source_bucket.into(),
                target,
                target_bucket: target_bucket.into(),
                rx: tokio::sync::Mutex::new(rx),
                pending: AtomicUsize::new(0),
                done: Notify::new(),
                report: Mutex::new(SyncReport::default()),
                cancel,
            }),
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Spawn the worker pool. Calling it again is a no-op.
    pub fn start(&self) {
        let Ok(mut workers) = self.workers.lock() else {
            return;
        };
        if !workers.is_empty() {
            return;
        }
        for worker in 0..self.limit {
            workers.push(tokio::spawn(self.inner.clone().run_worker(worker)));
        }
    }

    /// Queue one object, waiting while the queue is full.
    pub async fn send(&self, object: SyncObject) -> SyncResult<()> {
        let tx = self
            .tx
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
            .ok_or(SyncError::Closed)?;

        self.inner.pending.fetch_add(1, Ordering::AcqRel);
        let outcome = tokio::select! {
            _ = self.inner.cancel.cancelled() => Err(SyncError::Cancelled),
            sent = tx.send(object) => sent.map_err(|_| SyncError::Closed),
        };
        if outcome.is_err() {
            self.inner.finish_one();
        }
        outcome
    }

    /// Close the queue. Workers drain what is queued, then stop.
    pub fn close(&self) {
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
    }

    /// Stop every worker. In-flight copies are abandoned, not rolled back.
    pub fn interrupt(&self) {
        self.inner.cancel.cancel();
    }

    pub fn is_interrupted(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Wait until every sent object has been processed (or the sync was
    /// interrupted) and return the outcomes.
    pub async fn wait_done(&self) -> SyncReport {
        loop {
            let notified = self.inner.done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.pending.load(Ordering::Acquire) == 0 {
                break;
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = self.inner.cancel.cancelled() => break,
            }
        }
        self.report()
    }

    /// Snapshot of the outcomes so far.
    pub fn report(&self) -> SyncReport {
        self.inner
            .report
            .lock()
            .map(|report| report.clone())
            .unwrap_or_default()
    }
}

impl Drop for SyncManager {
    fn drop(&mut self) {
        self.close();
    }
}
