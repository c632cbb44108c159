//! src/services/import_pipeline.rs
//!
//! Imports an external S3 bucket into the local store, one job per sweep.
//! Objects already present in the target with the same size are skipped, so
//! a job left partially imported simply continues on the next sweep.

use crate::models::{
    import::S3ImportJob,
    status::ImportStatus,
};
use crate::services::{
    object_store::{ObjectStore, ObjectStoreConnector, ObjectStoreError, S3Endpoint},
    record_store::{RecordStore, StoreError},
    sync_engine::{SyncError, SyncManager, SyncObject, SyncReport},
};
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

#[derive(Debug, Error)]
pub enum ImportError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    ObjectStore(#[from] ObjectStoreError),
    #[error(transparent)]
    Sync(#[from] SyncError),
}

pub type ImportResult<T> = Result<T, ImportError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportOutcome {
    /// No job waiting.
    Idle,
    /// The source bucket does not exist; the job is marked failed.
    SourceMissing { job_id: i64 },
    /// Shutdown interrupted the copy; the job stays `importing`.
    Interrupted { job_id: i64 },
    Finished {
        job_id: i64,
        /// `Imported`, `Failed`, or `Importing` when only some objects copied.
        status: ImportStatus,
        copied: usize,
        skipped: usize,
        failed: usize,
    },
}

/// Percentage of `sent` out of `total` bytes; an empty bucket is complete.
fn progress_percent(sent: i64, total: i64) -> i32 {
    if total <= 0 {
        return 100;
    }
    ((sent as i128 * 100) / total as i128).clamp(0, 100) as i32
}

pub struct ImportPipeline {
    store: Arc<dyn RecordStore>,
    target: Arc<dyn ObjectStore>,
    connector: Arc<dyn ObjectStoreConnector>,
    sync_limit: usize,
    /// Set until the first sweep, which also resumes a job left `importing`.
    restart: AtomicBool,
    cancel: CancellationToken,
}

impl ImportPipeline {
    pub fn new(
        store: Arc<dyn RecordStore>,
        target: Arc<dyn ObjectStore>,
        connector: Arc<dyn ObjectStoreConnector>,
        sync_limit: usize,
    ) -> Self {
        Self {
            store,
            target,
            connector,
            sync_limit: sync_limit.max(1),
            restart: AtomicBool::new(true),
            cancel: CancellationToken::new(),
        }
    }

    /// Stop in-flight copies when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Pick the next job and import it.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> ImportResult<ImportOutcome> {
        let resume = self.restart.swap(false, Ordering::AcqRel);
        match self.store.next_import_job(resume).await? {
            Some(job) => self.import(&job).await,
            None => Ok(ImportOutcome::Idle),
        }
    }

    #[instrument(skip(self, job), fields(job_id = job.id, source = %job.bucket_name, target = %job.target_bucket))]
    pub async fn import(&self, job: &S3ImportJob) -> ImportResult<ImportOutcome> {
        let source = self
            .connector
            .connect(&S3Endpoint {
                endpoint: job.endpoint.clone(),
                access_key_id: job.access_key_id.clone(),
                secret_access_key: job.secret_access_key.clone(),
                region: job.location.clone(),
                secure: job.secure,
            })
            .await?;

        if !source.bucket_exists(&job.bucket_name).await? {
            let msg = format!("source bucket `{}` not found", job.bucket_name);
            warn!("{msg}");
            self.store
                .update_import_status(job.id, ImportStatus::Failed, &msg)
                .await?;
            return Ok(ImportOutcome::SourceMissing { job_id: job.id });
        }
        if !self.target.bucket_exists(&job.target_bucket).await? {
            self.target.make_bucket(&job.target_bucket).await?;
        }

        let present = self.target_snapshot(&job.target_bucket).await?;
        let objects = self.source_listing(source.as_ref(), &job.bucket_name).await?;

        if job.status != ImportStatus::Importing.code() {
            self.store
                .update_import_status(job.id, ImportStatus::Importing, "")
                .await?;
        }

        let manager = SyncManager::with_cancellation(
            self.sync_limit,
            source,
            job.bucket_name.clone(),
            self.target.clone(),
            job.target_bucket.clone(),
            self.cancel.child_token(),
        );
        manager.start();

        let total: i64 = objects.iter().map(|o| o.size).sum();
        let mut sent_bytes = 0;
        let mut progress = job.progress;
        let mut skipped = 0;

        for object in objects.iter() {
            sent_bytes += object.size;
            let pct = progress_percent(sent_bytes, total);
            if pct > progress {
                self.store.update_import_progress(job.id, pct).await?;
                progress = pct;
            }
            if present.get(&object.key) == Some(&object.size) {
                skipped += 1;
                continue;
            }
            if let Err(err) = manager.send(object.clone()).await {
                warn!(error = %err, "stopped queueing objects");
                break;
            }
        }
        manager.close();
        let report: SyncReport = manager.wait_done().await;

        if manager.is_interrupted() {
            return Ok(ImportOutcome::Interrupted { job_id: job.id });
        }

        let copied = report.succeeded;
        let failed = objects.len() - skipped - copied;
        let status = if failed == 0 {
            ImportStatus::Imported
        } else if copied + skipped == 0 {
            ImportStatus::Failed
        } else {
            ImportStatus::Importing
        };

        if status != ImportStatus::Importing {
            let msg = report
                .failed
                .first()
                .map(|f| format!("{failed} objects failed; first `{}`: {}", f.key, f.error))
                .unwrap_or_default();
            self.store.update_import_status(job.id, status, &msg).await?;
            self.store.update_import_progress(job.id, 100).await?;
        }
        info!(status = status.label(), copied, skipped, failed, "import sweep finished");

        Ok(ImportOutcome::Finished {
            job_id: job.id,
            status,
            copied,
            skipped,
            failed,
        })
    }

    async fn target_snapshot(&self, bucket: &str) -> ImportResult<HashMap<String, i64>> {
        let mut present = HashMap::new();
        for item in self.target.list_objects(bucket, "").await? {
            match item {
                Ok(info) => {
                    present.insert(info.key, info.size);
                }
                Err(err) => warn!(bucket, error = %err, "target listing incomplete"),
            }
        }
        Ok(present)
    }

    async fn source_listing(
        &self,
        source: &dyn ObjectStore,
        bucket: &str,
    ) -> ImportResult<Vec<SyncObject>> {
        let mut objects = Vec::new();
        for item in source.list_objects(bucket, "").await? {
            match item {
                Ok(info) => objects.push(SyncObject {
                    key: info.key,
                    size: info.size,
                }),
                Err(err) => warn!(bucket, error = %err, "skipping unlisted source object"),
            }
        }
        Ok(objects)
    }
}
