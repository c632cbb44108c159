//! src/services/backup_pipeline.rs
//!
//! Submits bucket objects to the deal network and reconciles the network's
//! slowly converging view back into local backup, slice and deal records.
//!
//! Failures are contained per unit of work: one bucket during a sweep, one
//! backup during reconciliation. They are logged and the sweep moves on; the
//! next scheduler tick retries naturally.

use crate::models::{
    backup::{
        BackupDealUpdate, NewBackupSlice, NewBackupSliceDeal, NewObjectBackup, NewObjectRemoval,
        ObjectBackup,
    },
    plan::BackupPlan,
    status::{DEAL_ACTIVE_CODE, DEAL_ACTIVE_STORAGE_STATUS},
};
use crate::services::{
    deal_client::{DealError, DealNetwork, FileDesc, FileData},
    download_token::{DownloadTokens, TokenError},
    object_store::{ObjectStore, ObjectStoreError},
    record_store::{RecordStore, StoreError},
    time_suffix,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, sync::Arc};
use thiserror::Error;
use tracing::{debug, error, info, instrument};

/// Backups polled per reconciliation page.
pub const RECONCILE_PAGE_SIZE: usize = 10;

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("no payment wallet is configured")]
    NoWallet,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    ObjectStore(#[from] ObjectStoreError),
    #[error(transparent)]
    Deal(#[from] DealError),
    #[error(transparent)]
    Token(#[from] TokenError),
}

pub type BackupResult<T> = Result<T, BackupError>;

/// What to back up, and the deal parameters to back it up with.
#[derive(Debug, Clone, Deserialize)]
pub struct BackupRequest {
    pub user_access_key: String,
    pub bucket: String,
    /// Object key; empty backs up the whole bucket as one directory payload.
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub provider_region: String,
    #[serde(default)]
    pub duration: i64,
    #[serde(default)]
    pub verified_deal: bool,
    #[serde(default)]
    pub fast_retrieval: bool,
    #[serde(default)]
    pub plan_id: i64,
    #[serde(default)]
    pub plan_name: String,
}

impl BackupRequest {
    /// Whole-bucket request carrying a plan's deal parameters.
    pub fn from_plan(plan: &BackupPlan, bucket: &str) -> Self {
        Self {
            user_access_key: plan.user_access_key.clone(),
            bucket: bucket.to_string(),
            object: String::new(),
            provider_region: plan.provider_region.clone(),
            duration: plan.duration,
            verified_deal: plan.verified_deal,
            fast_retrieval: plan.fast_retrieval,
            plan_id: plan.id,
            plan_name: plan.name.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub plans: usize,
    pub submitted: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub polled: usize,
    pub failed: usize,
}

/// `{bucket}-{name}-{YYYYmmddHHMMSS}`, `name` being the object's base name
/// or the bucket itself for a whole-bucket backup.
pub fn backup_name(bucket: &str, object: &str, at: DateTime<Utc>) -> String {
    format!("{bucket}-{}-{}", source_name(bucket, object), time_suffix(at))
}

/// Base name of the object, or the bucket name for a whole-bucket backup.
pub fn source_name<'a>(bucket: &'a str, object: &'a str) -> &'a str {
    object
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|n| !n.is_empty())
        .unwrap_or(bucket)
}

/// Miners holding an active deal for one slice.
fn active_miners(desc: &FileDesc) -> impl Iterator<Item = &str> {
    desc.deals
        .iter()
        .filter(|deal| deal.storage_status == DEAL_ACTIVE_STORAGE_STATUS)
        .map(|deal| deal.miner_fid.as_str())
}

pub struct BackupPipeline {
    store: Arc<dyn RecordStore>,
    objects: Arc<dyn ObjectStore>,
    network: Arc<dyn DealNetwork>,
    tokens: DownloadTokens,
    wallet: String,
}

impl BackupPipeline {
    pub fn new(
        store: Arc<dyn RecordStore>,
        objects: Arc<dyn ObjectStore>,
        network: Arc<dyn DealNetwork>,
        tokens: DownloadTokens,
        wallet: impl Into<String>,
    ) -> Self {
        Self {
            store,
            objects,
            network,
            tokens,
            wallet: wallet.into(),
        }
    }

    /// Submit every bucket of every enabled plan whose interval has elapsed.
    ///
    /// `last_at` is written before the plan's buckets are submitted, so a crash
    /// mid-sweep defers the remaining buckets to the next interval instead of
    /// re-submitting the ones already sent.
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> BackupResult<SweepSummary> {
        let now = Utc::now();
        let mut summary = SweepSummary::default();

        for plan in self.store.list_enabled_plans().await? {
            if !plan.is_due(now.timestamp()) {
                continue;
            }
            if let Err(err) = self.store.set_plan_last_run(plan.id, now.timestamp()).await {
                error!(plan_id = plan.id, error = %err, "failed to mark plan run, skipping");
                continue;
            }
            summary.plans += 1;

            for bucket in plan.buckets() {
                match self.submit(&BackupRequest::from_plan(&plan, bucket)).await {
                    Ok(backup) => {
                        summary.submitted += 1;
                        info!(plan_id = plan.id, bucket, backup_id = backup.id, "bucket submitted");
                    }
                    Err(err) => {
                        summary.failed += 1;
                        error!(plan_id = plan.id, bucket, error = %err, "bucket backup failed");
                    }
                }
            }
        }
        Ok(summary)
    }

    /// Submit one object (or a whole bucket) and record the backup.
    #[instrument(skip(self), fields(bucket = %request.bucket, object = %request.object))]
    pub async fn submit(&self, request: &BackupRequest) -> BackupResult<ObjectBackup> {
        if self.wallet.is_empty() {
            return Err(BackupError::NoWallet);
        }

        let stat = self
            .objects
            .stat_object(&request.bucket, &request.object)
            .await?;
        let download_url = self
            .tokens
            .download_url(&request.bucket, &request.object, stat.is_dir)?;
        let name = backup_name(&request.bucket, &request.object, Utc::now());

        let job_id = self
            .network
            .submit_backup(
                name,
                self.wallet.clone(),
                vec![FileData {
                    source_name: source_name(&request.bucket, &request.object).to_string(),
                    data_size: stat.size,
                    is_directory: stat.is_dir,
                    download_url: download_url.clone(),
                }],
            )
            .await?;

        let backup = self
            .store
            .create_backup(&NewObjectBackup {
                user_access_key: request.user_access_key.clone(),
                bucket_name: request.bucket.clone(),
                object_name: request.object.clone(),
                is_dir: stat.is_dir,
                size: stat.size,
                download_url,
                provider_region: request.provider_region.clone(),
                duration: request.duration,
                verified_deal: request.verified_deal,
                fast_retrieval: request.fast_retrieval,
                deal_job_id: job_id,
                plan_id: request.plan_id,
                plan_name: request.plan_name.clone(),
            })
            .await?;
        debug!(backup_id = backup.id, job_id, "backup recorded");
        Ok(backup)
    }

    /// Poll the network for every backup below the deal-active threshold,
    /// newest first, a page at a time.
    #[instrument(skip(self))]
    pub async fn reconcile(&self) -> BackupResult<ReconcileSummary> {
        let mut summary = ReconcileSummary::default();
        let mut before: Option<i64> = None;

        loop {
            let page = self
                .store
                .list_backups_below_status(DEAL_ACTIVE_CODE, before, RECONCILE_PAGE_SIZE)
                .await?;
            for backup in &page {
                summary.polled += 1;
                if let Err(err) = self.sync_backup(backup).await {
                    summary.failed += 1;
                    error!(backup_id = backup.id, error = %err, "backup reconciliation failed");
                }
                before = Some(backup.id);
            }
            if page.len() < RECONCILE_PAGE_SIZE {
                return Ok(summary);
            }
        }
    }

    /// Fold one network status report into the backup and its slices and deals.
    pub async fn sync_backup(&self, backup: &ObjectBackup) -> BackupResult<()> {
        if backup.deal_job_id == 0 {
            return Ok(());
        }
        let deal = self.network.backup_deal_status(backup.deal_job_id).await?;

        self.store
            .update_backup_deal(
                backup.id,
                &BackupDealUpdate {
                    status: deal.status,
                    status_msg: deal.dataset_status.clone(),
                    payload_cid: deal.payload_cid.clone(),
                    payload_url: deal.payload_url.clone(),
                },
            )
            .await?;

        let mut providers = BTreeSet::new();
        for desc in &deal.file_desc_list {
            providers.extend(active_miners(desc).map(str::to_string));
            if let Err(err) = self.sync_slice(backup.id, desc).await {
                error!(backup_id = backup.id, payload_cid = %desc.payload_cid, error = %err, "slice sync failed");
            }
        }

        if !providers.is_empty() {
            let joined = providers.into_iter().collect::<Vec<_>>().join(",");
            if joined != backup.providers {
                self.store.update_backup_providers(backup.id, &joined).await?;
            }
        }
        Ok(())
    }

    async fn sync_slice(&self, backup_id: i64, desc: &FileDesc) -> BackupResult<()> {
        let slice = match self.store.find_slice(backup_id, &desc.payload_cid).await? {
            Some(slice) => {
                if slice.payload_url != desc.car_file_url {
                    self.store
                        .update_slice_payload_url(slice.id, &desc.car_file_url)
                        .await?;
                }
                slice
            }
            None => {
                self.store
                    .create_slice(&NewBackupSlice {
                        backup_id,
                        file_name: desc.car_file_name.clone(),
                        size: desc.source_file_size,
                        payload_cid: desc.payload_cid.clone(),
                        payload_url: desc.car_file_url.clone(),
                    })
                    .await?
            }
        };

        for deal in &desc.deals {
            match self.store.find_slice_deal(slice.id, &deal.miner_fid).await? {
                Some(existing) => {
                    if existing.deal_id != deal.deal_id
                        || existing.deal_cid != deal.deal_cid
                        || existing.storage_status != deal.storage_status
                    {
                        self.store
                            .update_slice_deal(
                                existing.id,
                                deal.deal_id,
                                &deal.deal_cid,
                                &deal.storage_status,
                            )
                            .await?;
                    }
                }
                None => {
                    self.store
                        .create_slice_deal(&NewBackupSliceDeal {
                            slice_id: slice.id,
                            payload_cid: desc.payload_cid.clone(),
                            miner_id: deal.miner_fid.clone(),
                            deal_id: deal.deal_id,
                            deal_cid: deal.deal_cid.clone(),
                            storage_status: deal.storage_status.clone(),
                            cost: deal.cost.clone(),
                        })
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Keep an audit row for each deleted object, linked to its backup when
    /// one exists, so the payload stays recoverable.
    #[instrument(skip(self, objects), fields(count = objects.len()))]
    pub async fn record_removals(
        &self,
        user_access_key: &str,
        bucket: &str,
        objects: &[String],
    ) -> BackupResult<u64> {
        let mut removals = Vec::with_capacity(objects.len());
        for object in objects {
            let backup = self.store.find_backup_by_object(bucket, object).await?;
            let removal = match backup {
                Some(backup) => NewObjectRemoval {
                    user_access_key: user_access_key.to_string(),
                    bucket_name: bucket.to_string(),
                    object_name: object.clone(),
                    is_dir: backup.is_dir,
                    size: backup.size,
                    backup_id: backup.id,
                    payload_cid: backup.payload_cid,
                    payload_url: backup.payload_url,
                },
                None => NewObjectRemoval {
                    user_access_key: user_access_key.to_string(),
                    bucket_name: bucket.to_string(),
                    object_name: object.clone(),
                    is_dir: false,
                    size: 0,
                    backup_id: 0,
                    payload_cid: String::new(),
                    payload_url: String::new(),
                },
            };
            removals.push(removal);
        }
        Ok(self.store.create_removals(&removals).await?)
    }
}
