//! src/services/record_store.rs
//!
//! RecordStore: typed create / read / update / filtered-query operations over
//! plans, backups, slices, deals, removals, rebuilds and import jobs. The
//! pipelines only see the trait; `SqliteRecordStore` is the durable
//! implementation backed by a shared SQLite pool.

use crate::models::{
    backup::{
        BackupDealUpdate, BackupSlice, BackupSliceDeal, NewBackupSlice, NewBackupSliceDeal,
        NewObjectBackup, NewObjectRemoval, ObjectBackup, ObjectRemoval,
    },
    import::{NewS3ImportJob, S3ImportJob},
    plan::{BackupPlan, NewBackupPlan},
    rebuild::{NewObjectRebuild, ObjectRebuild, RebuildProgress},
    status::{ImportStatus, PlanStatus, RebuildStatus},
};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{
    QueryBuilder, SqlitePool,
    sqlite::{Sqlite, SqlitePoolOptions},
};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

const MIGRATION_SQL: &str = include_str!("../../migrations/0001_init.sql");

const PLAN_COLUMNS: &str = "id, user_access_key, name, bucket, interval_days, provider_region, \
     duration, verified_deal, fast_retrieval, status, last_at, created_at, updated_at";

const BACKUP_COLUMNS: &str = "id, user_access_key, bucket_name, object_name, is_dir, size, \
     download_url, provider_region, duration, verified_deal, fast_retrieval, payload_cid, \
     payload_url, deal_job_id, plan_id, plan_name, providers, status, status_msg, created_at, \
     updated_at";

const SLICE_COLUMNS: &str =
    "id, backup_id, file_name, size, payload_cid, payload_url, status, created_at, updated_at";

const DEAL_COLUMNS: &str = "id, slice_id, payload_cid, miner_id, deal_id, deal_cid, \
     storage_status, cost, status, created_at, updated_at";

const REMOVAL_COLUMNS: &str = "id, user_access_key, bucket_name, object_name, is_dir, size, \
     backup_id, payload_cid, payload_url, status, created_at, updated_at";

const REBUILD_COLUMNS: &str = "id, user_access_key, bucket_name, object_name, deal_job_id, \
     plan_id, plan_name, is_dir, size, backup_id, payload_cid, payload_url, providers, due_at, \
     status, created_at, updated_at";

const IMPORT_COLUMNS: &str = "id, user_access_key, access_key_id, secret_access_key, endpoint, \
     location, secure, bucket_name, target_bucket, status, status_msg, progress, created_at, \
     updated_at";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} `{id}` not found")]
    NotFound { entity: &'static str, id: i64 },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Record store contract used by every pipeline.
///
/// Updates are partial and not transactionally isolated across callers; the
/// pipelines guard concurrent work on the same row themselves.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Cheap connectivity probe.
    async fn ping(&self) -> StoreResult<()>;

    async fn create_plan(&self, plan: &NewBackupPlan) -> StoreResult<BackupPlan>;
    async fn get_plan(&self, id: i64) -> StoreResult<BackupPlan>;
    async fn list_plans(&self) -> StoreResult<Vec<BackupPlan>>;
    async fn list_enabled_plans(&self) -> StoreResult<Vec<BackupPlan>>;
    async fn set_plan_last_run(&self, id: i64, last_at: i64) -> StoreResult<()>;

    async fn create_backup(&self, backup: &NewObjectBackup) -> StoreResult<ObjectBackup>;
    async fn get_backup(&self, id: i64) -> StoreResult<ObjectBackup>;
    /// Most recent live backup of `bucket/object`, if any.
    async fn find_backup_by_object(
        &self,
        bucket: &str,
        object: &str,
    ) -> StoreResult<Option<ObjectBackup>>;
    /// One page of live backups with `status < status_below`, newest first,
    /// strictly older than `before_id` when given.
    async fn list_backups_below_status(
        &self,
        status_below: i32,
        before_id: Option<i64>,
        limit: usize,
    ) -> StoreResult<Vec<ObjectBackup>>;
    async fn update_backup_deal(&self, id: i64, update: &BackupDealUpdate) -> StoreResult<()>;
    async fn update_backup_providers(&self, id: i64, providers: &str) -> StoreResult<()>;
    async fn soft_delete_backup(&self, id: i64) -> StoreResult<()>;

    async fn find_slice(
        &self,
        backup_id: i64,
        payload_cid: &str,
    ) -> StoreResult<Option<BackupSlice>>;
    async fn create_slice(&self, slice: &NewBackupSlice) -> StoreResult<BackupSlice>;
    async fn update_slice_payload_url(&self, id: i64, payload_url: &str) -> StoreResult<()>;
    async fn list_slices(&self, backup_id: i64) -> StoreResult<Vec<BackupSlice>>;

    async fn find_slice_deal(
        &self,
        slice_id: i64,
        miner_id: &str,
    ) -> StoreResult<Option<BackupSliceDeal>>;
    async fn create_slice_deal(&self, deal: &NewBackupSliceDeal) -> StoreResult<BackupSliceDeal>;
    async fn update_slice_deal(
        &self,
        id: i64,
        deal_id: i64,
        deal_cid: &str,
        storage_status: &str,
    ) -> StoreResult<()>;
    async fn list_slice_deals(&self, slice_id: i64) -> StoreResult<Vec<BackupSliceDeal>>;

    async fn create_removals(&self, removals: &[NewObjectRemoval]) -> StoreResult<u64>;
    async fn list_removals(&self, bucket: &str) -> StoreResult<Vec<ObjectRemoval>>;

    async fn create_rebuild(&self, rebuild: &NewObjectRebuild) -> StoreResult<ObjectRebuild>;
    async fn get_rebuild(&self, id: i64) -> StoreResult<ObjectRebuild>;
    async fn list_rebuilds_below_status(
        &self,
        status_below: RebuildStatus,
        before_id: Option<i64>,
        limit: usize,
    ) -> StoreResult<Vec<ObjectRebuild>>;
    async fn update_rebuild_progress(&self, id: i64, progress: &RebuildProgress)
    -> StoreResult<()>;
    async fn update_rebuild_status(&self, id: i64, status: RebuildStatus) -> StoreResult<()>;

    async fn create_import_job(&self, job: &NewS3ImportJob) -> StoreResult<S3ImportJob>;
    async fn get_import_job(&self, id: i64) -> StoreResult<S3ImportJob>;
    /// Oldest `ready` job; with `include_importing`, an `importing` job wins.
    async fn next_import_job(&self, include_importing: bool) -> StoreResult<Option<S3ImportJob>>;
    async fn update_import_status(
        &self,
        id: i64,
        status: ImportStatus,
        status_msg: &str,
    ) -> StoreResult<()>;
    async fn update_import_progress(&self, id: i64, progress: i32) -> StoreResult<()>;
}

/// SQLite-backed [`RecordStore`].
#[derive(Clone)]
pub struct SqliteRecordStore {
    pub db: Arc<SqlitePool>,
}

impl SqliteRecordStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Private in-memory database pinned to one connection, schema applied.
    pub async fn in_memory() -> StoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self::new(Arc::new(pool));
        store.run_migrations().await?;
        Ok(store)
    }

    /// Apply the embedded schema. Every statement is idempotent.
    pub async fn run_migrations(&self) -> StoreResult<()> {
        let statements = MIGRATION_SQL
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();
        debug!("running {} migration statements", statements.len());
        for stmt in statements {
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    fn not_found(entity: &'static str, id: i64) -> impl FnOnce(sqlx::Error) -> StoreError {
        move |err| match err {
            sqlx::Error::RowNotFound => StoreError::NotFound { entity, id },
            other => StoreError::Sqlx(other),
        }
    }
}

/// Fails with NotFound when an update touched nothing.
fn ensure_touched(rows: u64, entity: &'static str, id: i64) -> StoreResult<()> {
    if rows == 0 {
        Err(StoreError::NotFound { entity, id })
    } else {
        Ok(())
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn ping(&self) -> StoreResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        Ok(())
    }

    async fn create_plan(&self, plan: &NewBackupPlan) -> StoreResult<BackupPlan> {
        let now = Utc::now();
        let row = sqlx::query_as::<_, BackupPlan>(&format!(
            "INSERT INTO backup_plans (
                user_access_key, name, bucket, interval_days, provider_region, duration,
                verified_deal, fast_retrieval, status, last_at, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
            RETURNING {PLAN_COLUMNS}"
        ))
        .bind(&plan.user_access_key)
        .bind(&plan.name)
        .bind(&plan.bucket)
        .bind(plan.interval_days)
        .bind(&plan.provider_region)
        .bind(plan.duration)
        .bind(plan.verified_deal)
        .bind(plan.fast_retrieval)
        .bind(PlanStatus::Enabled.code())
        .bind(now)
        .bind(now)
        .fetch_one(&*self.db)
        .await?;
        Ok(row)
    }

    async fn get_plan(&self, id: i64) -> StoreResult<BackupPlan> {
        sqlx::query_as::<_, BackupPlan>(&format!(
            "SELECT {PLAN_COLUMNS} FROM backup_plans WHERE id = ? AND deleted_at IS NULL"
        ))
        .bind(id)
        .fetch_one(&*self.db)
        .await
        .map_err(Self::not_found("plan", id))
    }

    async fn list_plans(&self) -> StoreResult<Vec<BackupPlan>> {
        let rows = sqlx::query_as::<_, BackupPlan>(&format!(
            "SELECT {PLAN_COLUMNS} FROM backup_plans WHERE deleted_at IS NULL ORDER BY id ASC"
        ))
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }

    async fn list_enabled_plans(&self) -> StoreResult<Vec<BackupPlan>> {
        let rows = sqlx::query_as::<_, BackupPlan>(&format!(
            "SELECT {PLAN_COLUMNS} FROM backup_plans
             WHERE status = ? AND deleted_at IS NULL ORDER BY id ASC"
        ))
        .bind(PlanStatus::Enabled.code())
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }

    async fn set_plan_last_run(&self, id: i64, last_at: i64) -> StoreResult<()> {
        let result = sqlx::query("UPDATE backup_plans SET last_at = ?, updated_at = ? WHERE id = ?")
            .bind(last_at)
            .bind(Utc::now())
            .bind(id)
            .execute(&*self.db)
            .await?;
        ensure_touched(result.rows_affected(), "plan", id)
    }

    async fn create_backup(&self, backup: &NewObjectBackup) -> StoreResult<ObjectBackup> {
        let now = Utc::now();
        let row = sqlx::query_as::<_, ObjectBackup>(&format!(
            "INSERT INTO bucket_object_backups (
                user_access_key, bucket_name, object_name, is_dir, size, download_url,
                provider_region, duration, verified_deal, fast_retrieval, deal_job_id,
                plan_id, plan_name, status, status_msg, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?)
            RETURNING {BACKUP_COLUMNS}"
        ))
        .bind(&backup.user_access_key)
        .bind(&backup.bucket_name)
        .bind(&backup.object_name)
        .bind(backup.is_dir)
        .bind(backup.size)
        .bind(&backup.download_url)
        .bind(&backup.provider_region)
        .bind(backup.duration)
        .bind(backup.verified_deal)
        .bind(backup.fast_retrieval)
        .bind(backup.deal_job_id)
        .bind(backup.plan_id)
        .bind(&backup.plan_name)
        .bind(crate::models::status::BACKUP_CREATED_MSG)
        .bind(now)
        .bind(now)
        .fetch_one(&*self.db)
        .await?;
        Ok(row)
    }

    async fn get_backup(&self, id: i64) -> StoreResult<ObjectBackup> {
        sqlx::query_as::<_, ObjectBackup>(&format!(
            "SELECT {BACKUP_COLUMNS} FROM bucket_object_backups
             WHERE id = ? AND deleted_at IS NULL"
        ))
        .bind(id)
        .fetch_one(&*self.db)
        .await
        .map_err(Self::not_found("backup", id))
    }

    async fn find_backup_by_object(
        &self,
        bucket: &str,
        object: &str,
    ) -> StoreResult<Option<ObjectBackup>> {
        let row = sqlx::query_as::<_, ObjectBackup>(&format!(
            "SELECT {BACKUP_COLUMNS} FROM bucket_object_backups
             WHERE bucket_name = ? AND object_name = ? AND deleted_at IS NULL
             ORDER BY id DESC LIMIT 1"
        ))
        .bind(bucket)
        .bind(object)
        .fetch_optional(&*self.db)
        .await?;
        Ok(row)
    }

    async fn list_backups_below_status(
        &self,
        status_below: i32,
        before_id: Option<i64>,
        limit: usize,
    ) -> StoreResult<Vec<ObjectBackup>> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {BACKUP_COLUMNS} FROM bucket_object_backups \
             WHERE deleted_at IS NULL AND status < "
        ));
        builder.push_bind(status_below);
        if let Some(before) = before_id {
            builder.push(" AND id < ");
            builder.push_bind(before);
        }
        builder.push(" ORDER BY id DESC LIMIT ");
        builder.push_bind(limit as i64);

        let rows = builder.build_query_as().fetch_all(&*self.db).await?;
        Ok(rows)
    }

    async fn update_backup_deal(&self, id: i64, update: &BackupDealUpdate) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE bucket_object_backups
             SET status = ?, status_msg = ?, payload_cid = ?, payload_url = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(update.status)
        .bind(&update.status_msg)
        .bind(&update.payload_cid)
        .bind(&update.payload_url)
        .bind(Utc::now())
        .bind(id)
        .execute(&*self.db)
        .await?;
        ensure_touched(result.rows_affected(), "backup", id)
    }

    async fn update_backup_providers(&self, id: i64, providers: &str) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE bucket_object_backups SET providers = ?, updated_at = ? WHERE id = ?",
        )
        .bind(providers)
        .bind(Utc::now())
        .bind(id)
        .execute(&*self.db)
        .await?;
        ensure_touched(result.rows_affected(), "backup", id)
    }

    async fn soft_delete_backup(&self, id: i64) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE bucket_object_backups SET deleted_at = ?
             WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&*self.db)
        .await?;
        ensure_touched(result.rows_affected(), "backup", id)
    }

    async fn find_slice(
        &self,
        backup_id: i64,
        payload_cid: &str,
    ) -> StoreResult<Option<BackupSlice>> {
        let row = sqlx::query_as::<_, BackupSlice>(&format!(
            "SELECT {SLICE_COLUMNS} FROM backup_slices WHERE backup_id = ? AND payload_cid = ?"
        ))
        .bind(backup_id)
        .bind(payload_cid)
        .fetch_optional(&*self.db)
        .await?;
        Ok(row)
    }

    async fn create_slice(&self, slice: &NewBackupSlice) -> StoreResult<BackupSlice> {
        let now = Utc::now();
        let row = sqlx::query_as::<_, BackupSlice>(&format!(
            "INSERT INTO backup_slices (
                backup_id, file_name, size, payload_cid, payload_url, status, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, 0, ?, ?)
            RETURNING {SLICE_COLUMNS}"
        ))
        .bind(slice.backup_id)
        .bind(&slice.file_name)
        .bind(slice.size)
        .bind(&slice.payload_cid)
        .bind(&slice.payload_url)
        .bind(now)
        .bind(now)
        .fetch_one(&*self.db)
        .await?;
        Ok(row)
    }

    async fn update_slice_payload_url(&self, id: i64, payload_url: &str) -> StoreResult<()> {
        let result =
            sqlx::query("UPDATE backup_slices SET payload_url = ?, updated_at = ? WHERE id = ?")
                .bind(payload_url)
                .bind(Utc::now())
                .bind(id)
                .execute(&*self.db)
                .await?;
        ensure_touched(result.rows_affected(), "slice", id)
    }

    async fn list_slices(&self, backup_id: i64) -> StoreResult<Vec<BackupSlice>> {
        let rows = sqlx::query_as::<_, BackupSlice>(&format!(
            "SELECT {SLICE_COLUMNS} FROM backup_slices WHERE backup_id = ? ORDER BY id ASC"
        ))
        .bind(backup_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }

    async fn find_slice_deal(
        &self,
        slice_id: i64,
        miner_id: &str,
    ) -> StoreResult<Option<BackupSliceDeal>> {
        let row = sqlx::query_as::<_, BackupSliceDeal>(&format!(
            "SELECT {DEAL_COLUMNS} FROM backup_slice_deals WHERE slice_id = ? AND miner_id = ?"
        ))
        .bind(slice_id)
        .bind(miner_id)
        .fetch_optional(&*self.db)
        .await?;
        Ok(row)
    }

    async fn create_slice_deal(&self, deal: &NewBackupSliceDeal) -> StoreResult<BackupSliceDeal> {
        let now = Utc::now();
        let row = sqlx::query_as::<_, BackupSliceDeal>(&format!(
            "INSERT INTO backup_slice_deals (
                slice_id, payload_cid, miner_id, deal_id, deal_cid, storage_status, cost,
                status, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
            RETURNING {DEAL_COLUMNS}"
        ))
        .bind(deal.slice_id)
        .bind(&deal.payload_cid)
        .bind(&deal.miner_id)
        .bind(deal.deal_id)
        .bind(&deal.deal_cid)
        .bind(&deal.storage_status)
        .bind(&deal.cost)
        .bind(now)
        .bind(now)
        .fetch_one(&*self.db)
        .await?;
        Ok(row)
    }

    async fn update_slice_deal(
        &self,
        id: i64,
        deal_id: i64,
        deal_cid: &str,
        storage_status: &str,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE backup_slice_deals
             SET deal_id = ?, deal_cid = ?, storage_status = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(deal_id)
        .bind(deal_cid)
        .bind(storage_status)
        .bind(Utc::now())
        .bind(id)
        .execute(&*self.db)
        .await?;
        ensure_touched(result.rows_affected(), "slice deal", id)
    }

    async fn list_slice_deals(&self, slice_id: i64) -> StoreResult<Vec<BackupSliceDeal>> {
        let rows = sqlx::query_as::<_, BackupSliceDeal>(&format!(
            "SELECT {DEAL_COLUMNS} FROM backup_slice_deals WHERE slice_id = ? ORDER BY id ASC"
        ))
        .bind(slice_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }

    async fn create_removals(&self, removals: &[NewObjectRemoval]) -> StoreResult<u64> {
        if removals.is_empty() {
            return Ok(0);
        }
        let now = Utc::now();
        let mut builder = QueryBuilder::<Sqlite>::new(
            "INSERT INTO object_removals (
                user_access_key, bucket_name, object_name, is_dir, size, backup_id,
                payload_cid, payload_url, status, created_at, updated_at
            ) ",
        );
        builder.push_values(removals, |mut row, removal| {
            row.push_bind(&removal.user_access_key)
                .push_bind(&removal.bucket_name)
                .push_bind(&removal.object_name)
                .push_bind(removal.is_dir)
                .push_bind(removal.size)
                .push_bind(removal.backup_id)
                .push_bind(&removal.payload_cid)
                .push_bind(&removal.payload_url)
                .push_bind(0_i32)
                .push_bind(now)
                .push_bind(now);
        });
        let result = builder.build().execute(&*self.db).await?;
        Ok(result.rows_affected())
    }

    async fn list_removals(&self, bucket: &str) -> StoreResult<Vec<ObjectRemoval>> {
        let rows = sqlx::query_as::<_, ObjectRemoval>(&format!(
            "SELECT {REMOVAL_COLUMNS} FROM object_removals WHERE bucket_name = ? ORDER BY id ASC"
        ))
        .bind(bucket)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }

    async fn create_rebuild(&self, rebuild: &NewObjectRebuild) -> StoreResult<ObjectRebuild> {
        let now = Utc::now();
        let row = sqlx::query_as::<_, ObjectRebuild>(&format!(
            "INSERT INTO object_rebuilds (
                user_access_key, bucket_name, object_name, deal_job_id, plan_id, plan_name,
                is_dir, size, backup_id, payload_cid, status, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING {REBUILD_COLUMNS}"
        ))
        .bind(&rebuild.user_access_key)
        .bind(&rebuild.bucket_name)
        .bind(&rebuild.object_name)
        .bind(rebuild.deal_job_id)
        .bind(rebuild.plan_id)
        .bind(&rebuild.plan_name)
        .bind(rebuild.is_dir)
        .bind(rebuild.size)
        .bind(rebuild.backup_id)
        .bind(&rebuild.payload_cid)
        .bind(RebuildStatus::Created.code())
        .bind(now)
        .bind(now)
        .fetch_one(&*self.db)
        .await?;
        Ok(row)
    }

    async fn get_rebuild(&self, id: i64) -> StoreResult<ObjectRebuild> {
        sqlx::query_as::<_, ObjectRebuild>(&format!(
            "SELECT {REBUILD_COLUMNS} FROM object_rebuilds WHERE id = ?"
        ))
        .bind(id)
        .fetch_one(&*self.db)
        .await
        .map_err(Self::not_found("rebuild", id))
    }

    async fn list_rebuilds_below_status(
        &self,
        status_below: RebuildStatus,
        before_id: Option<i64>,
        limit: usize,
    ) -> StoreResult<Vec<ObjectRebuild>> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {REBUILD_COLUMNS} FROM object_rebuilds WHERE status < "
        ));
        builder.push_bind(status_below.code());
        if let Some(before) = before_id {
            builder.push(" AND id < ");
            builder.push_bind(before);
        }
        builder.push(" ORDER BY id DESC LIMIT ");
        builder.push_bind(limit as i64);

        let rows = builder.build_query_as().fetch_all(&*self.db).await?;
        Ok(rows)
    }

    async fn update_rebuild_progress(
        &self,
        id: i64,
        progress: &RebuildProgress,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE object_rebuilds
             SET status = ?, due_at = ?, payload_cid = ?, payload_url = ?, providers = ?,
                 updated_at = ?
             WHERE id = ?",
        )
        .bind(progress.status.code())
        .bind(progress.due_at)
        .bind(&progress.payload_cid)
        .bind(&progress.payload_url)
        .bind(&progress.providers)
        .bind(Utc::now())
        .bind(id)
        .execute(&*self.db)
        .await?;
        ensure_touched(result.rows_affected(), "rebuild", id)
    }

    async fn update_rebuild_status(&self, id: i64, status: RebuildStatus) -> StoreResult<()> {
        let result =
            sqlx::query("UPDATE object_rebuilds SET status = ?, updated_at = ? WHERE id = ?")
                .bind(status.code())
                .bind(Utc::now())
                .bind(id)
                .execute(&*self.db)
                .await?;
        ensure_touched(result.rows_affected(), "rebuild", id)
    }

    async fn create_import_job(&self, job: &NewS3ImportJob) -> StoreResult<S3ImportJob> {
        let now = Utc::now();
        let row = sqlx::query_as::<_, S3ImportJob>(&format!(
            "INSERT INTO s3_import_jobs (
                user_access_key, access_key_id, secret_access_key, endpoint, location, secure,
                bucket_name, target_bucket, status, status_msg, progress, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, '', 0, ?, ?)
            RETURNING {IMPORT_COLUMNS}"
        ))
        .bind(&job.user_access_key)
        .bind(&job.access_key_id)
        .bind(&job.secret_access_key)
        .bind(&job.endpoint)
        .bind(&job.location)
        .bind(job.secure)
        .bind(&job.bucket_name)
        .bind(&job.target_bucket)
        .bind(ImportStatus::Ready.code())
        .bind(now)
        .bind(now)
        .fetch_one(&*self.db)
        .await?;
        Ok(row)
    }

    async fn get_import_job(&self, id: i64) -> StoreResult<S3ImportJob> {
        sqlx::query_as::<_, S3ImportJob>(&format!(
            "SELECT {IMPORT_COLUMNS} FROM s3_import_jobs WHERE id = ?"
        ))
        .bind(id)
        .fetch_one(&*self.db)
        .await
        .map_err(Self::not_found("import job", id))
    }

    async fn next_import_job(&self, include_importing: bool) -> StoreResult<Option<S3ImportJob>> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {IMPORT_COLUMNS} FROM s3_import_jobs WHERE status = "
        ));
        builder.push_bind(ImportStatus::Ready.code());
        if include_importing {
            builder.push(" OR status = ");
            builder.push_bind(ImportStatus::Importing.code());
        }
        builder.push(" ORDER BY status DESC, id ASC LIMIT 1");

        let row = builder.build_query_as().fetch_optional(&*self.db).await?;
        Ok(row)
    }

    async fn update_import_status(
        &self,
        id: i64,
        status: ImportStatus,
        status_msg: &str,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE s3_import_jobs SET status = ?, status_msg = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.code())
        .bind(status_msg)
        .bind(Utc::now())
        .bind(id)
        .execute(&*self.db)
        .await?;
        ensure_touched(result.rows_affected(), "import job", id)
    }

    async fn update_import_progress(&self, id: i64, progress: i32) -> StoreResult<()> {
        // Progress only moves forward, even when two sweeps race on one job.
        let result = sqlx::query(
            "UPDATE s3_import_jobs SET progress = MAX(progress, ?), updated_at = ? WHERE id = ?",
        )
        .bind(progress)
        .bind(Utc::now())
        .bind(id)
        .execute(&*self.db)
        .await?;
        ensure_touched(result.rows_affected(), "import job", id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::backup::NewObjectBackup;

    fn new_backup(bucket: &str, object: &str, job: i64) -> NewObjectBackup {
        NewObjectBackup {
            user_access_key: "owner".into(),
            bucket_name: bucket.into(),
            object_name: object.into(),
            is_dir: false,
            size: 10,
            download_url: "http://localhost/download".into(),
            provider_region: String::new(),
            duration: 0,
            verified_deal: false,
            fast_retrieval: false,
            deal_job_id: job,
            plan_id: 0,
            plan_name: String::new(),
        }
    }

    #[tokio::test]
    async fn backup_pages_descend_by_id_and_respect_threshold() {
        let store = SqliteRecordStore::in_memory().await.unwrap();
        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(store.create_backup(&new_backup("b", &format!("o{i}"), i + 1)).await.unwrap().id);
        }
        store
            .update_backup_deal(
                ids[2],
                &BackupDealUpdate {
                    status: 45,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let first = store.list_backups_below_status(45, None, 2).await.unwrap();
        assert_eq!(first.iter().map(|b| b.id).collect::<Vec<_>>(), vec![ids[4], ids[3]]);

        let second = store
            .list_backups_below_status(45, Some(ids[3]), 2)
            .await
            .unwrap();
        assert_eq!(second.iter().map(|b| b.id).collect::<Vec<_>>(), vec![ids[1], ids[0]]);
    }

    #[tokio::test]
    async fn soft_deleted_backups_are_hidden() {
        let store = SqliteRecordStore::in_memory().await.unwrap();
        let backup = store.create_backup(&new_backup("b", "o", 1)).await.unwrap();
        assert_eq!(backup.status_msg, "Created");

        store.soft_delete_backup(backup.id).await.unwrap();
        assert!(matches!(
            store.get_backup(backup.id).await,
            Err(StoreError::NotFound { .. })
        ));
        assert!(store.find_backup_by_object("b", "o").await.unwrap().is_none());
        assert!(store.soft_delete_backup(backup.id).await.is_err());
    }

    #[tokio::test]
    async fn import_progress_never_moves_backwards() {
        let store = SqliteRecordStore::in_memory().await.unwrap();
        let job = store
            .create_import_job(&NewS3ImportJob {
                user_access_key: "owner".into(),
                access_key_id: "ak".into(),
                secret_access_key: "sk".into(),
                endpoint: "s3.example.com".into(),
                location: String::new(),
                secure: true,
                bucket_name: "src".into(),
                target_bucket: "dst".into(),
            })
            .await
            .unwrap();

        store.update_import_progress(job.id, 60).await.unwrap();
        store.update_import_progress(job.id, 40).await.unwrap();
        assert_eq!(store.get_import_job(job.id).await.unwrap().progress, 60);
    }

    #[tokio::test]
    async fn restart_prefers_importing_jobs() {
        let store = SqliteRecordStore::in_memory().await.unwrap();
        let template = NewS3ImportJob {
            user_access_key: "owner".into(),
            access_key_id: "ak".into(),
            secret_access_key: "sk".into(),
            endpoint: "s3.example.com".into(),
            location: String::new(),
            secure: true,
            bucket_name: "src".into(),
            target_bucket: "dst".into(),
        };
        let ready = store.create_import_job(&template).await.unwrap();
        let stuck = store.create_import_job(&template).await.unwrap();
        store
            .update_import_status(stuck.id, ImportStatus::Importing, "")
            .await
            .unwrap();

        assert_eq!(store.next_import_job(false).await.unwrap().unwrap().id, ready.id);
        assert_eq!(store.next_import_job(true).await.unwrap().unwrap().id, stuck.id);
    }
}
