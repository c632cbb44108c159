//! Represents a request to pull a backed-up object back from the deal network.

use super::backup::ObjectBackup;
use super::status::{RebuildStatus, UnknownStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One rebuild / retrieve request and its progress through the rebuild phases.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct ObjectRebuild {
    pub id: i64,

    pub user_access_key: String,

    /// Bucket the object originally lived in (and is restored into, if it still exists).
    pub bucket_name: String,

    pub object_name: String,

    /// Network job handle of the originating backup.
    pub deal_job_id: i64,

    pub plan_id: i64,

    pub plan_name: String,

    pub is_dir: bool,

    pub size: i64,

    pub backup_id: i64,

    pub payload_cid: String,

    /// Where the staged payload can be downloaded once stored.
    pub payload_url: String,

    pub providers: String,

    /// Unix seconds by which the network promised to stage the payload.
    pub due_at: i64,

    /// Persisted [`RebuildStatus`] code.
    pub status: i32,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl ObjectRebuild {
    pub fn status(&self) -> Result<RebuildStatus, UnknownStatus> {
        RebuildStatus::from_code(self.status)
    }
}

/// Input for a new rebuild, copied from the backup it restores.
#[derive(Clone, Debug)]
pub struct NewObjectRebuild {
    pub user_access_key: String,
    pub bucket_name: String,
    pub object_name: String,
    pub deal_job_id: i64,
    pub plan_id: i64,
    pub plan_name: String,
    pub is_dir: bool,
    pub size: i64,
    pub backup_id: i64,
    pub payload_cid: String,
}

impl NewObjectRebuild {
    pub fn from_backup(backup: &ObjectBackup, user_access_key: impl Into<String>) -> Self {
        Self {
            user_access_key: user_access_key.into(),
            bucket_name: backup.bucket_name.clone(),
            object_name: backup.object_name.clone(),
            deal_job_id: backup.deal_job_id,
            plan_id: backup.plan_id,
            plan_name: backup.plan_name.clone(),
            is_dir: backup.is_dir,
            size: backup.size,
            backup_id: backup.id,
            payload_cid: backup.payload_cid.clone(),
        }
    }
}

/// Fields written after every network poll, whether or not the payload is staged.
#[derive(Clone, Debug)]
pub struct RebuildProgress {
    pub status: RebuildStatus,
    pub due_at: i64,
    pub payload_cid: String,
    pub payload_url: String,
    pub providers: String,
}
