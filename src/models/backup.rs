//! Backup records: one row per submitted object, its slices, their deals, and
//! the audit trail written when a backed-up object is deleted.

use super::status::BackupState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One object (or whole bucket, for directory backups) handed to the deal network.
///
/// Created at submission time and only mutated by reconciliation afterwards.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct ObjectBackup {
    pub id: i64,

    pub user_access_key: String,

    pub bucket_name: String,

    /// Object key; empty when the whole bucket was submitted as a directory.
    pub object_name: String,

    pub is_dir: bool,

    pub size: i64,

    /// Pre-authenticated URL the network fetches the payload from.
    pub download_url: String,

    pub provider_region: String,

    pub duration: i64,

    pub verified_deal: bool,

    pub fast_retrieval: bool,

    /// Content address assigned by the network.
    pub payload_cid: String,

    pub payload_url: String,

    /// Job handle returned by the network on submission.
    pub deal_job_id: i64,

    pub plan_id: i64,

    pub plan_name: String,

    /// Sorted, comma-separated providers holding an active deal.
    pub providers: String,

    /// Numeric status as last reported by the network.
    pub status: i32,

    pub status_msg: String,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl ObjectBackup {
    pub fn state(&self) -> BackupState {
        BackupState::from_code(self.status)
    }
}

/// Input for a freshly submitted backup.
#[derive(Clone, Debug)]
pub struct NewObjectBackup {
    pub user_access_key: String,
    pub bucket_name: String,
    pub object_name: String,
    pub is_dir: bool,
    pub size: i64,
    pub download_url: String,
    pub provider_region: String,
    pub duration: i64,
    pub verified_deal: bool,
    pub fast_retrieval: bool,
    pub deal_job_id: i64,
    pub plan_id: i64,
    pub plan_name: String,
}

/// Fields refreshed on every reconciliation poll.
#[derive(Clone, Debug, Default)]
pub struct BackupDealUpdate {
    pub status: i32,
    pub status_msg: String,
    pub payload_cid: String,
    pub payload_url: String,
}

/// A content-addressed slice of a backup payload, as chunked by the network.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct BackupSlice {
    pub id: i64,
    pub backup_id: i64,
    pub file_name: String,
    pub size: i64,
    pub payload_cid: String,
    pub payload_url: String,
    pub status: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct NewBackupSlice {
    pub backup_id: i64,
    pub file_name: String,
    pub size: i64,
    pub payload_cid: String,
    pub payload_url: String,
}

/// A storage provider's deal for one slice.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct BackupSliceDeal {
    pub id: i64,
    pub slice_id: i64,
    pub payload_cid: String,
    pub miner_id: String,
    pub deal_id: i64,
    pub deal_cid: String,
    /// On-chain status string reported for the deal.
    pub storage_status: String,
    pub cost: String,
    pub status: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct NewBackupSliceDeal {
    pub slice_id: i64,
    pub payload_cid: String,
    pub miner_id: String,
    pub deal_id: i64,
    pub deal_cid: String,
    pub storage_status: String,
    pub cost: String,
}

/// Audit row kept when a user deletes an object that may have a backup.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct ObjectRemoval {
    pub id: i64,
    pub user_access_key: String,
    pub bucket_name: String,
    pub object_name: String,
    pub is_dir: bool,
    pub size: i64,
    /// Linked backup, 0 when the object was never backed up.
    pub backup_id: i64,
    pub payload_cid: String,
    pub payload_url: String,
    pub status: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct NewObjectRemoval {
    pub user_access_key: String,
    pub bucket_name: String,
    pub object_name: String,
    pub is_dir: bool,
    pub size: i64,
    pub backup_id: i64,
    pub payload_cid: String,
    pub payload_url: String,
}
