//! Represents a recurring backup plan over one or more buckets.

use super::status::{PlanStatus, UnknownStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A user-owned schedule that periodically backs up a set of buckets.
///
/// Plans are created through the API and read by the backup sweep, which only
/// ever mutates `last_at`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct BackupPlan {
    pub id: i64,

    /// Access key of the user owning the plan.
    pub user_access_key: String,

    pub name: String,

    /// Comma-separated list of bucket names.
    pub bucket: String,

    /// Recurrence interval in days.
    pub interval_days: i64,

    /// Preferred storage-provider region for deals.
    pub provider_region: String,

    /// Requested deal duration.
    pub duration: i64,

    pub verified_deal: bool,

    pub fast_retrieval: bool,

    /// Persisted [`PlanStatus`] code.
    pub status: i32,

    /// Unix seconds of the last sweep that picked this plan up (0 = never).
    pub last_at: i64,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl BackupPlan {
    pub fn status(&self) -> Result<PlanStatus, UnknownStatus> {
        PlanStatus::from_code(self.status)
    }

    /// Bucket names listed on the plan, trimmed, empty entries dropped.
    pub fn buckets(&self) -> Vec<&str> {
        self.bucket
            .split(',')
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .collect()
    }

    /// A plan is due once a full interval has passed since its last run.
    pub fn is_due(&self, now: i64) -> bool {
        now - self.last_at >= self.interval_days * 24 * 3600
    }
}

/// Input for creating a plan.
#[derive(Deserialize, Clone, Debug)]
pub struct NewBackupPlan {
    pub user_access_key: String,
    pub name: String,
    pub bucket: String,
    pub interval_days: i64,
    #[serde(default)]
    pub provider_region: String,
    #[serde(default)]
    pub duration: i64,
    #[serde(default)]
    pub verified_deal: bool,
    #[serde(default)]
    pub fast_retrieval: bool,
}
