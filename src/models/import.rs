//! Represents a migration of an external S3 bucket into the local store.

use super::status::{ImportStatus, UnknownStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One external-bucket import job.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct S3ImportJob {
    pub id: i64,

    pub user_access_key: String,

    /// Credentials for the source endpoint.
    pub access_key_id: String,

    #[serde(skip_serializing)]
    pub secret_access_key: String,

    /// Source endpoint, `host:port` or a full URL.
    pub endpoint: String,

    /// Source region, empty for the default.
    pub location: String,

    /// Use TLS for a bare `host:port` endpoint.
    pub secure: bool,

    /// Bucket copied from.
    pub bucket_name: String,

    /// Local bucket copied into.
    pub target_bucket: String,

    /// Persisted [`ImportStatus`] code.
    pub status: i32,

    pub status_msg: String,

    /// Percentage of source bytes handed to the sync engine; never decreases.
    pub progress: i32,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl S3ImportJob {
    pub fn status(&self) -> Result<ImportStatus, UnknownStatus> {
        ImportStatus::from_code(self.status)
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct NewS3ImportJob {
    pub user_access_key: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub endpoint: String,
    #[serde(default)]
    pub location: String,
    #[serde(default = "default_secure")]
    pub secure: bool,
    pub bucket_name: String,
    pub target_bucket: String,
}

fn default_secure() -> bool {
    true
}
