//! Services: the record store and object-store seams, the deal network
//! client, and the pipelines and schedulers built on top of them.

pub mod archive;
pub mod backup_pipeline;
pub mod deal_client;
pub mod download_token;
pub mod import_pipeline;
pub mod object_store;
pub mod rebuild_pipeline;
pub mod record_store;
pub mod scheduler;
pub mod sync_engine;

use chrono::{DateTime, Utc};

/// `YYYYmmddHHMMSS`, used to make backup names and restore targets unique.
pub fn time_suffix(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d%H%M%S").to_string()
}
