use crate::services::{
    backup_pipeline::BackupPipeline, download_token::DownloadTokens, object_store::ObjectStore,
    rebuild_pipeline::RebuildPipeline, record_store::RecordStore,
};
use std::{path::PathBuf, sync::Arc};

/// Shared state handed to every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RecordStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub backups: Arc<BackupPipeline>,
    pub rebuilds: Arc<RebuildPipeline>,
    pub tokens: DownloadTokens,
    /// Local staging directory for rebuild payloads.
    pub rebuild_path: PathBuf,
}
