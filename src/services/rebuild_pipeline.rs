//! src/services/rebuild_pipeline.rs
//!
//! Drives object rebuilds through their phases: poll the deal network until
//! the payload is stored, download it into the staging directory, unpack
//! directory archives, and restore everything into a live bucket.
//!
//! Restores never overwrite: single files get a time-suffixed name, and a
//! fresh time-suffixed bucket is created when the original bucket is gone or
//! the backup covered a whole bucket.

use crate::models::{
    backup::ObjectBackup,
    rebuild::{NewObjectRebuild, ObjectRebuild, RebuildProgress},
    status::{BackupState, PhaseState, RebuildPhase, RebuildStatus, UnknownStatus},
};
use crate::services::{
    archive::{self, ArchiveError},
    deal_client::{DealError, DealNetwork},
    object_store::{ObjectStore, ObjectStoreError, file_stream},
    record_store::{RecordStore, StoreError},
    time_suffix,
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::{
    collections::HashSet,
    ffi::OsString,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, instrument, warn};

/// Rebuild records polled per reconciliation page.
pub const REBUILD_PAGE_SIZE: usize = 10;

const DOWNLOADING: RebuildStatus =
    RebuildStatus::phase(RebuildPhase::Download, PhaseState::InProgress);
const DOWNLOAD_FAILED: RebuildStatus =
    RebuildStatus::phase(RebuildPhase::Download, PhaseState::Failed);
const RESTORE_READY: RebuildStatus = RebuildStatus::phase(RebuildPhase::Restore, PhaseState::Ready);
const RESTORING: RebuildStatus =
    RebuildStatus::phase(RebuildPhase::Restore, PhaseState::InProgress);
const RESTORE_FAILED: RebuildStatus =
    RebuildStatus::phase(RebuildPhase::Restore, PhaseState::Failed);

#[derive(Debug, Error)]
pub enum RebuildError {
    #[error("backup {backup_id} cannot be rebuilt while {state}")]
    NotRebuildable { backup_id: i64, state: &'static str },
    #[error("network reported a stored payload without a payload url")]
    EmptyPayloadUrl,
    #[error("cannot restore a single file without an object name")]
    EmptyObjectName,
    #[error("payload download failed: {0}")]
    Download(#[from] reqwest::Error),
    #[error(transparent)]
    Status(#[from] UnknownStatus),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    ObjectStore(#[from] ObjectStoreError),
    #[error(transparent)]
    Deal(#[from] DealError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type RebuildResult<T> = Result<T, RebuildError>;

/// Set of rebuild ids currently being driven. At most one driver per id.
#[derive(Clone, Default)]
pub struct InFlight {
    ids: Arc<Mutex<HashSet<i64>>>,
}

/// Holds an id in the [`InFlight`] set until dropped.
pub struct InFlightGuard {
    ids: Arc<Mutex<HashSet<i64>>>,
    id: i64,
}

impl InFlight {
    pub fn try_acquire(&self, id: i64) -> Option<InFlightGuard> {
        let mut ids = self.ids.lock().ok()?;
        if !ids.insert(id) {
            return None;
        }
        Some(InFlightGuard {
            ids: self.ids.clone(),
            id,
        })
    }

    pub fn contains(&self, id: i64) -> bool {
        self.ids.lock().map(|ids| ids.contains(&id)).unwrap_or(false)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut ids) = self.ids.lock() {
            ids.remove(&self.id);
        }
    }
}

/// What one driver invocation achieved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriveOutcome {
    /// Another driver holds this record.
    Busy,
    /// Not stored on the network yet; re-polled next tick.
    Waiting(RebuildStatus),
    Restored { bucket: String, objects: usize },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RebuildSweepSummary {
    pub polled: usize,
    pub restored: usize,
    pub failed: usize,
}

/// Where a restore writes to.
struct RestoreTarget {
    bucket: String,
    /// The rebuild's own bucket is being reused.
    original_bucket: bool,
}

pub struct RebuildPipeline {
    store: Arc<dyn RecordStore>,
    objects: Arc<dyn ObjectStore>,
    network: Arc<dyn DealNetwork>,
    http: reqwest::Client,
    rebuild_path: PathBuf,
    in_flight: InFlight,
}

impl RebuildPipeline {
    pub fn new(
        store: Arc<dyn RecordStore>,
        objects: Arc<dyn ObjectStore>,
        network: Arc<dyn DealNetwork>,
        rebuild_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            objects,
            network,
            http: reqwest::Client::new(),
            rebuild_path: rebuild_path.into(),
            in_flight: InFlight::default(),
        }
    }

    pub fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    /// Open a rebuild for a backup whose deals are active.
    #[instrument(skip(self))]
    pub async fn request(
        &self,
        backup_id: i64,
        user_access_key: &str,
    ) -> RebuildResult<ObjectRebuild> {
        let backup: ObjectBackup = self.store.get_backup(backup_id).await?;
        let state: BackupState = backup.state();
        if !state.can_rebuild() {
            return Err(RebuildError::NotRebuildable {
                backup_id,
                state: state.label(),
            });
        }
        let rebuild = self
            .store
            .create_rebuild(&NewObjectRebuild::from_backup(&backup, user_access_key))
            .await?;
        info!(rebuild_id = rebuild.id, backup_id, "rebuild requested");
        Ok(rebuild)
    }

    /// Drive every rebuild not yet restored, newest first, a page at a time.
    #[instrument(skip(self))]
    pub async fn sync_pending(&self) -> RebuildResult<RebuildSweepSummary> {
        let mut summary = RebuildSweepSummary::default();
        let mut before: Option<i64> = None;

        loop {
            let page = self
                .store
                .list_rebuilds_below_status(RebuildStatus::RESTORED, before, REBUILD_PAGE_SIZE)
                .await?;
            for rebuild in &page {
                summary.polled += 1;
                match self.drive(rebuild).await {
                    Ok(DriveOutcome::Restored { .. }) => summary.restored += 1,
                    Ok(_) => {}
                    Err(err) => {
                        summary.failed += 1;
                        error!(rebuild_id = rebuild.id, error = %err, "rebuild sync failed");
                    }
                }
                before = Some(rebuild.id);
            }
            if page.len() < REBUILD_PAGE_SIZE {
                return Ok(summary);
            }
        }
    }

    /// Advance one rebuild as far as it can go this tick.
    #[instrument(skip(self, rebuild), fields(rebuild_id = rebuild.id))]
    pub async fn drive(&self, rebuild: &ObjectRebuild) -> RebuildResult<DriveOutcome> {
        let Some(_guard) = self.in_flight.try_acquire(rebuild.id) else {
            info!("rebuild already in progress");
            return Ok(DriveOutcome::Busy);
        };

        let resp = self
            .network
            .rebuild(rebuild.deal_job_id, rebuild.object_name.clone())
            .await?;
        // Payload fields are kept even when the reported code is unknown; the
        // record then keeps its current status and is polled again.
        let reported = RebuildStatus::from_code(resp.status);
        let status = match &reported {
            Ok(status) => *status,
            Err(_) => rebuild.status()?,
        };
        self.store
            .update_rebuild_progress(
                rebuild.id,
                &RebuildProgress {
                    status,
                    due_at: resp.due_at,
                    payload_cid: resp.payload_cid.clone(),
                    payload_url: resp.payload_url.clone(),
                    providers: resp.providers.join(","),
                },
            )
            .await?;
        let status = reported?;

        if !status.is_staged() {
            debug!(%status, "payload not stored yet");
            return Ok(DriveOutcome::Waiting(status));
        }
        if resp.payload_url.is_empty() {
            self.demote(rebuild.id, DOWNLOAD_FAILED).await;
            return Err(RebuildError::EmptyPayloadUrl);
        }

        self.store.update_rebuild_status(rebuild.id, DOWNLOADING).await?;
        let staged = match self.fetch_payload(rebuild, &resp.payload_url).await {
            Ok(path) => path,
            Err(err) => {
                self.demote(rebuild.id, DOWNLOAD_FAILED).await;
                return Err(err);
            }
        };

        self.store.update_rebuild_status(rebuild.id, RESTORE_READY).await?;
        let now = Utc::now();
        let restored = async {
            let target = self.prepare_target(rebuild, now).await?;
            self.store.update_rebuild_status(rebuild.id, RESTORING).await?;
            let count = if rebuild.is_dir {
                self.restore_tree(rebuild, &target, &staged, now).await?
            } else {
                self.restore_file(rebuild, &target, &staged, now).await?
            };
            Ok::<_, RebuildError>((target.bucket, count))
        }
        .await;

        match restored {
            Ok((bucket, objects)) => {
                self.store
                    .update_rebuild_status(rebuild.id, RebuildStatus::RESTORED)
                    .await?;
                info!(bucket = %bucket, objects, "rebuild restored");
                Ok(DriveOutcome::Restored { bucket, objects })
            }
            Err(err) => {
                self.demote(rebuild.id, RESTORE_FAILED).await;
                Err(err)
            }
        }
    }

    async fn demote(&self, id: i64, status: RebuildStatus) {
        if let Err(err) = self.store.update_rebuild_status(id, status).await {
            error!(rebuild_id = id, %status, error = %err, "failed to record rebuild failure");
        }
    }

    /// `{rebuild_path}/{job}/{bucket}[/{object}]`, plus `.zip` for directories.
    pub fn staging_path(&self, rebuild: &ObjectRebuild) -> PathBuf {
        let mut path = self
            .rebuild_path
            .join(rebuild.deal_job_id.to_string())
            .join(&rebuild.bucket_name);
        let object = rebuild.object_name.trim_matches('/');
        if !object.is_empty() {
            path = path.join(object);
        }
        if rebuild.is_dir {
            let mut zipped: OsString = path.into_os_string();
            zipped.push(".zip");
            path = PathBuf::from(zipped);
        }
        path
    }

    /// Download the payload (unless an identical-size copy is already staged)
    /// and, for directories, unpack it. Returns the path to restore from.
    async fn fetch_payload(&self, rebuild: &ObjectRebuild, url: &str) -> RebuildResult<PathBuf> {
        let path = self.staging_path(rebuild);

        if !self.already_staged(&path, url).await {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let response = self.http.get(url).send().await?.error_for_status()?;
            let mut body = response.bytes_stream();
            let mut file = tokio::fs::File::create(&path).await?;
            while let Some(chunk) = body.next().await {
                file.write_all(&chunk?).await?;
            }
            file.flush().await?;
            info!(path = %path.display(), "payload downloaded");
        }

        if !rebuild.is_dir {
            return Ok(path);
        }
        let unpacked = path.with_extension("");
        match tokio::fs::remove_dir_all(&unpacked).await {
            Ok(()) => debug!(path = %unpacked.display(), "cleared previous unpack"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        archive::unzip(&path, &unpacked).await?;
        Ok(unpacked)
    }

    async fn already_staged(&self, path: &Path, url: &str) -> bool {
        let Ok(meta) = tokio::fs::metadata(path).await else {
            return false;
        };
        match self.remote_size(url).await {
            Some(size) if size > 0 && size == meta.len() => {
                info!(path = %path.display(), "payload already staged");
                true
            }
            _ => false,
        }
    }

    async fn remote_size(&self, url: &str) -> Option<u64> {
        let response = match self.http.head(url).send().await {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "payload size probe failed");
                return None;
            }
        };
        response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)?
            .to_str()
            .ok()?
            .parse()
            .ok()
    }

    async fn prepare_target(
        &self,
        rebuild: &ObjectRebuild,
        now: DateTime<Utc>,
    ) -> RebuildResult<RestoreTarget> {
        let exists = self.objects.bucket_exists(&rebuild.bucket_name).await?;
        if exists && !rebuild.object_name.is_empty() {
            return Ok(RestoreTarget {
                bucket: rebuild.bucket_name.clone(),
                original_bucket: true,
            });
        }
        let bucket = format!("{}-{}", rebuild.bucket_name, time_suffix(now));
        info!(bucket = %bucket, "restoring into a new bucket");
        self.objects.make_bucket(&bucket).await?;
        Ok(RestoreTarget {
            bucket,
            original_bucket: false,
        })
    }

    async fn restore_file(
        &self,
        rebuild: &ObjectRebuild,
        target: &RestoreTarget,
        staged: &Path,
        now: DateTime<Utc>,
    ) -> RebuildResult<usize> {
        if rebuild.object_name.is_empty() {
            return Err(RebuildError::EmptyObjectName);
        }
        let key = suffixed_object_name(&rebuild.object_name, now);
        let size = tokio::fs::metadata(staged).await?.len() as i64;
        self.objects
            .put_object(&target.bucket, &key, file_stream(staged).await?, size)
            .await?;
        debug!(bucket = %target.bucket, key = %key, "file restored");
        Ok(1)
    }

    /// Restore every regular file under `root`. The first failure aborts.
    async fn restore_tree(
        &self,
        rebuild: &ObjectRebuild,
        target: &RestoreTarget,
        root: &Path,
        now: DateTime<Utc>,
    ) -> RebuildResult<usize> {
        let object = rebuild.object_name.trim_end_matches('/');
        let dir_name = if target.original_bucket && !object.is_empty() {
            format!("{object}-{}", time_suffix(now))
        } else {
            object.to_string()
        };

        let files = archive::walk_files(root)?;
        for file in &files {
            let key = if object.is_empty() {
                file.relative.clone()
            } else {
                format!("{dir_name}/{}", file.relative)
            };
            self.objects
                .put_object(
                    &target.bucket,
                    &key,
                    file_stream(&file.path).await?,
                    file.size as i64,
                )
                .await?;
            debug!(bucket = %target.bucket, key = %key, "file restored");
        }
        Ok(files.len())
    }
}

/// `dir/stem.ext` becomes `dir/stem-{suffix}.ext`.
pub fn suffixed_object_name(object: &str, at: DateTime<Utc>) -> String {
    let (dir, base) = match object.rsplit_once('/') {
        Some((dir, base)) => (Some(dir), base),
        None => (None, object),
    };
    let (stem, ext) = match base.rfind('.') {
        Some(dot) => base.split_at(dot),
        None => (base, ""),
    };
    let name = format!("{stem}-{}{ext}", time_suffix(at));
    match dir {
        Some(dir) if !dir.is_empty() => format!("{dir}/{name}"),
        _ => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn restored_files_keep_extension_and_directory() {
        let at = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(suffixed_object_name("cat.png", at), "cat-20240102030405.png");
        assert_eq!(suffixed_object_name("a/b/cat.tar.gz", at), "a/b/cat.tar-20240102030405.gz");
        assert_eq!(suffixed_object_name("README", at), "README-20240102030405");
    }

    #[test]
    fn in_flight_admits_one_driver_per_id() {
        let set = InFlight::default();
        let guard = set.try_acquire(7).unwrap();
        assert!(set.try_acquire(7).is_none());
        assert!(set.try_acquire(8).is_some());
        drop(guard);
        assert!(!set.contains(7));
        assert!(set.try_acquire(7).is_some());
    }
}
