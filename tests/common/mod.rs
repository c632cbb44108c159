#![allow(dead_code)]

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{Duration, Utc};
use deal_backup::{
    models::{
        backup::{BackupDealUpdate, NewObjectBackup, ObjectBackup},
        import::NewS3ImportJob,
        plan::{BackupPlan, NewBackupPlan},
    },
    services::{
        download_token::DownloadTokens,
        object_store::{
            ByteStream, ObjectInfo, ObjectStat, ObjectStore, ObjectStoreConnector,
            ObjectStoreError, ObjectStoreResult, S3Endpoint, bytes_stream,
        },
        record_store::{RecordStore, SqliteRecordStore},
    },
};
use futures::StreamExt;
use std::{
    collections::{BTreeMap, HashSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

/// In-memory bucket store with per-key failure injection.
#[derive(Default)]
pub struct MemoryObjectStore {
    buckets: Mutex<BTreeMap<String, BTreeMap<String, Bytes>>>,
    failing_gets: Mutex<HashSet<String>>,
    failing_puts: Mutex<HashSet<String>>,
    puts: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_bucket(&self, bucket: &str) {
        self.buckets
            .lock()
            .unwrap()
            .entry(bucket.to_string())
            .or_default();
    }

    pub fn insert(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
        self.buckets
            .lock()
            .unwrap()
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), data.into());
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.buckets.lock().unwrap().get(bucket)?.get(key).cloned()
    }

    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.buckets
            .lock()
            .unwrap()
            .get(bucket)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn bucket_names(&self) -> Vec<String> {
        self.buckets.lock().unwrap().keys().cloned().collect()
    }

    pub fn fail_get(&self, key: &str) {
        self.failing_gets.lock().unwrap().insert(key.to_string());
    }

    pub fn fail_put(&self, key: &str) {
        self.failing_puts.lock().unwrap().insert(key.to_string());
    }

    pub fn clear_failures(&self) {
        self.failing_gets.lock().unwrap().clear();
        self.failing_puts.lock().unwrap().clear();
    }

    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    fn with_bucket<T>(
        &self,
        bucket: &str,
        f: impl FnOnce(&BTreeMap<String, Bytes>) -> ObjectStoreResult<T>,
    ) -> ObjectStoreResult<T> {
        let buckets = self.buckets.lock().unwrap();
        let objects = buckets
            .get(bucket)
            .ok_or_else(|| ObjectStoreError::BucketNotFound(bucket.to_string()))?;
        f(objects)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn bucket_exists(&self, bucket: &str) -> ObjectStoreResult<bool> {
        Ok(self.buckets.lock().unwrap().contains_key(bucket))
    }

    async fn make_bucket(&self, bucket: &str) -> ObjectStoreResult<()> {
        self.add_bucket(bucket);
        Ok(())
    }

    async fn stat_object(&self, bucket: &str, key: &str) -> ObjectStoreResult<ObjectStat> {
        self.with_bucket(bucket, |objects| {
            if let Some(data) = objects.get(key).filter(|_| !key.is_empty()) {
                return Ok(ObjectStat {
                    name: key.to_string(),
                    size: data.len() as i64,
                    is_dir: false,
                });
            }
            let prefix = if key.is_empty() || key.ends_with('/') {
                key.to_string()
            } else {
                format!("{key}/")
            };
            let under: Vec<&Bytes> = objects
                .iter()
                .filter(|(k, _)| k.starts_with(&prefix))
                .map(|(_, v)| v)
                .collect();
            if under.is_empty() && !key.is_empty() {
                return Err(ObjectStoreError::NotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                });
            }
            Ok(ObjectStat {
                name: key.to_string(),
                size: under.iter().map(|v| v.len() as i64).sum(),
                is_dir: true,
            })
        })
    }

    async fn get_object(&self, bucket: &str, key: &str) -> ObjectStoreResult<ByteStream> {
        if self.failing_gets.lock().unwrap().contains(key) {
            return Err(ObjectStoreError::Backend(format!("injected get failure for {key}")));
        }
        let data = self.with_bucket(bucket, |objects| {
            objects
                .get(key)
                .cloned()
                .ok_or_else(|| ObjectStoreError::NotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                })
        })?;
        Ok(bytes_stream(data))
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        mut body: ByteStream,
        _size: i64,
    ) -> ObjectStoreResult<()> {
        if self.failing_puts.lock().unwrap().contains(key) {
            return Err(ObjectStoreError::Backend(format!("injected put failure for {key}")));
        }
        let mut buf = BytesMut::new();
        while let Some(chunk) = body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        let mut buckets = self.buckets.lock().unwrap();
        let objects = buckets
            .get_mut(bucket)
            .ok_or_else(|| ObjectStoreError::BucketNotFound(bucket.to_string()))?;
        objects.insert(key.to_string(), buf.freeze());
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> ObjectStoreResult<Vec<ObjectStoreResult<ObjectInfo>>> {
        self.with_bucket(bucket, |objects| {
            Ok(objects
                .iter()
                .filter(|(k, _)| k.starts_with(prefix))
                .map(|(k, v)| {
                    Ok(ObjectInfo {
                        key: k.clone(),
                        size: v.len() as i64,
                    })
                })
                .collect())
        })
    }
}

/// Hands out the same store for every endpoint.
pub struct FixedConnector(pub Arc<MemoryObjectStore>);

#[async_trait]
impl ObjectStoreConnector for FixedConnector {
    async fn connect(&self, _endpoint: &S3Endpoint) -> ObjectStoreResult<Arc<dyn ObjectStore>> {
        Ok(self.0.clone())
    }
}

pub async fn store() -> Arc<SqliteRecordStore> {
    Arc::new(SqliteRecordStore::in_memory().await.unwrap())
}

pub fn tokens() -> DownloadTokens {
    DownloadTokens::new("admin", "root-secret", "http://backup.local:3000")
}

pub async fn plan_due(store: &SqliteRecordStore, buckets: &str) -> BackupPlan {
    let plan = store
        .create_plan(&NewBackupPlan {
            user_access_key: "owner".into(),
            name: "nightly".into(),
            bucket: buckets.into(),
            interval_days: 1,
            provider_region: "eu".into(),
            duration: 518400,
            verified_deal: true,
            fast_retrieval: true,
        })
        .await
        .unwrap();
    let two_days_ago = (Utc::now() - Duration::days(2)).timestamp();
    store.set_plan_last_run(plan.id, two_days_ago).await.unwrap();
    store.get_plan(plan.id).await.unwrap()
}

/// A backup whose deals are active, ready to be rebuilt.
pub async fn active_backup(
    store: &SqliteRecordStore,
    bucket: &str,
    object: &str,
    is_dir: bool,
) -> ObjectBackup {
    let backup = store
        .create_backup(&NewObjectBackup {
            user_access_key: "owner".into(),
            bucket_name: bucket.into(),
            object_name: object.into(),
            is_dir,
            size: 42,
            download_url: String::new(),
            provider_region: String::new(),
            duration: 0,
            verified_deal: false,
            fast_retrieval: false,
            deal_job_id: 77,
            plan_id: 0,
            plan_name: String::new(),
        })
        .await
        .unwrap();
    store
        .update_backup_deal(
            backup.id,
            &BackupDealUpdate {
                status: 45,
                status_msg: "DealActive".into(),
                payload_cid: "bafy-root".into(),
                payload_url: String::new(),
            },
        )
        .await
        .unwrap();
    store.get_backup(backup.id).await.unwrap()
}

pub fn import_job(source: &str, target: &str) -> NewS3ImportJob {
    NewS3ImportJob {
        user_access_key: "owner".into(),
        access_key_id: "ak".into(),
        secret_access_key: "sk".into(),
        endpoint: "s3.remote.example".into(),
        location: String::new(),
        secure: true,
        bucket_name: source.into(),
        target_bucket: target.into(),
    }
}
