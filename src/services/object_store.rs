//! src/services/object_store.rs
//!
//! The slice of an S3-compatible object store the pipelines depend on: stat,
//! streaming get / put, recursive listing, bucket existence and creation.
//! `S3ObjectStore` talks to any S3-compatible endpoint through `aws-sdk-s3`.

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::{
    Client,
    config::Credentials,
    error::SdkError,
    primitives::ByteStream as S3Body,
};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::{pin::Pin, sync::Arc};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, instrument};

const DEFAULT_REGION: &str = "us-east-1";

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("bucket `{0}` not found")]
    BucketNotFound(String),
    #[error("object `{bucket}/{key}` not found")]
    NotFound { bucket: String, key: String },
    #[error("object store request failed: {0}")]
    Backend(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type ObjectStoreResult<T> = Result<T, ObjectStoreError>;

/// Streaming object body.
pub type ByteStream = Pin<Box<dyn Stream<Item = ObjectStoreResult<Bytes>> + Send>>;

/// One listed object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: i64,
}

/// Result of a stat. Prefixes (and the empty key) stat as directories whose
/// size is the sum of everything beneath them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectStat {
    pub name: String,
    pub size: i64,
    pub is_dir: bool,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn bucket_exists(&self, bucket: &str) -> ObjectStoreResult<bool>;

    async fn make_bucket(&self, bucket: &str) -> ObjectStoreResult<()>;

    async fn stat_object(&self, bucket: &str, key: &str) -> ObjectStoreResult<ObjectStat>;

    async fn get_object(&self, bucket: &str, key: &str) -> ObjectStoreResult<ByteStream>;

    /// Write `body` under `key`. `size` is the exact body length.
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: ByteStream,
        size: i64,
    ) -> ObjectStoreResult<()>;

    /// Recursive listing under `prefix`. A listing failure part way through is
    /// reported as a trailing error item; earlier items remain usable.
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> ObjectStoreResult<Vec<ObjectStoreResult<ObjectInfo>>>;
}

/// Connection parameters for an S3-compatible endpoint.
#[derive(Clone)]
pub struct S3Endpoint {
    /// `host:port` or a full URL.
    pub endpoint: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Empty selects the default region.
    pub region: String,
    /// Scheme used when `endpoint` has none.
    pub secure: bool,
}

impl std::fmt::Debug for S3Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Endpoint")
            .field("endpoint", &self.endpoint)
            .field("access_key_id", &self.access_key_id)
            .field("region", &self.region)
            .field("secure", &self.secure)
            .finish_non_exhaustive()
    }
}

impl S3Endpoint {
    pub fn url(&self) -> String {
        let lower = self.endpoint.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            self.endpoint.clone()
        } else if self.secure {
            format!("https://{}", self.endpoint)
        } else {
            format!("http://{}", self.endpoint)
        }
    }
}

/// Opens object-store handles for endpoints only known at run time
/// (import sources).
#[async_trait]
pub trait ObjectStoreConnector: Send + Sync {
    async fn connect(&self, endpoint: &S3Endpoint) -> ObjectStoreResult<Arc<dyn ObjectStore>>;
}

/// Connector producing [`S3ObjectStore`] handles.
#[derive(Debug, Default, Clone)]
pub struct S3Connector;

#[async_trait]
impl ObjectStoreConnector for S3Connector {
    async fn connect(&self, endpoint: &S3Endpoint) -> ObjectStoreResult<Arc<dyn ObjectStore>> {
        Ok(Arc::new(S3ObjectStore::new(endpoint)))
    }
}

/// S3-compatible object store using the AWS SDK with path-style addressing.
#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
    endpoint: String,
}

impl std::fmt::Debug for S3ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3ObjectStore")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl S3ObjectStore {
    pub fn new(endpoint: &S3Endpoint) -> Self {
        let region = if endpoint.region.is_empty() {
            DEFAULT_REGION.to_string()
        } else {
            endpoint.region.clone()
        };
        let credentials = Credentials::new(
            endpoint.access_key_id.clone(),
            endpoint.secret_access_key.clone(),
            None,
            None,
            "deal-backup",
        );
        let url = endpoint.url();
        let config = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region))
            .credentials_provider(credentials)
            .endpoint_url(&url)
            .force_path_style(true)
            .build();

        Self {
            client: Client::from_conf(config),
            endpoint: url,
        }
    }

    fn is_not_found<E>(err: &SdkError<E>) -> bool {
        matches!(err, SdkError::ServiceError(service_err) if service_err.raw().status().as_u16() == 404)
    }

    fn backend<E>(err: SdkError<E>) -> ObjectStoreError
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        ObjectStoreError::Backend(aws_sdk_s3::error::DisplayErrorContext(err).to_string())
    }

    async fn sum_prefix(&self, bucket: &str, prefix: &str) -> ObjectStoreResult<(usize, i64)> {
        let mut count = 0;
        let mut total = 0;
        for item in self.list_objects(bucket, prefix).await? {
            let info = item?;
            count += 1;
            total += info.size;
        }
        Ok((count, total))
    }
}

/// Prefix that lists everything beneath a directory-style key.
fn directory_prefix(key: &str) -> String {
    if key.is_empty() || key.ends_with('/') {
        key.to_string()
    } else {
        format!("{key}/")
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    async fn bucket_exists(&self, bucket: &str) -> ObjectStoreResult<bool> {
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(true),
            Err(err) if Self::is_not_found(&err) => Ok(false),
            Err(err) => Err(Self::backend(err)),
        }
    }

    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    async fn make_bucket(&self, bucket: &str) -> ObjectStoreResult<()> {
        self.client
            .create_bucket()
            .bucket(bucket)
            .send()
            .await
            .map_err(Self::backend)?;
        Ok(())
    }

    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    async fn stat_object(&self, bucket: &str, key: &str) -> ObjectStoreResult<ObjectStat> {
        if !key.is_empty() && !key.ends_with('/') {
            match self.client.head_object().bucket(bucket).key(key).send().await {
                Ok(output) => {
                    return Ok(ObjectStat {
                        name: key.to_string(),
                        size: output.content_length().unwrap_or(0),
                        is_dir: false,
                    });
                }
                Err(err) if Self::is_not_found(&err) => {}
                Err(err) => return Err(Self::backend(err)),
            }
        }

        if !self.bucket_exists(bucket).await? {
            return Err(ObjectStoreError::BucketNotFound(bucket.to_string()));
        }
        let (count, size) = self.sum_prefix(bucket, &directory_prefix(key)).await?;
        if count == 0 && !key.is_empty() {
            return Err(ObjectStoreError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }
        Ok(ObjectStat {
            name: key.to_string(),
            size,
            is_dir: true,
        })
    }

    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    async fn get_object(&self, bucket: &str, key: &str) -> ObjectStoreResult<ByteStream> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| {
                if Self::is_not_found(&err) {
                    ObjectStoreError::NotFound {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                    }
                } else {
                    Self::backend(err)
                }
            })?;

        let stream = ReaderStream::new(output.body.into_async_read())
            .map(|chunk| chunk.map_err(ObjectStoreError::Io));
        Ok(Box::pin(stream))
    }

    #[instrument(skip(self, body), fields(endpoint = %self.endpoint))]
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        mut body: ByteStream,
        size: i64,
    ) -> ObjectStoreResult<()> {
        // The SDK needs a replayable body for signing; spool to disk first.
        let spool = tempfile::NamedTempFile::new()?;
        let mut file = tokio::fs::File::create(spool.path()).await?;
        while let Some(chunk) = body.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        drop(file);

        let upload = S3Body::from_path(spool.path())
            .await
            .map_err(|err| ObjectStoreError::Backend(err.to_string()))?;
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_length(size)
            .body(upload)
            .send()
            .await
            .map_err(Self::backend)?;
        debug!(bucket, key, size, "object written");
        Ok(())
    }

    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> ObjectStoreResult<Vec<ObjectStoreResult<ObjectInfo>>> {
        let mut results = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self.client.list_objects_v2().bucket(bucket);
            if !prefix.is_empty() {
                request = request.prefix(prefix);
            }
            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let output = match request.send().await {
                Ok(output) => output,
                Err(err) if results.is_empty() && Self::is_not_found(&err) => {
                    return Err(ObjectStoreError::BucketNotFound(bucket.to_string()));
                }
                Err(err) => {
                    results.push(Err(Self::backend(err)));
                    break;
                }
            };

            for obj in output.contents() {
                if let Some(key) = obj.key() {
                    results.push(Ok(ObjectInfo {
                        key: key.to_string(),
                        size: obj.size().unwrap_or(0),
                    }));
                }
            }

            if output.is_truncated() == Some(true) {
                continuation_token = output.next_continuation_token().map(str::to_string);
            } else {
                break;
            }
        }

        Ok(results)
    }
}

/// Wrap an in-memory buffer as a [`ByteStream`].
pub fn bytes_stream(data: Bytes) -> ByteStream {
    Box::pin(futures::stream::once(async move { Ok(data) }))
}

/// Stream a local file as a [`ByteStream`].
pub async fn file_stream(path: &std::path::Path) -> ObjectStoreResult<ByteStream> {
    let file = tokio::fs::File::open(path).await?;
    Ok(Box::pin(
        ReaderStream::new(file).map(|chunk| chunk.map_err(ObjectStoreError::Io)),
    ))
}
