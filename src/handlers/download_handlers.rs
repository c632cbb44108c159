//! Token-guarded downloads of live objects.
//!
//! These are the URLs handed to the deal network at submission time. A
//! single object streams straight from the object server; a directory (or
//! any request with `format=zip`) is materialised under a temp dir, zipped
//! and streamed back.

use crate::{
    errors::AppError,
    services::{
        archive,
        object_store::{ObjectStore, ObjectStoreResult},
    },
    state::AppState,
};
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode, header},
    response::Response,
};
use futures::StreamExt;
use serde::Deserialize;
use std::path::{Component, Path as FsPath};
use tokio::{fs, io::AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    pub token: Option<String>,
    pub format: Option<String>,
}

impl DownloadQuery {
    fn wants_zip(&self) -> bool {
        self.format
            .as_deref()
            .is_some_and(|f| f.eq_ignore_ascii_case("zip"))
    }
}

/// `GET /download/{bucket}`: the whole bucket as a zip archive.
pub async fn download_bucket(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, AppError> {
    download(&state, &bucket, "", &query).await
}

/// `GET /download/{bucket}/{*key}`
pub async fn download_object(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, AppError> {
    download(&state, &bucket, &key, &query).await
}

async fn download(
    state: &AppState,
    bucket: &str,
    key: &str,
    query: &DownloadQuery,
) -> Result<Response, AppError> {
    let token = query
        .token
        .as_deref()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AppError::unauthorized("missing download token"))?;
    let claims = state.tokens.verify(token)?;
    debug!(bucket, key, access_key = %claims.access_key, "download authorised");

    let stat = state.objects.stat_object(bucket, key).await?;
    if stat.is_dir || query.wants_zip() {
        return zip_response(state.objects.as_ref(), bucket, key, stat.is_dir).await;
    }

    let stream = state.objects.get_object(bucket, key).await?;
    let file_name = base_name(key, bucket);
    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(stat.size));
    set_attachment(headers, &file_name);
    Ok(response)
}

async fn zip_response(
    objects: &dyn ObjectStore,
    bucket: &str,
    key: &str,
    is_dir: bool,
) -> Result<Response, AppError> {
    let workdir = tempfile::tempdir().map_err(|e| AppError::internal(e.to_string()))?;
    let root = workdir.path().join("root");
    let archive_path = workdir.path().join("payload.zip");

    let prefix = if !is_dir {
        // A single object zips under its own base name.
        key.rsplit_once('/')
            .map(|(parent, _)| format!("{parent}/"))
            .unwrap_or_default()
    } else if key.is_empty() || key.ends_with('/') {
        key.to_string()
    } else {
        format!("{key}/")
    };
    let only = (!is_dir).then_some(key);
    let fetched = fetch_tree(objects, bucket, &prefix, only, &root).await?;
    let zipped = archive::zip_dir(&root, &archive_path).await?;
    info!(bucket, prefix = %prefix, fetched, zipped, "serving zip download");

    let file = fs::File::open(&archive_path)
        .await
        .map_err(|e| AppError::internal(e.to_string()))?;
    let length = file
        .metadata()
        .await
        .map_err(|e| AppError::internal(e.to_string()))?
        .len();
    // The stream owns the temp dir; it is removed once the body is dropped.
    let stream = ReaderStream::new(file).map(move |chunk| {
        let _workdir = &workdir;
        chunk
    });

    let file_name = format!("{}.zip", base_name(key, bucket));
    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/zip"));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    set_attachment(headers, &file_name);
    Ok(response)
}

/// Copy every object under `prefix` into `root`, keyed by its path below the
/// prefix. With `only`, just that key is copied.
async fn fetch_tree(
    objects: &dyn ObjectStore,
    bucket: &str,
    prefix: &str,
    only: Option<&str>,
    root: &FsPath,
) -> ObjectStoreResult<usize> {
    fs::create_dir_all(root).await?;
    let mut fetched = 0;
    for entry in objects.list_objects(bucket, prefix).await? {
        let info = entry?;
        if only.is_some_and(|key| key != info.key) {
            continue;
        }
        let relative = info.key.strip_prefix(prefix).unwrap_or(&info.key);
        if relative.is_empty() || relative.ends_with('/') {
            continue;
        }
        let relative_path = FsPath::new(relative);
        if !relative_path
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            warn!(bucket, key = %info.key, "skipping object with unsafe path");
            continue;
        }

        let dest = root.join(relative_path);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut body = objects.get_object(bucket, &info.key).await?;
        let mut file = fs::File::create(&dest).await?;
        while let Some(chunk) = body.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        fetched += 1;
    }
    Ok(fetched)
}

fn base_name(key: &str, bucket: &str) -> String {
    key.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or(bucket)
        .to_string()
}

fn set_attachment(headers: &mut axum::http::HeaderMap, file_name: &str) {
    let value = format!("attachment; filename=\"{}\"", file_name.replace('"', ""));
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_name_falls_back_to_bucket() {
        assert_eq!(base_name("a/b/c.txt", "bkt"), "c.txt");
        assert_eq!(base_name("albums/", "bkt"), "albums");
        assert_eq!(base_name("", "bkt"), "bkt");
    }

    #[test]
    fn zip_format_is_case_insensitive() {
        let query = DownloadQuery {
            token: None,
            format: Some("ZIP".into()),
        };
        assert!(query.wants_zip());
        let query = DownloadQuery {
            token: None,
            format: None,
        };
        assert!(!query.wants_zip());
    }
}
