mod common;

use axum::{
    Json,
    body::to_bytes,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
};
use chrono::Duration;
use common::{MemoryObjectStore, active_backup, store, tokens};
use deal_backup::{
    handlers::{
        download_handlers::{DownloadQuery, download_bucket, download_object},
        health_handlers::readyz,
        record_handlers::{RebuildRequest, get_backup, get_rebuild, request_rebuild},
    },
    services::{
        archive,
        backup_pipeline::BackupPipeline,
        deal_client::MockDealNetwork,
        rebuild_pipeline::RebuildPipeline,
        record_store::SqliteRecordStore,
    },
    state::AppState,
};
use std::{path::PathBuf, sync::Arc};

struct Harness {
    state: AppState,
    store: Arc<SqliteRecordStore>,
    objects: Arc<MemoryObjectStore>,
    _staging: tempfile::TempDir,
}

async fn harness() -> Harness {
    let store = store().await;
    let objects = MemoryObjectStore::new();
    objects.insert("b1", "a.txt", "alpha");
    objects.insert("b1", "docs/b.txt", "beta");
    let staging = tempfile::tempdir().unwrap();
    let rebuild_path: PathBuf = staging.path().join("rebuild");

    let backups = Arc::new(BackupPipeline::new(
        store.clone(),
        objects.clone(),
        Arc::new(MockDealNetwork::new()),
        tokens(),
        "0xwallet",
    ));
    let rebuilds = Arc::new(RebuildPipeline::new(
        store.clone(),
        objects.clone(),
        Arc::new(MockDealNetwork::new()),
        rebuild_path.clone(),
    ));
    Harness {
        state: AppState {
            store: store.clone(),
            objects: objects.clone(),
            backups,
            rebuilds,
            tokens: tokens(),
            rebuild_path,
        },
        store,
        objects,
        _staging: staging,
    }
}

fn query(token: Option<String>, format: Option<&str>) -> Query<DownloadQuery> {
    Query(DownloadQuery {
        token,
        format: format.map(str::to_string),
    })
}

#[tokio::test]
async fn objects_download_with_a_valid_token() {
    let h = harness().await;
    let token = h.state.tokens.mint().unwrap();

    let response = download_object(
        State(h.state.clone()),
        Path(("b1".into(), "a.txt".into())),
        query(Some(token), None),
    )
    .await
    .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_DISPOSITION],
        "attachment; filename=\"a.txt\""
    );
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(body, "alpha");
}

#[tokio::test]
async fn missing_or_stale_tokens_are_unauthorized() {
    let h = harness().await;

    let Err(err) = download_object(
        State(h.state.clone()),
        Path(("b1".into(), "a.txt".into())),
        query(None, None),
    )
    .await
    else {
        panic!("expected an error");
    };
    assert_eq!(err.status, StatusCode::UNAUTHORIZED);

    let stale = h
        .state
        .tokens
        .mint_with_validity(Duration::seconds(-60))
        .unwrap();
    let Err(err) = download_object(
        State(h.state.clone()),
        Path(("b1".into(), "a.txt".into())),
        query(Some(stale), None),
    )
    .await
    else {
        panic!("expected an error");
    };
    assert_eq!(err.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn buckets_download_as_zip_archives() {
    let h = harness().await;
    let token = h.state.tokens.mint().unwrap();

    let response = download_bucket(
        State(h.state.clone()),
        Path("b1".into()),
        query(Some(token), Some("zip")),
    )
    .await
    .unwrap();
    assert_eq!(response.headers()[header::CONTENT_TYPE], "application/zip");
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let archive_path = dir.path().join("b1.zip");
    std::fs::write(&archive_path, &body).unwrap();
    let unpacked = dir.path().join("b1");
    assert_eq!(archive::unzip(&archive_path, &unpacked).await.unwrap(), 2);
    assert_eq!(std::fs::read_to_string(unpacked.join("a.txt")).unwrap(), "alpha");
    assert_eq!(std::fs::read_to_string(unpacked.join("docs/b.txt")).unwrap(), "beta");
}

#[tokio::test]
async fn missing_objects_are_not_found() {
    let h = harness().await;
    let token = h.state.tokens.mint().unwrap();

    let Err(err) = download_object(
        State(h.state.clone()),
        Path(("b1".into(), "nope.txt".into())),
        query(Some(token), None),
    )
    .await
    else {
        panic!("expected an error");
    };
    assert_eq!(err.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn readiness_checks_store_and_staging_dir() {
    let h = harness().await;
    let response = readyz(State(h.state.clone())).await.into_response();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(h.state.rebuild_path.is_dir());
}

#[tokio::test]
async fn backups_and_rebuilds_read_back_with_labels() {
    let h = harness().await;
    let backup = active_backup(&h.store, "b1", "a.txt", false).await;

    let Json(view) = get_backup(State(h.state.clone()), Path(backup.id))
        .await
        .unwrap();
    assert_eq!(view.state_label, "completed");
    assert!(view.can_rebuild);
    assert!(view.slices.is_empty());

    let created = request_rebuild(
        State(h.state.clone()),
        Json(RebuildRequest {
            backup_id: backup.id,
            user_access_key: "owner".into(),
        }),
    )
    .await
    .unwrap()
    .into_response();
    assert_eq!(created.status(), StatusCode::CREATED);
    let body = to_bytes(created.into_body(), usize::MAX).await.unwrap();
    let rebuild: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let rebuild_id = rebuild["id"].as_i64().unwrap();

    let Json(view) = get_rebuild(State(h.state.clone()), Path(rebuild_id))
        .await
        .unwrap();
    assert_eq!(view.status_label, "ready");
    assert!(!view.in_flight);
    assert_eq!(h.objects.put_count(), 0);

    let Err(err) = get_backup(State(h.state.clone()), Path(9_999)).await else {
        panic!("expected an error");
    };
    assert_eq!(err.status, StatusCode::NOT_FOUND);
}
