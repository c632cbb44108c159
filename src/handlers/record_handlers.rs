//! JSON endpoints over plans, backups, rebuilds and import jobs.
//!
//! Handlers stay thin: they validate the request, call the record store or a
//! pipeline, and wrap the records with their decoded status labels.

use crate::{
    errors::AppError,
    models::{
        backup::{BackupSlice, BackupSliceDeal, ObjectBackup, ObjectRemoval},
        import::{NewS3ImportJob, S3ImportJob},
        plan::{BackupPlan, NewBackupPlan},
        rebuild::ObjectRebuild,
        status::BackupState,
    },
    services::backup_pipeline::BackupRequest,
    state::AppState,
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use tracing::info;

// ---- plans ----

/// `POST /plans`
pub async fn create_plan(
    State(state): State<AppState>,
    Json(plan): Json<NewBackupPlan>,
) -> Result<impl IntoResponse, AppError> {
    if plan.bucket.split(',').all(|b| b.trim().is_empty()) {
        return Err(AppError::bad_request("plan must name at least one bucket"));
    }
    if plan.interval_days <= 0 {
        return Err(AppError::bad_request("interval_days must be positive"));
    }
    let created = state.store.create_plan(&plan).await?;
    info!(plan_id = created.id, "plan created");
    Ok((StatusCode::CREATED, Json(created)))
}

/// `GET /plans`
pub async fn list_plans(State(state): State<AppState>) -> Result<Json<Vec<BackupPlan>>, AppError> {
    Ok(Json(state.store.list_plans().await?))
}

// ---- backups ----

/// `POST /backups`: one-off backup of an object, or of a whole bucket when
/// `object` is empty.
pub async fn submit_backup(
    State(state): State<AppState>,
    Json(request): Json<BackupRequest>,
) -> Result<impl IntoResponse, AppError> {
    if request.bucket.is_empty() {
        return Err(AppError::bad_request("bucket is required"));
    }
    let backup = state.backups.submit(&request).await?;
    Ok((StatusCode::CREATED, Json(backup)))
}

#[derive(Serialize)]
pub struct BackupView {
    #[serde(flatten)]
    pub backup: ObjectBackup,
    pub state: BackupState,
    pub state_label: &'static str,
    pub can_rebuild: bool,
    pub slices: Vec<SliceView>,
}

#[derive(Serialize)]
pub struct SliceView {
    #[serde(flatten)]
    pub slice: BackupSlice,
    pub deals: Vec<BackupSliceDeal>,
}

/// `GET /backups/{id}`
pub async fn get_backup(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<BackupView>, AppError> {
    let backup = state.store.get_backup(id).await?;
    let mut slices = Vec::new();
    for slice in state.store.list_slices(backup.id).await? {
        let deals = state.store.list_slice_deals(slice.id).await?;
        slices.push(SliceView { slice, deals });
    }
    let backup_state = backup.state();
    Ok(Json(BackupView {
        backup,
        state: backup_state,
        state_label: backup_state.label(),
        can_rebuild: backup_state.can_rebuild(),
        slices,
    }))
}

/// `DELETE /backups/{id}`: hides the record from reconciliation and lookups.
pub async fn delete_backup(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, AppError> {
    state.store.soft_delete_backup(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct RemovalRequest {
    pub user_access_key: String,
    pub bucket: String,
    pub objects: Vec<String>,
}

/// `POST /backups/removals`
pub async fn record_removals(
    State(state): State<AppState>,
    Json(request): Json<RemovalRequest>,
) -> Result<impl IntoResponse, AppError> {
    if request.objects.is_empty() {
        return Ok((StatusCode::OK, Json(serde_json::json!({ "recorded": 0 }))));
    }
    let recorded = state
        .backups
        .record_removals(&request.user_access_key, &request.bucket, &request.objects)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "recorded": recorded })),
    ))
}

#[derive(Debug, Deserialize)]
pub struct RemovalQuery {
    pub bucket: String,
}

/// `GET /backups/removals?bucket=..`
pub async fn list_removals(
    State(state): State<AppState>,
    Query(q): Query<RemovalQuery>,
) -> Result<Json<Vec<ObjectRemoval>>, AppError> {
    Ok(Json(state.store.list_removals(&q.bucket).await?))
}

// ---- rebuilds ----

#[derive(Debug, Deserialize)]
pub struct RebuildRequest {
    pub backup_id: i64,
    pub user_access_key: String,
}

/// `POST /rebuilds`
pub async fn request_rebuild(
    State(state): State<AppState>,
    Json(request): Json<RebuildRequest>,
) -> Result<impl IntoResponse, AppError> {
    let rebuild = state
        .rebuilds
        .request(request.backup_id, &request.user_access_key)
        .await?;
    Ok((StatusCode::CREATED, Json(rebuild)))
}

#[derive(Serialize)]
pub struct RebuildView {
    #[serde(flatten)]
    pub rebuild: ObjectRebuild,
    pub status_label: &'static str,
    /// A scheduler tick is driving this record right now.
    pub in_flight: bool,
}

/// `GET /rebuilds/{id}`
pub async fn get_rebuild(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<RebuildView>, AppError> {
    let rebuild = state.store.get_rebuild(id).await?;
    let status_label = rebuild.status().map(|s| s.label()).unwrap_or("unknown");
    let in_flight = state.rebuilds.in_flight().contains(rebuild.id);
    Ok(Json(RebuildView {
        rebuild,
        status_label,
        in_flight,
    }))
}

// ---- imports ----

/// `POST /imports`
pub async fn create_import(
    State(state): State<AppState>,
    Json(job): Json<NewS3ImportJob>,
) -> Result<impl IntoResponse, AppError> {
    if job.endpoint.is_empty() || job.bucket_name.is_empty() || job.target_bucket.is_empty() {
        return Err(AppError::bad_request(
            "endpoint, bucket_name and target_bucket are required",
        ));
    }
    let created = state.store.create_import_job(&job).await?;
    info!(job_id = created.id, source = %created.bucket_name, "import job queued");
    Ok((StatusCode::CREATED, Json(created)))
}

#[derive(Serialize)]
pub struct ImportView {
    #[serde(flatten)]
    pub job: S3ImportJob,
    pub status_label: &'static str,
}

/// `GET /imports/{id}`
pub async fn get_import(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ImportView>, AppError> {
    let job = state.store.get_import_job(id).await?;
    let status_label = job.status().map(|s| s.label()).unwrap_or("unknown");
    Ok(Json(ImportView { job, status_label }))
}
