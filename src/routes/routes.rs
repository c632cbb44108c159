//! Defines every HTTP route the service exposes.
//!
//! ## Structure
//! - **Probes**
//!   - `GET    /healthz`, `GET /readyz`
//!
//! - **Downloads** (token in `?token=`, `format=zip` for directories)
//!   - `GET    /download/{bucket}`
//!   - `GET    /download/{bucket}/{*key}`
//!
//! - **Records**
//!   - `POST   /plans`, `GET /plans`
//!   - `POST   /backups`, `GET /backups/{id}`, `DELETE /backups/{id}`
//!   - `POST   /backups/removals`, `GET /backups/removals?bucket=`
//!   - `POST   /rebuilds`, `GET /rebuilds/{id}`
//!   - `POST   /imports`, `GET /imports/{id}`

use crate::{
    handlers::{
        download_handlers::{download_bucket, download_object},
        health_handlers::{healthz, readyz},
        record_handlers::{
            create_import, create_plan, delete_backup, get_backup, get_import, get_rebuild,
            list_plans, list_removals, record_removals, request_rebuild, submit_backup,
        },
    },
    state::AppState,
};
use axum::{
    Router,
    routing::{get, post},
};

/// Build the router. Handlers share [`AppState`].
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // downloads handed to the deal network
        .route("/download/{bucket}", get(download_bucket))
        .route("/download/{bucket}/{*key}", get(download_object))
        // records
        .route("/plans", post(create_plan).get(list_plans))
        .route("/backups", post(submit_backup))
        .route("/backups/removals", post(record_removals).get(list_removals))
        .route("/backups/{id}", get(get_backup).delete(delete_backup))
        .route("/rebuilds", post(request_rebuild))
        .route("/rebuilds/{id}", get(get_rebuild))
        .route("/imports", post(create_import))
        .route("/imports/{id}", get(get_import))
}
