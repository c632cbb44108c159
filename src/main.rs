use anyhow::{Context, Result};
use axum::Router;
use deal_backup::{
    config::AppConfig,
    routes,
    services::{
        backup_pipeline::BackupPipeline,
        deal_client::MetaClient,
        download_token::DownloadTokens,
        import_pipeline::ImportPipeline,
        object_store::{S3Connector, S3Endpoint, S3ObjectStore},
        rebuild_pipeline::RebuildPipeline,
        record_store::SqliteRecordStore,
        scheduler::Scheduler,
    },
    state::AppState,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{fs, io::ErrorKind, path::Path, str::FromStr, sync::Arc};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting deal-backup with config: {:?}", cfg);

    // --- Ensure staging directory exists ---
    if !cfg.rebuild_path.exists() {
        fs::create_dir_all(&cfg.rebuild_path)
            .with_context(|| format!("creating {}", cfg.rebuild_path.display()))?;
        tracing::info!("Created rebuild directory at {}", cfg.rebuild_path.display());
    }

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let options = SqliteConnectOptions::from_str(db_url)
        .with_context(|| format!("parsing database url `{}`", db_url))?
        .create_if_missing(true);
    let db = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?,
    );
    let store = Arc::new(SqliteRecordStore::new(db));
    store.run_migrations().await?;

    // --- Handle migration mode ---
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Collaborators ---
    let local = S3Endpoint {
        endpoint: cfg.server_endpoint.clone(),
        access_key_id: cfg.root_user.clone(),
        secret_access_key: cfg.root_password.clone(),
        region: String::new(),
        secure: cfg.server_endpoint.starts_with("https://"),
    };
    let objects = Arc::new(S3ObjectStore::new(&local));
    let network = Arc::new(MetaClient::new(
        &cfg.meta_server,
        cfg.swan_key.clone(),
        cfg.swan_token.clone(),
    ));
    if cfg.meta_server.is_empty() {
        tracing::warn!("META_SERVER is empty; deal network calls will fail");
    }
    if cfg.wallet_address.is_empty() {
        tracing::warn!("FS3_WALLET_ADDRESS is empty; backup submission is disabled");
    }
    let tokens = DownloadTokens::new(
        cfg.root_user.clone(),
        cfg.root_password.clone(),
        cfg.host_name.clone(),
    );

    let cancel = CancellationToken::new();
    let backups = Arc::new(BackupPipeline::new(
        store.clone(),
        objects.clone(),
        network.clone(),
        tokens.clone(),
        cfg.wallet_address.clone(),
    ));
    let rebuilds = Arc::new(RebuildPipeline::new(
        store.clone(),
        objects.clone(),
        network,
        cfg.rebuild_path.clone(),
    ));
    let imports = Arc::new(
        ImportPipeline::new(
            store.clone(),
            objects.clone(),
            Arc::new(S3Connector),
            cfg.sync_limit,
        )
        .with_cancellation(cancel.child_token()),
    );

    let scheduler = Scheduler::spawn(
        backups.clone(),
        rebuilds.clone(),
        imports,
        cfg.intervals(),
        cancel.clone(),
    );

    // --- Build router ---
    let state = AppState {
        store,
        objects,
        backups,
        rebuilds,
        tokens,
        rebuild_path: cfg.rebuild_path.clone(),
    };
    let app: Router = routes::routes::routes().with_state(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("Shutdown signal received"),
                _ = shutdown.cancelled() => {}
            }
        })
        .await?;

    scheduler.shutdown().await;
    tracing::info!("Stopped");
    Ok(())
}
