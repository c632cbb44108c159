mod common;

use common::{FixedConnector, MemoryObjectStore, import_job, store};
use deal_backup::{
    models::status::ImportStatus,
    services::{
        import_pipeline::{ImportOutcome, ImportPipeline},
        record_store::RecordStore,
    },
};
use std::sync::Arc;

fn source() -> Arc<MemoryObjectStore> {
    let source = MemoryObjectStore::new();
    source.insert("src", "a.txt", "aaa");
    source.insert("src", "docs/b.txt", "bbbbb");
    source.insert("src", "docs/c.txt", "cc");
    source
}

#[tokio::test]
async fn same_size_objects_are_skipped_and_the_rest_copied() {
    let store = store().await;
    let source = source();
    let target = MemoryObjectStore::new();
    target.insert("dst", "a.txt", "zzz");
    let job = store.create_import_job(&import_job("src", "dst")).await.unwrap();

    let pipeline = ImportPipeline::new(
        store.clone(),
        target.clone(),
        Arc::new(FixedConnector(source)),
        2,
    );
    let outcome = pipeline.run_once().await.unwrap();
    assert_eq!(
        outcome,
        ImportOutcome::Finished {
            job_id: job.id,
            status: ImportStatus::Imported,
            copied: 2,
            skipped: 1,
            failed: 0,
        }
    );

    // Same size means already imported, even with different bytes.
    assert_eq!(target.object("dst", "a.txt").unwrap(), "zzz");
    assert_eq!(target.object("dst", "docs/b.txt").unwrap(), "bbbbb");
    assert_eq!(target.put_count(), 2);

    let job = store.get_import_job(job.id).await.unwrap();
    assert_eq!(job.status, ImportStatus::Imported.code());
    assert_eq!(job.progress, 100);

    assert_eq!(pipeline.run_once().await.unwrap(), ImportOutcome::Idle);
}

#[tokio::test]
async fn a_missing_target_bucket_is_created() {
    let store = store().await;
    let target = MemoryObjectStore::new();
    store.create_import_job(&import_job("src", "fresh")).await.unwrap();

    let pipeline = ImportPipeline::new(store, target.clone(), Arc::new(FixedConnector(source())), 0);
    let outcome = pipeline.run_once().await.unwrap();

    assert!(matches!(
        outcome,
        ImportOutcome::Finished {
            status: ImportStatus::Imported,
            copied: 3,
            ..
        }
    ));
    assert_eq!(target.keys("fresh").len(), 3);
}

#[tokio::test]
async fn a_missing_source_bucket_fails_the_job() {
    let store = store().await;
    let job = store.create_import_job(&import_job("nope", "dst")).await.unwrap();
    let target = MemoryObjectStore::new();

    let pipeline = ImportPipeline::new(store.clone(), target.clone(), Arc::new(FixedConnector(source())), 4);
    let outcome = pipeline.run_once().await.unwrap();
    assert_eq!(outcome, ImportOutcome::SourceMissing { job_id: job.id });

    let job = store.get_import_job(job.id).await.unwrap();
    assert_eq!(job.status, ImportStatus::Failed.code());
    assert!(job.status_msg.contains("nope"));
    assert!(target.bucket_names().is_empty());
}

#[tokio::test]
async fn partial_imports_stay_importing_and_resume_after_restart() {
    let store = store().await;
    let source = source();
    source.fail_get("docs/b.txt");
    let target = MemoryObjectStore::new();
    let job = store.create_import_job(&import_job("src", "dst")).await.unwrap();

    let pipeline = ImportPipeline::new(
        store.clone(),
        target.clone(),
        Arc::new(FixedConnector(source.clone())),
        3,
    );
    let outcome = pipeline.run_once().await.unwrap();
    assert_eq!(
        outcome,
        ImportOutcome::Finished {
            job_id: job.id,
            status: ImportStatus::Importing,
            copied: 2,
            skipped: 0,
            failed: 1,
        }
    );
    let stored = store.get_import_job(job.id).await.unwrap();
    assert_eq!(stored.status, ImportStatus::Importing.code());

    // A running process only picks up new jobs.
    assert_eq!(pipeline.run_once().await.unwrap(), ImportOutcome::Idle);

    // A restarted process resumes it, skipping what already landed.
    source.clear_failures();
    let restarted = ImportPipeline::new(store.clone(), target.clone(), Arc::new(FixedConnector(source)), 3);
    let outcome = restarted.run_once().await.unwrap();
    assert_eq!(
        outcome,
        ImportOutcome::Finished {
            job_id: job.id,
            status: ImportStatus::Imported,
            copied: 1,
            skipped: 2,
            failed: 0,
        }
    );
    assert_eq!(store.get_import_job(job.id).await.unwrap().progress, 100);
}
