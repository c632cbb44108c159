//! src/services/scheduler.rs
//!
//! Fixed-interval timers driving the pipelines. Each timer awaits its job
//! inline, so ticks of one timer never overlap; different timers run
//! concurrently. A failing tick is logged and the timer keeps going.

use crate::services::{
    backup_pipeline::BackupPipeline, import_pipeline::ImportPipeline,
    rebuild_pipeline::RebuildPipeline,
};
use std::{fmt, future::Future, sync::Arc, time::Duration};
use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Cadence of each timer.
#[derive(Debug, Clone, Copy)]
pub struct Intervals {
    pub backup: Duration,
    pub backup_sync: Duration,
    pub rebuild_sync: Duration,
    pub import: Duration,
}

impl Default for Intervals {
    fn default() -> Self {
        Self {
            backup: Duration::from_secs(120),
            backup_sync: Duration::from_secs(60),
            rebuild_sync: Duration::from_secs(600),
            import: Duration::from_secs(600),
        }
    }
}

/// Handles to the running timers.
pub struct Scheduler {
    cancel: CancellationToken,
    timers: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn spawn(
        backup: Arc<BackupPipeline>,
        rebuild: Arc<RebuildPipeline>,
        import: Arc<ImportPipeline>,
        intervals: Intervals,
        cancel: CancellationToken,
    ) -> Self {
        let sweep = backup.clone();
        let timers = vec![
            spawn_timer("backup", intervals.backup, cancel.clone(), move || {
                let pipeline = sweep.clone();
                async move { pipeline.sweep().await }
            }),
            spawn_timer("backup-sync", intervals.backup_sync, cancel.clone(), move || {
                let pipeline = backup.clone();
                async move { pipeline.reconcile().await }
            }),
            spawn_timer("rebuild-sync", intervals.rebuild_sync, cancel.clone(), move || {
                let pipeline = rebuild.clone();
                async move { pipeline.sync_pending().await }
            }),
            spawn_timer("import", intervals.import, cancel.clone(), move || {
                let pipeline = import.clone();
                async move { pipeline.run_once().await }
            }),
        ];
        info!(?intervals, "schedulers started");
        Self { cancel, timers }
    }

    /// Stop every timer and wait for running ticks to wind down.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for timer in self.timers {
            if let Err(err) = timer.await {
                error!(error = %err, "scheduler task panicked");
            }
        }
    }
}

/// Run `tick` every `period`, first after one full period, until cancelled.
pub fn spawn_timer<F, Fut, T, E>(
    name: &'static str,
    period: Duration,
    cancel: CancellationToken,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: fmt::Debug,
    E: fmt::Display,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            info!(scheduler = name, "scheduler tick");
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = tick() => match result {
                    Ok(summary) => debug!(scheduler = name, ?summary, "tick finished"),
                    Err(err) => error!(scheduler = name, error = %err, "tick failed"),
                },
            }
        }
        debug!(scheduler = name, "scheduler stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn failing_ticks_do_not_stop_the_timer() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let counter = calls.clone();
        let handle = spawn_timer("test", Duration::from_secs(10), cancel.clone(), move || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    Err("first tick fails")
                } else {
                    Ok(n)
                }
            }
        });

        tokio::time::sleep(Duration::from_secs(35)).await;
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_runs_before_the_first_period() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let counter = calls.clone();
        let handle = spawn_timer("test", Duration::from_secs(60), cancel.clone(), move || {
            let counter = counter.clone();
            async move { Ok::<_, String>(counter.fetch_add(1, Ordering::SeqCst)) }
        });

        tokio::time::sleep(Duration::from_secs(59)).await;
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
