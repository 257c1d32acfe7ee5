use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::config::{artifact_path, work_dir};
use crate::scheduler::{Job, JobStore};
use crate::worker::packager;
use crate::worker::runner::ActionRunner;

/// The single job dispatcher.
///
/// Wakes on the store's work-available signal, starts the earliest waiting job
/// and runs it to completion before looking for the next one. The store lock
/// is only held for the start and finish transitions, never while captures run.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    store: JobStore,
    runner: ActionRunner,
    work_root: PathBuf,
}

impl Dispatcher {
    pub fn new(store: JobStore, runner: ActionRunner, work_root: impl Into<PathBuf>) -> Self {
        Self {
            store,
            runner,
            work_root: work_root.into(),
        }
    }

    /// Start and run the next waiting job, if nothing else is running.
    ///
    /// Returns the job as stored once it is done.
    pub async fn dispatch_next(&self, cancel: &CancellationToken) -> Option<Job> {
        let job = self.store.try_dispatch_next(Utc::now())?;
        tracing::info!(job_id = %job.id, url = %job.url, "Job started");

        self.execute(&job, cancel).await;

        let finished = self.store.finish(&job.id, Utc::now());
        match &finished {
            Some(done) => tracing::info!(
                job_id = %done.id,
                error = done.error,
                failures = done.messages.len(),
                "Job finished"
            ),
            None => tracing::error!(job_id = %job.id, "Finished job missing from store"),
        }
        finished
    }

    async fn execute(&self, job: &Job, cancel: &CancellationToken) {
        let work_dir = work_dir(&self.work_root, job.id);

        if let Err(e) = prepare_work_dir(&work_dir).await {
            tracing::error!(
                job_id = %job.id,
                work_dir = %work_dir.display(),
                error = %e,
                "Unable to prepare working directory"
            );
            let requested = job.actions.count();
            self.store.update(&job.id, |j| {
                for _ in 0..requested {
                    j.record_failure("unable to prepare working directory");
                }
            });
            return;
        }

        let report = self.runner.run(job, &work_dir, cancel).await;

        if report.any_succeeded() {
            let artifact = artifact_path(&self.work_root, job.id);
            let source = work_dir.clone();
            let packaged =
                tokio::task::spawn_blocking(move || packager::package(&source, &artifact)).await;
            match packaged {
                Ok(Ok(())) => tracing::debug!(job_id = %job.id, "Job packaged"),
                Ok(Err(e)) => {
                    tracing::error!(job_id = %job.id, error = %e, "Packaging failed")
                }
                Err(e) => {
                    tracing::error!(job_id = %job.id, error = %e, "Packaging task panicked")
                }
            }
        }

        if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
            tracing::warn!(
                job_id = %job.id,
                work_dir = %work_dir.display(),
                error = %e,
                "Unable to remove working directory"
            );
        }
    }

    /// Dispatch jobs until `shutdown` fires. A running job is cancelled through
    /// the same token.
    pub async fn run(self, shutdown: CancellationToken) {
        let work_available = self.store.work_available();
        tracing::info!(work_root = %self.work_root.display(), "Dispatcher started");

        loop {
            while !shutdown.is_cancelled() {
                if self.dispatch_next(&shutdown).await.is_none() {
                    break;
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = work_available.notified() => {}
            }
        }

        tracing::info!("Dispatcher stopped");
    }
}

async fn prepare_work_dir(work_dir: &Path) -> std::io::Result<()> {
    if tokio::fs::try_exists(work_dir).await? {
        tokio::fs::remove_dir_all(work_dir).await?;
    }
    tokio::fs::create_dir_all(work_dir).await
}
