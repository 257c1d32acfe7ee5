use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::config::artifact_path;
use crate::scheduler::{Job, JobStore};

/// Evicts finished jobs once their retention window has passed.
#[derive(Debug, Clone)]
pub struct RetentionSweep {
    store: JobStore,
    work_root: PathBuf,
    failed_retention: chrono::Duration,
    finished_retention: chrono::Duration,
}

impl RetentionSweep {
    pub fn new(
        store: JobStore,
        work_root: impl Into<PathBuf>,
        failed_retention_secs: u64,
        finished_retention_secs: u64,
    ) -> Self {
        Self {
            store,
            work_root: work_root.into(),
            failed_retention: secs(failed_retention_secs),
            finished_retention: secs(finished_retention_secs),
        }
    }

    /// Remove expired jobs as of `now`. Returns the removed jobs in arrival order.
    ///
    /// An expired job's artifact is deleted before its record goes; a failed
    /// deletion is logged and the record is removed anyway.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<Job> {
        let failed_cutoff = cutoff(now, self.failed_retention);
        let finished_cutoff = cutoff(now, self.finished_retention);

        let removed = self.store.remove_where(|job| {
            let Some(finished) = job.finished.filter(|_| job.is_done()) else {
                return false;
            };

            let expired = if job.error {
                finished < failed_cutoff
            } else {
                finished < finished_cutoff
            };
            if !expired {
                return false;
            }

            // Partially successful jobs carry an artifact too.
            let artifact = artifact_path(&self.work_root, job.id);
            match std::fs::remove_file(&artifact) {
                Ok(()) => {}
                Err(e) if job.error && e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::error!(
                    job_id = %job.id,
                    artifact = %artifact.display(),
                    error = %e,
                    "Failed to remove artifact"
                ),
            }
            true
        });

        for job in &removed {
            if job.error {
                tracing::debug!(job_id = %job.id, "Removed failed job (cleanup)");
            } else {
                tracing::debug!(job_id = %job.id, "Removed finished job (cleanup)");
            }
        }
        removed
    }

    /// Sweep on a fixed cadence until `shutdown` fires.
    pub async fn run(self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!("Retention sweep stopped");
                    break;
                }
                _ = ticker.tick() => {
                    self.sweep(Utc::now());
                }
            }
        }
    }
}

fn secs(value: u64) -> chrono::Duration {
    chrono::Duration::try_seconds(i64::try_from(value).unwrap_or(i64::MAX))
        .unwrap_or(chrono::Duration::MAX)
}

fn cutoff(now: DateTime<Utc>, retention: chrono::Duration) -> DateTime<Utc> {
    now.checked_sub_signed(retention)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
