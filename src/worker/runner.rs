use std::path::Path;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::scheduler::{Job, JobStore};
use crate::worker::backend::Backends;

/// Summary of one job's capture actions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub requested: usize,
    pub failed: usize,
}

impl RunReport {
    pub fn any_succeeded(&self) -> bool {
        self.failed < self.requested
    }

    pub fn all_failed(&self) -> bool {
        !self.any_succeeded()
    }
}

/// Runs a job's requested captures one after another.
///
/// A failing capture is recorded on the job (message plus error flag) and
/// the next capture still runs.
#[derive(Debug, Clone)]
pub struct ActionRunner {
    backends: Backends,
    store: JobStore,
    timeout: Option<Duration>,
}

impl ActionRunner {
    pub fn new(backends: Backends, store: JobStore, timeout: Option<Duration>) -> Self {
        Self {
            backends,
            store,
            timeout,
        }
    }

    pub async fn run(&self, job: &Job, work_dir: &Path, cancel: &CancellationToken) -> RunReport {
        let variants = job.actions.variants();
        let mut report = RunReport {
            requested: variants.len(),
            failed: 0,
        };

        for variant in variants {
            let backend = self.backends.for_variant(&variant);
            let outcome = backend
                .capture(&job.url, work_dir, variant, self.timeout, cancel)
                .await;

            if outcome.success {
                tracing::debug!(job_id = %job.id, action = %variant, "Action succeeded");
                continue;
            }

            report.failed += 1;
            tracing::warn!(
                job_id = %job.id,
                action = %variant,
                diagnostics = %outcome.diagnostics,
                "Action failed"
            );
            let recorded = self
                .store
                .update(&job.id, |j| j.record_failure(outcome.diagnostics));
            if recorded.is_none() {
                tracing::error!(job_id = %job.id, "Running job vanished from the store");
            }
        }

        if report.all_failed() {
            tracing::warn!(job_id = %job.id, requested = report.requested, "All actions failed");
        }
        report
    }
}
