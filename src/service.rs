use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ServiceConfig;
use crate::error::{DownloadError, Result, SitegrabError};
use crate::scheduler::{
    AdmissionController, HostResolver, JobId, JobStore, JobView, RequestedActions,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    /// Waiting jobs plus the running one, if any
    pub queue: usize,
    pub waiting: usize,
    pub running: Option<JobId>,
    pub max_queue: usize,
    pub max_keep_failed_jobs_time: u64,
    pub max_keep_finished_jobs_time: u64,
}

/// Transport-independent operations exposed to clients.
#[derive(Debug, Clone)]
pub struct CaptureService {
    config: Arc<ServiceConfig>,
    store: JobStore,
    admission: AdmissionController,
}

impl CaptureService {
    pub fn new(config: ServiceConfig, store: JobStore, resolver: Arc<dyn HostResolver>) -> Self {
        let admission = AdmissionController::new(store.clone(), resolver, config.max_queue);
        Self {
            config: Arc::new(config),
            store,
            admission,
        }
    }

    pub async fn submit(
        &self,
        url: &str,
        origin: IpAddr,
        actions: RequestedActions,
    ) -> Result<JobId> {
        self.admission.submit(url, origin, actions).await
    }

    pub fn get_job(&self, id: &JobId) -> Result<JobView> {
        self.store
            .get(id)
            .map(|job| job.view())
            .ok_or(SitegrabError::JobNotFound(*id))
    }

    pub fn queue_status(&self) -> QueueStatus {
        let counts = self.store.counts();
        QueueStatus {
            queue: counts.waiting + usize::from(counts.running.is_some()),
            waiting: counts.waiting,
            running: counts.running,
            max_queue: self.config.max_queue,
            max_keep_failed_jobs_time: self.config.failed_retention_secs,
            max_keep_finished_jobs_time: self.config.finished_retention_secs,
        }
    }

    pub async fn download(&self, id: &JobId) -> Result<Vec<u8>> {
        self.download_at(id, Utc::now()).await
    }

    /// Artifact bytes for a job, if its download window is still open at `now`.
    ///
    /// The window is checked here as well as by the retention sweep, so a job
    /// that expired but was not yet swept is already refused.
    pub async fn download_at(&self, id: &JobId, now: DateTime<Utc>) -> Result<Vec<u8>> {
        let job = self.store.get(id).ok_or(DownloadError::NotFound)?;

        let finished = job
            .finished
            .filter(|_| job.is_done())
            .ok_or(DownloadError::NotFinished)?;

        let window = chrono::Duration::try_seconds(
            i64::try_from(self.config.finished_retention_secs).unwrap_or(i64::MAX),
        )
        .unwrap_or(chrono::Duration::MAX);
        let open_until = finished
            .checked_add_signed(window)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        if open_until <= now {
            return Err(DownloadError::Expired.into());
        }

        let path = self.config.artifact_path(job.id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                tracing::error!(
                    job_id = %job.id,
                    artifact = %path.display(),
                    error = %e,
                    "Artifact unavailable"
                );
                Err(DownloadError::ArtifactMissing.into())
            }
        }
    }
}
