use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::api::{run_api, ApiState};
use crate::config::ServiceConfig;
use crate::error::{Result, SitegrabError};
use crate::scheduler::{HostResolver, JobStore};
use crate::service::CaptureService;
use crate::worker::{ActionRunner, Backends, Dispatcher, RetentionSweep};

/// Owns every component of a running service.
#[derive(Debug)]
pub struct Server {
    pub config: ServiceConfig,
    pub store: JobStore,
    pub service: CaptureService,
    pub dispatcher: Dispatcher,
    pub retention: RetentionSweep,
}

impl Server {
    pub fn new(config: ServiceConfig, backends: Backends, resolver: Arc<dyn HostResolver>) -> Self {
        let store = JobStore::new();
        let runner = ActionRunner::new(backends, store.clone(), config.backend.timeout);

        Self {
            dispatcher: Dispatcher::new(store.clone(), runner, config.work_root.clone()),
            retention: RetentionSweep::new(
                store.clone(),
                config.work_root.clone(),
                config.failed_retention_secs,
                config.finished_retention_secs,
            ),
            service: CaptureService::new(config.clone(), store.clone(), resolver),
            store,
            config,
        }
    }

    /// Create the working root and the scratch directory below it.
    pub async fn prepare_work_root(config: &ServiceConfig) -> Result<()> {
        let scratch = config.work_root.join("work");
        tokio::fs::create_dir_all(&scratch).await.map_err(|e| {
            SitegrabError::Startup(format!(
                "unable to create working root {}: {}",
                scratch.display(),
                e
            ))
        })?;
        Ok(())
    }

    /// Run the service until `shutdown` fires or the HTTP server fails.
    ///
    /// 1. Creates the working root
    /// 2. Binds the HTTP listener
    /// 3. Spawns the retention sweep and the dispatcher
    /// 4. Serves the HTTP API (blocking)
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        Self::prepare_work_root(&self.config).await?;

        let listener = tokio::net::TcpListener::bind(self.config.listen_addr)
            .await
            .map_err(|e| {
                SitegrabError::Startup(format!(
                    "unable to bind {}: {}",
                    self.config.listen_addr, e
                ))
            })?;

        let sweep_interval = Duration::from_millis(self.config.sweep_interval_ms.max(1));
        let retention = tokio::spawn(self.retention.run(sweep_interval, shutdown.clone()));
        let dispatcher = tokio::spawn(self.dispatcher.run(shutdown.clone()));

        let state = ApiState {
            service: self.service,
        };
        let served = run_api(listener, state, shutdown.clone()).await;

        // The API stopping for any reason takes the background tasks down with it.
        shutdown.cancel();
        for (name, handle) in [("retention", retention), ("dispatcher", dispatcher)] {
            if let Err(e) = handle.await {
                tracing::error!(task = name, error = %e, "Background task panicked");
            }
        }

        served.map_err(SitegrabError::from)
    }
}
