use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::scheduler::JobId;

/// Configuration for the Docker-hosted capture backends.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Docker CLI binary used to launch capture containers
    pub docker_bin: String,
    /// Image that performs the full-page browser save
    pub browser_image: String,
    /// Image that renders screenshots
    pub screenshot_image: String,
    /// Screenshot viewport (e.g., "1920x1080")
    pub resolution: String,
    /// Upper bound on a single capture. `None` lets a capture run as long as it needs.
    pub timeout: Option<Duration>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            docker_bin: "docker".to_string(),
            browser_image: "gts-browser".to_string(),
            screenshot_image: "gts-pageres".to_string(),
            resolution: "1920x1080".to_string(),
            timeout: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub listen_addr: SocketAddr,
    /// Maximum number of waiting jobs
    pub max_queue: usize,
    /// How long a failed job stays visible after it finished
    pub failed_retention_secs: u64,
    /// How long a successful job and its artifact stay downloadable
    pub finished_retention_secs: u64,
    /// Root directory holding artifacts and per-job working directories
    pub work_root: PathBuf,
    pub sweep_interval_ms: u64,
    pub backend: BackendConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "127.0.0.1:12810"
                .parse()
                .expect("default listen address is valid"),
            max_queue: 10,
            failed_retention_secs: 5,
            finished_retention_secs: 60,
            work_root: std::env::temp_dir().join("sitegrab"),
            sweep_interval_ms: 1000,
            backend: BackendConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn new(listen_addr: SocketAddr, work_root: impl Into<PathBuf>) -> Self {
        Self {
            listen_addr,
            work_root: work_root.into(),
            ..Default::default()
        }
    }

    pub fn with_max_queue(mut self, max_queue: usize) -> Self {
        self.max_queue = max_queue;
        self
    }

    pub fn with_retention(mut self, failed_secs: u64, finished_secs: u64) -> Self {
        self.failed_retention_secs = failed_secs;
        self.finished_retention_secs = finished_secs;
        self
    }

    pub fn with_sweep_interval_ms(mut self, interval_ms: u64) -> Self {
        self.sweep_interval_ms = interval_ms;
        self
    }

    pub fn with_backend(mut self, backend: BackendConfig) -> Self {
        self.backend = backend;
        self
    }

    /// Location of the packaged archive for a job.
    pub fn artifact_path(&self, id: JobId) -> PathBuf {
        artifact_path(&self.work_root, id)
    }

    /// Scratch directory a job's capture backends write into.
    pub fn work_dir(&self, id: JobId) -> PathBuf {
        work_dir(&self.work_root, id)
    }
}

pub fn artifact_path(work_root: &Path, id: JobId) -> PathBuf {
    work_root.join(format!("{}.zip", id))
}

pub fn work_dir(work_root: &Path, id: JobId) -> PathBuf {
    work_root.join("work").join(id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_config_default() {
        let cfg = BackendConfig::default();
        assert_eq!(cfg.docker_bin, "docker");
        assert_eq!(cfg.browser_image, "gts-browser");
        assert_eq!(cfg.screenshot_image, "gts-pageres");
        assert_eq!(cfg.resolution, "1920x1080");
        assert!(cfg.timeout.is_none());
    }

    #[test]
    fn service_config_default() {
        let cfg = ServiceConfig::default();
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:12810");
        assert_eq!(cfg.max_queue, 10);
        assert_eq!(cfg.failed_retention_secs, 5);
        assert_eq!(cfg.finished_retention_secs, 60);
        assert_eq!(cfg.sweep_interval_ms, 1000);
        assert!(cfg.work_root.ends_with("sitegrab"));
    }

    #[test]
    fn service_config_builders() {
        let addr: SocketAddr = "0.0.0.0:9000".parse().unwrap();
        let cfg = ServiceConfig::new(addr, "/srv/grab")
            .with_max_queue(3)
            .with_retention(1, 2)
            .with_sweep_interval_ms(50);
        assert_eq!(cfg.listen_addr, addr);
        assert_eq!(cfg.work_root, PathBuf::from("/srv/grab"));
        assert_eq!(cfg.max_queue, 3);
        assert_eq!(cfg.failed_retention_secs, 1);
        assert_eq!(cfg.finished_retention_secs, 2);
        assert_eq!(cfg.sweep_interval_ms, 50);
    }

    #[test]
    fn artifact_and_work_paths_are_keyed_by_job_id() {
        let cfg = ServiceConfig::new("127.0.0.1:0".parse().unwrap(), "/srv/grab");
        let id = JobId::new();
        assert_eq!(
            cfg.artifact_path(id),
            PathBuf::from(format!("/srv/grab/{}.zip", id))
        );
        assert_eq!(
            cfg.work_dir(id),
            PathBuf::from(format!("/srv/grab/work/{}", id))
        );
    }
}
