use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::BackendConfig;
use crate::error::{Result, SitegrabError};
use crate::scheduler::{BrowserSave, CaptureVariant, ScreenshotFormat};

/// Result of one capture attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureOutcome {
    pub success: bool,
    /// Short diagnostic recorded on the job when the capture fails
    pub diagnostics: String,
}

impl CaptureOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            diagnostics: String::new(),
        }
    }

    pub fn failed(diagnostics: impl Into<String>) -> Self {
        Self {
            success: false,
            diagnostics: diagnostics.into(),
        }
    }
}

/// A capture backend turns a URL into files inside `out_dir`.
///
/// Implementations must honour `cancel` and, when given, `timeout`, and report
/// either as a failed outcome.
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn capture(
        &self,
        url: &str,
        out_dir: &Path,
        variant: CaptureVariant,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> CaptureOutcome;
}

/// The pair of backends a job can request.
#[derive(Clone)]
pub struct Backends {
    pub browser: Arc<dyn CaptureBackend>,
    pub screenshot: Arc<dyn CaptureBackend>,
}

impl std::fmt::Debug for Backends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backends")
            .field("browser", &self.browser.name())
            .field("screenshot", &self.screenshot.name())
            .finish()
    }
}

impl Backends {
    pub fn new(browser: Arc<dyn CaptureBackend>, screenshot: Arc<dyn CaptureBackend>) -> Self {
        Self {
            browser,
            screenshot,
        }
    }

    pub fn docker(config: &BackendConfig) -> Self {
        Self::new(
            Arc::new(DockerBrowserBackend::new(config.clone())),
            Arc::new(DockerScreenshotBackend::new(config.clone())),
        )
    }

    pub fn for_variant(&self, variant: &CaptureVariant) -> &Arc<dyn CaptureBackend> {
        match variant {
            CaptureVariant::BrowserSave(_) => &self.browser,
            CaptureVariant::Screenshot(_) => &self.screenshot,
        }
    }
}

enum RunError {
    Spawn(std::io::Error),
    TimedOut(Duration),
    Cancelled,
}

struct RunOutput {
    success: bool,
    exit_code: Option<i32>,
    console: String,
}

/// Upper bound on the `docker rm -f` issued after an aborted capture.
const CONTAINER_REMOVE_TIMEOUT: Duration = Duration::from_secs(30);

/// Unique `--name` for one capture container.
fn container_name(backend: &str) -> String {
    format!("sitegrab-{}-{}", backend, Uuid::new_v4().simple())
}

/// Run a `docker run` command for the container named `container`.
///
/// On timeout or cancellation the client is killed and the container is
/// force-removed before returning, so no capture outlives its action.
async fn run_docker(
    config: &BackendConfig,
    container: &str,
    args: &[String],
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> std::result::Result<RunOutput, RunError> {
    let child = Command::new(&config.docker_bin)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let deadline = async {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };

    // The client future is dropped, and the client killed, when select! returns.
    let finished = tokio::select! {
        result = child => result.map_err(RunError::Spawn),
        _ = deadline => Err(RunError::TimedOut(timeout.unwrap_or_default())),
        _ = cancel.cancelled() => Err(RunError::Cancelled),
    };
    let output = match finished {
        Ok(output) => output,
        Err(e @ (RunError::TimedOut(_) | RunError::Cancelled)) => {
            remove_container(config, container).await;
            return Err(e);
        }
        Err(e) => return Err(e),
    };

    let mut console = String::from_utf8_lossy(&output.stdout).to_string();
    console.push_str(&String::from_utf8_lossy(&output.stderr));

    Ok(RunOutput {
        success: output.status.success(),
        exit_code: output.status.code(),
        console,
    })
}

async fn remove_container(config: &BackendConfig, container: &str) {
    let removal = Command::new(&config.docker_bin)
        .args(["rm", "-f", container])
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(CONTAINER_REMOVE_TIMEOUT, removal).await {
        Ok(Ok(out)) if out.status.success() => {
            tracing::debug!(container, "Capture container removed")
        }
        Ok(Ok(out)) => tracing::error!(
            container,
            stderr = %String::from_utf8_lossy(&out.stderr).trim(),
            "Unable to remove capture container"
        ),
        Ok(Err(e)) => {
            tracing::error!(container, error = %e, "Unable to remove capture container")
        }
        Err(_) => tracing::error!(container, "Timed out removing capture container"),
    }
}

fn describe_run_error(backend: &str, url: &str, error: &RunError) -> String {
    match error {
        RunError::Spawn(e) => {
            tracing::error!(backend, url, error = %e, "Capture backend failed to start");
            format!("{} could not start: {}", backend, e)
        }
        RunError::TimedOut(limit) => {
            tracing::error!(backend, url, timeout = ?limit, "Capture backend timed out");
            format!("{} timed out after {:?}", backend, limit)
        }
        RunError::Cancelled => {
            tracing::warn!(backend, url, "Capture backend cancelled");
            format!("{} cancelled", backend)
        }
    }
}

fn volume_arg(out_dir: &Path) -> String {
    format!("{}:/output", out_dir.display())
}

/// Full-page "save as" through a browser running in a container.
#[derive(Debug, Clone)]
pub struct DockerBrowserBackend {
    config: BackendConfig,
}

impl DockerBrowserBackend {
    pub fn new(config: BackendConfig) -> Self {
        Self { config }
    }

    pub fn args(
        &self,
        container: &str,
        url: &str,
        out_dir: &Path,
        save: BrowserSave,
    ) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            container.to_string(),
            "-v".to_string(),
            volume_arg(out_dir),
            "--cap-add".to_string(),
            "SYS_ADMIN".to_string(),
            self.config.browser_image.clone(),
            "sh".to_string(),
            "/opt/run.sh".to_string(),
            url.to_string(),
            save.browser.as_str().to_string(),
        ];
        if save.fix {
            args.push("fix".to_string());
        }
        args
    }
}

#[async_trait]
impl CaptureBackend for DockerBrowserBackend {
    fn name(&self) -> &'static str {
        "browser"
    }

    async fn capture(
        &self,
        url: &str,
        out_dir: &Path,
        variant: CaptureVariant,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> CaptureOutcome {
        let CaptureVariant::BrowserSave(save) = variant else {
            return CaptureOutcome::failed(format!("browser backend cannot run {}", variant));
        };

        tracing::info!(url, browser = save.browser.as_str(), fix = save.fix, "Saving page");

        let container = container_name(self.name());
        let args = self.args(&container, url, out_dir, save);
        match run_docker(&self.config, &container, &args, timeout, cancel).await {
            Ok(out) if !out.success => {
                tracing::error!(url, exit_code = ?out.exit_code, output = %out.console, "Browser save failed");
                CaptureOutcome::failed("unable to save page as browser")
            }
            Ok(out) => {
                if out.console.contains("Saving web page") && out.console.contains("Done") {
                    tracing::debug!(url, output = %out.console, "Browser save finished");
                    CaptureOutcome::ok()
                } else {
                    tracing::error!(url, output = %out.console, "Browser save reported no result");
                    CaptureOutcome::failed("unable to save page as browser")
                }
            }
            Err(e) => CaptureOutcome::failed(describe_run_error(self.name(), url, &e)),
        }
    }
}

/// Screenshot rendering with pageres in a container.
#[derive(Debug, Clone)]
pub struct DockerScreenshotBackend {
    config: BackendConfig,
}

impl DockerScreenshotBackend {
    pub fn new(config: BackendConfig) -> Self {
        Self { config }
    }

    pub fn args(
        &self,
        container: &str,
        url: &str,
        out_dir: &Path,
        format: ScreenshotFormat,
    ) -> Vec<String> {
        vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            container.to_string(),
            "-v".to_string(),
            volume_arg(out_dir),
            self.config.screenshot_image.clone(),
            "sh".to_string(),
            "-c".to_string(),
            format!(
                "cd /output && pageres '{}' {} --format={}",
                url.replace('\'', "%27"),
                self.config.resolution,
                format.as_str()
            ),
        ]
    }
}

#[async_trait]
impl CaptureBackend for DockerScreenshotBackend {
    fn name(&self) -> &'static str {
        "screenshot"
    }

    async fn capture(
        &self,
        url: &str,
        out_dir: &Path,
        variant: CaptureVariant,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> CaptureOutcome {
        let CaptureVariant::Screenshot(format) = variant else {
            return CaptureOutcome::failed(format!("screenshot backend cannot run {}", variant));
        };

        tracing::info!(url, format = format.as_str(), "Rendering screenshot");

        let container = container_name(self.name());
        let args = self.args(&container, url, out_dir, format);
        match run_docker(&self.config, &container, &args, timeout, cancel).await {
            Ok(out) if out.success && out.console.contains("Generated 1 screenshot") => {
                tracing::debug!(url, output = %out.console, "Screenshot finished");
                CaptureOutcome::ok()
            }
            Ok(out) => {
                tracing::error!(url, exit_code = ?out.exit_code, output = %out.console, "Screenshot failed");
                CaptureOutcome::failed("unable to create screenshot")
            }
            Err(e) => CaptureOutcome::failed(describe_run_error(self.name(), url, &e)),
        }
    }
}

/// Check that the docker daemon answers and both capture images exist locally.
pub async fn verify_images(config: &BackendConfig) -> Result<()> {
    let output = Command::new(&config.docker_bin)
        .args(["images", "--format", "{{.Repository}}"])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| {
            SitegrabError::Startup(format!(
                "error running \"{} images\": {} (docker daemon not running?)",
                config.docker_bin, e
            ))
        })?;

    if !output.status.success() {
        return Err(SitegrabError::Startup(format!(
            "\"{} images\" failed: {}",
            config.docker_bin,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let listing = String::from_utf8_lossy(&output.stdout);
    for image in [&config.browser_image, &config.screenshot_image] {
        if !listing.lines().any(|line| line.trim() == image.as_str()) {
            return Err(SitegrabError::Startup(format!(
                "missing {} docker image",
                image
            )));
        }
    }

    tracing::info!(
        browser_image = %config.browser_image,
        screenshot_image = %config.screenshot_image,
        "Capture images available"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::BrowserKind;
    use std::path::PathBuf;

    #[test]
    fn browser_args_include_fix_flag() {
        let backend = DockerBrowserBackend::new(BackendConfig::default());
        let args = backend.args(
            "sitegrab-browser-1",
            "https://example.com",
            &PathBuf::from("/tmp/out"),
            BrowserSave {
                browser: BrowserKind::Firefox,
                fix: true,
            },
        );
        assert_eq!(&args[..4], &["run", "--rm", "--name", "sitegrab-browser-1"]);
        assert_eq!(args[5], "/tmp/out:/output");
        assert!(args.contains(&"gts-browser".to_string()));
        assert_eq!(
            &args[args.len() - 3..],
            &["https://example.com", "firefox", "fix"]
        );
    }

    #[test]
    fn screenshot_args_pass_resolution_and_format() {
        let backend = DockerScreenshotBackend::new(BackendConfig::default());
        let args = backend.args(
            "sitegrab-screenshot-1",
            "https://example.com",
            &PathBuf::from("/tmp/out"),
            ScreenshotFormat::Jpg,
        );
        let script = args.last().unwrap();
        assert_eq!(
            script,
            "cd /output && pageres 'https://example.com' 1920x1080 --format=jpg"
        );
    }

    #[tokio::test]
    async fn missing_docker_binary_is_a_failed_outcome() {
        let config = BackendConfig {
            docker_bin: "/nonexistent/docker-binary".to_string(),
            ..BackendConfig::default()
        };
        let backend = DockerScreenshotBackend::new(config);
        let outcome = backend
            .capture(
                "https://example.com",
                &PathBuf::from("/tmp"),
                CaptureVariant::Screenshot(ScreenshotFormat::Png),
                None,
                &CancellationToken::new(),
            )
            .await;
        assert!(!outcome.success);
        assert!(outcome.diagnostics.contains("could not start"));
    }

    #[tokio::test]
    async fn wrong_variant_is_rejected() {
        let backend = DockerBrowserBackend::new(BackendConfig::default());
        let outcome = backend
            .capture(
                "https://example.com",
                &PathBuf::from("/tmp"),
                CaptureVariant::Screenshot(ScreenshotFormat::Png),
                None,
                &CancellationToken::new(),
            )
            .await;
        assert!(!outcome.success);
    }

    /// A stand-in docker CLI that records its arguments and hangs on `run`.
    #[cfg(unix)]
    fn hanging_docker(dir: &Path) -> (String, PathBuf) {
        use std::os::unix::fs::PermissionsExt;

        let log = dir.join("calls.log");
        let script = dir.join("docker");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\necho \"$*\" >> '{}'\nif [ \"$1\" = run ]; then exec sleep 30; fi\n",
                log.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        (script.display().to_string(), log)
    }

    /// The container name passed to `run` and the later `rm -f` call.
    #[cfg(unix)]
    fn run_and_remove(log: &Path) -> (String, String) {
        let calls = std::fs::read_to_string(log).unwrap();
        let lines: Vec<&str> = calls.lines().collect();
        assert_eq!(lines.len(), 2, "unexpected docker calls: {:?}", lines);
        let name = lines[0].split_whitespace().nth(3).unwrap().to_string();
        (name, lines[1].to_string())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timed_out_capture_removes_its_container() {
        let dir = tempfile::tempdir().unwrap();
        let (docker_bin, log) = hanging_docker(dir.path());
        let backend = DockerScreenshotBackend::new(BackendConfig {
            docker_bin,
            ..BackendConfig::default()
        });

        let outcome = backend
            .capture(
                "https://example.com",
                dir.path(),
                CaptureVariant::Screenshot(ScreenshotFormat::Png),
                Some(Duration::from_millis(300)),
                &CancellationToken::new(),
            )
            .await;

        assert!(!outcome.success);
        assert_eq!(outcome.diagnostics, "screenshot timed out after 300ms");
        let (name, removal) = run_and_remove(&log);
        assert!(name.starts_with("sitegrab-screenshot-"));
        assert_eq!(removal, format!("rm -f {}", name));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancelled_capture_removes_its_container() {
        let dir = tempfile::tempdir().unwrap();
        let (docker_bin, log) = hanging_docker(dir.path());
        let backend = DockerBrowserBackend::new(BackendConfig {
            docker_bin,
            ..BackendConfig::default()
        });
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let outcome = backend
            .capture(
                "https://example.com",
                dir.path(),
                CaptureVariant::BrowserSave(BrowserSave {
                    browser: BrowserKind::Chromium,
                    fix: false,
                }),
                None,
                &cancel,
            )
            .await;

        assert!(!outcome.success);
        assert_eq!(outcome.diagnostics, "browser cancelled");
        let (name, removal) = run_and_remove(&log);
        assert!(name.starts_with("sitegrab-browser-"));
        assert_eq!(removal, format!("rm -f {}", name));
    }
}
