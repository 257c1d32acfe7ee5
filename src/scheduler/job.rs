use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Waiting,
    Running,
    Done,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Waiting => write!(f, "waiting"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Done => write!(f, "done"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserKind {
    Firefox,
    Chromium,
}

impl BrowserKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrowserKind::Firefox => "firefox",
            BrowserKind::Chromium => "chromium",
        }
    }

    /// Parse an optional wire value; `"none"` and the empty string mean no browser save.
    pub fn parse_optional(value: Option<&str>) -> Result<Option<Self>, ValidationError> {
        match value.map(str::trim) {
            None | Some("") | Some("none") => Ok(None),
            Some("firefox") => Ok(Some(BrowserKind::Firefox)),
            Some("chromium") => Ok(Some(BrowserKind::Chromium)),
            Some(other) => Err(ValidationError::InvalidBrowser(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScreenshotFormat {
    Png,
    Jpg,
}

impl ScreenshotFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScreenshotFormat::Png => "png",
            ScreenshotFormat::Jpg => "jpg",
        }
    }

    pub fn parse_optional(value: Option<&str>) -> Result<Option<Self>, ValidationError> {
        match value.map(str::trim) {
            None | Some("") | Some("none") => Ok(None),
            Some("png") => Ok(Some(ScreenshotFormat::Png)),
            Some("jpg") | Some("jpeg") => Ok(Some(ScreenshotFormat::Jpg)),
            Some(other) => Err(ValidationError::InvalidScreenshotFormat(other.to_string())),
        }
    }
}

/// Browser-save variant requested for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrowserSave {
    pub browser: BrowserKind,
    pub fix: bool,
}

/// One capture to perform, handed to a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureVariant {
    BrowserSave(BrowserSave),
    Screenshot(ScreenshotFormat),
}

impl fmt::Display for CaptureVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureVariant::BrowserSave(save) => write!(f, "browser-save:{}", save.browser.as_str()),
            CaptureVariant::Screenshot(format) => write!(f, "screenshot:{}", format.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestedActions {
    pub browser: Option<BrowserKind>,
    pub browser_fix: bool,
    pub screenshot: Option<ScreenshotFormat>,
}

impl RequestedActions {
    pub fn browser_save(browser: BrowserKind, fix: bool) -> Self {
        Self {
            browser: Some(browser),
            browser_fix: fix,
            screenshot: None,
        }
    }

    pub fn screenshot(format: ScreenshotFormat) -> Self {
        Self {
            browser: None,
            browser_fix: false,
            screenshot: Some(format),
        }
    }

    pub fn with_screenshot(mut self, format: ScreenshotFormat) -> Self {
        self.screenshot = Some(format);
        self
    }

    /// Captures in execution order: browser save first, then screenshot.
    pub fn variants(&self) -> Vec<CaptureVariant> {
        let mut variants = Vec::with_capacity(2);
        if let Some(browser) = self.browser {
            variants.push(CaptureVariant::BrowserSave(BrowserSave {
                browser,
                fix: self.browser_fix,
            }));
        }
        if let Some(format) = self.screenshot {
            variants.push(CaptureVariant::Screenshot(format));
        }
        variants
    }

    pub fn count(&self) -> usize {
        usize::from(self.browser.is_some()) + usize::from(self.screenshot.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub url: String,
    /// Requester address. Only used for per-origin exclusivity, never exposed.
    pub origin: IpAddr,
    pub status: JobStatus,
    pub created: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    pub error: bool,
    pub messages: Vec<String>,
    pub actions: RequestedActions,
}

impl Job {
    pub fn new(url: String, origin: IpAddr, actions: RequestedActions) -> Self {
        Self::with_id(JobId::new(), url, origin, actions, Utc::now())
    }

    pub fn with_id(
        id: JobId,
        url: String,
        origin: IpAddr,
        actions: RequestedActions,
        created: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            url,
            origin,
            status: JobStatus::Waiting,
            created,
            started: None,
            finished: None,
            error: false,
            messages: Vec::new(),
            actions,
        }
    }

    /// Waiting -> Running. Returns false for any other starting state.
    pub fn start(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != JobStatus::Waiting {
            return false;
        }
        self.status = JobStatus::Running;
        self.started = Some(now);
        true
    }

    /// Running -> Done. Returns false for any other starting state.
    pub fn finish(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != JobStatus::Running {
            return false;
        }
        self.status = JobStatus::Done;
        self.finished = Some(now);
        true
    }

    pub fn record_failure(&mut self, message: impl Into<String>) {
        self.error = true;
        self.messages.push(message.into());
    }

    pub fn is_done(&self) -> bool {
        self.status == JobStatus::Done
    }

    pub fn view(&self) -> JobView {
        JobView::from(self)
    }
}

fn unix_or_zero(ts: Option<DateTime<Utc>>) -> i64 {
    ts.map(|t| t.timestamp()).unwrap_or(0)
}

/// Client-facing projection of a job. Timestamps are unix seconds, 0 when unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobView {
    pub id: JobId,
    pub url: String,
    pub status: JobStatus,
    pub created: i64,
    pub started: i64,
    pub finished: i64,
    pub error: bool,
    pub messages: Vec<String>,
    pub browser: Option<BrowserKind>,
    pub browser_fix: bool,
    pub screenshot: Option<ScreenshotFormat>,
}

impl From<&Job> for JobView {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            url: job.url.clone(),
            status: job.status,
            created: job.created.timestamp(),
            started: unix_or_zero(job.started),
            finished: unix_or_zero(job.finished),
            error: job.error,
            messages: job.messages.clone(),
            browser: job.actions.browser,
            browser_fix: job.actions.browser_fix,
            screenshot: job.actions.screenshot,
        }
    }
}
