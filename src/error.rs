use std::net::IpAddr;

use thiserror::Error;

use crate::scheduler::JobId;

/// Reasons a submission is refused before a job is created.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing url")]
    MissingUrl,

    #[error("neither browser nor screenshot chosen; nothing to do")]
    NoActions,

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("invalid url scheme: {0}")]
    InvalidScheme(String),

    #[error("invalid hostname (empty)")]
    EmptyHost,

    #[error("invalid hostname (localhost not allowed)")]
    LocalhostNotAllowed,

    #[error("invalid hostname (ip address not allowed)")]
    IpAddressNotAllowed,

    #[error("invalid hostname (not RFC 1123): {0}")]
    InvalidHostname(String),

    #[error("unable to resolve {host}: {reason}")]
    ResolutionFailed { host: String, reason: String },

    #[error("invalid ip address {0} (within private range)")]
    PrivateAddress(IpAddr),

    #[error("invalid browser: {0}")]
    InvalidBrowser(String),

    #[error("invalid screenshot format: {0}")]
    InvalidScreenshotFormat(String),
}

/// Reasons a valid submission cannot enter the queue right now.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("queue limit ({max}) was reached")]
    QueueFull { max: usize },

    #[error("only one concurrent job per ip address allowed")]
    OriginBusy,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DownloadError {
    #[error("job id not found")]
    NotFound,

    #[error("job has not finished yet")]
    NotFinished,

    #[error("job expired")]
    Expired,

    #[error("job got lost; try again")]
    ArtifactMissing,
}

#[derive(Error, Debug)]
pub enum SitegrabError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Startup check failed: {0}")]
    Startup(String),
}

pub type Result<T> = std::result::Result<T, SitegrabError>;
