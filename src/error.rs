//! Error types for the proxy-media-pipeline crate.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Error returned when no selectable proxy is available in the pool,
/// even after a forced refill and a fail-count reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("No proxy available in pool")]
pub struct NoProxyAvailable;

/// Invalid configuration. These are programmer errors and are the only
/// errors surfaced by constructors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Failure of a proxy acquisition source. Never fatal: the pool logs it
/// and treats the refill as having produced nothing.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to read proxy list {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("proxy source request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("proxy source returned HTTP {0}")]
    Status(u16),

    #[error("proxy source rejected request (code {code}): {message}")]
    Rejected { code: i64, message: String },

    #[error("malformed proxy source response: {0}")]
    Malformed(String),
}

/// Failure reading or writing the pool snapshot. The pool keeps running
/// in memory when this happens.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("snapshot I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("snapshot at {path} is not valid JSON: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Failure fetching a media asset.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    ProxyUnavailable(#[from] NoProxyAvailable),

    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },

    #[error("request to {url} timed out")]
    Timeout { url: String },

    #[error("network error: {0}")]
    Network(#[source] reqwest::Error),

    #[error("unusable proxy {proxy}: {source}")]
    Proxy {
        proxy: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("giving up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: usize,
        last: Box<DownloadError>,
    },
}

impl DownloadError {
    /// Whether another attempt through a different proxy may succeed.
    ///
    /// Server errors, timeouts and transport failures are blamed on the
    /// egress route. Other statuses (404, 410, ...) are properties of the
    /// resource and retrying would not help.
    pub fn is_retryable(&self) -> bool {
        match self {
            DownloadError::Status { status, .. } => *status >= 500,
            DownloadError::Timeout { .. }
            | DownloadError::Network(_)
            | DownloadError::Proxy { .. } => true,
            DownloadError::ProxyUnavailable(_) | DownloadError::Exhausted { .. } => false,
        }
    }
}

/// Failure of the watermark-removal step.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("no transform client configured")]
    NotConfigured,

    #[error("transform {stage} call failed: {source}")]
    Service {
        stage: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("transform job {job_id} failed: {reason}")]
    JobFailed { job_id: String, reason: String },

    #[error("transform job {job_id} still pending after {waited:?}")]
    Timeout { job_id: String, waited: Duration },

    #[error("transform job {job_id} abandoned by its caller")]
    Cancelled { job_id: String },

    #[error("failed to stage transformed artifact: {0}")]
    Artifact(#[from] std::io::Error),

    #[error("transform worker pool is shut down")]
    WorkersClosed,

    #[error("transform worker panicked")]
    WorkerPanicked,
}

/// Failure of the object-store upload step.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("no object store configured")]
    NotConfigured,

    #[error("failed to read artifact: {0}")]
    Artifact(#[from] std::io::Error),

    #[error("object store rejected {key}")]
    Rejected { key: String },

    #[error("object store {stage} call failed: {source}")]
    Service {
        stage: &'static str,
        #[source]
        source: anyhow::Error,
    },
}
