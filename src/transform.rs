//! Watermark-removal client contract and job runner.
//!
//! The client is synchronous: [`run_watermark_job`] blocks its thread
//! while polling and is meant to run on a [`BlockingPool`](crate::worker::BlockingPool).

use log::{debug, warn};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;

use crate::error::TransformError;

/// Status reported by the transform service for a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Done { result_url: String },
    Error { reason: String },
}

/// Blocking watermark-removal service: submit, poll, fetch.
pub trait TransformClient: Send + Sync {
    fn submit(&self, asset: &[u8]) -> anyhow::Result<String>;
    fn poll(&self, job_id: &str) -> anyhow::Result<JobStatus>;
    fn fetch(&self, result_url: &str) -> anyhow::Result<Vec<u8>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Submitted,
    Polling { polls: u32 },
    Done,
    Failed,
}

/// An in-flight transform job. Lives only as long as one pipeline task.
#[derive(Debug)]
pub struct WatermarkJob {
    pub job_id: String,
    pub state: JobState,
    pub output_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TransformSettings {
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub work_dir: PathBuf,
}

/// Transformed asset staged on local disk. The file is deleted when the
/// artifact is discarded or dropped.
#[derive(Debug)]
pub struct Artifact {
    file: NamedTempFile,
    len: usize,
}

impl Artifact {
    fn write(work_dir: &Path, bytes: &[u8]) -> Result<Self, TransformError> {
        let mut file = tempfile::Builder::new()
            .prefix("media-")
            .suffix(".part")
            .tempfile_in(work_dir)?;
        file.write_all(bytes)?;
        file.flush()?;
        Ok(Self { file, len: bytes.len() })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn discard(self) {
        let path = self.file.path().to_path_buf();
        if let Err(e) = self.file.close() {
            warn!("Failed to remove artifact {}: {}", path.display(), e);
        }
    }
}

/// Submit `asset`, poll until the job finishes or `settings.timeout`
/// elapses, then fetch the result into a temporary artifact.
///
/// `cancel` is checked before every poll; once set the job is abandoned
/// with [`TransformError::Cancelled`].
pub fn run_watermark_job(
    client: &dyn TransformClient,
    asset: &[u8],
    settings: &TransformSettings,
    cancel: &AtomicBool,
) -> Result<Artifact, TransformError> {
    let started = Instant::now();
    let job_id = client
        .submit(asset)
        .map_err(|source| TransformError::Service { stage: "submit", source })?;
    let mut job = WatermarkJob {
        job_id,
        state: JobState::Submitted,
        output_url: None,
    };
    debug!("Submitted transform job {}", job.job_id);

    let mut polls = 0;
    let output_url = loop {
        if cancel.load(Ordering::Relaxed) {
            job.state = JobState::Failed;
            debug!("Transform job {} cancelled after {} polls", job.job_id, polls);
            return Err(TransformError::Cancelled { job_id: job.job_id });
        }
        polls += 1;
        job.state = JobState::Polling { polls };
        match client
            .poll(&job.job_id)
            .map_err(|source| TransformError::Service { stage: "poll", source })?
        {
            JobStatus::Done { result_url } => {
                job.output_url = Some(result_url.clone());
                job.state = JobState::Done;
                break result_url;
            }
            JobStatus::Error { reason } => {
                job.state = JobState::Failed;
                return Err(TransformError::JobFailed {
                    job_id: job.job_id,
                    reason,
                });
            }
            JobStatus::Pending => {}
        }

        let waited = started.elapsed();
        if waited >= settings.timeout {
            job.state = JobState::Failed;
            return Err(TransformError::Timeout {
                job_id: job.job_id,
                waited,
            });
        }
        thread::sleep(settings.poll_interval.min(settings.timeout - waited));
    };

    let bytes = client
        .fetch(&output_url)
        .map_err(|source| TransformError::Service { stage: "fetch", source })?;
    debug!(
        "Transform job {} done after {} polls, {} bytes",
        job.job_id,
        polls,
        bytes.len()
    );
    Artifact::write(&settings.work_dir, &bytes)
}
