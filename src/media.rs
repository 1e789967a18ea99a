//! Pipeline input and output records.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Image,
    Video,
}

/// One media asset referenced by a listing.
#[derive(Clone, Serialize, Deserialize)]
pub struct MediaReference {
    pub media_type: MediaType,
    pub url: String,
    pub listing_id: String,
    /// Ordinal within the listing.
    pub position: u32,
    /// Bytes already rendered by a browser session; when present the
    /// network download is skipped.
    #[serde(skip)]
    pub prefetched: Option<Vec<u8>>,
}

impl MediaReference {
    pub fn new(media_type: MediaType, url: impl Into<String>, listing_id: impl Into<String>, position: u32) -> Self {
        Self {
            media_type,
            url: url.into(),
            listing_id: listing_id.into(),
            position,
            prefetched: None,
        }
    }

    pub fn image(url: impl Into<String>, listing_id: impl Into<String>, position: u32) -> Self {
        Self::new(MediaType::Image, url, listing_id, position)
    }

    pub fn with_prefetched(mut self, bytes: Vec<u8>) -> Self {
        self.prefetched = Some(bytes);
        self
    }
}

impl fmt::Debug for MediaReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaReference")
            .field("media_type", &self.media_type)
            .field("url", &self.url)
            .field("listing_id", &self.listing_id)
            .field("position", &self.position)
            .field("prefetched", &self.prefetched.as_ref().map(Vec::len))
            .finish()
    }
}

/// Step a reference's workflow had reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Pending,
    Downloading,
    Transforming,
    Uploading,
}

/// Terminal state of one reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutcomeStatus {
    Uploaded,
    Deferred,
    DownloadFailed,
    TransformFailed,
    UploadFailed,
    TimedOut { stage: Stage },
    /// The task itself died (panic); nothing is known about the asset.
    Aborted,
}

/// The single result record produced for every input reference.
///
/// Built only through the constructors below, which keep `final_url` and
/// `storage_key` unset unless the asset was transformed and uploaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaOutcome {
    pub listing_id: String,
    pub media_type: MediaType,
    pub original_url: String,
    pub final_url: Option<String>,
    pub storage_key: Option<String>,
    pub transformed: bool,
    pub position: u32,
    pub status: OutcomeStatus,
}

impl MediaOutcome {
    fn base(reference: &MediaReference, status: OutcomeStatus) -> Self {
        Self {
            listing_id: reference.listing_id.clone(),
            media_type: reference.media_type,
            original_url: reference.url.clone(),
            final_url: None,
            storage_key: None,
            transformed: false,
            position: reference.position,
            status,
        }
    }

    pub fn uploaded(reference: &MediaReference, storage_key: String, final_url: String) -> Self {
        Self {
            final_url: Some(final_url),
            storage_key: Some(storage_key),
            transformed: true,
            ..Self::base(reference, OutcomeStatus::Uploaded)
        }
    }

    pub fn deferred(reference: &MediaReference) -> Self {
        Self::base(reference, OutcomeStatus::Deferred)
    }

    /// Any non-success terminal state.
    pub fn failed(reference: &MediaReference, status: OutcomeStatus) -> Self {
        debug_assert!(status != OutcomeStatus::Uploaded);
        Self::base(reference, status)
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Uploaded
    }

    /// Whether out-of-band batch processing should pick this up later.
    pub fn needs_compensation(&self) -> bool {
        !self.transformed
    }
}

/// Counts over a batch of outcomes, for the orchestrator's
/// listing-level decision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub uploaded: usize,
    pub deferred: usize,
    pub failed: usize,
}

impl BatchSummary {
    pub fn from_outcomes(outcomes: &[MediaOutcome]) -> Self {
        outcomes.iter().fold(Self::default(), |mut s, o| {
            s.total += 1;
            match o.status {
                OutcomeStatus::Uploaded => s.uploaded += 1,
                OutcomeStatus::Deferred => s.deferred += 1,
                _ => s.failed += 1,
            }
            s
        })
    }

    /// Every reference was either uploaded or deliberately deferred.
    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }
}
