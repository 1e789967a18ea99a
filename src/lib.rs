//! # proxy-media-pipeline
//!
//! A rotating proxy pool and the media acquisition pipeline built on it.
//!
//! The [`ProxyPool`] keeps a set of egress identities from one of several
//! vendor sources, evicting them on repeated failure, refilling ahead of
//! expiry and persisting a snapshot across restarts. The [`MediaPipeline`]
//! consumes the pool to download listing media, removes watermarks on a
//! dedicated worker pool and uploads the result, producing exactly one
//! [`MediaOutcome`] per input reference.

pub mod config;
pub mod error;
pub mod fetcher;
pub mod media;
pub mod middleware;
pub mod pipeline;
pub mod pool;
pub mod proxy;
pub mod snapshot;
pub mod source;
pub mod storage;
pub mod transform;
pub mod worker;
mod utils;

pub use config::{
    PipelineConfig, PipelineConfigBuilder, PoolType, ProxyPoolConfig, ProxyPoolConfigBuilder, SourceConfig,
};
pub use error::{
    ConfigError, DownloadError, NoProxyAvailable, PersistenceError, SourceError, TransformError, UploadError,
};
pub use fetcher::{MediaFetcher, ReqwestFetcher};
pub use media::{BatchSummary, MediaOutcome, MediaReference, MediaType, OutcomeStatus, Stage};
pub use middleware::ProxyPoolMiddleware;
pub use pipeline::{MediaPipeline, MediaPipelineBuilder};
pub use pool::{PoolStats, ProxyPool};
pub use proxy::{Credentials, Protocol, Proxy, ProxyKey};
pub use storage::{storage_key, ObjectStore};
pub use transform::{JobStatus, TransformClient};
