//! Configuration for the proxy pool and the media pipeline.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::proxy::Protocol;

/// Kind of proxy pool, derived from its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolType {
    /// Fixed list read from a file at startup.
    StaticFile,
    /// JSON list fetched from a vendor endpoint.
    GenericApi,
    /// IP batches rented for a limited time from a rate-limited API.
    RentedIpBatch,
    /// Residential gateway credentials generated locally per session.
    SessionTemplated,
}

impl PoolType {
    /// Dynamic pools evict, refill and persist; static pools do none of that.
    pub fn is_dynamic(&self) -> bool {
        !matches!(self, PoolType::StaticFile)
    }

    /// Whether the credential itself stops working at `expires_at`.
    pub fn has_ttl_credentials(&self) -> bool {
        matches!(self, PoolType::SessionTemplated)
    }

    /// Whether `expires_at` marks the end of a paid lease or credential,
    /// so an entry past it is worthless after a restart.
    pub fn has_leases(&self) -> bool {
        matches!(self, PoolType::RentedIpBatch | PoolType::SessionTemplated)
    }

    /// Whether refills merge by host+port.
    pub fn dedupes_by_endpoint(&self) -> bool {
        matches!(self, PoolType::GenericApi | PoolType::RentedIpBatch)
    }
}

/// Where proxies come from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceConfig {
    StaticFile {
        path: PathBuf,
    },
    GenericApi {
        endpoint: String,
    },
    RentedIpBatch {
        endpoint: String,
        secret: String,
        order_id: String,
        /// Number of IPs requested per call.
        batch_size: usize,
        protocol: Protocol,
    },
    SessionTemplated {
        account: String,
        password: String,
        region: String,
        gateway_host: String,
        gateway_port: u16,
        protocol: Protocol,
        ttl_minutes: u64,
        /// Number of session credentials generated per refill.
        batch_size: usize,
        session_len: usize,
    },
}

impl SourceConfig {
    pub fn pool_type(&self) -> PoolType {
        match self {
            SourceConfig::StaticFile { .. } => PoolType::StaticFile,
            SourceConfig::GenericApi { .. } => PoolType::GenericApi,
            SourceConfig::RentedIpBatch { .. } => PoolType::RentedIpBatch,
            SourceConfig::SessionTemplated { .. } => PoolType::SessionTemplated,
        }
    }
}

/// Configuration for the proxy pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyPoolConfig {
    /// Source of proxies.
    pub source: SourceConfig,
    /// Fail count at which a proxy stops being selectable.
    pub max_fails: u32,
    /// Refill when fewer selectable proxies than this remain.
    pub min_proxy_count: usize,
    /// Lifetime assigned to rented IPs.
    pub ip_ttl: Duration,
    /// Minimum spacing between unforced calls to the rented-ip-batch API.
    pub api_request_interval: Duration,
    /// Proxies expiring within this window count towards a pre-emptive refill.
    pub refill_lead_time: Duration,
    /// Timeout for proxy source HTTP calls.
    pub request_timeout: Duration,
    /// Snapshot file; dynamic pools persist to it when set.
    pub snapshot_path: Option<PathBuf>,
}

impl ProxyPoolConfig {
    /// Create a new configuration builder.
    pub fn builder(source: SourceConfig) -> ProxyPoolConfigBuilder {
        ProxyPoolConfigBuilder::new(source)
    }

    pub fn pool_type(&self) -> PoolType {
        self.source.pool_type()
    }

    /// Reject configurations the pool cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_fails == 0 {
            return Err(ConfigError::Invalid("max_fails must be at least 1".into()));
        }
        match &self.source {
            SourceConfig::RentedIpBatch { batch_size, .. } => {
                if *batch_size == 0 {
                    return Err(ConfigError::Invalid("rented batch_size must be at least 1".into()));
                }
                if self.api_request_interval.is_zero() {
                    return Err(ConfigError::Invalid(
                        "api_request_interval must be non-zero for rented IP batches".into(),
                    ));
                }
            }
            SourceConfig::SessionTemplated {
                ttl_minutes,
                batch_size,
                session_len,
                ..
            } => {
                if *ttl_minutes == 0 {
                    return Err(ConfigError::Invalid("session ttl_minutes must be at least 1".into()));
                }
                if *batch_size == 0 || *session_len == 0 {
                    return Err(ConfigError::Invalid(
                        "session batch_size and session_len must be at least 1".into(),
                    ));
                }
            }
            SourceConfig::StaticFile { .. } | SourceConfig::GenericApi { .. } => {}
        }
        Ok(())
    }
}

/// Builder for `ProxyPoolConfig`.
pub struct ProxyPoolConfigBuilder {
    source: SourceConfig,
    max_fails: Option<u32>,
    min_proxy_count: Option<usize>,
    ip_ttl: Option<Duration>,
    api_request_interval: Option<Duration>,
    refill_lead_time: Option<Duration>,
    request_timeout: Option<Duration>,
    snapshot_path: Option<PathBuf>,
}

impl ProxyPoolConfigBuilder {
    /// Create a new builder with default values.
    pub fn new(source: SourceConfig) -> Self {
        Self {
            source,
            max_fails: None,
            min_proxy_count: None,
            ip_ttl: None,
            api_request_interval: None,
            refill_lead_time: None,
            request_timeout: None,
            snapshot_path: None,
        }
    }

    /// Set the fail count at which a proxy is evicted.
    pub fn max_fails(mut self, max_fails: u32) -> Self {
        self.max_fails = Some(max_fails);
        self
    }

    /// Set the refill threshold.
    pub fn min_proxy_count(mut self, count: usize) -> Self {
        self.min_proxy_count = Some(count);
        self
    }

    /// Set the lifetime of rented IPs.
    pub fn ip_ttl(mut self, ttl: Duration) -> Self {
        self.ip_ttl = Some(ttl);
        self
    }

    /// Set the rate limit on rented-ip-batch API calls.
    pub fn api_request_interval(mut self, interval: Duration) -> Self {
        self.api_request_interval = Some(interval);
        self
    }

    /// Set the pre-emptive refill window.
    pub fn refill_lead_time(mut self, lead: Duration) -> Self {
        self.refill_lead_time = Some(lead);
        self
    }

    /// Set the timeout for proxy source requests.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Persist the pool to this JSON file.
    pub fn snapshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_path = Some(path.into());
        self
    }

    /// Build the configuration.
    pub fn build(self) -> ProxyPoolConfig {
        ProxyPoolConfig {
            source: self.source,
            max_fails: self.max_fails.unwrap_or(3),
            min_proxy_count: self.min_proxy_count.unwrap_or(3),
            ip_ttl: self.ip_ttl.unwrap_or(Duration::from_secs(300)),
            api_request_interval: self.api_request_interval.unwrap_or(Duration::from_secs(5)),
            refill_lead_time: self.refill_lead_time.unwrap_or(Duration::from_secs(60)),
            request_timeout: self.request_timeout.unwrap_or(Duration::from_secs(10)),
            snapshot_path: self.snapshot_path,
        }
    }
}

/// Configuration for the media pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Default number of references processed at once per batch.
    pub concurrency_limit: usize,
    /// Download attempts per reference, each through a different proxy.
    pub max_download_attempts: usize,
    /// Timeout for a single download attempt.
    pub download_timeout: Duration,
    /// Threads dedicated to the blocking transform client.
    pub transform_workers: usize,
    /// Interval between transform job polls.
    pub transform_poll_interval: Duration,
    /// Maximum time a transform job may stay pending.
    pub transform_timeout: Duration,
    /// Overall deadline for download, transform and upload of one reference.
    pub item_deadline: Duration,
    /// Lifetime of issued object URLs.
    pub url_ttl: Duration,
    /// Skip transform and upload, keeping only the original URL.
    pub deferred: bool,
    /// Directory for temporary artifacts.
    pub work_dir: PathBuf,
    /// User agent for media downloads.
    pub user_agent: Option<String>,
}

impl PipelineConfig {
    /// Create a new configuration builder.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency_limit == 0 {
            return Err(ConfigError::Invalid("concurrency_limit must be at least 1".into()));
        }
        if self.max_download_attempts == 0 {
            return Err(ConfigError::Invalid("max_download_attempts must be at least 1".into()));
        }
        if self.transform_workers == 0 {
            return Err(ConfigError::Invalid("transform_workers must be at least 1".into()));
        }
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfigBuilder::new().build()
    }
}

/// Builder for `PipelineConfig`.
#[derive(Default)]
pub struct PipelineConfigBuilder {
    concurrency_limit: Option<usize>,
    max_download_attempts: Option<usize>,
    download_timeout: Option<Duration>,
    transform_workers: Option<usize>,
    transform_poll_interval: Option<Duration>,
    transform_timeout: Option<Duration>,
    item_deadline: Option<Duration>,
    url_ttl: Option<Duration>,
    deferred: bool,
    work_dir: Option<PathBuf>,
    user_agent: Option<String>,
}

impl PipelineConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = Some(limit);
        self
    }

    pub fn max_download_attempts(mut self, attempts: usize) -> Self {
        self.max_download_attempts = Some(attempts);
        self
    }

    pub fn download_timeout(mut self, timeout: Duration) -> Self {
        self.download_timeout = Some(timeout);
        self
    }

    pub fn transform_workers(mut self, workers: usize) -> Self {
        self.transform_workers = Some(workers);
        self
    }

    pub fn transform_poll_interval(mut self, interval: Duration) -> Self {
        self.transform_poll_interval = Some(interval);
        self
    }

    pub fn transform_timeout(mut self, timeout: Duration) -> Self {
        self.transform_timeout = Some(timeout);
        self
    }

    pub fn item_deadline(mut self, deadline: Duration) -> Self {
        self.item_deadline = Some(deadline);
        self
    }

    pub fn url_ttl(mut self, ttl: Duration) -> Self {
        self.url_ttl = Some(ttl);
        self
    }

    /// Capture metadata only; transform and upload happen out of band.
    pub fn deferred(mut self, deferred: bool) -> Self {
        self.deferred = deferred;
        self
    }

    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = Some(ua.into());
        self
    }

    /// Build the configuration.
    pub fn build(self) -> PipelineConfig {
        PipelineConfig {
            concurrency_limit: self.concurrency_limit.unwrap_or(5),
            max_download_attempts: self.max_download_attempts.unwrap_or(3),
            download_timeout: self.download_timeout.unwrap_or(Duration::from_secs(30)),
            transform_workers: self.transform_workers.unwrap_or(5),
            transform_poll_interval: self.transform_poll_interval.unwrap_or(Duration::from_secs(2)),
            transform_timeout: self.transform_timeout.unwrap_or(Duration::from_secs(120)),
            item_deadline: self.item_deadline.unwrap_or(Duration::from_secs(300)),
            url_ttl: self.url_ttl.unwrap_or(Duration::from_secs(7 * 24 * 3600)),
            deferred: self.deferred,
            work_dir: self.work_dir.unwrap_or_else(std::env::temp_dir),
            user_agent: self.user_agent,
        }
    }
}
