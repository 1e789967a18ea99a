//! Media acquisition pipeline: download through the proxy pool, remove
//! watermarks on a dedicated worker pool, upload to the object store.
//!
//! Every input reference yields exactly one [`MediaOutcome`]. Failures are
//! converted into outcome values inside each task and never abort
//! sibling references or the batch.

use futures::future;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::PipelineConfig;
use crate::error::{ConfigError, DownloadError, TransformError, UploadError};
use crate::fetcher::{MediaFetcher, ReqwestFetcher};
use crate::media::{BatchSummary, MediaOutcome, MediaReference, OutcomeStatus, Stage};
use crate::pool::ProxyPool;
use crate::proxy::ProxyKey;
use crate::storage::{storage_key, ObjectStore};
use crate::transform::{run_watermark_job, Artifact, TransformClient, TransformSettings};
use crate::worker::BlockingPool;

/// Batch slot of one reference. Shared with the transform job so the slot
/// is only released once that job has really stopped.
type Slot = Option<Arc<OwnedSemaphorePermit>>;

/// Tracks the step a workflow reached so a deadline expiry can report it.
struct StageCell(AtomicU8);

impl StageCell {
    fn new() -> Self {
        Self(AtomicU8::new(Stage::Pending as u8))
    }

    fn set(&self, stage: Stage) {
        self.0.store(stage as u8, Ordering::Relaxed);
    }

    fn get(&self) -> Stage {
        match self.0.load(Ordering::Relaxed) {
            1 => Stage::Downloading,
            2 => Stage::Transforming,
            3 => Stage::Uploading,
            _ => Stage::Pending,
        }
    }
}

/// Builder for [`MediaPipeline`].
pub struct MediaPipelineBuilder {
    pool: Arc<ProxyPool>,
    config: PipelineConfig,
    fetcher: Option<Arc<dyn MediaFetcher>>,
    transform: Option<Arc<dyn TransformClient>>,
    store: Option<Arc<dyn ObjectStore>>,
}

impl MediaPipelineBuilder {
    /// Replace the default `reqwest` fetcher.
    pub fn fetcher(mut self, fetcher: Arc<dyn MediaFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn transform_client(mut self, client: Arc<dyn TransformClient>) -> Self {
        self.transform = Some(client);
        self
    }

    pub fn object_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Build the pipeline. Outside deferred mode both the transform client
    /// and the object store are required.
    pub fn build(self) -> Result<MediaPipeline, ConfigError> {
        self.config.validate()?;
        if !self.config.deferred && (self.transform.is_none() || self.store.is_none()) {
            return Err(ConfigError::Invalid(
                "transform client and object store are required unless deferred".into(),
            ));
        }

        let workers = match (&self.transform, self.config.deferred) {
            (Some(_), false) => Some(Arc::new(BlockingPool::new(
                "transform-worker",
                self.config.transform_workers,
            ))),
            _ => None,
        };
        let fetcher = self
            .fetcher
            .unwrap_or_else(|| Arc::new(ReqwestFetcher::new(self.config.user_agent.clone())));

        Ok(MediaPipeline {
            pool: self.pool,
            fetcher,
            transform: self.transform,
            store: self.store,
            workers,
            config: Arc::new(self.config),
        })
    }
}

/// Bounded-concurrency download → transform → upload pipeline.
#[derive(Clone)]
pub struct MediaPipeline {
    pool: Arc<ProxyPool>,
    fetcher: Arc<dyn MediaFetcher>,
    transform: Option<Arc<dyn TransformClient>>,
    store: Option<Arc<dyn ObjectStore>>,
    workers: Option<Arc<BlockingPool>>,
    config: Arc<PipelineConfig>,
}

impl MediaPipeline {
    pub fn builder(pool: Arc<ProxyPool>, config: PipelineConfig) -> MediaPipelineBuilder {
        MediaPipelineBuilder {
            pool,
            config,
            fetcher: None,
            transform: None,
            store: None,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Process one listing's media with the configured concurrency limit.
    pub async fn process(&self, listing_id: &str, references: Vec<MediaReference>) -> Vec<MediaOutcome> {
        self.process_batch(listing_id, references, self.config.concurrency_limit)
            .await
    }

    /// Process `references` with at most `concurrency_limit` in flight.
    /// Returns one outcome per reference, in input order.
    ///
    /// A reference counts as in flight until its transform job has stopped,
    /// even after its deadline produced a timeout outcome. The call returns
    /// once those jobs are done, or after `transform_timeout` more at most.
    pub async fn process_batch(
        &self,
        listing_id: &str,
        references: Vec<MediaReference>,
        concurrency_limit: usize,
    ) -> Vec<MediaOutcome> {
        let limit = concurrency_limit.max(1);
        let semaphore = Arc::new(Semaphore::new(limit));
        let started = Instant::now();
        info!(
            "Processing {} media for listing {} (concurrency {})",
            references.len(),
            listing_id,
            limit
        );

        let mut fallbacks = Vec::with_capacity(references.len());
        let mut handles = Vec::with_capacity(references.len());
        for reference in references {
            if reference.listing_id != listing_id {
                warn!(
                    "Reference {} belongs to listing {}, not {}",
                    reference.url, reference.listing_id, listing_id
                );
            }
            fallbacks.push(MediaOutcome::failed(&reference, OutcomeStatus::Aborted));

            let pipeline = self.clone();
            let semaphore = Arc::clone(&semaphore);
            handles.push(tokio::spawn(async move {
                // The semaphore is never closed.
                let slot = semaphore.acquire_owned().await.ok().map(Arc::new);
                pipeline.process_one(reference, slot).await
            }));
        }

        let outcomes: Vec<MediaOutcome> = future::join_all(handles)
            .await
            .into_iter()
            .zip(fallbacks)
            .map(|(joined, fallback)| match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!("Media task for {} died: {}", fallback.original_url, e);
                    fallback
                }
            })
            .collect();

        // Wait for transform jobs that outlived their deadline.
        let drain = semaphore.acquire_many(limit as u32);
        if tokio::time::timeout(self.config.transform_timeout, drain).await.is_err() {
            warn!(
                "Listing {}: transform jobs still running after {:?}",
                listing_id, self.config.transform_timeout
            );
        }

        let summary = BatchSummary::from_outcomes(&outcomes);
        info!(
            "Listing {} done in {:?}: {} uploaded, {} deferred, {} failed",
            listing_id,
            started.elapsed(),
            summary.uploaded,
            summary.deferred,
            summary.failed
        );
        outcomes
    }

    async fn process_one(&self, reference: MediaReference, slot: Slot) -> MediaOutcome {
        let stage = StageCell::new();
        let cancel = Arc::new(AtomicBool::new(false));
        let workflow = self.run_workflow(&reference, &stage, slot, Arc::clone(&cancel));
        match tokio::time::timeout(self.config.item_deadline, workflow).await {
            Ok(outcome) => outcome,
            Err(_) => {
                cancel.store(true, Ordering::Relaxed);
                let stage = stage.get();
                warn!(
                    "{} exceeded {:?} while {:?}",
                    reference.url, self.config.item_deadline, stage
                );
                MediaOutcome::failed(&reference, OutcomeStatus::TimedOut { stage })
            }
        }
    }

    async fn run_workflow(
        &self,
        reference: &MediaReference,
        stage: &StageCell,
        slot: Slot,
        cancel: Arc<AtomicBool>,
    ) -> MediaOutcome {
        if self.config.deferred {
            return MediaOutcome::deferred(reference);
        }

        stage.set(Stage::Downloading);
        let bytes = match &reference.prefetched {
            Some(bytes) => bytes.clone(),
            None => match self.download(&reference.url).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Download of {} failed: {}", reference.url, e);
                    return MediaOutcome::failed(reference, OutcomeStatus::DownloadFailed);
                }
            },
        };

        stage.set(Stage::Transforming);
        let artifact = match self.transform(bytes, slot.clone(), cancel).await {
            Ok(artifact) => artifact,
            Err(e) => {
                warn!("Transform of {} failed: {}", reference.url, e);
                return MediaOutcome::failed(reference, OutcomeStatus::TransformFailed);
            }
        };

        stage.set(Stage::Uploading);
        let key = storage_key(&reference.listing_id, &reference.url);
        let uploaded = self.upload(&artifact, &key).await;
        artifact.discard();
        match uploaded {
            Ok(final_url) => {
                debug!("Uploaded {} as {}", reference.url, key);
                MediaOutcome::uploaded(reference, key, final_url)
            }
            Err(e) => {
                warn!("Upload of {} failed: {}", reference.url, e);
                MediaOutcome::failed(reference, OutcomeStatus::UploadFailed)
            }
        }
    }

    /// Fetch `url`, rotating to a different proxy after each retryable
    /// failure.
    async fn download(&self, url: &str) -> Result<Vec<u8>, DownloadError> {
        let max_attempts = self.config.max_download_attempts;
        let mut tried: Vec<ProxyKey> = Vec::new();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let mut proxy = self.pool.acquire_excluding(&tried).await?;
            let started = Instant::now();
            match self.fetcher.fetch(url, &proxy, self.config.download_timeout).await {
                Ok(bytes) => {
                    proxy.response_time = Some(started.elapsed().as_secs_f64());
                    self.pool.mark_success(&proxy);
                    return Ok(bytes);
                }
                Err(e) if e.is_retryable() => {
                    warn!(
                        "Download of {} via {} failed (attempt {}/{}): {}",
                        url, proxy, attempt, max_attempts, e
                    );
                    self.pool.mark_failure(&proxy);
                    if attempt >= max_attempts {
                        return Err(DownloadError::Exhausted {
                            attempts: attempt,
                            last: Box::new(e),
                        });
                    }
                    tried.push(proxy.key());
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn transform(
        &self,
        bytes: Vec<u8>,
        slot: Slot,
        cancel: Arc<AtomicBool>,
    ) -> Result<Artifact, TransformError> {
        let (client, workers) = match (&self.transform, &self.workers) {
            (Some(client), Some(workers)) => (Arc::clone(client), workers),
            _ => return Err(TransformError::NotConfigured),
        };
        let settings = TransformSettings {
            poll_interval: self.config.transform_poll_interval,
            timeout: self.config.transform_timeout,
            work_dir: self.config.work_dir.clone(),
        };
        workers
            .run(move || {
                let _slot = slot;
                run_watermark_job(client.as_ref(), &bytes, &settings, &cancel)
            })
            .await?
    }

    async fn upload(&self, artifact: &Artifact, key: &str) -> Result<String, UploadError> {
        let store = self.store.as_ref().ok_or(UploadError::NotConfigured)?;
        let bytes = tokio::fs::read(artifact.path()).await?;
        let accepted = store
            .put(key, bytes)
            .await
            .map_err(|source| UploadError::Service { stage: "put", source })?;
        if !accepted {
            return Err(UploadError::Rejected { key: key.to_string() });
        }
        store
            .issue_url(key, self.config.url_ttl)
            .await
            .map_err(|source| UploadError::Service { stage: "issue_url", source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PipelineConfigBuilder, ProxyPoolConfig, SourceConfig};
    use crate::proxy::Proxy;
    use crate::transform::JobStatus;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::io::Write;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    async fn static_pool(count: usize, max_fails: u32) -> Arc<ProxyPool> {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for i in 0..count {
            writeln!(file, "http://10.0.0.{}:8080", i + 1).unwrap();
        }
        let config = ProxyPoolConfig::builder(SourceConfig::StaticFile {
            path: file.path().to_path_buf(),
        })
        .max_fails(max_fails)
        .build();
        ProxyPool::new(config).await.unwrap()
    }

    /// Replies from a per-URL script of statuses (200 once exhausted).
    #[derive(Default)]
    struct ScriptedFetcher {
        scripts: Mutex<HashMap<String, Vec<u16>>>,
        used: Mutex<Vec<(String, Proxy)>>,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        delay: Duration,
    }

    impl ScriptedFetcher {
        fn with_delay(delay: Duration) -> Self {
            Self {
                delay,
                ..Default::default()
            }
        }

        fn script(&self, url: &str, statuses: &[u16]) {
            self.scripts.lock().insert(url.to_string(), statuses.to_vec());
        }

        fn proxies_for(&self, url: &str) -> Vec<Proxy> {
            self.used
                .lock()
                .iter()
                .filter(|(u, _)| u == url)
                .map(|(_, p)| p.clone())
                .collect()
        }
    }

    #[async_trait]
    impl MediaFetcher for ScriptedFetcher {
        async fn fetch(&self, url: &str, proxy: &Proxy, _timeout: Duration) -> Result<Vec<u8>, DownloadError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.used.lock().push((url.to_string(), proxy.clone()));
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let status = {
                let mut scripts = self.scripts.lock();
                match scripts.get_mut(url) {
                    Some(script) if !script.is_empty() => script.remove(0),
                    _ => 200,
                }
            };
            if status == 200 {
                Ok(format!("raw:{}", url).into_bytes())
            } else {
                Err(DownloadError::Status {
                    status,
                    url: url.to_string(),
                })
            }
        }
    }

    #[derive(Default)]
    struct FakeTransform {
        fail: bool,
        stuck: bool,
        submit_delay: Duration,
        submitted: AtomicUsize,
        polled: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl FakeTransform {
        fn new(fail: bool) -> Self {
            Self {
                fail,
                ..Default::default()
            }
        }
    }

    impl TransformClient for FakeTransform {
        fn submit(&self, _asset: &[u8]) -> anyhow::Result<String> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(self.submit_delay);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            let n = self.submitted.fetch_add(1, Ordering::SeqCst);
            Ok(format!("job-{}", n))
        }

        fn poll(&self, job_id: &str) -> anyhow::Result<JobStatus> {
            self.polled.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(anyhow!("service unavailable"));
            }
            if self.stuck {
                return Ok(JobStatus::Pending);
            }
            Ok(JobStatus::Done {
                result_url: format!("mem://{}", job_id),
            })
        }

        fn fetch(&self, result_url: &str) -> anyhow::Result<Vec<u8>> {
            Ok(format!("clean:{}", result_url).into_bytes())
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        reject: bool,
        puts: AtomicUsize,
        objects: Mutex<HashMap<String, Vec<u8>>>,
    }

    #[async_trait]
    impl ObjectStore for MemoryStore {
        async fn put(&self, key: &str, bytes: Vec<u8>) -> anyhow::Result<bool> {
            self.puts.fetch_add(1, Ordering::SeqCst);
            if self.reject {
                return Ok(false);
            }
            self.objects.lock().insert(key.to_string(), bytes);
            Ok(true)
        }

        async fn issue_url(&self, key: &str, _ttl: Duration) -> anyhow::Result<String> {
            Ok(format!("https://cdn.example/{}", key))
        }
    }

    struct Harness {
        pipeline: MediaPipeline,
        fetcher: Arc<ScriptedFetcher>,
        transform: Arc<FakeTransform>,
        store: Arc<MemoryStore>,
        pool: Arc<ProxyPool>,
        work_dir: tempfile::TempDir,
    }

    async fn harness(
        pool: Arc<ProxyPool>,
        fetcher: ScriptedFetcher,
        transform: FakeTransform,
        store: MemoryStore,
        config: PipelineConfigBuilder,
    ) -> Harness {
        let work_dir = tempfile::tempdir().unwrap();
        let config = config
            .work_dir(work_dir.path())
            .transform_poll_interval(Duration::from_millis(5))
            .build();
        let fetcher = Arc::new(fetcher);
        let transform = Arc::new(transform);
        let store = Arc::new(store);
        let pipeline = MediaPipeline::builder(Arc::clone(&pool), config)
            .fetcher(fetcher.clone())
            .transform_client(transform.clone())
            .object_store(store.clone())
            .build()
            .unwrap();
        Harness {
            pipeline,
            fetcher,
            transform,
            store,
            pool,
            work_dir,
        }
    }

    fn references(listing: &str, n: u32) -> Vec<MediaReference> {
        (0..n)
            .map(|i| MediaReference::image(format!("https://img.example/{}/{}.jpg", listing, i), listing, i))
            .collect()
    }

    fn prefetched(listing: &str, n: u32) -> Vec<MediaReference> {
        references(listing, n)
            .into_iter()
            .map(|r| r.with_prefetched(b"rendered".to_vec()))
            .collect()
    }

    fn work_dir_is_empty(dir: &tempfile::TempDir) -> bool {
        std::fs::read_dir(dir.path()).unwrap().next().is_none()
    }

    #[tokio::test]
    async fn every_reference_gets_one_outcome() {
        let h = harness(
            static_pool(3, 3).await,
            ScriptedFetcher::default(),
            FakeTransform::new(false),
            MemoryStore::default(),
            PipelineConfig::builder(),
        )
        .await;
        let mut refs = references("L1", 7);
        refs.reverse();

        let outcomes = h.pipeline.process_batch("L1", refs.clone(), 3).await;
        assert_eq!(outcomes.len(), refs.len());
        for (reference, outcome) in refs.iter().zip(&outcomes) {
            assert_eq!(outcome.position, reference.position);
            assert_eq!(outcome.original_url, reference.url);
            assert!(outcome.is_success());
            assert!(outcome.transformed);
            assert_eq!(
                outcome.storage_key.as_deref(),
                Some(storage_key("L1", &reference.url).as_str())
            );
        }
        assert_eq!(h.store.objects.lock().len(), 7);
        assert!(work_dir_is_empty(&h.work_dir));
    }

    #[tokio::test]
    async fn retries_server_errors_on_distinct_proxies() {
        let h = harness(
            static_pool(3, 1).await,
            ScriptedFetcher::default(),
            FakeTransform::new(false),
            MemoryStore::default(),
            PipelineConfig::builder(),
        )
        .await;
        let url = "https://img.example/L2/0.jpg";
        h.fetcher.script(url, &[503, 503, 200]);

        let outcomes = h
            .pipeline
            .process_batch("L2", vec![MediaReference::image(url, "L2", 0)], 1)
            .await;
        assert!(outcomes[0].is_success());

        let used = h.fetcher.proxies_for(url);
        assert_eq!(used.len(), 3);
        assert_ne!(used[0].key(), used[1].key());
        assert_ne!(used[1].key(), used[2].key());
        assert_ne!(used[0].key(), used[2].key());

        // max_fails = 1: the two failed proxies are out, the third is healthy.
        assert_eq!(h.pool.stats().available, 1);
        let survivor = h.pool.acquire().await.unwrap();
        assert_eq!(survivor.key(), used[2].key());
        assert!(survivor.response_time.is_some());
    }

    #[tokio::test]
    async fn exhausted_retries_fail_only_that_reference() {
        let h = harness(
            static_pool(3, 3).await,
            ScriptedFetcher::default(),
            FakeTransform::new(false),
            MemoryStore::default(),
            PipelineConfig::builder(),
        )
        .await;
        let refs = references("L3", 3);
        h.fetcher.script(&refs[1].url, &[500, 502, 503]);

        let outcomes = h.pipeline.process_batch("L3", refs.clone(), 3).await;
        assert_eq!(outcomes[1].status, OutcomeStatus::DownloadFailed);
        assert!(outcomes[1].final_url.is_none());
        assert!(outcomes[0].is_success());
        assert!(outcomes[2].is_success());
        assert_eq!(h.fetcher.proxies_for(&refs[1].url).len(), 3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let h = harness(
            static_pool(3, 3).await,
            ScriptedFetcher::default(),
            FakeTransform::new(false),
            MemoryStore::default(),
            PipelineConfig::builder(),
        )
        .await;
        let url = "https://img.example/gone.jpg";
        h.fetcher.script(url, &[404]);
        let outcomes = h
            .pipeline
            .process_batch("L4", vec![MediaReference::image(url, "L4", 0)], 1)
            .await;
        assert_eq!(outcomes[0].status, OutcomeStatus::DownloadFailed);
        assert_eq!(h.fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.pool.stats().available, 3);
    }

    #[tokio::test]
    async fn transform_failure_never_uploads() {
        let h = harness(
            static_pool(2, 3).await,
            ScriptedFetcher::default(),
            FakeTransform::new(true),
            MemoryStore::default(),
            PipelineConfig::builder(),
        )
        .await;
        let outcomes = h.pipeline.process_batch("L5", references("L5", 4), 2).await;
        assert_eq!(outcomes.len(), 4);
        for outcome in &outcomes {
            assert_eq!(outcome.status, OutcomeStatus::TransformFailed);
            assert!(!outcome.transformed);
            assert!(outcome.final_url.is_none());
        }
        assert_eq!(h.transform.submitted.load(Ordering::SeqCst), 4);
        assert_eq!(h.store.puts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rejected_upload_is_downgraded_and_cleaned_up() {
        let store = MemoryStore {
            reject: true,
            ..Default::default()
        };
        let h = harness(
            static_pool(2, 3).await,
            ScriptedFetcher::default(),
            FakeTransform::new(false),
            store,
            PipelineConfig::builder(),
        )
        .await;
        let outcomes = h.pipeline.process_batch("L6", references("L6", 2), 2).await;
        for outcome in &outcomes {
            assert_eq!(outcome.status, OutcomeStatus::UploadFailed);
            assert!(!outcome.transformed);
            assert!(outcome.final_url.is_none() && outcome.storage_key.is_none());
        }
        assert_eq!(h.store.puts.load(Ordering::SeqCst), 2);
        assert!(work_dir_is_empty(&h.work_dir));
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let h = harness(
            static_pool(4, 3).await,
            ScriptedFetcher::with_delay(Duration::from_millis(20)),
            FakeTransform::new(false),
            MemoryStore::default(),
            PipelineConfig::builder(),
        )
        .await;
        let outcomes = h.pipeline.process_batch("L7", references("L7", 12), 2).await;
        assert_eq!(outcomes.len(), 12);
        assert!(h.fetcher.peak.load(Ordering::SeqCst) <= 2);
        assert!(h.fetcher.peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn deadline_turns_hangs_into_timeouts() {
        let h = harness(
            static_pool(2, 3).await,
            ScriptedFetcher::with_delay(Duration::from_secs(5)),
            FakeTransform::new(false),
            MemoryStore::default(),
            PipelineConfig::builder().item_deadline(Duration::from_millis(50)),
        )
        .await;
        let outcomes = h.pipeline.process_batch("L8", references("L8", 2), 2).await;
        for outcome in &outcomes {
            assert_eq!(
                outcome.status,
                OutcomeStatus::TimedOut {
                    stage: Stage::Downloading
                }
            );
            assert!(outcome.final_url.is_none());
        }
    }

    #[tokio::test]
    async fn timed_out_transforms_keep_their_slot() {
        let transform = FakeTransform {
            submit_delay: Duration::from_millis(200),
            ..Default::default()
        };
        let h = harness(
            static_pool(1, 3).await,
            ScriptedFetcher::default(),
            transform,
            MemoryStore::default(),
            PipelineConfig::builder().item_deadline(Duration::from_millis(50)),
        )
        .await;
        let outcomes = h.pipeline.process_batch("L12", prefetched("L12", 3), 1).await;

        for outcome in &outcomes {
            assert_eq!(
                outcome.status,
                OutcomeStatus::TimedOut {
                    stage: Stage::Transforming
                }
            );
        }
        // One job at a time even though each caller gave up after 50ms.
        assert_eq!(h.transform.peak.load(Ordering::SeqCst), 1);
        assert_eq!(h.transform.submitted.load(Ordering::SeqCst), 3);
        // Nothing still running once the batch returns, and abandoned jobs
        // stopped before polling.
        assert_eq!(h.transform.in_flight.load(Ordering::SeqCst), 0);
        assert_eq!(h.transform.polled.load(Ordering::SeqCst), 0);
        assert_eq!(h.store.puts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn pending_transform_times_out_without_upload() {
        let transform = FakeTransform {
            stuck: true,
            ..Default::default()
        };
        let h = harness(
            static_pool(1, 3).await,
            ScriptedFetcher::default(),
            transform,
            MemoryStore::default(),
            PipelineConfig::builder().transform_timeout(Duration::from_millis(30)),
        )
        .await;
        let outcomes = h.pipeline.process_batch("L13", prefetched("L13", 2), 2).await;

        for outcome in &outcomes {
            assert_eq!(outcome.status, OutcomeStatus::TransformFailed);
            assert!(outcome.final_url.is_none());
        }
        assert!(h.transform.polled.load(Ordering::SeqCst) >= 2);
        assert_eq!(h.store.puts.load(Ordering::SeqCst), 0);
        assert!(work_dir_is_empty(&h.work_dir));
    }

    #[tokio::test]
    async fn empty_pool_fails_references_without_panicking() {
        let h = harness(
            static_pool(0, 3).await,
            ScriptedFetcher::default(),
            FakeTransform::new(false),
            MemoryStore::default(),
            PipelineConfig::builder(),
        )
        .await;
        let outcomes = h.pipeline.process_batch("L9", references("L9", 3), 2).await;
        assert!(outcomes.iter().all(|o| o.status == OutcomeStatus::DownloadFailed));
        assert_eq!(h.fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn prefetched_bytes_skip_download() {
        let h = harness(
            static_pool(1, 3).await,
            ScriptedFetcher::default(),
            FakeTransform::new(false),
            MemoryStore::default(),
            PipelineConfig::builder(),
        )
        .await;
        let reference = MediaReference::image("https://img.example/r.jpg", "L10", 0).with_prefetched(b"rendered".to_vec());
        let outcomes = h.pipeline.process("L10", vec![reference]).await;
        assert!(outcomes[0].is_success());
        assert_eq!(h.fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn deferred_mode_only_captures_metadata() {
        let pool = static_pool(1, 3).await;
        let fetcher = Arc::new(ScriptedFetcher::default());
        let config = PipelineConfig::builder().deferred(true).build();
        let pipeline = MediaPipeline::builder(pool, config)
            .fetcher(fetcher.clone())
            .build()
            .unwrap();

        let outcomes = pipeline.process("L11", references("L11", 3)).await;
        assert_eq!(outcomes.len(), 3);
        for outcome in &outcomes {
            assert_eq!(outcome.status, OutcomeStatus::Deferred);
            assert!(!outcome.transformed);
            assert!(outcome.final_url.is_none());
        }
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
        assert!(BatchSummary::from_outcomes(&outcomes).is_complete());
    }

    #[tokio::test]
    async fn transform_is_required_outside_deferred_mode() {
        let pool = static_pool(1, 3).await;
        let result = MediaPipeline::builder(pool, PipelineConfig::default()).build();
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }
}
