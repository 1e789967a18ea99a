//! Core proxy pool implementation.
//!
//! All selection and health bookkeeping happens under a single
//! `parking_lot::Mutex` held only for in-memory work. Network refills and
//! snapshot writes run with the lock released and merge back briefly.

use chrono::Utc;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

use crate::config::{PoolType, ProxyPoolConfig};
use crate::error::{ConfigError, NoProxyAvailable};
use crate::proxy::{Proxy, ProxyKey};
use crate::snapshot::{PoolSnapshot, SnapshotStore};
use crate::source::ProxySource;

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Proxies currently held.
    pub total: usize,
    /// Proxies below the failure threshold.
    pub available: usize,
    /// Proxies handed out since the pool started.
    pub usage: u64,
}

#[derive(Debug, Default)]
struct PoolState {
    proxies: Vec<Proxy>,
    served: u64,
    /// Bumped on every mutation worth persisting.
    revision: u64,
}

/// A pool of rotating proxies.
pub struct ProxyPool {
    state: Mutex<PoolState>,
    source: ProxySource,
    /// Configuration for the pool.
    pub config: ProxyPoolConfig,
    /// Spaces out unforced calls to rate-limited vendor APIs.
    refill_limiter: Option<DefaultDirectRateLimiter>,
    /// Serializes refills so concurrent acquirers do not all hit the source.
    refill_gate: tokio::sync::Mutex<()>,
    snapshot: Option<Arc<SnapshotStore>>,
}

impl ProxyPool {
    /// Create a new proxy pool with the given configuration.
    ///
    /// Dynamic pools restore their snapshot first; if that leaves the pool
    /// empty an initial refill is forced. Static pools read their file.
    /// Source failures are logged and leave the pool empty.
    pub async fn new(config: ProxyPoolConfig) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let source = ProxySource::from_config(&config)?;

        let refill_limiter = match config.pool_type() {
            PoolType::RentedIpBatch => Quota::with_period(config.api_request_interval).map(RateLimiter::direct),
            _ => None,
        };
        let snapshot = match (&config.snapshot_path, config.pool_type().is_dynamic()) {
            (Some(path), true) => Some(Arc::new(SnapshotStore::new(path))),
            _ => None,
        };

        let pool = Arc::new(Self {
            state: Mutex::new(PoolState::default()),
            source,
            config,
            refill_limiter,
            refill_gate: tokio::sync::Mutex::new(()),
            snapshot,
        });

        pool.initialize().await;

        let stats = pool.stats();
        info!(
            "Proxy pool ({:?}) initialized with {}/{} available proxies",
            pool.pool_type(),
            stats.available,
            stats.total
        );
        Ok(pool)
    }

    async fn initialize(&self) {
        if !self.pool_type().is_dynamic() {
            match self.source.fetch().await {
                Ok(proxies) => self.state.lock().proxies = proxies,
                Err(e) => warn!("Failed to load static proxies: {}", e),
            }
            return;
        }

        let restored = self.restore();
        if restored == 0 {
            self.refill(true).await;
        }
    }

    /// Load the snapshot into the pool, returning how many proxies survived.
    fn restore(&self) -> usize {
        let Some(store) = &self.snapshot else {
            return 0;
        };
        let mut snapshot = match store.load() {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return 0,
            Err(e) => {
                error!("Ignoring unreadable pool snapshot: {}", e);
                return 0;
            }
        };
        if snapshot.pool_type != self.pool_type() {
            warn!(
                "Ignoring {:?} snapshot at {} for a {:?} pool",
                snapshot.pool_type,
                store.path().display(),
                self.pool_type()
            );
            return 0;
        }

        let dropped = snapshot.retain_live(self.config.max_fails, Utc::now());
        let restored = snapshot.proxies.len();
        info!(
            "Restored {} proxies from {} (dropped {} dead)",
            restored,
            store.path().display(),
            dropped
        );
        let mut state = self.state.lock();
        state.proxies = snapshot.proxies;
        state.revision += 1;
        restored
    }

    pub fn pool_type(&self) -> PoolType {
        self.source.pool_type()
    }

    /// Acquire the least recently used selectable proxy.
    pub async fn acquire(&self) -> Result<Proxy, NoProxyAvailable> {
        self.acquire_excluding(&[]).await
    }

    /// Like [`acquire`](Self::acquire), but proxies in `exclude` are only
    /// returned when nothing else is selectable. Retry loops pass the
    /// proxies they already burned.
    pub async fn acquire_excluding(&self, exclude: &[ProxyKey]) -> Result<Proxy, NoProxyAvailable> {
        let dynamic = self.pool_type().is_dynamic();

        if dynamic {
            let (evicted, wants_refill) = {
                let mut state = self.state.lock();
                let evicted = self.evict(&mut state);
                (evicted, self.needs_refill(&state))
            };
            if evicted > 0 {
                self.persist();
            }
            if wants_refill {
                self.refill(false).await;
            }
        }

        if let Some(proxy) = self.select(exclude) {
            return Ok(proxy);
        }

        if dynamic {
            warn!("No selectable proxy, forcing refill");
            self.refill(true).await;
            if let Some(proxy) = self.select(exclude) {
                return Ok(proxy);
            }
        }

        // Last resort: give every held proxy another chance.
        let reset = {
            let mut state = self.state.lock();
            let count = state.proxies.len();
            for proxy in state.proxies.iter_mut() {
                proxy.fail_count = 0;
            }
            if count > 0 {
                state.revision += 1;
            }
            count
        };
        if reset == 0 {
            let stats = self.stats();
            warn!("No proxy available. Total: {}, Available: {}", stats.total, stats.available);
            return Err(NoProxyAvailable);
        }
        warn!("All {} proxies unselectable, reset fail counts", reset);
        self.persist();
        self.select(exclude).ok_or(NoProxyAvailable)
    }

    /// Record a successful request through `proxy`. A latency set on the
    /// caller's copy is recorded too.
    pub fn mark_success(&self, proxy: &Proxy) {
        let key = proxy.key();
        let updated = {
            let mut state = self.state.lock();
            let found = match state.proxies.iter_mut().find(|p| p.key() == key) {
                Some(p) => {
                    p.fail_count = p.fail_count.saturating_sub(1);
                    if proxy.response_time.is_some() {
                        p.response_time = proxy.response_time;
                    }
                    true
                }
                None => false,
            };
            if found {
                state.revision += 1;
            }
            found
        };
        if updated {
            self.persist();
        }
    }

    /// Record a failed request through `proxy`.
    pub fn mark_failure(&self, proxy: &Proxy) {
        let key = proxy.key();
        let max_fails = self.config.max_fails;
        let updated = {
            let mut state = self.state.lock();
            let found = match state.proxies.iter_mut().find(|p| p.key() == key) {
                Some(p) => {
                    p.fail_count += 1;
                    if p.fail_count == max_fails {
                        warn!("Proxy {} reached {} failures, no longer selectable", p, max_fails);
                    }
                    true
                }
                None => false,
            };
            if found {
                state.revision += 1;
            }
            found
        };
        if updated {
            self.persist();
        }
    }

    /// Get statistics about the proxy pool.
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            total: state.proxies.len(),
            available: self.selectable_count(&state),
            usage: state.served,
        }
    }

    /// Fetch a new batch from the source. Unforced refreshes respect the
    /// rate limit and merge into the pool; forced ones bypass the limit and
    /// replace the pool when the source returns anything. Returns the
    /// number of proxies added.
    pub async fn refresh(&self, force: bool) -> usize {
        if !self.pool_type().is_dynamic() {
            return 0;
        }
        self.refill(force).await
    }

    async fn refill(&self, forced: bool) -> usize {
        let _gate = self.refill_gate.lock().await;

        // Another task may have refilled while we waited for the gate.
        {
            let state = self.state.lock();
            if forced && self.selectable_count(&state) > 0 {
                debug!("Skipping forced refill, pool already replenished");
                return 0;
            }
            if !forced && !self.needs_refill(&state) {
                return 0;
            }
        }

        // Forced calls bypass the limit but still spend the budget.
        if let Some(limiter) = &self.refill_limiter {
            if limiter.check().is_err() && !forced {
                debug!("Refill rate-limited");
                return 0;
            }
        }

        let fetched = match self.source.fetch().await {
            Ok(proxies) => proxies,
            Err(e) => {
                warn!("Proxy refill failed: {}", e);
                return 0;
            }
        };
        if fetched.is_empty() {
            warn!("Proxy refill returned no proxies");
            return 0;
        }

        let added = {
            let mut state = self.state.lock();
            let added = if forced {
                let count = fetched.len();
                state.proxies = fetched;
                count
            } else {
                self.merge(&mut state.proxies, fetched)
            };
            state.revision += 1;
            added
        };
        info!(
            "Refilled {} proxies ({})",
            added,
            if forced { "forced" } else { "scheduled" }
        );
        self.persist();
        added
    }

    fn merge(&self, proxies: &mut Vec<Proxy>, fetched: Vec<Proxy>) -> usize {
        let before = proxies.len();
        let by_endpoint = self.pool_type().dedupes_by_endpoint();
        for proxy in fetched {
            let duplicate = if by_endpoint {
                proxies.iter().any(|p| p.same_endpoint(&proxy))
            } else {
                let key = proxy.key();
                proxies.iter().any(|p| p.key() == key)
            };
            if !duplicate {
                proxies.push(proxy);
            }
        }
        proxies.len() - before
    }

    /// Remove proxies that are over the failure threshold, and expired
    /// ones whose credential carries the TTL. Expired proxies of other
    /// types keep serving until they actually fail.
    fn evict(&self, state: &mut PoolState) -> usize {
        let max_fails = self.config.max_fails;
        let ttl_bound = self.pool_type().has_ttl_credentials();
        let now = Utc::now();
        let before = state.proxies.len();
        state
            .proxies
            .retain(|p| p.is_selectable(max_fails) && !(ttl_bound && p.is_expired(now)));
        let evicted = before - state.proxies.len();
        if evicted > 0 {
            state.revision += 1;
            info!("Evicted {} proxies, {} remain", evicted, state.proxies.len());
        }
        evicted
    }

    fn needs_refill(&self, state: &PoolState) -> bool {
        let max_fails = self.config.max_fails;
        let now = Utc::now();
        let lead = self.config.refill_lead_time;
        let selectable = self.selectable_count(state);
        let expiring = state
            .proxies
            .iter()
            .filter(|p| p.is_selectable(max_fails) && p.expires_within(now, lead))
            .count();
        selectable < self.config.min_proxy_count || expiring >= self.config.min_proxy_count
    }

    fn selectable_count(&self, state: &PoolState) -> usize {
        state
            .proxies
            .iter()
            .filter(|p| p.is_selectable(self.config.max_fails))
            .count()
    }

    fn select(&self, exclude: &[ProxyKey]) -> Option<Proxy> {
        let max_fails = self.config.max_fails;
        let mut state = self.state.lock();
        let index = state
            .proxies
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_selectable(max_fails))
            .min_by_key(|(_, p)| (exclude.contains(&p.key()), p.last_used_at))
            .map(|(i, _)| i)?;

        let proxy = &mut state.proxies[index];
        proxy.last_used_at = Some(Utc::now());
        let chosen = proxy.clone();
        state.served += 1;
        Some(chosen)
    }

    /// Write the current snapshot and wait for it to reach disk. Earlier
    /// background writes still in flight are superseded.
    pub async fn flush(&self) {
        let Some((store, revision, snapshot)) = self.snapshot_job() else {
            return;
        };
        if let Err(e) = tokio::task::spawn_blocking(move || write_snapshot(&store, revision, &snapshot)).await {
            error!("Snapshot writer died: {}", e);
        }
    }

    /// Write the pool snapshot in the background. The copy is taken under
    /// the lock; the file write runs on the blocking pool.
    fn persist(&self) {
        let Some((store, revision, snapshot)) = self.snapshot_job() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || write_snapshot(&store, revision, &snapshot));
            }
            Err(_) => write_snapshot(&store, revision, &snapshot),
        }
    }

    fn snapshot_job(&self) -> Option<(Arc<SnapshotStore>, u64, PoolSnapshot)> {
        let store = Arc::clone(self.snapshot.as_ref()?);
        let state = self.state.lock();
        let snapshot = PoolSnapshot {
            proxies: state.proxies.clone(),
            last_update: Utc::now(),
            pool_type: self.pool_type(),
        };
        Some((store, state.revision, snapshot))
    }
}

fn write_snapshot(store: &SnapshotStore, revision: u64, snapshot: &PoolSnapshot) {
    if let Err(e) = store.save(revision, snapshot) {
        error!("Failed to persist proxy pool, continuing in memory: {}", e);
    }
}
