//! Middleware implementation for reqwest.
//!
//! Routes arbitrary requests (listing pages, API calls) through the pool,
//! retrying on a different proxy after transport errors and 5xx replies.

use crate::error::NoProxyAvailable;
use crate::pool::ProxyPool;
use crate::proxy::ProxyKey;

use anyhow::anyhow;
use async_trait::async_trait;
use log::{info, warn};
use reqwest_middleware::{Error, Middleware, Next, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Middleware that uses a pool of proxies for HTTP requests.
#[derive(Clone)]
pub struct ProxyPoolMiddleware {
    /// The proxy pool.
    pool: Arc<ProxyPool>,
    /// Attempts per request, each through a different proxy.
    max_attempts: usize,
    /// Timeout per attempt.
    timeout: Duration,
}

impl ProxyPoolMiddleware {
    /// Create a middleware over an existing pool.
    pub fn new(pool: Arc<ProxyPool>) -> Self {
        let stats = pool.stats();
        info!(
            "Proxy middleware using pool with {}/{} available proxies",
            stats.available, stats.total
        );
        if stats.available == 0 {
            warn!("No selectable proxies in pool");
        }
        Self {
            pool,
            max_attempts: 3,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Middleware for ProxyPoolMiddleware {
    async fn handle(
        &self,
        req: reqwest::Request,
        _extensions: &mut http::Extensions,
        _next: Next<'_>,
    ) -> Result<reqwest::Response> {
        let mut tried: Vec<ProxyKey> = Vec::new();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let last_attempt = attempt >= self.max_attempts;

            let mut proxy = match self.pool.acquire_excluding(&tried).await {
                Ok(proxy) => proxy,
                Err(_) => {
                    let stats = self.pool.stats();
                    warn!("No proxy available. Total: {}, Available: {}", stats.total, stats.available);
                    return Err(Error::Middleware(anyhow!(NoProxyAvailable)));
                }
            };
            tried.push(proxy.key());

            let proxied_request = req.try_clone().ok_or_else(|| {
                Error::Middleware(anyhow!(
                    "Request object is not cloneable. Are you passing a streaming body?"
                ))
            })?;

            info!("Using proxy: {} (attempt {})", proxy, attempt);

            // Build a new client with the selected proxy
            let client = match proxy
                .to_reqwest_proxy()
                .and_then(|p| reqwest::Client::builder().proxy(p).timeout(self.timeout).build())
            {
                Ok(c) => c,
                Err(e) => {
                    warn!("Failed to build client with proxy {}: {}", proxy, e);
                    self.pool.mark_failure(&proxy);
                    if last_attempt {
                        return Err(Error::Reqwest(e));
                    }
                    continue;
                }
            };

            let started = Instant::now();
            match client.execute(proxied_request).await {
                Ok(response) if response.status().is_server_error() => {
                    warn!(
                        "Proxy {} got HTTP {} (attempt {})",
                        proxy,
                        response.status(),
                        attempt
                    );
                    self.pool.mark_failure(&proxy);
                    if last_attempt {
                        return Ok(response);
                    }
                }
                Ok(response) => {
                    proxy.response_time = Some(started.elapsed().as_secs_f64());
                    self.pool.mark_success(&proxy);
                    return Ok(response);
                }
                Err(err) => {
                    warn!("Request failed with proxy {} (attempt {}): {}", proxy, attempt, err);
                    self.pool.mark_failure(&proxy);
                    if last_attempt {
                        return Err(Error::Reqwest(err));
                    }
                }
            }
        }
    }
}
