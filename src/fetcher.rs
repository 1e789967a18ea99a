//! Fetching media bytes through a given proxy.

use async_trait::async_trait;
use log::debug;
use std::time::Duration;

use crate::error::DownloadError;
use crate::proxy::Proxy;

/// Fetches a URL through one specific proxy. The pipeline owns the retry
/// and proxy rotation; implementations make exactly one attempt.
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch(&self, url: &str, proxy: &Proxy, timeout: Duration) -> Result<Vec<u8>, DownloadError>;
}

/// `reqwest` fetcher building one client per proxy.
#[derive(Debug, Clone, Default)]
pub struct ReqwestFetcher {
    user_agent: Option<String>,
}

impl ReqwestFetcher {
    pub fn new(user_agent: Option<String>) -> Self {
        Self { user_agent }
    }
}

pub(crate) fn classify(err: reqwest::Error, url: &str) -> DownloadError {
    if err.is_timeout() {
        DownloadError::Timeout { url: url.to_string() }
    } else {
        DownloadError::Network(err)
    }
}

#[async_trait]
impl MediaFetcher for ReqwestFetcher {
    async fn fetch(&self, url: &str, proxy: &Proxy, timeout: Duration) -> Result<Vec<u8>, DownloadError> {
        let reqwest_proxy = proxy.to_reqwest_proxy().map_err(|source| DownloadError::Proxy {
            proxy: proxy.to_string(),
            source,
        })?;

        let mut builder = reqwest::Client::builder().proxy(reqwest_proxy).timeout(timeout);
        if let Some(ua) = &self.user_agent {
            builder = builder.user_agent(ua);
        }
        let client = builder.build().map_err(|source| DownloadError::Proxy {
            proxy: proxy.to_string(),
            source,
        })?;

        let response = client.get(url).send().await.map_err(|e| classify(e, url))?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        let bytes = response.bytes().await.map_err(|e| classify(e, url))?;
        debug!("Fetched {} bytes from {} via {}", bytes.len(), url, proxy);
        Ok(bytes.to_vec())
    }
}
