//! Proxy acquisition strategies.
//!
//! The set of vendors is closed: each variant of [`ProxySource`] has its
//! own request shape, credential format and rate-limit semantics, and the
//! pool dispatches on the variant selected by configuration.

use log::{debug, info};
use reqwest::Client;
use serde::{Deserialize, Deserializer};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{PoolType, ProxyPoolConfig, SourceConfig};
use crate::error::{ConfigError, SourceError};
use crate::proxy::{Protocol, Proxy};
use crate::utils;

/// A configured proxy source.
#[derive(Debug)]
pub enum ProxySource {
    StaticFile(StaticFileSource),
    GenericApi(GenericApiSource),
    RentedIpBatch(RentedIpSource),
    SessionTemplated(SessionTemplateSource),
}

impl ProxySource {
    /// Build the source described by the pool configuration.
    pub fn from_config(config: &ProxyPoolConfig) -> Result<Self, ConfigError> {
        let source = match &config.source {
            SourceConfig::StaticFile { path } => ProxySource::StaticFile(StaticFileSource { path: path.clone() }),
            SourceConfig::GenericApi { endpoint } => ProxySource::GenericApi(GenericApiSource {
                client: source_client(config.request_timeout)?,
                endpoint: endpoint.clone(),
            }),
            SourceConfig::RentedIpBatch {
                endpoint,
                secret,
                order_id,
                batch_size,
                protocol,
            } => ProxySource::RentedIpBatch(RentedIpSource {
                client: source_client(config.request_timeout)?,
                endpoint: endpoint.clone(),
                secret: secret.clone(),
                order_id: order_id.clone(),
                batch_size: *batch_size,
                protocol: *protocol,
                ip_ttl: config.ip_ttl,
            }),
            SourceConfig::SessionTemplated {
                account,
                password,
                region,
                gateway_host,
                gateway_port,
                protocol,
                ttl_minutes,
                batch_size,
                session_len,
            } => ProxySource::SessionTemplated(SessionTemplateSource {
                account: account.clone(),
                password: password.clone(),
                region: region.clone(),
                gateway_host: gateway_host.clone(),
                gateway_port: *gateway_port,
                protocol: *protocol,
                ttl_minutes: *ttl_minutes,
                batch_size: *batch_size,
                session_len: *session_len,
            }),
        };
        Ok(source)
    }

    pub fn pool_type(&self) -> PoolType {
        match self {
            ProxySource::StaticFile(_) => PoolType::StaticFile,
            ProxySource::GenericApi(_) => PoolType::GenericApi,
            ProxySource::RentedIpBatch(_) => PoolType::RentedIpBatch,
            ProxySource::SessionTemplated(_) => PoolType::SessionTemplated,
        }
    }

    /// Fetch a batch of fresh proxies.
    pub async fn fetch(&self) -> Result<Vec<Proxy>, SourceError> {
        match self {
            ProxySource::StaticFile(s) => s.load().await,
            ProxySource::GenericApi(s) => s.fetch().await,
            ProxySource::RentedIpBatch(s) => s.fetch().await,
            ProxySource::SessionTemplated(s) => Ok(s.generate()),
        }
    }
}

/// Vendor APIs are called directly, never through a proxy from the
/// environment.
fn source_client(timeout: Duration) -> Result<Client, ConfigError> {
    Ok(Client::builder().timeout(timeout).no_proxy().build()?)
}

async fn get_json<T: serde::de::DeserializeOwned>(request: reqwest::RequestBuilder) -> Result<T, SourceError> {
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(SourceError::Status(status.as_u16()));
    }
    let body = response.text().await?;
    serde_json::from_str(&body).map_err(|e| SourceError::Malformed(e.to_string()))
}

/// Newline-delimited proxy list on disk.
#[derive(Debug)]
pub struct StaticFileSource {
    path: PathBuf,
}

impl StaticFileSource {
    async fn load(&self) -> Result<Vec<Proxy>, SourceError> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| SourceError::File {
                path: self.path.clone(),
                source,
            })?;
        let proxies = utils::parse_proxy_list(&content);
        info!("Loaded {} proxies from {}", proxies.len(), self.path.display());
        Ok(proxies)
    }
}

#[derive(Debug, Deserialize)]
struct ApiProxy {
    ip: String,
    #[serde(deserialize_with = "port_from_any")]
    port: u16,
    #[serde(default)]
    protocol: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

/// Endpoint returning a JSON list of `{ip, port, protocol, username?, password?}`.
#[derive(Debug)]
pub struct GenericApiSource {
    client: Client,
    endpoint: String,
}

impl GenericApiSource {
    async fn fetch(&self) -> Result<Vec<Proxy>, SourceError> {
        let entries: Vec<ApiProxy> = get_json(self.client.get(&self.endpoint)).await?;
        let mut proxies = Vec::with_capacity(entries.len());
        for entry in entries {
            let protocol = match entry.protocol.as_deref() {
                Some(p) => p.parse().map_err(SourceError::Malformed)?,
                None => Protocol::Http,
            };
            let mut proxy = Proxy::new(entry.ip, entry.port, protocol);
            if let Some(username) = entry.username {
                proxy = proxy.with_credentials(username, entry.password.unwrap_or_default());
            }
            proxies.push(proxy);
        }
        debug!("Generic API returned {} proxies", proxies.len());
        Ok(proxies)
    }
}

#[derive(Debug, Deserialize)]
struct RentedBatchResponse {
    code: i64,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    obj: Vec<RentedIp>,
}

#[derive(Debug, Deserialize)]
struct RentedIp {
    ip: String,
    #[serde(deserialize_with = "port_from_any")]
    port: u16,
    account: String,
    password: String,
}

/// Time-limited IP batches from a rate-limited vendor API. The pool
/// enforces `api_request_interval` between calls.
#[derive(Debug)]
pub struct RentedIpSource {
    client: Client,
    endpoint: String,
    secret: String,
    order_id: String,
    batch_size: usize,
    protocol: Protocol,
    ip_ttl: Duration,
}

impl RentedIpSource {
    async fn fetch(&self) -> Result<Vec<Proxy>, SourceError> {
        let num = self.batch_size.to_string();
        let request = self.client.get(&self.endpoint).query(&[
            ("secret", self.secret.as_str()),
            ("orderId", self.order_id.as_str()),
            ("num", num.as_str()),
        ]);
        let response: RentedBatchResponse = get_json(request).await?;
        if response.code != 0 {
            return Err(SourceError::Rejected {
                code: response.code,
                message: response.msg.unwrap_or_default(),
            });
        }
        let proxies: Vec<Proxy> = response
            .obj
            .into_iter()
            .map(|ip| {
                Proxy::new(ip.ip, ip.port, self.protocol)
                    .with_credentials(ip.account, ip.password)
                    .with_ttl(self.ip_ttl)
            })
            .collect();
        info!("Rented {} IPs (requested {})", proxies.len(), self.batch_size);
        Ok(proxies)
    }
}

/// Residential gateway billed per session. Every "proxy" is the same
/// gateway with a freshly generated session credential that stops
/// authenticating after `ttl_minutes`.
#[derive(Debug)]
pub struct SessionTemplateSource {
    account: String,
    password: String,
    region: String,
    gateway_host: String,
    gateway_port: u16,
    protocol: Protocol,
    ttl_minutes: u64,
    batch_size: usize,
    session_len: usize,
}

impl SessionTemplateSource {
    fn generate(&self) -> Vec<Proxy> {
        let ttl = Duration::from_secs(self.ttl_minutes * 60);
        (0..self.batch_size)
            .map(|_| {
                let session = utils::session_token(self.session_len);
                let username = utils::session_username(&self.account, &self.region, &session, self.ttl_minutes);
                Proxy::new(self.gateway_host.as_str(), self.gateway_port, self.protocol)
                    .with_credentials(username, self.password.as_str())
                    .with_ttl(ttl)
            })
            .collect()
    }
}

fn port_from_any<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Num(u16),
        Text(String),
    }
    match Port::deserialize(deserializer)? {
        Port::Num(n) => Ok(n),
        Port::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}
