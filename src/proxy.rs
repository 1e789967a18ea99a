//! Proxy representation and health metadata.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Protocol spoken by a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
    Socks5,
}

impl Protocol {
    pub fn scheme(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Socks5 => "socks5",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            "socks5" | "socks5h" => Ok(Protocol::Socks5),
            other => Err(format!("unsupported proxy protocol `{}`", other)),
        }
    }
}

/// Username/password pair. For session-templated vendors the username
/// encodes a rotation session rather than a fixed account.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Identity of a proxy inside the pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyKey {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
}

/// Representation of a rotating egress identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proxy {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
    /// Consecutive-ish failure counter; success decrements it.
    #[serde(default)]
    pub fail_count: u32,
    /// `None` until the proxy is handed out for the first time.
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
    /// Last measured latency in seconds, if available.
    #[serde(default)]
    pub response_time: Option<f64>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Proxy {
    /// Create a new proxy without credentials or expiry.
    pub fn new(host: impl Into<String>, port: u16, protocol: Protocol) -> Self {
        Self {
            host: host.into(),
            port,
            protocol,
            credentials: None,
            fail_count: 0,
            last_used_at: None,
            response_time: None,
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    /// Set `expires_at` relative to `created_at`.
    pub fn with_ttl(mut self, ttl: std::time::Duration) -> Self {
        let ttl = ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::MAX);
        self.expires_at = self.created_at.checked_add_signed(ttl);
        self
    }

    /// Parse `protocol://[user:pass@]host:port`. A bare `host:port` is
    /// taken to be an HTTP proxy; http and https may omit the port.
    pub fn parse(input: &str) -> Result<Self, String> {
        let input = input.trim();
        let with_scheme = if input.contains("://") {
            input.to_string()
        } else {
            format!("http://{}", input)
        };
        let url = url::Url::parse(&with_scheme).map_err(|e| format!("{}: {}", input, e))?;
        let protocol: Protocol = url.scheme().parse()?;
        let host = url
            .host_str()
            .ok_or_else(|| format!("{}: missing host", input))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| format!("{}: missing port", input))?;

        let mut proxy = Proxy::new(host, port, protocol);
        if !url.username().is_empty() {
            let password = url.password().unwrap_or_default();
            proxy = proxy.with_credentials(decode(url.username()), decode(password));
        }
        Ok(proxy)
    }

    pub fn key(&self) -> ProxyKey {
        ProxyKey {
            host: self.host.clone(),
            port: self.port,
            username: self.credentials.as_ref().map(|c| c.username.clone()),
        }
    }

    /// Whether two proxies route through the same endpoint, ignoring
    /// credentials.
    pub fn same_endpoint(&self, other: &Proxy) -> bool {
        self.host == other.host && self.port == other.port
    }

    /// A proxy is selectable while its fail count is below the threshold.
    /// Expiry alone never makes it unselectable.
    pub fn is_selectable(&self, max_fails: u32) -> bool {
        self.fail_count < max_fails
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Not yet expired, but will be within `window`.
    pub fn expires_within(&self, now: DateTime<Utc>, window: std::time::Duration) -> bool {
        let window = ChronoDuration::from_std(window).unwrap_or(ChronoDuration::MAX);
        match self.expires_at {
            Some(at) => at > now && at - now <= window,
            None => false,
        }
    }

    /// Proxy URL without credentials.
    pub fn url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }

    /// Convert to a `reqwest::Proxy` routing all traffic.
    pub fn to_reqwest_proxy(&self) -> Result<reqwest::Proxy, reqwest::Error> {
        let proxy = reqwest::Proxy::all(self.url())?;
        Ok(match &self.credentials {
            Some(c) => proxy.basic_auth(&c.username, &c.password),
            None => proxy,
        })
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.credentials {
            Some(c) => write!(f, "{}://{}@{}:{}", self.protocol, c.username, self.host, self.port),
            None => write!(f, "{}://{}:{}", self.protocol, self.host, self.port),
        }
    }
}

/// Percent-decode a URL userinfo component. `+` is literal here.
fn decode(s: &str) -> String {
    percent_decode_str(s).decode_utf8_lossy().into_owned()
}
