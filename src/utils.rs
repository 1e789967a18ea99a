//! Utility functions for proxy sources.

use log::warn;
use rand::distr::Alphanumeric;
use rand::Rng;

use crate::proxy::Proxy;

/// Parse newline-delimited `protocol://[user:pass@]host:port` entries.
/// Blank lines and `#` comments are skipped, malformed lines are logged
/// and dropped.
pub(crate) fn parse_proxy_list(content: &str) -> Vec<Proxy> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| match Proxy::parse(line) {
            Ok(proxy) => Some(proxy),
            Err(e) => {
                warn!("Skipping malformed proxy entry: {}", e);
                None
            }
        })
        .collect()
}

/// Random alphanumeric session token of fixed length.
pub(crate) fn session_token(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

pub(crate) fn ttl_label(ttl_minutes: u64) -> String {
    format!("sessTime{}", ttl_minutes)
}

/// Build a session-templated username:
/// `<account>-res_<region>_<session>-<ttl-label>`.
pub(crate) fn session_username(account: &str, region: &str, session: &str, ttl_minutes: u64) -> String {
    format!("{}-res_{}_{}-{}", account, region, session, ttl_label(ttl_minutes))
}
