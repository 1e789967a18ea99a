//! Object-store client contract and storage keys.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Blob store the transformed assets are uploaded to.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` under `key`. `Ok(false)` means the store refused it.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> anyhow::Result<bool>;

    /// Issue a URL for `key` valid for `ttl`.
    async fn issue_url(&self, key: &str, ttl: Duration) -> anyhow::Result<String>;
}

/// Deterministic key for an asset: the same listing and source URL always
/// map to the same key, so reruns overwrite instead of duplicating.
///
/// Shape: `listings/<listing_id>/<first 16 bytes of sha256(url) as hex>.<ext>`
pub fn storage_key(listing_id: &str, original_url: &str) -> String {
    let digest = Sha256::new()
        .chain_update(listing_id.as_bytes())
        .chain_update(b"\n")
        .chain_update(original_url.as_bytes())
        .finalize();
    format!(
        "listings/{}/{}.{}",
        sanitize(listing_id),
        hex::encode(&digest[..16]),
        extension(original_url)
    )
}

fn sanitize(segment: &str) -> String {
    segment
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn extension(original_url: &str) -> String {
    url::Url::parse(original_url)
        .ok()
        .and_then(|u| {
            let path = u.path().to_string();
            let name = path.rsplit('/').next()?.to_string();
            let (_, ext) = name.rsplit_once('.')?;
            let ext = ext.to_ascii_lowercase();
            (!ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric())).then_some(ext)
        })
        .unwrap_or_else(|| "jpg".to_string())
}
