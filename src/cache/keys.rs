//! Cache key derivation.
//!
//! A key combines a 128-bit digest of the request URL with two watermarks: the
//! most recent content modification anywhere on the site and the modification
//! time of the active template bundle. Any watermark change produces a new key
//! for every URL at once, so content edits never need to enumerate the entries
//! they affect.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::warn;

use super::context::RequestContext;

/// Number of digest bytes kept from the URL hash (128 bits).
const URL_DIGEST_BYTES: usize = 16;

/// Opaque, freshness-sensitive identifier of a stored page.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File name of the entry inside the store directory.
    pub fn file_name(&self) -> String {
        format!("{}.html", self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Failure to obtain a freshness watermark from the host.
#[derive(Debug, Error)]
pub enum ContentQueryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("watermark unavailable: {0}")]
    Unavailable(String),
}

/// Host-provided freshness queries.
#[async_trait]
pub trait Watermarks: Send + Sync {
    /// Timestamp of the most recently modified content item across the site.
    async fn content_modified(&self) -> Result<OffsetDateTime, ContentQueryError>;

    /// Last-modified timestamp of the active template bundle root.
    async fn template_modified(&self) -> Result<OffsetDateTime, ContentQueryError>;
}

/// Derives cache keys from request snapshots and the injected watermarks.
pub struct KeyDeriver {
    prefix: String,
    watermarks: Arc<dyn Watermarks>,
}

impl KeyDeriver {
    pub fn new(prefix: impl Into<String>, watermarks: Arc<dyn Watermarks>) -> Self {
        Self {
            prefix: prefix.into(),
            watermarks,
        }
    }

    /// Compute the key for a request.
    ///
    /// A failing watermark query degrades to the current time, which turns the
    /// lookup into a guaranteed miss rather than risking a stale hit.
    pub async fn derive(&self, ctx: &RequestContext) -> CacheKey {
        let content = resolve_watermark(self.watermarks.content_modified().await, "content");
        let template = resolve_watermark(self.watermarks.template_modified().await, "template");
        compose_key(&self.prefix, &ctx.url(), content, template)
    }
}

/// Hex-encoded 128-bit digest of a request URL.
pub fn hash_url(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..URL_DIGEST_BYTES])
}

/// Assemble `prefix || hash || "_" || content || "_" || template`.
pub fn compose_key(prefix: &str, url: &str, content: i64, template: i64) -> CacheKey {
    CacheKey(format!("{prefix}{}_{content}_{template}", hash_url(url)))
}

fn resolve_watermark(
    result: Result<OffsetDateTime, ContentQueryError>,
    watermark: &'static str,
) -> i64 {
    match result {
        Ok(timestamp) => timestamp.unix_timestamp(),
        Err(err) => {
            warn!(
                target = "quire::cache::keys",
                watermark,
                error = %err,
                "Watermark query failed; falling back to current time"
            );
            OffsetDateTime::now_utc().unix_timestamp()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::watermarks::ManualWatermarks;

    struct FailingWatermarks;

    #[async_trait]
    impl Watermarks for FailingWatermarks {
        async fn content_modified(&self) -> Result<OffsetDateTime, ContentQueryError> {
            Err(ContentQueryError::Unavailable("database offline".to_string()))
        }

        async fn template_modified(&self) -> Result<OffsetDateTime, ContentQueryError> {
            Ok(OffsetDateTime::from_unix_timestamp(2000).expect("valid timestamp"))
        }
    }

    fn deriver(watermarks: Arc<ManualWatermarks>) -> KeyDeriver {
        KeyDeriver::new("quire_page_", watermarks)
    }

    #[test]
    fn url_hash_is_128_bits_of_hex() {
        let hash = hash_url("/about?x=1");
        assert_eq!(hash.len(), 32);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn different_urls_produce_different_hashes() {
        assert_ne!(hash_url("/about?x=1"), hash_url("/about?x=2"));
        assert_ne!(hash_url("/about"), hash_url("/about/"));
    }

    #[test]
    fn composed_key_layout() {
        let key = compose_key("quire_page_", "/about?x=1", 1000, 2000);
        let expected = format!("quire_page_{}_1000_2000", hash_url("/about?x=1"));
        assert_eq!(key.as_str(), expected);
        assert_eq!(key.file_name(), format!("{expected}.html"));
    }

    #[tokio::test]
    async fn derive_is_deterministic() {
        let watermarks = Arc::new(ManualWatermarks::new(1000, 2000));
        let keys = deriver(watermarks);
        let ctx = RequestContext::get("/about", Some("x=1"));

        let first = keys.derive(&ctx).await;
        let second = keys.derive(&ctx).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn content_edit_changes_key_for_same_url() {
        let watermarks = Arc::new(ManualWatermarks::new(1000, 2000));
        let keys = deriver(watermarks.clone());
        let ctx = RequestContext::get("/about", Some("x=1"));

        let before = keys.derive(&ctx).await;
        watermarks.set_content(1050);
        let after = keys.derive(&ctx).await;

        assert_ne!(before, after);
        assert!(after.as_str().ends_with("_1050_2000"));
    }

    #[tokio::test]
    async fn template_change_changes_key() {
        let watermarks = Arc::new(ManualWatermarks::new(1000, 2000));
        let keys = deriver(watermarks.clone());
        let ctx = RequestContext::get("/", None);

        let before = keys.derive(&ctx).await;
        watermarks.set_template(2500);
        assert_ne!(before, keys.derive(&ctx).await);
    }

    #[tokio::test]
    async fn failing_watermark_falls_back_to_now() {
        let keys = KeyDeriver::new("quire_page_", Arc::new(FailingWatermarks));
        let ctx = RequestContext::get("/", None);
        let before = OffsetDateTime::now_utc().unix_timestamp();

        let key = keys.derive(&ctx).await;

        let parts: Vec<&str> = key.as_str().rsplitn(3, '_').collect();
        assert_eq!(parts[0], "2000");
        let content: i64 = parts[1].parse().expect("numeric watermark");
        assert!(content >= before);
    }
}
