//! Pre-render and post-render hooks around the dynamic renderer.
//!
//! Every request handled by the interceptor ends in exactly one
//! [`RequestOutcome`]. Internal failures (store I/O, transform panics,
//! watermark queries) degrade to serving the freshly rendered page.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use super::context::RequestContext;
use super::eligibility::bypass_reason;
use super::keys::{CacheKey, KeyDeriver};
use super::prefetch::inject_prefetch_script;
use super::store::PageStore;
use super::transform::{Trailer, TransformResult, Transformer};

const TARGET: &str = "quire::cache::interceptor";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    ServedFromCache,
    ServedFreshAndCached,
    ServedFreshUncached,
}

impl RequestOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestOutcome::ServedFromCache => "hit",
            RequestOutcome::ServedFreshAndCached => "stored",
            RequestOutcome::ServedFreshUncached => "uncached",
        }
    }
}

/// Stored page found before rendering.
#[derive(Debug, Clone)]
pub struct CachedPage {
    pub key: CacheKey,
    pub html: String,
}

impl CachedPage {
    pub fn into_delivery(self) -> Delivery {
        let body = TransformResult {
            html: self.html,
            trailer: Trailer::Hit(self.key),
        }
        .into_body();
        Delivery {
            body,
            outcome: RequestOutcome::ServedFromCache,
        }
    }
}

#[derive(Debug)]
pub enum PreRender {
    /// Short-circuit the renderer with this page.
    Serve(CachedPage),
    PassToRender,
}

/// Final body for the client and how it was produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub body: String,
    pub outcome: RequestOutcome,
}

pub struct ResponseInterceptor {
    keys: KeyDeriver,
    store: Arc<PageStore>,
    transformer: Arc<Transformer>,
    inject_prefetch: bool,
}

impl ResponseInterceptor {
    pub fn new(
        keys: KeyDeriver,
        store: Arc<PageStore>,
        transformer: Arc<Transformer>,
        inject_prefetch: bool,
    ) -> Self {
        Self {
            keys,
            store,
            transformer,
            inject_prefetch,
        }
    }

    /// Look up a stored page for an eligible request.
    pub async fn before_render(&self, ctx: &RequestContext) -> PreRender {
        if let Some(reason) = bypass_reason(ctx) {
            metrics::counter!("quire_cache_bypass_total", "reason" => reason.as_str()).increment(1);
            debug!(target = TARGET, outcome = "bypass", reason = reason.as_str());
            return PreRender::PassToRender;
        }

        let key = self.keys.derive(ctx).await;
        match self.store.read(&key).await {
            Ok(Some(bytes)) => match String::from_utf8(bytes.to_vec()) {
                Ok(html) => {
                    metrics::counter!("quire_cache_hit_total").increment(1);
                    debug!(target = TARGET, outcome = "hit", key = %key);
                    PreRender::Serve(CachedPage { key, html })
                }
                Err(_) => {
                    warn!(
                        target = TARGET,
                        key = %key,
                        "Stored page is not valid UTF-8; rendering fresh"
                    );
                    metrics::counter!("quire_cache_miss_total").increment(1);
                    PreRender::PassToRender
                }
            },
            Ok(None) => {
                metrics::counter!("quire_cache_miss_total").increment(1);
                debug!(target = TARGET, outcome = "miss", key = %key);
                PreRender::PassToRender
            }
            Err(err) => {
                metrics::counter!("quire_cache_miss_total").increment(1);
                warn!(
                    target = TARGET,
                    key = %key,
                    error = %err,
                    "Failed to read stored page; rendering fresh"
                );
                PreRender::PassToRender
            }
        }
    }

    /// Transform and store a freshly rendered page.
    ///
    /// The key is derived again here rather than reused from
    /// [`before_render`](Self::before_render), so a content change during
    /// rendering stores the page under the newer key.
    pub async fn after_render(&self, ctx: &RequestContext, html: String) -> Delivery {
        if bypass_reason(ctx).is_some() {
            return Delivery {
                body: html,
                outcome: RequestOutcome::ServedFreshUncached,
            };
        }

        let page = if self.inject_prefetch {
            inject_prefetch_script(&html)
        } else {
            html
        };

        let transformer = Arc::clone(&self.transformer);
        let source = page.clone();
        let transformed =
            match tokio::task::spawn_blocking(move || transformer.transform(&source)).await {
                Ok(output) => output,
                Err(err) => {
                    warn!(
                        target = TARGET,
                        error = %err,
                        "Transform task failed; serving page uncached"
                    );
                    return Delivery {
                        body: page,
                        outcome: RequestOutcome::ServedFreshUncached,
                    };
                }
            };

        let key = self.keys.derive(ctx).await;
        if let Err(err) = self
            .store
            .write(&key, Bytes::from(transformed.clone()))
            .await
        {
            warn!(
                target = TARGET,
                key = %key,
                error = %err,
                "Failed to store rendered page"
            );
        } else {
            debug!(target = TARGET, outcome = "stored", key = %key);
        }

        Delivery {
            body: TransformResult {
                html: transformed,
                trailer: Trailer::Stored(key),
            }
            .into_body(),
            outcome: RequestOutcome::ServedFreshAndCached,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use tempfile::TempDir;

    use super::*;
    use crate::cache::keys::compose_key;
    use crate::cache::transform::{AssetResolver, InlineSettings};
    use crate::infra::watermarks::ManualWatermarks;

    const PAGE: &str = "<html>\n  <body>\n    <p>Hello   world</p>\n  </body>\n</html>";

    struct NoAssets;

    impl AssetResolver for NoAssets {
        fn open(&self, _url_path: &str) -> io::Result<Option<Vec<u8>>> {
            Ok(None)
        }
    }

    fn interceptor(store: PageStore, watermarks: Arc<ManualWatermarks>) -> ResponseInterceptor {
        ResponseInterceptor::new(
            KeyDeriver::new("quire_page_", watermarks),
            Arc::new(store),
            Arc::new(Transformer::new(InlineSettings::default(), Arc::new(NoAssets))),
            false,
        )
    }

    #[tokio::test]
    async fn store_failure_still_delivers_transformed_page() {
        let dir = TempDir::new().expect("tempdir");
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "not a directory").unwrap();
        let interceptor = interceptor(
            PageStore::new(blocker.join("cache"), "quire_page_"),
            Arc::new(ManualWatermarks::new(1000, 2000)),
        );
        let ctx = RequestContext::get("/", None);

        let delivery = interceptor.after_render(&ctx, PAGE.to_string()).await;

        let key = compose_key("quire_page_", "/", 1000, 2000);
        let expected = TransformResult {
            html: interceptor.transformer.transform(PAGE),
            trailer: Trailer::Stored(key),
        }
        .into_body();
        assert_eq!(delivery.outcome, RequestOutcome::ServedFreshAndCached);
        assert_eq!(delivery.body, expected);
        assert!(delivery.body.contains("<p>Hello world</p>"), "{}", delivery.body);
    }

    #[tokio::test]
    async fn content_change_during_render_stores_under_new_key() {
        let dir = TempDir::new().expect("tempdir");
        let watermarks = Arc::new(ManualWatermarks::new(1000, 2000));
        let interceptor = interceptor(
            PageStore::new(dir.path().join("quire-cache"), "quire_page_"),
            watermarks.clone(),
        );
        let ctx = RequestContext::get("/about", None);

        assert!(matches!(
            interceptor.before_render(&ctx).await,
            PreRender::PassToRender
        ));
        watermarks.set_content(1050);
        let delivery = interceptor.after_render(&ctx, PAGE.to_string()).await;

        let old_key = compose_key("quire_page_", "/about", 1000, 2000);
        let new_key = compose_key("quire_page_", "/about", 1050, 2000);
        assert!(
            delivery.body.ends_with(&Trailer::Stored(new_key.clone()).render()),
            "{}",
            delivery.body
        );
        assert!(interceptor.store.exists(&new_key).await);
        assert!(!interceptor.store.exists(&old_key).await);

        let PreRender::Serve(page) = interceptor.before_render(&ctx).await else {
            panic!("expected stored page under the new key");
        };
        assert_eq!(page.key, new_key);
    }
}
