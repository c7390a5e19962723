//! Quire page cache.
//!
//! Stores fully rendered, minified HTML pages on disk and serves them to
//! anonymous visitors without invoking the dynamic renderer.
//!
//! ## Flow
//!
//! ```text
//! request -> eligibility -> key -> store.read
//!              |                       |-- hit:  stored page + trailer
//!              |                       `-- miss: render -> transform -> store.write
//!              `-- ineligible: pass through untouched
//! ```
//!
//! Keys embed the site's content and template watermarks, so any edit makes
//! every existing entry unreachable. The [`InvalidationCoordinator`] also
//! clears the directory on content events and sweeps it on a weekly timer.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! enabled = true
//! content_root = "wp-content"
//! directory = "quire-cache"
//! key_prefix = "quire_page_"
//! cleanup_interval_days = 7
//! ```

mod config;
mod context;
mod eligibility;
mod events;
mod interceptor;
mod keys;
mod lock;
mod middleware;
mod prefetch;
mod store;
mod transform;
mod trigger;

pub use config::CacheConfig;
pub use context::{ContextPolicy, RequestContext, RequestOrigin};
pub use eligibility::{BypassReason, bypass_reason, is_cacheable};
pub use events::{ContentEvent, Invalidation, InvalidationCause};
pub use interceptor::{CachedPage, Delivery, PreRender, RequestOutcome, ResponseInterceptor};
pub use keys::{CacheKey, ContentQueryError, KeyDeriver, Watermarks, compose_key, hash_url};
pub use middleware::{PageCacheState, X_CACHE, page_cache_layer, should_store_response};
pub use prefetch::{PREFETCH_SCRIPT_ID, inject_prefetch_script};
pub use store::{ClearReport, PLACEHOLDER_FILE, PageStore, StoreError};
pub use transform::{
    AssetResolver, INLINED_MARKER, InlineSettings, Trailer, TransformError, TransformResult,
    Transformer,
};
pub use trigger::InvalidationCoordinator;
