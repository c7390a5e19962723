mod admin;
mod middleware;
mod proxy;

pub use admin::{AdminState, build_admin_router};
pub use middleware::{RequestTrace, log_responses, set_request_context};
pub use proxy::{ProxyState, forward};

use axum::{Router, middleware as axum_middleware};

use crate::cache::{PageCacheState, page_cache_layer};

/// Public router: every request is proxied upstream behind the page cache.
pub fn build_public_router(proxy: ProxyState, cache: PageCacheState) -> Router {
    Router::new()
        .fallback(forward)
        .with_state(proxy)
        .layer(axum_middleware::from_fn_with_state(cache, page_cache_layer))
        .layer(axum_middleware::from_fn(log_responses))
        .layer(axum_middleware::from_fn(set_request_context))
}
