//! Page cache middleware.
//!
//! Serves stored pages before the inner service runs and captures eligible
//! HTML responses on the way out. Ineligible requests and responses that are
//! not storable stream through untouched.

use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{HeaderValue, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use bytes::BytesMut;
use futures::{StreamExt, stream};
use http_body_util::BodyExt;
use tracing::{debug, instrument};

use crate::application::error::ErrorReport;

use super::{
    CacheConfig,
    context::ContextPolicy,
    eligibility::is_cacheable,
    interceptor::{Delivery, PreRender, RequestOutcome, ResponseInterceptor},
};

pub const X_CACHE: &str = "x-cache";

/// Shared cache state for middleware.
#[derive(Clone)]
pub struct PageCacheState {
    pub config: CacheConfig,
    pub policy: Arc<ContextPolicy>,
    pub interceptor: Arc<ResponseInterceptor>,
}

#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn page_cache_layer(
    State(cache): State<PageCacheState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !cache.config.enabled {
        return next.run(request).await;
    }

    let ctx = cache
        .policy
        .capture(request.method(), request.uri(), request.headers());

    if let PreRender::Serve(page) = cache.interceptor.before_render(&ctx).await {
        return html_response(StatusCode::OK, page.into_delivery());
    }

    let response = next.run(request).await;

    if !is_cacheable(&ctx) || !should_store_response(&response) {
        return response;
    }

    let limit = cache.config.max_page_bytes;
    if declared_length(&response).is_some_and(|length| length > limit) {
        debug!(outcome = "uncached", reason = "oversized", "passing response through");
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let bytes = match buffer_page(body, limit).await {
        Ok(Buffered::Complete(bytes)) => bytes,
        Ok(Buffered::Overflow(body)) => {
            debug!(outcome = "uncached", reason = "oversized", "passing response through");
            return Response::from_parts(parts, body);
        }
        Err(err) => {
            let mut response = StatusCode::INTERNAL_SERVER_ERROR.into_response();
            ErrorReport::from_message(
                "cache::middleware::page_cache_layer",
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to buffer rendered page: {err}"),
            )
            .attach(&mut response);
            return response;
        }
    };

    let html = match String::from_utf8(bytes.to_vec()) {
        Ok(html) => html,
        Err(_) => {
            debug!(outcome = "uncached", reason = "non_utf8", "passing response through");
            return Response::from_parts(parts, Body::from(bytes));
        }
    };

    let delivery = cache.interceptor.after_render(&ctx, html).await;
    parts.headers.remove(header::CONTENT_LENGTH);
    if delivery.outcome == RequestOutcome::ServedFreshAndCached {
        parts
            .headers
            .insert(X_CACHE, HeaderValue::from_static("MISS"));
    }
    Response::from_parts(parts, Body::from(delivery.body))
}

/// Whether a rendered response may be captured into the store.
pub fn should_store_response(response: &Response) -> bool {
    if response.status() != StatusCode::OK {
        return false;
    }

    let headers = response.headers();
    if headers.contains_key(header::SET_COOKIE) || headers.contains_key(header::CONTENT_ENCODING) {
        return false;
    }

    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.trim_start().to_ascii_lowercase().starts_with("text/html"))
}

enum Buffered {
    Complete(Bytes),
    /// The page outgrew the limit; the body replays what was read and streams the rest.
    Overflow(Body),
}

fn declared_length(response: &Response) -> Option<usize> {
    response
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}

async fn buffer_page(mut body: Body, limit: usize) -> Result<Buffered, axum::Error> {
    let mut collected = BytesMut::new();
    while let Some(frame) = body.frame().await {
        let Ok(data) = frame?.into_data() else {
            continue;
        };
        if collected.len() + data.len() > limit {
            let head = [Ok::<Bytes, axum::Error>(collected.freeze()), Ok(data)];
            let replay = stream::iter(head).chain(body.into_data_stream());
            return Ok(Buffered::Overflow(Body::from_stream(replay)));
        }
        collected.extend_from_slice(&data);
    }
    Ok(Buffered::Complete(collected.freeze()))
}

fn html_response(status: StatusCode, delivery: Delivery) -> Response {
    let mut response = (status, delivery.body).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    if delivery.outcome == RequestOutcome::ServedFromCache {
        headers.insert(X_CACHE, HeaderValue::from_static("HIT"));
    }
    response
}
