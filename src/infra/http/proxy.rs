//! Reverse proxy to the upstream dynamic site.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode, header},
    response::{IntoResponse, Response},
};
use reqwest::{Client, redirect::Policy};
use tracing::debug;
use url::Url;

use crate::application::error::HttpError;
use crate::config::UpstreamSettings;
use crate::infra::error::InfraError;

const SOURCE: &str = "infra::http::proxy::forward";

/// Connection-scoped headers that must not cross the proxy.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

#[derive(Clone)]
pub struct ProxyState {
    client: Client,
    upstream: Arc<Url>,
    max_body_bytes: usize,
}

impl ProxyState {
    pub fn new(settings: &UpstreamSettings) -> Result<Self, InfraError> {
        let client = Client::builder()
            .user_agent(Self::user_agent())
            .redirect(Policy::none())
            .timeout(settings.timeout)
            .build()
            .map_err(|err| InfraError::upstream(err.to_string()))?;

        Ok(Self {
            client,
            upstream: Arc::new(settings.url.clone()),
            max_body_bytes: settings.max_body_bytes.get(),
        })
    }

    pub fn user_agent() -> &'static str {
        concat!("quire/", env!("CARGO_PKG_VERSION"))
    }

    fn target_url(&self, path_and_query: &str) -> Result<Url, url::ParseError> {
        let base = self.upstream.as_str().trim_end_matches('/');
        Url::parse(&format!("{base}{path_and_query}"))
    }
}

/// Forward the request upstream and relay the buffered response.
pub async fn forward(State(proxy): State<ProxyState>, request: Request<Body>) -> Response {
    match forward_inner(&proxy, request).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn forward_inner(proxy: &ProxyState, request: Request<Body>) -> Result<Response, HttpError> {
    let (parts, body) = request.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let url = proxy.target_url(path_and_query).map_err(|err| {
        HttpError::from_error(SOURCE, StatusCode::BAD_REQUEST, "Invalid request target", &err)
    })?;

    let body = axum::body::to_bytes(body, proxy.max_body_bytes)
        .await
        .map_err(|err| {
            HttpError::new(
                SOURCE,
                StatusCode::PAYLOAD_TOO_LARGE,
                "Request body too large",
                err.to_string(),
            )
        })?;

    let headers = upstream_request_headers(&parts.headers);
    debug!(target = "quire::http::proxy", method = %parts.method, url = %url, "forwarding request");

    let mut upstream = proxy
        .client
        .request(parts.method, url)
        .headers(headers)
        .body(body)
        .send()
        .await
        .map_err(|err| {
            HttpError::from_error(SOURCE, StatusCode::BAD_GATEWAY, "Upstream unavailable", &err)
        })?;

    let status = upstream.status();
    let mut response_headers = upstream.headers().clone();
    strip_hop_by_hop(&mut response_headers);

    let mut buffered = Vec::new();
    while let Some(chunk) = upstream.chunk().await.map_err(|err| {
        HttpError::from_error(SOURCE, StatusCode::BAD_GATEWAY, "Upstream unavailable", &err)
    })? {
        if buffered.len() + chunk.len() > proxy.max_body_bytes {
            return Err(HttpError::new(
                SOURCE,
                StatusCode::BAD_GATEWAY,
                "Upstream response too large",
                format!("response exceeded {} bytes", proxy.max_body_bytes),
            ));
        }
        buffered.extend_from_slice(&chunk);
    }

    let mut response = Response::new(Body::from(buffered));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    Ok(response)
}

fn upstream_request_headers(incoming: &HeaderMap) -> HeaderMap {
    let mut headers = incoming.clone();
    strip_hop_by_hop(&mut headers);
    // Responses must arrive uncompressed so they can be transformed.
    headers.remove(header::ACCEPT_ENCODING);
    headers.remove(header::CONTENT_LENGTH);

    if let Some(host) = headers.remove(header::HOST) {
        headers.insert(HeaderName::from_static("x-forwarded-host"), host);
    }
    headers.insert(
        HeaderName::from_static("x-forwarded-proto"),
        HeaderValue::from_static("http"),
    );
    headers
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in HOP_BY_HOP.iter().chain(listed.iter()) {
        headers.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_headers_are_sanitised_for_upstream() {
        let mut incoming = HeaderMap::new();
        incoming.insert(header::HOST, HeaderValue::from_static("example.com"));
        incoming.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip, br"));
        incoming.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-private"));
        incoming.insert("x-private", HeaderValue::from_static("1"));
        incoming.insert(header::COOKIE, HeaderValue::from_static("a=b"));

        let headers = upstream_request_headers(&incoming);

        assert!(headers.get(header::HOST).is_none());
        assert!(headers.get(header::ACCEPT_ENCODING).is_none());
        assert!(headers.get(header::CONNECTION).is_none());
        assert!(headers.get("x-private").is_none());
        assert_eq!(headers.get("x-forwarded-host").unwrap(), "example.com");
        assert_eq!(headers.get(header::COOKIE).unwrap(), "a=b");
    }

    #[test]
    fn target_url_keeps_path_and_query() {
        let settings = UpstreamSettings {
            url: Url::parse("http://127.0.0.1:8080/").unwrap(),
            timeout: std::time::Duration::from_secs(5),
            max_body_bytes: std::num::NonZeroUsize::new(1024).unwrap(),
        };
        let proxy = ProxyState::new(&settings).expect("client");
        assert_eq!(
            proxy.target_url("/about?x=1").unwrap().as_str(),
            "http://127.0.0.1:8080/about?x=1"
        );
    }
}
