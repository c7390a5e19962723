use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{Method, Request, StatusCode, header},
    middleware,
    response::{Html, IntoResponse, Response},
    routing::get,
};
use quire::cache::{
    AssetResolver, CacheConfig, ContentEvent, ContextPolicy, InlineSettings,
    InvalidationCoordinator, KeyDeriver, PREFETCH_SCRIPT_ID, PageCacheState, PageStore,
    ResponseInterceptor, Transformer, X_CACHE, page_cache_layer,
};
use quire::infra::{assets::FsAssetResolver, watermarks::ManualWatermarks};
use tempfile::TempDir;
use tower::ServiceExt;

const PAGE: &str = "<!DOCTYPE html>\n<html>\n  <head>\n    <title>Caf\u{e9}</title>\n    \
<link rel=\"stylesheet\" href=\"/wp-content/themes/plain/style.css\">\n  </head>\n  \
<body>\n    <!-- sidebar -->\n    <p>Hello   world</p>\n  </body>\n</html>\n";

struct Harness {
    app: Router,
    renders: Arc<AtomicUsize>,
    watermarks: Arc<ManualWatermarks>,
    store: Arc<PageStore>,
    _dir: TempDir,
}

async fn render_page(State(renders): State<Arc<AtomicUsize>>) -> Html<&'static str> {
    renders.fetch_add(1, Ordering::SeqCst);
    Html(PAGE)
}

async fn render_feed(State(renders): State<Arc<AtomicUsize>>) -> impl IntoResponse {
    renders.fetch_add(1, Ordering::SeqCst);
    Json(serde_json::json!({ "items": [] }))
}

async fn render_with_cookie(State(renders): State<Arc<AtomicUsize>>) -> Response {
    renders.fetch_add(1, Ordering::SeqCst);
    ([(header::SET_COOKIE, "visited=1")], Html(PAGE)).into_response()
}

async fn render_sized(State(renders): State<Arc<AtomicUsize>>) -> Response {
    renders.fetch_add(1, Ordering::SeqCst);
    ([(header::CONTENT_LENGTH, PAGE.len().to_string())], Html(PAGE)).into_response()
}

async fn render_chunked(State(renders): State<Arc<AtomicUsize>>) -> Response {
    renders.fetch_add(1, Ordering::SeqCst);
    let chunks = PAGE
        .as_bytes()
        .chunks(16)
        .map(|chunk| Ok::<_, std::io::Error>(chunk.to_vec()))
        .collect::<Vec<_>>();
    (
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        Body::from_stream(futures::stream::iter(chunks)),
    )
        .into_response()
}

fn harness(inject_prefetch_script: bool) -> Harness {
    harness_with(inject_prefetch_script, CacheConfig::default().max_page_bytes)
}

fn harness_with(inject_prefetch_script: bool, max_page_bytes: usize) -> Harness {
    let dir = TempDir::new().expect("tempdir");
    let document_root = dir.path().join("public");
    let theme = document_root.join("wp-content/themes/plain");
    std::fs::create_dir_all(&theme).expect("theme dir");
    std::fs::write(theme.join("style.css"), "body {\n  color: red;\n}\n").expect("stylesheet");

    let config = CacheConfig {
        directory: dir.path().join("wp-content/quire-cache"),
        inject_prefetch_script,
        max_page_bytes,
        ..CacheConfig::default()
    };
    let store = Arc::new(PageStore::new(
        config.directory.clone(),
        config.key_prefix.clone(),
    ));
    let watermarks = Arc::new(ManualWatermarks::new(1_700_000_000, 1_600_000_000));
    let assets: Arc<dyn AssetResolver> = Arc::new(FsAssetResolver::new(document_root));
    let transformer = Arc::new(Transformer::new(
        InlineSettings {
            site_url: "https://example.com".to_string(),
            theme_uri: "/wp-content/themes/plain".to_string(),
            core_prefixes: vec!["/wp-".to_string()],
        },
        assets,
    ));
    let interceptor = Arc::new(ResponseInterceptor::new(
        KeyDeriver::new(config.key_prefix.clone(), watermarks.clone()),
        store.clone(),
        transformer,
        config.inject_prefetch_script,
    ));

    let renders = Arc::new(AtomicUsize::new(0));
    let cache = PageCacheState {
        config,
        policy: Arc::new(ContextPolicy::default()),
        interceptor,
    };

    let app = Router::new()
        .route("/", get(render_page).post(render_page))
        .route("/about", get(render_page))
        .route("/sized", get(render_sized))
        .route("/chunked", get(render_chunked))
        .route("/feed.json", get(render_feed))
        .route("/welcome", get(render_with_cookie))
        .route("/wp-admin/edit.php", get(render_page))
        .with_state(renders.clone())
        .layer(middleware::from_fn_with_state(cache, page_cache_layer));

    Harness {
        app,
        renders,
        watermarks,
        store,
        _dir: dir,
    }
}

fn request(method: Method, uri: &str) -> axum::http::request::Builder {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::HOST, "example.com")
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Option<String>, String) {
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let x_cache = response
        .headers()
        .get(X_CACHE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    (status, x_cache, String::from_utf8(body.to_vec()).expect("utf-8"))
}

async fn get_page(app: &Router, uri: &str) -> (StatusCode, Option<String>, String) {
    send(app, request(Method::GET, uri).body(Body::empty()).unwrap()).await
}

#[tokio::test]
async fn second_request_is_served_from_store() {
    let h = harness(false);

    let (status, x_cache, body) = get_page(&h.app, "/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(x_cache.as_deref(), Some("MISS"));
    assert!(body.contains("<!-- quire-stored: quire_page_"), "{body}");
    assert!(body.contains("<p>Hello world</p>"), "{body}");
    assert!(!body.contains("sidebar"), "{body}");
    assert!(body.contains("data-quire-inlined"), "{body}");
    assert!(!body.contains("style.css"), "{body}");
    assert_eq!(h.store.entry_count().await.unwrap(), 1);

    let (status, x_cache, cached) = get_page(&h.app, "/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(x_cache.as_deref(), Some("HIT"));
    assert!(cached.contains("<!-- quire-cached: quire_page_"), "{cached}");
    assert!(cached.contains("<p>Hello world</p>"));
    assert_eq!(h.renders.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stored_and_served_bodies_match_apart_from_trailer() {
    let h = harness(false);

    let (_, _, fresh) = get_page(&h.app, "/about").await;
    let (_, _, cached) = get_page(&h.app, "/about").await;

    let fresh_html = fresh.split("<!-- quire-stored:").next().unwrap();
    let cached_html = cached.split("<!-- quire-cached:").next().unwrap();
    assert_eq!(fresh_html, cached_html);
}

#[tokio::test]
async fn distinct_urls_get_distinct_entries() {
    let h = harness(false);

    get_page(&h.app, "/").await;
    get_page(&h.app, "/about").await;
    get_page(&h.app, "/?page=2").await;

    assert_eq!(h.store.entry_count().await.unwrap(), 3);
    assert_eq!(h.renders.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn session_cookie_bypasses_cache() {
    let h = harness(false);
    get_page(&h.app, "/").await;

    let request = request(Method::GET, "/")
        .header(header::COOKIE, "wordpress_logged_in_abc=editor%7C123")
        .body(Body::empty())
        .unwrap();
    let (status, x_cache, body) = send(&h.app, request).await;

    assert_eq!(status, StatusCode::OK);
    assert!(x_cache.is_none());
    assert_eq!(body, PAGE);
    assert_eq!(h.renders.load(Ordering::SeqCst), 2);
    assert_eq!(h.store.entry_count().await.unwrap(), 1);
}

#[tokio::test]
async fn post_and_admin_requests_pass_through() {
    let h = harness(false);

    let (_, x_cache, body) =
        send(&h.app, request(Method::POST, "/").body(Body::empty()).unwrap()).await;
    assert!(x_cache.is_none());
    assert_eq!(body, PAGE);

    let (_, x_cache, body) = get_page(&h.app, "/wp-admin/edit.php").await;
    assert!(x_cache.is_none());
    assert_eq!(body, PAGE);

    assert_eq!(h.store.entry_count().await.unwrap(), 0);
}

#[tokio::test]
async fn request_without_host_is_not_cached() {
    let h = harness(false);

    let request = Request::builder().uri("/").body(Body::empty()).unwrap();
    let (_, x_cache, body) = send(&h.app, request).await;

    assert!(x_cache.is_none());
    assert_eq!(body, PAGE);
    assert_eq!(h.store.entry_count().await.unwrap(), 0);
}

#[tokio::test]
async fn non_html_and_cookie_setting_responses_are_not_stored() {
    let h = harness(false);

    let (_, x_cache, body) = get_page(&h.app, "/feed.json").await;
    assert!(x_cache.is_none());
    assert_eq!(body, r#"{"items":[]}"#);

    let (_, x_cache, body) = get_page(&h.app, "/welcome").await;
    assert!(x_cache.is_none());
    assert_eq!(body, PAGE);

    assert_eq!(h.store.entry_count().await.unwrap(), 0);
}

#[tokio::test]
async fn content_watermark_change_misses_old_entry() {
    let h = harness(false);

    get_page(&h.app, "/").await;
    let (_, x_cache, _) = get_page(&h.app, "/").await;
    assert_eq!(x_cache.as_deref(), Some("HIT"));

    h.watermarks.set_content(1_700_000_100);
    let (_, x_cache, _) = get_page(&h.app, "/").await;
    assert_eq!(x_cache.as_deref(), Some("MISS"));

    // The orphaned entry stays until the next clear.
    assert_eq!(h.store.entry_count().await.unwrap(), 2);
}

#[tokio::test]
async fn content_event_clears_store_and_forces_fresh_render() {
    let h = harness(false);
    let coordinator = InvalidationCoordinator::new(h.store.clone());

    get_page(&h.app, "/").await;
    get_page(&h.app, "/about").await;

    let report = coordinator
        .on_content_changed(ContentEvent::ContentSaved)
        .await
        .expect("clear");
    assert_eq!(report.removed, 2);
    assert_eq!(h.store.entry_count().await.unwrap(), 0);

    let (_, x_cache, _) = get_page(&h.app, "/").await;
    assert_eq!(x_cache.as_deref(), Some("MISS"));
    assert_eq!(h.renders.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn prefetch_script_is_stored_with_the_page() {
    let h = harness(true);

    let (_, _, fresh) = get_page(&h.app, "/").await;
    assert_eq!(fresh.matches(PREFETCH_SCRIPT_ID).count(), 1, "{fresh}");

    let (_, x_cache, cached) = get_page(&h.app, "/").await;
    assert_eq!(x_cache.as_deref(), Some("HIT"));
    assert_eq!(cached.matches(PREFETCH_SCRIPT_ID).count(), 1);
}

#[tokio::test]
async fn disabled_cache_passes_everything_through() {
    let dir = TempDir::new().unwrap();
    let config = CacheConfig {
        enabled: false,
        directory: dir.path().join("cache"),
        ..CacheConfig::default()
    };
    let store = Arc::new(PageStore::new(config.directory.clone(), config.key_prefix.clone()));
    let assets: Arc<dyn AssetResolver> = Arc::new(FsAssetResolver::new(dir.path()));
    let interceptor = Arc::new(ResponseInterceptor::new(
        KeyDeriver::new(config.key_prefix.clone(), Arc::new(ManualWatermarks::new(1, 1))),
        store.clone(),
        Arc::new(Transformer::new(InlineSettings::default(), assets)),
        false,
    ));
    let cache = PageCacheState {
        config,
        policy: Arc::new(ContextPolicy::default()),
        interceptor,
    };
    let renders = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route("/", get(render_page))
        .with_state(renders.clone())
        .layer(middleware::from_fn_with_state(cache, page_cache_layer));

    let (_, x_cache, body) = get_page(&app, "/").await;
    assert!(x_cache.is_none());
    assert_eq!(body, PAGE);
    assert_eq!(store.entry_count().await.unwrap(), 0);
}

#[tokio::test]
async fn oversized_pages_are_delivered_uncached() {
    let h = harness_with(false, 64);
    assert!(PAGE.len() > 64);

    for uri in ["/", "/sized", "/chunked"] {
        let (status, x_cache, body) = get_page(&h.app, uri).await;
        assert_eq!(status, StatusCode::OK, "{uri}");
        assert_eq!(x_cache, None, "{uri}");
        assert_eq!(body, PAGE, "{uri}");
    }

    assert_eq!(h.store.entry_count().await.unwrap(), 0);
    assert_eq!(h.renders.load(Ordering::SeqCst), 3);
}
