//! Output transformer applied to freshly rendered pages before storage.
//!
//! Stages run in a fixed order: Unicode NFC normalisation, stylesheet
//! inlining, comment removal, whitespace collapsing, whitespace trimming
//! around tags, around `=` and before `/>`, and finally a missing `</html>`
//! is restored. The pipeline is idempotent on its own output.

mod inline;
mod minify;

use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use super::keys::CacheKey;

pub use inline::{AssetResolver, INLINED_MARKER, InlineSettings, TransformError};

const TARGET: &str = "quire::cache::transform";

/// Diagnostic comment appended to every cacheable delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trailer {
    /// Page was served from the store.
    Hit(CacheKey),
    /// Page was rendered and stored on this request.
    Stored(CacheKey),
}

impl Trailer {
    pub fn render(&self) -> String {
        match self {
            Trailer::Hit(key) => format!("<!-- quire-cached: {key} -->"),
            Trailer::Stored(key) => format!("<!-- quire-stored: {key} -->"),
        }
    }
}

/// Delivered page: transformed or stored HTML plus its trailer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformResult {
    pub html: String,
    pub trailer: Trailer,
}

impl TransformResult {
    pub fn into_body(self) -> String {
        let mut body = self.html;
        body.push_str(&self.trailer.render());
        body
    }
}

pub struct Transformer {
    settings: InlineSettings,
    assets: Arc<dyn AssetResolver>,
}

impl Transformer {
    pub fn new(settings: InlineSettings, assets: Arc<dyn AssetResolver>) -> Self {
        Self { settings, assets }
    }

    /// Run the full pipeline. Never fails; broken stages degrade to their input.
    pub fn transform(&self, html: &str) -> String {
        let started_at = Instant::now();
        let input_len = html.len();

        let html = normalize(html);
        let html = inline::inline_stylesheets(&html, &self.settings, self.assets.as_ref());
        let html = minify::strip_comments(&html).into_owned();
        let html = minify::collapse_whitespace(&html).into_owned();
        let html = minify::strip_space_around_tags(&html);
        let html = minify::strip_space_around_equals(&html).into_owned();
        let html = minify::strip_space_before_self_close(&html).into_owned();
        let html = minify::ensure_html_close(html);

        let elapsed_ms = started_at.elapsed().as_secs_f64() * 1000.0;
        metrics::histogram!("quire_cache_transform_ms").record(elapsed_ms);
        debug!(
            target = TARGET,
            op = "transform",
            input_bytes = input_len,
            output_bytes = html.len(),
            elapsed_ms,
            "Transformed page"
        );
        html
    }
}

#[cfg(feature = "nfc")]
fn normalize(html: &str) -> String {
    use unicode_normalization::UnicodeNormalization;

    html.nfc().collect()
}

#[cfg(not(feature = "nfc"))]
fn normalize(html: &str) -> String {
    static WARNED: std::sync::Once = std::sync::Once::new();
    WARNED.call_once(|| {
        tracing::warn!(
            target = TARGET,
            op = "normalize",
            "Built without the `nfc` feature; skipping Unicode normalisation"
        );
    });
    html.to_string()
}
