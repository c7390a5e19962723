//! Stylesheet inlining.
//!
//! The first rewriter pass only collects eligible stylesheet links; the
//! stylesheets are then resolved and read outside the rewriter, and a second
//! pass performs every DOM mutation. A link whose stylesheet cannot be read is
//! left in place.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::rc::Rc;

use lol_html::html_content::ContentType;
use lol_html::{RewriteStrSettings, element, rewrite_str};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use thiserror::Error;
use tracing::warn;

const TARGET: &str = "quire::cache::transform";

/// Attribute marking a `<style>` element produced by inlining.
pub const INLINED_MARKER: &str = "data-quire-inlined";

static CSS_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"url\(\s*(?:'([^']*)'|"([^"]*)"|([^)'"]*?))\s*\)"#).expect("css url regex")
});

/// Resolves a site URL path (`/theme/style.css`) to local file bytes.
pub trait AssetResolver: Send + Sync {
    /// `Ok(None)` when no file exists for `url_path`.
    fn open(&self, url_path: &str) -> io::Result<Option<Vec<u8>>>;
}

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("stylesheet `{href}` does not map to a local path")]
    NotLocal { href: String },
    #[error("stylesheet `{href}` not found")]
    MissingAsset { href: String },
    #[error("failed to read stylesheet `{href}`: {source}")]
    AssetRead {
        href: String,
        #[source]
        source: io::Error,
    },
    #[error("stylesheet `{href}` is not valid UTF-8")]
    NotUtf8 { href: String },
    #[error("html rewrite failed: {message}")]
    Rewrite { message: String },
}

/// Which stylesheet hrefs count as local to the site.
#[derive(Debug, Clone, Default)]
pub struct InlineSettings {
    pub site_url: String,
    pub theme_uri: String,
    pub core_prefixes: Vec<String>,
}

impl InlineSettings {
    fn is_eligible(&self, href: &str) -> bool {
        std::iter::once(self.theme_uri.as_str())
            .chain(self.core_prefixes.iter().map(String::as_str))
            .chain(std::iter::once(self.site_url.as_str()))
            .any(|prefix| !prefix.is_empty() && href.starts_with(prefix))
    }

    /// URL path of `href` relative to the site root, without query or fragment.
    fn local_path<'a>(&self, href: &'a str) -> Option<&'a str> {
        let site = self.site_url.trim_end_matches('/');
        let relative = if !site.is_empty() && href.starts_with(site) {
            &href[site.len()..]
        } else {
            href
        };
        let path = relative
            .split(['?', '#'])
            .next()
            .unwrap_or_default();
        path.starts_with('/').then_some(path).filter(|p| !p.starts_with("//"))
    }
}

struct CollectedLink {
    href: String,
    id: Option<String>,
}

struct InlinedStylesheet {
    marker: String,
    css: String,
}

/// Replace eligible stylesheet links with inline `<style>` blocks.
///
/// Returns the input unchanged when the rewriter fails on the document.
pub(super) fn inline_stylesheets(
    html: &str,
    settings: &InlineSettings,
    resolver: &dyn AssetResolver,
) -> String {
    match try_inline(html, settings, resolver) {
        Ok(rewritten) => rewritten,
        Err(err) => {
            warn!(
                target = TARGET,
                op = "inline_stylesheets",
                result = "fallback",
                error = %err,
                "Stylesheet inlining failed; keeping original document"
            );
            html.to_string()
        }
    }
}

fn try_inline(
    html: &str,
    settings: &InlineSettings,
    resolver: &dyn AssetResolver,
) -> Result<String, TransformError> {
    let links = collect_links(html, settings)?;

    let mut inlined: HashMap<String, InlinedStylesheet> = HashMap::new();
    for link in links {
        if inlined.contains_key(&link.href) {
            continue;
        }
        match load_stylesheet(&link.href, settings, resolver) {
            Ok(css) => {
                let marker = link.id.unwrap_or_else(|| "true".to_string());
                inlined.insert(link.href, InlinedStylesheet { marker, css });
            }
            Err(err) => {
                warn!(
                    target = TARGET,
                    op = "inline_stylesheets",
                    href = %link.href,
                    error = %err,
                    "Leaving stylesheet link in place"
                );
            }
        }
    }

    apply_mutations(html, &inlined)
}

fn collect_links(html: &str, settings: &InlineSettings) -> Result<Vec<CollectedLink>, TransformError> {
    let links = Rc::new(RefCell::new(Vec::new()));

    rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: vec![element!("link[href]", {
                let links = Rc::clone(&links);
                move |el| {
                    if !has_rel(el.get_attribute("rel").as_deref(), "stylesheet") {
                        return Ok(());
                    }
                    if let Some(href) = el.get_attribute("href")
                        && settings.is_eligible(&href)
                    {
                        links.borrow_mut().push(CollectedLink {
                            href,
                            id: el.get_attribute("id"),
                        });
                    }
                    Ok(())
                }
            })],
            ..RewriteStrSettings::default()
        },
    )
    .map_err(|err| TransformError::Rewrite {
        message: err.to_string(),
    })?;

    Ok(links.take())
}

fn apply_mutations(
    html: &str,
    inlined: &HashMap<String, InlinedStylesheet>,
) -> Result<String, TransformError> {
    rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: vec![
                element!("link[href]", |el| {
                    let rel = el.get_attribute("rel");
                    let href = el.get_attribute("href").unwrap_or_default();
                    if let Some(sheet) = inlined.get(&href) {
                        if has_rel(rel.as_deref(), "stylesheet") {
                            let style = format!(
                                "<style {INLINED_MARKER}=\"{}\">{}</style>",
                                escape_attribute(&sheet.marker),
                                sheet.css
                            );
                            el.after(&style, ContentType::Html);
                            el.remove();
                            return Ok(());
                        }
                        if has_rel(rel.as_deref(), "preload") {
                            el.remove();
                            return Ok(());
                        }
                    }
                    strip_type(el, "text/css");
                    Ok(())
                }),
                element!("style[type]", |el| {
                    strip_type(el, "text/css");
                    Ok(())
                }),
                element!("script[type]", |el| {
                    strip_type(el, "text/javascript");
                    Ok(())
                }),
            ],
            ..RewriteStrSettings::default()
        },
    )
    .map_err(|err| TransformError::Rewrite {
        message: err.to_string(),
    })
}

fn strip_type(el: &mut lol_html::html_content::Element<'_, '_>, redundant: &str) {
    if el
        .get_attribute("type")
        .is_some_and(|value| value.trim().eq_ignore_ascii_case(redundant))
    {
        el.remove_attribute("type");
    }
}

fn has_rel(rel: Option<&str>, wanted: &str) -> bool {
    rel.is_some_and(|rel| {
        rel.split_ascii_whitespace()
            .any(|token| token.eq_ignore_ascii_case(wanted))
    })
}

fn load_stylesheet(
    href: &str,
    settings: &InlineSettings,
    resolver: &dyn AssetResolver,
) -> Result<String, TransformError> {
    let path = settings
        .local_path(href)
        .ok_or_else(|| TransformError::NotLocal {
            href: href.to_string(),
        })?;

    let bytes = resolver
        .open(path)
        .map_err(|source| TransformError::AssetRead {
            href: href.to_string(),
            source,
        })?
        .ok_or_else(|| TransformError::MissingAsset {
            href: href.to_string(),
        })?;

    let css = String::from_utf8(bytes).map_err(|_| TransformError::NotUtf8 {
        href: href.to_string(),
    })?;

    let base = stylesheet_base(href);
    // `</` would terminate the enclosing <style> element early.
    Ok(rewrite_css_urls(&css, base).replace("</", "<\\/"))
}

/// `href` without its query and final path segment.
fn stylesheet_base(href: &str) -> &str {
    let without_query = href.split(['?', '#']).next().unwrap_or_default();
    match without_query.rfind('/') {
        Some(index) => &without_query[..index],
        None => "",
    }
}

/// Anchor relative `url(...)` references at the stylesheet's directory.
pub(super) fn rewrite_css_urls(css: &str, base: &str) -> String {
    CSS_URL
        .replace_all(css, |caps: &Captures<'_>| {
            let reference = caps
                .get(1)
                .or_else(|| caps.get(2))
                .or_else(|| caps.get(3))
                .map(|m| m.as_str().trim())
                .unwrap_or_default();
            if is_absolute_reference(reference) {
                caps[0].to_string()
            } else {
                // Double-quoted references may carry a bare `'`.
                let target = format!("{base}/{reference}").replace('\'', "\\'");
                format!("url('{target}')")
            }
        })
        .into_owned()
}

fn is_absolute_reference(reference: &str) -> bool {
    let lower = reference.to_ascii_lowercase();
    reference.is_empty()
        || reference.starts_with('/')
        || reference.starts_with('#')
        || lower.starts_with("http:")
        || lower.starts_with("https:")
        || lower.starts_with("data:")
}

fn escape_attribute(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
}
