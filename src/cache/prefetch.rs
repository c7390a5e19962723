//! Link prefetch script injected into freshly rendered pages.

use std::cell::Cell;
use std::rc::Rc;

use lol_html::html_content::ContentType;
use lol_html::{RewriteStrSettings, element, rewrite_str};
use tracing::warn;

pub const PREFETCH_SCRIPT_ID: &str = "quire-prefetch";

const PREFETCH_JS: &str = include_str!("../../static/prefetch.js");

/// Append the prefetch script to the end of `<body>`.
///
/// Documents that already carry the script, or have no `<body>`, are
/// returned unchanged.
pub fn inject_prefetch_script(html: &str) -> String {
    if html.contains(&format!("id=\"{PREFETCH_SCRIPT_ID}\"")) {
        return html.to_string();
    }

    let script = format!("<script id=\"{PREFETCH_SCRIPT_ID}\">{}</script>", PREFETCH_JS.trim());
    let injected = Rc::new(Cell::new(false));

    let result = rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: vec![element!("body", {
                let injected = Rc::clone(&injected);
                let script = script.as_str();
                move |el| {
                    if !injected.get() && !el.is_self_closing() {
                        el.append(script, ContentType::Html);
                        injected.set(true);
                    }
                    Ok(())
                }
            })],
            ..RewriteStrSettings::default()
        },
    );

    match result {
        Ok(rewritten) => rewritten,
        Err(err) => {
            warn!(
                target = "quire::cache::prefetch",
                error = %err,
                "Failed to inject prefetch script"
            );
            html.to_string()
        }
    }
}
