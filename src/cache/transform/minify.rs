//! Regex-driven minification stages.
//!
//! Whitespace classes are ASCII-only so non-breaking and other Unicode spaces
//! inside text content are left untouched.

use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

static COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<!--(.*?)-->").expect("comment regex"));
static WHITESPACE_RUN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\t\n\x0B\x0C\r ]+").expect("whitespace regex"));
static SPACE_AFTER_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r">[\t\n\x0B\x0C\r ]+").expect("tag-close regex"));
static SPACE_BEFORE_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\t\n\x0B\x0C\r ]+<").expect("tag-open regex"));
static SPACE_AROUND_EQUALS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\t\n\x0B\x0C\r ]*=[\t\n\x0B\x0C\r ]*").expect("equals regex"));
static SPACE_BEFORE_SELF_CLOSE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\t\n\x0B\x0C\r ]+/>").expect("self-close regex"));
static HTML_OPEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<html[\t\n\x0C\r />]").expect("html open regex"));
static HTML_CLOSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)</html\s*>").expect("html close regex"));

/// Drop comments, keeping conditional (`<!--[`), downlevel-revealed (`<!--<!`)
/// and `<!-->` forms.
pub(super) fn strip_comments(html: &str) -> Cow<'_, str> {
    COMMENT.replace_all(html, |caps: &Captures<'_>| {
        let body = &caps[1];
        if body.starts_with('[') || body.starts_with("<!") || body.starts_with('>') {
            caps[0].to_string()
        } else {
            String::new()
        }
    })
}

pub(super) fn collapse_whitespace(html: &str) -> Cow<'_, str> {
    WHITESPACE_RUN.replace_all(html, " ")
}

pub(super) fn strip_space_around_tags(html: &str) -> String {
    let html = SPACE_AFTER_TAG.replace_all(html, ">");
    SPACE_BEFORE_TAG.replace_all(&html, "<").into_owned()
}

pub(super) fn strip_space_around_equals(html: &str) -> Cow<'_, str> {
    SPACE_AROUND_EQUALS.replace_all(html, "=")
}

pub(super) fn strip_space_before_self_close(html: &str) -> Cow<'_, str> {
    SPACE_BEFORE_SELF_CLOSE.replace_all(html, "/>")
}

/// Append `</html>` when the document opens the root element but never closes it.
pub(super) fn ensure_html_close(mut html: String) -> String {
    if HTML_OPEN.is_match(&html) && !HTML_CLOSE.is_match(&html) {
        html.push_str("</html>");
    }
    html
}
