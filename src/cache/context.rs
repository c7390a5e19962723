//! Request snapshot consumed by the classifier and key deriver.

use axum::http::{HeaderMap, Method, Uri, header};

/// Where a request originated, as far as caching is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestOrigin {
    /// Ordinary navigation from a browser.
    #[default]
    Browser,
    /// Asynchronous in-page request (XHR, fetch to an ajax endpoint).
    Background,
    /// Host scheduler hitting its cron endpoint.
    Scheduled,
    /// Command-line or automation tooling.
    Automation,
}

/// Read-only view of the inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub host: Option<String>,
    pub authenticated: bool,
    pub administrative: bool,
    pub in_uploads: bool,
    pub origin: RequestOrigin,
}

impl RequestContext {
    /// Anonymous browser GET with a host, eligible unless the caller changes it.
    pub fn get(path: &str, query: Option<&str>) -> Self {
        Self {
            method: Method::GET,
            path: path.to_string(),
            query: query.map(str::to_string),
            host: Some("localhost".to_string()),
            authenticated: false,
            administrative: false,
            in_uploads: false,
            origin: RequestOrigin::Browser,
        }
    }

    /// Path plus `?query` when a query string is present.
    pub fn url(&self) -> String {
        match self.query.as_deref() {
            Some(query) => format!("{}?{query}", self.path),
            None => self.path.clone(),
        }
    }
}

/// Rules used to classify an inbound HTTP request into a [`RequestContext`].
#[derive(Debug, Clone)]
pub struct ContextPolicy {
    pub admin_prefixes: Vec<String>,
    pub session_cookie_prefixes: Vec<String>,
    pub background_paths: Vec<String>,
    pub scheduled_paths: Vec<String>,
    pub automation_user_agents: Vec<String>,
    pub uploads_prefix: String,
}

impl Default for ContextPolicy {
    fn default() -> Self {
        Self {
            admin_prefixes: vec!["/wp-admin".to_string(), "/wp-login.php".to_string()],
            session_cookie_prefixes: vec![
                "wordpress_logged_in_".to_string(),
                "wp-postpass_".to_string(),
            ],
            background_paths: vec!["/wp-admin/admin-ajax.php".to_string()],
            scheduled_paths: vec!["/wp-cron.php".to_string()],
            automation_user_agents: vec!["WP-CLI".to_string()],
            uploads_prefix: "/wp-content/uploads".to_string(),
        }
    }
}

impl ContextPolicy {
    pub fn capture(&self, method: &Method, uri: &Uri, headers: &HeaderMap) -> RequestContext {
        let path = uri.path().to_string();

        let host = headers
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .or_else(|| uri.host().map(str::to_string))
            .filter(|host| !host.trim().is_empty());

        RequestContext {
            method: method.clone(),
            query: uri.query().map(str::to_string),
            host,
            authenticated: self.has_session(headers),
            administrative: starts_with_any(&path, &self.admin_prefixes),
            in_uploads: !self.uploads_prefix.is_empty() && path.starts_with(&self.uploads_prefix),
            origin: self.origin(&path, headers),
            path,
        }
    }

    fn has_session(&self, headers: &HeaderMap) -> bool {
        if headers.contains_key(header::AUTHORIZATION) {
            return true;
        }

        headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .any(|(name, _)| {
                self.session_cookie_prefixes
                    .iter()
                    .any(|prefix| name.starts_with(prefix.as_str()))
            })
    }

    fn origin(&self, path: &str, headers: &HeaderMap) -> RequestOrigin {
        if self.scheduled_paths.iter().any(|p| p == path) {
            return RequestOrigin::Scheduled;
        }

        let xhr = headers
            .get("x-requested-with")
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.eq_ignore_ascii_case("XMLHttpRequest"));
        if xhr || self.background_paths.iter().any(|p| p == path) {
            return RequestOrigin::Background;
        }

        let automation = headers
            .get(header::USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|agent| {
                self.automation_user_agents
                    .iter()
                    .any(|needle| agent.contains(needle.as_str()))
            });
        if automation {
            return RequestOrigin::Automation;
        }

        RequestOrigin::Browser
    }
}

fn starts_with_any(path: &str, prefixes: &[String]) -> bool {
    prefixes.iter().any(|prefix| path.starts_with(prefix.as_str()))
}
