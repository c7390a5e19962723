//! Decides whether a request may be served from or stored into the page cache.

use axum::http::Method;

use super::context::{RequestContext, RequestOrigin};

/// Why a request bypasses the cache. `None` from [`bypass_reason`] means cacheable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassReason {
    Administrative,
    Authenticated,
    MissingHost,
    Background,
    Scheduled,
    Automation,
    Uploads,
    Method,
}

impl BypassReason {
    pub fn as_str(self) -> &'static str {
        match self {
            BypassReason::Administrative => "administrative",
            BypassReason::Authenticated => "authenticated",
            BypassReason::MissingHost => "missing_host",
            BypassReason::Background => "background",
            BypassReason::Scheduled => "scheduled",
            BypassReason::Automation => "automation",
            BypassReason::Uploads => "uploads",
            BypassReason::Method => "method",
        }
    }
}

/// First rule that excludes the request, if any.
pub fn bypass_reason(ctx: &RequestContext) -> Option<BypassReason> {
    if ctx.administrative {
        return Some(BypassReason::Administrative);
    }
    if ctx.authenticated {
        return Some(BypassReason::Authenticated);
    }
    if ctx.host.as_deref().is_none_or(|host| host.trim().is_empty()) {
        return Some(BypassReason::MissingHost);
    }
    match ctx.origin {
        RequestOrigin::Background => return Some(BypassReason::Background),
        RequestOrigin::Scheduled => return Some(BypassReason::Scheduled),
        RequestOrigin::Automation => return Some(BypassReason::Automation),
        RequestOrigin::Browser => {}
    }
    if ctx.in_uploads {
        return Some(BypassReason::Uploads);
    }
    // HEAD would store an empty body under the GET key.
    if ctx.method != Method::GET {
        return Some(BypassReason::Method);
    }
    None
}

/// Pure predicate evaluated in both the pre-render and post-render hooks.
pub fn is_cacheable(ctx: &RequestContext) -> bool {
    bypass_reason(ctx).is_none()
}
