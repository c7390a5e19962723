//! Cache configuration.
//!
//! Controls the page store location, key prefix, cleanup cadence and the
//! fresh-path extras via the `[cache]` section of `quire.toml`.

use std::path::PathBuf;
use std::time::Duration;

use super::context::ContextPolicy;
use super::transform::InlineSettings;

const DEFAULT_CONTENT_ROOT: &str = "wp-content";
const DEFAULT_DIRECTORY: &str = "quire-cache";
const DEFAULT_KEY_PREFIX: &str = "quire_page_";
const DEFAULT_CLEANUP_INTERVAL_DAYS: u32 = 7;
const DEFAULT_MAX_PAGE_BYTES: usize = 8 * 1024 * 1024;
const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Master switch; when off the middleware passes every request through.
    pub enabled: bool,
    /// Flat directory holding stored pages.
    pub directory: PathBuf,
    pub key_prefix: String,
    pub cleanup_interval_days: u32,
    /// Append the link prefetch script to freshly rendered pages.
    pub inject_prefetch_script: bool,
    /// Largest rendered page the middleware will buffer for storage.
    pub max_page_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: PathBuf::from(DEFAULT_CONTENT_ROOT).join(DEFAULT_DIRECTORY),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            cleanup_interval_days: DEFAULT_CLEANUP_INTERVAL_DAYS,
            inject_prefetch_script: true,
            max_page_bytes: DEFAULT_MAX_PAGE_BYTES,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            directory: settings.content_root.join(&settings.directory),
            key_prefix: settings.key_prefix.clone(),
            cleanup_interval_days: settings.cleanup_interval_days.get(),
            inject_prefetch_script: settings.inject_prefetch_script,
            max_page_bytes: settings.max_page_bytes.get(),
        }
    }
}

impl CacheConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.cleanup_interval_days) * SECONDS_PER_DAY)
    }
}

impl From<&crate::config::Settings> for ContextPolicy {
    fn from(settings: &crate::config::Settings) -> Self {
        let policy = &settings.request_policy;
        Self {
            admin_prefixes: policy.admin_prefixes.clone(),
            session_cookie_prefixes: policy.session_cookie_prefixes.clone(),
            background_paths: policy.background_paths.clone(),
            scheduled_paths: policy.scheduled_paths.clone(),
            automation_user_agents: policy.automation_user_agents.clone(),
            uploads_prefix: settings.site.uploads_prefix.clone(),
        }
    }
}

impl From<&crate::config::SiteSettings> for InlineSettings {
    fn from(site: &crate::config::SiteSettings) -> Self {
        Self {
            site_url: site.site_url.clone(),
            theme_uri: site.theme_uri.clone(),
            core_prefixes: site.core_prefixes.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_interval_is_one_week() {
        let config = CacheConfig::default();
        assert_eq!(config.cleanup_interval(), Duration::from_secs(604_800));
        assert_eq!(config.directory, PathBuf::from("wp-content/quire-cache"));
    }
}
