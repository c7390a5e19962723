//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    net::SocketAddr,
    num::{NonZeroU32, NonZeroUsize},
    path::{Component, Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "quire";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_ADMIN_HOST: &str = "127.0.0.1";
const DEFAULT_PUBLIC_PORT: u16 = 3000;
const DEFAULT_ADMIN_PORT: u16 = 3001;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_UPSTREAM_URL: &str = "http://127.0.0.1:8080";
const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 30;
const DEFAULT_UPSTREAM_MAX_BODY_BYTES: u64 = 16 * 1024 * 1024;
const DEFAULT_CACHE_CONTENT_ROOT: &str = "wp-content";
const DEFAULT_CACHE_DIRECTORY: &str = "quire-cache";
const DEFAULT_CACHE_KEY_PREFIX: &str = "quire_page_";
const DEFAULT_CACHE_CLEANUP_INTERVAL_DAYS: u64 = 7;
const DEFAULT_CACHE_MAX_PAGE_BYTES: u64 = 8 * 1024 * 1024;
const DEFAULT_CORE_PREFIX: &str = "/wp-";
const DEFAULT_UPLOADS_PREFIX: &str = "/wp-content/uploads";
const DEFAULT_DOCUMENT_ROOT: &str = "public";
const DEFAULT_TEMPLATE_ROOT: &str = "public/wp-content/themes";
const DEFAULT_CONTENT_MARKER: &str = "wp-content/.quire-content-stamp";

/// Command-line arguments for the quire binary.
#[derive(Debug, Parser)]
#[command(name = "quire", version, about = "Full-page caching front proxy")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "QUIRE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the caching proxy and the admin listener.
    Serve(Box<ServeArgs>),
    /// Clear every stored page and exit.
    Purge(PurgeArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct PurgeArgs {
    #[command(flatten)]
    pub cache: CacheLocationOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct CacheLocationOverrides {
    /// Override the directory under which the cache directory lives.
    #[arg(long = "cache-content-root", value_name = "PATH")]
    pub content_root: Option<PathBuf>,

    /// Override the cache directory name.
    #[arg(long = "cache-directory", value_name = "NAME")]
    pub directory: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub cache: CacheLocationOverrides,

    /// Override the public listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the administrative listener host.
    #[arg(long = "server-admin-host", value_name = "HOST")]
    pub server_admin_host: Option<String>,

    /// Override the public listener port.
    #[arg(long = "server-public-port", value_name = "PORT")]
    pub public_port: Option<u16>,

    /// Override the administrative listener port.
    #[arg(long = "server-admin-port", value_name = "PORT")]
    pub admin_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the upstream site URL.
    #[arg(long = "upstream-url", value_name = "URL")]
    pub upstream_url: Option<String>,

    /// Toggle the page cache.
    #[arg(
        long = "cache-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_enabled: Option<bool>,
}

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub upstream: UpstreamSettings,
    pub cache: CacheSettings,
    pub site: SiteSettings,
    pub request_policy: RequestPolicySettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub public_addr: SocketAddr,
    pub admin_addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    pub url: Url,
    pub timeout: Duration,
    pub max_body_bytes: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub content_root: PathBuf,
    pub directory: PathBuf,
    pub key_prefix: String,
    pub cleanup_interval_days: NonZeroU32,
    pub inject_prefetch_script: bool,
    pub max_page_bytes: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct SiteSettings {
    /// Public origin of the site, used to recognise local stylesheet hrefs.
    pub site_url: String,
    pub theme_uri: String,
    pub core_prefixes: Vec<String>,
    pub uploads_prefix: String,
    /// Filesystem directory that URL paths resolve against.
    pub document_root: PathBuf,
    pub template_root: PathBuf,
    /// File whose modification time is the content watermark.
    pub content_marker: PathBuf,
}

#[derive(Debug, Clone)]
pub struct RequestPolicySettings {
    pub admin_prefixes: Vec<String>,
    pub session_cookie_prefixes: Vec<String>,
    pub background_paths: Vec<String>,
    pub scheduled_paths: Vec<String>,
    pub automation_user_agents: Vec<String>,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("QUIRE").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Purge(args)) => raw.apply_cache_location_overrides(&args.cache),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    upstream: RawUpstreamSettings,
    cache: RawCacheSettings,
    site: RawSiteSettings,
    request_policy: RawRequestPolicySettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(host) = overrides.server_admin_host.as_ref() {
            self.server.admin_host = Some(host.clone());
        }
        if let Some(port) = overrides.public_port {
            self.server.public_port = Some(port);
        }
        if let Some(port) = overrides.admin_port {
            self.server.admin_port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = overrides.upstream_url.as_ref() {
            self.upstream.url = Some(url.clone());
        }
        if let Some(enabled) = overrides.cache_enabled {
            self.cache.enabled = Some(enabled);
        }
        self.apply_cache_location_overrides(&overrides.cache);
    }

    fn apply_cache_location_overrides(&mut self, overrides: &CacheLocationOverrides) {
        if let Some(root) = overrides.content_root.as_ref() {
            self.cache.content_root = Some(root.clone());
        }
        if let Some(directory) = overrides.directory.as_ref() {
            self.cache.directory = Some(directory.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            upstream,
            cache,
            site,
            request_policy,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let upstream = build_upstream_settings(upstream)?;
        let cache = build_cache_settings(cache)?;
        let site = build_site_settings(site)?;
        let request_policy = build_request_policy_settings(request_policy);

        Ok(Self {
            server,
            logging,
            upstream,
            cache,
            site,
            request_policy,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let admin_host = server
        .admin_host
        .unwrap_or_else(|| DEFAULT_ADMIN_HOST.to_string());

    let public_port = server.public_port.unwrap_or(DEFAULT_PUBLIC_PORT);
    if public_port == 0 {
        return Err(LoadError::invalid(
            "server.public_port",
            "port must be greater than zero",
        ));
    }

    let admin_port = server.admin_port.unwrap_or(DEFAULT_ADMIN_PORT);
    if admin_port == 0 {
        return Err(LoadError::invalid(
            "server.admin_port",
            "port must be greater than zero",
        ));
    }

    let public_addr = parse_socket_addr(&host, public_port)
        .map_err(|reason| LoadError::invalid("server.public_addr", reason))?;
    let admin_addr = parse_socket_addr(&admin_host, admin_port)
        .map_err(|reason| LoadError::invalid("server.admin_addr", reason))?;
    if public_addr == admin_addr {
        return Err(LoadError::invalid(
            "server.admin_port",
            "admin listener must not share the public address",
        ));
    }

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        public_addr,
        admin_addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_upstream_settings(upstream: RawUpstreamSettings) -> Result<UpstreamSettings, LoadError> {
    let raw_url = upstream
        .url
        .unwrap_or_else(|| DEFAULT_UPSTREAM_URL.to_string());
    let url = Url::parse(raw_url.trim())
        .map_err(|err| LoadError::invalid("upstream.url", format!("failed to parse: {err}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(LoadError::invalid(
            "upstream.url",
            "scheme must be http or https",
        ));
    }

    let timeout_secs = upstream
        .timeout_seconds
        .unwrap_or(DEFAULT_UPSTREAM_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(LoadError::invalid(
            "upstream.timeout_seconds",
            "must be greater than zero",
        ));
    }

    let max_body_bytes = non_zero_usize(
        upstream
            .max_body_bytes
            .unwrap_or(DEFAULT_UPSTREAM_MAX_BODY_BYTES),
        "upstream.max_body_bytes",
    )?;

    Ok(UpstreamSettings {
        url,
        timeout: Duration::from_secs(timeout_secs),
        max_body_bytes,
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let content_root = cache
        .content_root
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_CONTENT_ROOT));
    if content_root.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "cache.content_root",
            "path must not be empty",
        ));
    }

    let directory = cache
        .directory
        .unwrap_or_else(|| DEFAULT_CACHE_DIRECTORY.to_string());
    if !is_single_component(Path::new(&directory)) {
        return Err(LoadError::invalid(
            "cache.directory",
            "must be a single directory name",
        ));
    }

    let key_prefix = cache
        .key_prefix
        .unwrap_or_else(|| DEFAULT_CACHE_KEY_PREFIX.to_string());
    validate_key_prefix(&key_prefix)?;

    let cleanup_interval_days = non_zero_u32(
        cache
            .cleanup_interval_days
            .unwrap_or(DEFAULT_CACHE_CLEANUP_INTERVAL_DAYS),
        "cache.cleanup_interval_days",
    )?;

    let max_page_bytes = non_zero_usize(
        cache.max_page_bytes.unwrap_or(DEFAULT_CACHE_MAX_PAGE_BYTES),
        "cache.max_page_bytes",
    )?;

    Ok(CacheSettings {
        enabled: cache.enabled.unwrap_or(true),
        content_root,
        directory: PathBuf::from(directory),
        key_prefix,
        cleanup_interval_days,
        inject_prefetch_script: cache.inject_prefetch_script.unwrap_or(true),
        max_page_bytes,
    })
}

fn build_site_settings(site: RawSiteSettings) -> Result<SiteSettings, LoadError> {
    let site_url = site
        .site_url
        .map(|value| value.trim().trim_end_matches('/').to_string())
        .unwrap_or_default();
    if !site_url.is_empty() {
        Url::parse(&site_url)
            .map_err(|err| LoadError::invalid("site.site_url", format!("failed to parse: {err}")))?;
    }

    let uploads_prefix = site
        .uploads_prefix
        .unwrap_or_else(|| DEFAULT_UPLOADS_PREFIX.to_string());
    if !uploads_prefix.is_empty() && !uploads_prefix.starts_with('/') {
        return Err(LoadError::invalid(
            "site.uploads_prefix",
            "must be an absolute URL path",
        ));
    }

    let core_prefixes = site
        .core_prefixes
        .unwrap_or_else(|| vec![DEFAULT_CORE_PREFIX.to_string()])
        .into_iter()
        .filter(|prefix| !prefix.trim().is_empty())
        .collect();

    Ok(SiteSettings {
        site_url,
        theme_uri: site.theme_uri.unwrap_or_default(),
        core_prefixes,
        uploads_prefix,
        document_root: site
            .document_root
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DOCUMENT_ROOT)),
        template_root: site
            .template_root
            .unwrap_or_else(|| PathBuf::from(DEFAULT_TEMPLATE_ROOT)),
        content_marker: site
            .content_marker
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONTENT_MARKER)),
    })
}

fn build_request_policy_settings(policy: RawRequestPolicySettings) -> RequestPolicySettings {
    let defaults = crate::cache::ContextPolicy::default();
    RequestPolicySettings {
        admin_prefixes: policy.admin_prefixes.unwrap_or(defaults.admin_prefixes),
        session_cookie_prefixes: policy
            .session_cookie_prefixes
            .unwrap_or(defaults.session_cookie_prefixes),
        background_paths: policy.background_paths.unwrap_or(defaults.background_paths),
        scheduled_paths: policy.scheduled_paths.unwrap_or(defaults.scheduled_paths),
        automation_user_agents: policy
            .automation_user_agents
            .unwrap_or(defaults.automation_user_agents),
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    admin_host: Option<String>,
    public_port: Option<u16>,
    admin_port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawUpstreamSettings {
    url: Option<String>,
    timeout_seconds: Option<u64>,
    max_body_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enabled: Option<bool>,
    content_root: Option<PathBuf>,
    directory: Option<String>,
    key_prefix: Option<String>,
    cleanup_interval_days: Option<u64>,
    inject_prefetch_script: Option<bool>,
    max_page_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSiteSettings {
    site_url: Option<String>,
    theme_uri: Option<String>,
    core_prefixes: Option<Vec<String>>,
    uploads_prefix: Option<String>,
    document_root: Option<PathBuf>,
    template_root: Option<PathBuf>,
    content_marker: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRequestPolicySettings {
    admin_prefixes: Option<Vec<String>>,
    session_cookie_prefixes: Option<Vec<String>>,
    background_paths: Option<Vec<String>>,
    scheduled_paths: Option<Vec<String>>,
    automation_user_agents: Option<Vec<String>>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }

    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;

    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    let value_usize: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))?;

    NonZeroUsize::new(value_usize).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

/// Key prefixes become file-name prefixes and select what `clear` deletes.
fn validate_key_prefix(prefix: &str) -> Result<(), LoadError> {
    if prefix.is_empty() {
        return Err(LoadError::invalid("cache.key_prefix", "must not be empty"));
    }
    if prefix.starts_with('.') {
        return Err(LoadError::invalid(
            "cache.key_prefix",
            "must not start with `.`",
        ));
    }
    if !prefix
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(LoadError::invalid(
            "cache.key_prefix",
            "may only contain ASCII letters, digits, `_` and `-`",
        ));
    }
    if prefix.eq_ignore_ascii_case("index") {
        return Err(LoadError::invalid(
            "cache.key_prefix",
            "must not collide with the placeholder index",
        ));
    }
    Ok(())
}

fn is_single_component(path: &Path) -> bool {
    let mut components = path.components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
