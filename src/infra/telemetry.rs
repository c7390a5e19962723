use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register metric descriptions with the installed recorder. Safe to call repeatedly.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "quire_cache_hit_total",
            Unit::Count,
            "Total number of requests served from the page store."
        );
        describe_counter!(
            "quire_cache_miss_total",
            Unit::Count,
            "Total number of eligible requests with no stored page."
        );
        describe_counter!(
            "quire_cache_bypass_total",
            Unit::Count,
            "Total number of requests ineligible for caching, labelled by reason."
        );
        describe_counter!(
            "quire_cache_clear_total",
            Unit::Count,
            "Total number of page store clears, labelled by cause."
        );
        describe_histogram!(
            "quire_cache_transform_ms",
            Unit::Milliseconds,
            "Output transform latency in milliseconds."
        );
    });
}
