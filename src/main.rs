use std::{future::Future, process, sync::Arc, time::Duration};

use quire::{
    application::error::AppError,
    cache::{
        AssetResolver, CacheConfig, ContextPolicy, InlineSettings, InvalidationCoordinator,
        KeyDeriver, PageCacheState, PageStore, ResponseInterceptor, Transformer,
    },
    config,
    infra::{
        assets::FsAssetResolver,
        error::InfraError,
        http::{self, AdminState, ProxyState},
        telemetry,
        watermarks::FsWatermarks,
    },
};
use tokio::{sync::watch, try_join};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Purge(_) => run_purge(settings).await,
    }
}

async fn run_purge(settings: config::Settings) -> Result<(), AppError> {
    let cache_config = CacheConfig::from(&settings.cache);
    let store = Arc::new(PageStore::new(
        cache_config.directory.clone(),
        cache_config.key_prefix.clone(),
    ));
    let coordinator = InvalidationCoordinator::new(store);

    let report = coordinator.purge().await?;
    info!(
        target = "quire::purge",
        directory = %cache_config.directory.display(),
        removed = report.removed,
        failed = report.failed,
        "Purge completed"
    );
    Ok(())
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let cache_config = CacheConfig::from(&settings.cache);
    let store = Arc::new(PageStore::new(
        cache_config.directory.clone(),
        cache_config.key_prefix.clone(),
    ));

    let watermarks = Arc::new(FsWatermarks::new(
        settings.site.content_marker.clone(),
        settings.site.template_root.clone(),
    ));
    if let Err(err) = watermarks.ensure_content_marker().await {
        warn!(
            target = "quire::startup",
            marker = %settings.site.content_marker.display(),
            error = %err,
            "Failed to create content marker"
        );
    }

    let assets: Arc<dyn AssetResolver> =
        Arc::new(FsAssetResolver::new(settings.site.document_root.clone()));
    let transformer = Arc::new(Transformer::new(InlineSettings::from(&settings.site), assets));
    let keys = KeyDeriver::new(cache_config.key_prefix.clone(), watermarks.clone());
    let interceptor = Arc::new(ResponseInterceptor::new(
        keys,
        store.clone(),
        transformer,
        cache_config.inject_prefetch_script,
    ));

    let coordinator = Arc::new(InvalidationCoordinator::new(store.clone()));
    if cache_config.enabled {
        coordinator.schedule_cleanup(cache_config.cleanup_interval());
    }

    info!(
        target = "quire::startup",
        enabled = cache_config.enabled,
        directory = %cache_config.directory.display(),
        key_prefix = %cache_config.key_prefix,
        cleanup_interval_days = cache_config.cleanup_interval_days,
        upstream = %settings.upstream.url,
        "Page cache configured"
    );

    let proxy = ProxyState::new(&settings.upstream)?;
    let cache_state = PageCacheState {
        config: cache_config,
        policy: Arc::new(ContextPolicy::from(&settings)),
        interceptor,
    };
    let admin_state = AdminState {
        coordinator: coordinator.clone(),
        store,
        watermarks: Some(watermarks),
    };

    let result = serve_http(&settings, proxy, cache_state, admin_state).await;
    coordinator.cancel_cleanup();
    result
}

async fn serve_http(
    settings: &config::Settings,
    proxy: ProxyState,
    cache_state: PageCacheState,
    admin_state: AdminState,
) -> Result<(), AppError> {
    let public_router = http::build_public_router(proxy, cache_state);
    let admin_router = http::build_admin_router(admin_state);

    let public_listener = tokio::net::TcpListener::bind(settings.server.public_addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    let admin_listener = tokio::net::TcpListener::bind(settings.server.admin_addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    info!(
        target = "quire::startup",
        public = %settings.server.public_addr,
        admin = %settings.server.admin_addr,
        "Listening"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!(target = "quire::shutdown", "Shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    let public_server = axum::serve(public_listener, public_router.into_make_service())
        .with_graceful_shutdown(shutdown_requested(shutdown_rx.clone()));
    let admin_server = axum::serve(admin_listener, admin_router.into_make_service())
        .with_graceful_shutdown(shutdown_requested(shutdown_rx.clone()));

    let servers = async { try_join!(public_server, admin_server) };
    let deadline = drain_deadline(shutdown_rx, settings.server.graceful_shutdown);

    tokio::select! {
        result = servers => {
            result.map_err(|err| AppError::unexpected(format!("server error: {err}")))?;
        }
        () = deadline => {
            warn!(
                target = "quire::shutdown",
                timeout_secs = settings.server.graceful_shutdown.as_secs(),
                "Graceful shutdown timed out; dropping open connections"
            );
        }
    }

    Ok(())
}

fn shutdown_requested(mut rx: watch::Receiver<bool>) -> impl Future<Output = ()> + Send + 'static {
    async move {
        // A closed channel means the signal task is gone; keep serving.
        if rx.wait_for(|requested| *requested).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn drain_deadline(rx: watch::Receiver<bool>, timeout: Duration) {
    shutdown_requested(rx).await;
    tokio::time::sleep(timeout).await;
}
