use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use spindle_core::{
    ConfigSnapshot, ConfigStore, Dispatcher, EgressPool, HealthProber, ObservabilitySink,
    ProviderRegistry, UpstreamClient,
};
use tokio::{signal, sync::broadcast};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod router;
mod watcher;

/// Buffered records kept for the admin UI before the external store drains
/// them.
const SINK_CAPACITY: usize = 4096;

fn init_logging(format: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,spindle_core=info,server=info"));

    let registry = tracing_subscriber::registry().with(filter);
    if format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().with_target(false)).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_path = PathBuf::from(
        std::env::var("SPINDLE_ENV_FILE").unwrap_or_else(|_| ".env".to_string()),
    );
    let map = watcher::load_config_map(&env_path);

    init_logging(map.get("LOG_FORMAT").map_or("pretty", String::as_str));

    let snapshot = ConfigSnapshot::from_map(&map)
        .with_context(|| format!("invalid configuration (env file: {})", env_path.display()))?;
    info!(
        providers = snapshot.providers.len(),
        proxies = snapshot.proxies.len(),
        default_provider = %snapshot.default_provider,
        "configuration loaded"
    );

    let config = Arc::new(ConfigStore::new(snapshot.clone()));
    let registry = Arc::new(ProviderRegistry::new(&snapshot));
    let egresses = EgressPool::new(&snapshot.proxies, snapshot.proxy_max_failures);
    let client = Arc::new(UpstreamClient::new().context("HTTP client initialization failed")?);
    let sink = Arc::new(ObservabilitySink::new(SINK_CAPACITY));
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&config),
        Arc::clone(&registry),
        egresses.clone(),
        Arc::clone(&client),
        Arc::clone(&sink),
    ));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let prober = HealthProber::new(
        Arc::clone(&config),
        Arc::clone(&registry),
        egresses.clone(),
        Arc::clone(&client),
        Arc::clone(&sink),
    );
    let prober_handle = prober.start_with_shutdown(shutdown_tx.subscribe());
    info!("health prober started");

    let watcher_handle = watcher::start_env_watcher(
        env_path,
        Arc::clone(&config),
        Arc::clone(&registry),
        egresses.clone(),
        shutdown_tx.subscribe(),
    );

    let app = router::create_app(router::AppState {
        config,
        registry,
        egresses,
        dispatcher,
        sink,
    });

    let host = map.get("HOST").map_or("0.0.0.0", String::as_str);
    let port: u16 = map
        .get("PORT")
        .map_or(Ok(8100), |p| p.parse())
        .context("PORT must be a number")?;
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid bind address {host}:{port}"))?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(address = %addr, "proxy listening");

    if let Err(err) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    {
        error!(error = %err, "server error");
    }

    let _ = shutdown_tx.send(());
    prober_handle.abort();
    watcher_handle.abort();
    info!("shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "failed to install ctrl-c handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                () = std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received, draining connections");
}
