//! Factlog server binary.
//!
//! Opens the fact log, starts the subscription engine and its maintenance
//! tasks, and serves the health endpoints with graceful shutdown on
//! SIGTERM/SIGINT.

use std::net::SocketAddr;
use std::sync::Arc;

use factlog_server::{app, background, config, AppState};
use factlog_store::FactStore;
use factlog_subscribe::SubscriptionCoordinator;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("FACTLOG_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

#[tokio::main]
async fn main() {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("config.toml"));

    let config = config::load_config(selected_config_path)
        .expect("failed to load configuration, the server cannot start without valid config");

    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );

    let store = Arc::new(
        FactStore::open(&config.database.path, config.database.runtime_settings())
            .expect("failed to open fact log, check database.path in config"),
    );

    let coordinator = Arc::new(SubscriptionCoordinator::for_store(
        Arc::clone(&store),
        config.subscription.coordinator_settings(),
        tokio::runtime::Handle::current(),
    ));

    tokio::spawn(background::start_token_compaction_task(
        Arc::clone(&store),
        config.state_tokens.retention(),
        config.state_tokens.compaction_interval_secs,
    ));
    tokio::spawn(background::start_fast_forward_refresh_task(
        coordinator.log(),
        coordinator.fast_forward_target(),
        config.subscription.fast_forward_refresh_secs,
    ));

    let state = Arc::new(AppState { store, coordinator });
    let addr = SocketAddr::new(config.server.host, config.server.port);

    tracing::info!(%addr, "starting factlog server");

    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind to address, is another process using this port?");

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    tracing::info!("factlog server shut down");
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}
