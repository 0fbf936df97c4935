//! Toolcrib server binary.
//!
//! Starts an axum HTTP server with structured logging, database initialization,
//! and graceful shutdown on SIGTERM/SIGINT.

use std::net::SocketAddr;
use tokio::net::TcpListener;
use toolcrib_server::{app, config, initialize_database, AppState};
use tracing_subscriber::EnvFilter;

/// Where the config file path came from, for the startup log.
#[derive(Debug, Clone, Copy)]
enum ConfigSource {
    Argument,
    Environment,
    Default,
}

/// First CLI argument, then `TOOLCRIB_CONFIG_PATH`, then `config.toml`.
fn config_path() -> (String, ConfigSource) {
    let non_blank = |value: &String| !value.trim().is_empty();
    std::env::args()
        .nth(1)
        .filter(non_blank)
        .map(|path| (path, ConfigSource::Argument))
        .or_else(|| {
            std::env::var("TOOLCRIB_CONFIG_PATH")
                .ok()
                .filter(non_blank)
                .map(|path| (path, ConfigSource::Environment))
        })
        .unwrap_or_else(|| ("config.toml".to_string(), ConfigSource::Default))
}

#[tokio::main]
async fn main() {
    let (path, source) = config_path();
    let config = config::load_config(Some(&path))
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

    tracing::info!(path = %path, source = ?source, "loaded configuration");

    // A database that cannot be opened, migrated or self-tested is fatal.
    let db = match tokio::task::spawn_blocking({
        let database = config.database.clone();
        move || initialize_database(&database)
    })
    .await
    .expect("database initialization task panicked")
    {
        Ok(db) => db,
        Err(e) => {
            tracing::error!(error = %e, "aborting startup");
            std::process::exit(1);
        }
    };

    let app = app(AppState { db });
    let addr = SocketAddr::new(config.server.host, config.server.port);

    tracing::info!(%addr, "starting toolcrib server");

    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind to address, is another process using this port?");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let signal = shutdown_requested().await;
            tracing::info!(signal, "initiating graceful shutdown");
        })
        .await
        .expect("server error");

    tracing::info!("toolcrib server shut down");
}

/// Resolves once the process is asked to stop, naming the signal.
async fn shutdown_requested() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => tokio::select! {
                _ = tokio::signal::ctrl_c() => "SIGINT",
                _ = terminate.recv() => "SIGTERM",
            },
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable, stopping on Ctrl+C only");
                let _ = tokio::signal::ctrl_c().await;
                "SIGINT"
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "SIGINT"
    }
}
