//! Toolcrib server library: database startup and the HTTP health surface.

pub mod config;

use std::path::{Path, PathBuf};

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde_json::{json, Value};
use thiserror::Error;
use toolcrib_db::{Database, DbError};
use tower_http::trace::TraceLayer;

use crate::config::DatabaseConfig;

/// Shared application state.
#[derive(Clone, Debug)]
pub struct AppState {
    pub db: Database,
}

/// Errors that abort server startup.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to create database directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("database initialization failed: {0}")]
    Database(#[from] DbError),
}

/// Opens the configured database and proves it is usable.
///
/// Creates the parent directory, opens the pool, then opens one session,
/// which migrates (or refuses a stale schema when auto-migration is off),
/// and runs a self-test on it.
///
/// # Errors
///
/// Any failure here is fatal for the server; the caller should abort startup.
pub fn initialize_database(config: &DatabaseConfig) -> Result<Database, StartupError> {
    let path = Path::new(&config.path);
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| StartupError::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let db = Database::open(path, config.runtime_settings())?;
    let mut session = db.session()?;
    session.self_test()?;
    let version = session.schema_version()?;
    session.close()?;

    tracing::info!(
        path = %config.path,
        schema_version = version,
        target_version = db.schema().target_version(),
        "database ready"
    );
    Ok(db)
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check handler.
///
/// Opens a fresh session and self-tests it. Returns `503` if the database
/// cannot be reached or its schema is not current.
async fn health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let db = state.db.clone();
    let result = tokio::task::spawn_blocking(move || -> Result<(u32, u32), DbError> {
        let mut session = db.session()?;
        session.self_test()?;
        let version = session.schema_version()?;
        let target = session.target_version();
        session.close()?;
        Ok((version, target))
    })
    .await;

    match result {
        Ok(Ok((schema_version, target_version))) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "schema_version": schema_version,
                "target_version": target_version,
            })),
        ),
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unavailable", "error": e.to_string() })),
            )
        }
        Err(e) => {
            tracing::error!(error = %e, "health check task panicked");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "status": "error", "error": "internal error" })),
            )
        }
    }
}
