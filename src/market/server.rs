use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::accounts::AccountPolicy;
use super::api::{self, AppState, SharedState};
use super::db::{DbHandle, MarketDb};
use super::ws;

/// Bootstrap administrator created on start-up when missing.
#[derive(Debug, Clone)]
pub struct SuperuserSeed {
    pub email: String,
    pub password: String,
}

/// Configuration for the marketplace server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: std::path::PathBuf,
    pub dev_mode: bool,
    pub policy: AccountPolicy,
    pub superuser: Option<SuperuserSeed>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            db_path: std::path::PathBuf::from(".recyconnect/recyconnect.db"),
            dev_mode: false,
            policy: AccountPolicy::default(),
            superuser: None,
        }
    }
}

/// Build the full application router: REST API plus the notification socket.
pub fn build_router(state: SharedState, dev_mode: bool) -> Router {
    let mut app = api::api_router()
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http());
    if dev_mode {
        app = app.layer(CorsLayer::permissive());
    }
    app
}

/// Open the database, creating its directory and seeding the superuser.
pub fn open_database(config: &ServerConfig) -> Result<MarketDb> {
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let db = MarketDb::new(&config.db_path).context("Failed to initialize marketplace database")?;

    match &config.superuser {
        Some(seed) => {
            if let Some(user) = db
                .ensure_superuser(&seed.email, &seed.password)
                .context("Failed to create superuser")?
            {
                tracing::info!(user_id = user.id, email = %user.email, "superuser created");
            }
        }
        None => tracing::warn!("no superuser configured; admin endpoints need an existing admin"),
    }

    let purged = db
        .purge_expired_sessions()
        .context("Failed to purge expired sessions")?;
    if purged > 0 {
        tracing::debug!(purged, "expired sessions removed");
    }
    Ok(db)
}

/// Start the marketplace server.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    let db = open_database(&config)?;
    let state = Arc::new(AppState::new(DbHandle::new(db), config.policy.clone()));
    let app = build_router(state, config.dev_mode);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, db = %config.db_path.display(), "RecyConnect listening");
    println!("RecyConnect running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    println!("\nShutting down...");
}
