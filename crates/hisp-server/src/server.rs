use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use hisp_core::PresenceStore;
use hisp_settings::{HispSettings, PresenceSettings};
use hisp_store::{Database, SqlitePresenceStore};
use hisp_telemetry::SqliteLogSink;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::dispatcher::EventDispatcher;
use crate::handlers;
use crate::registry::{ConnectionRegistry, RegistryConfig};

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub presence: PresenceSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_settings(&HispSettings::default())
    }
}

impl ServerConfig {
    pub fn from_settings(settings: &HispSettings) -> Self {
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            presence: settings.presence.clone(),
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub dispatcher: EventDispatcher,
    pub db: Database,
    pub send_queue: usize,
    pub log_sink: Option<Arc<SqliteLogSink>>,
}

impl AppState {
    pub fn new(db: Database, presence: &PresenceSettings, log_sink: Option<Arc<SqliteLogSink>>) -> Self {
        let store: Arc<dyn PresenceStore> = Arc::new(SqlitePresenceStore::new(db.clone()));
        let registry = Arc::new(ConnectionRegistry::new(store, RegistryConfig::from(presence)));
        Self {
            dispatcher: EventDispatcher::new(Arc::clone(&registry)),
            registry,
            db,
            send_queue: presence.send_queue,
            log_sink,
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/logs", get(handlers::query_logs))
        .route("/devices", post(handlers::register_device))
        .route("/devices/{id}", get(handlers::device_info))
        .route("/devices/{id}/events", get(handlers::device_events))
        .route("/devices/{id}/action", post(handlers::request_action))
        .route("/devices/{id}/sensor", post(handlers::push_sensor))
        .route(
            "/devices/{id}/log",
            get(handlers::device_activity).post(handlers::push_log),
        )
        .route("/owners/{owner_id}/devices", get(handlers::owner_devices))
        .route("/owners/{owner_id}/devices/{id}", get(handlers::owned_device))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and start serving. Returns a handle to shut it down.
pub async fn start(
    config: ServerConfig,
    db: Database,
    log_sink: Option<Arc<SqliteLogSink>>,
) -> Result<ServerHandle, std::io::Error> {
    let state = AppState::new(db, &config.presence, log_sink);
    let registry = Arc::clone(&state.registry);

    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(host = %config.host, port = local_addr.port(), "hisp server started");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "server stopped");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        registry,
        server,
    })
}

/// Handle returned by `start()`.
pub struct ServerHandle {
    pub port: u16,
    registry: Arc<ConnectionRegistry>,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Take every device offline, then stop accepting requests.
    pub async fn shutdown(self) {
        self.registry.shutdown().await;
        self.server.abort();
        tracing::info!("hisp server stopped");
    }
}
