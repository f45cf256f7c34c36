//! Runtime server: the stream endpoint plus a small HTTP surface, on one port.

use crate::handler::{handle_health, handle_run_app_method};
use crate::methods::{GetAppSettings, ListApps, RestartApp, RunApp, UpdateAppSettings};
use crate::settings::SettingsStore;
use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tether_core::pubsub::{
    CreateTopicMethod, GetTopicsMethod, PublishTopicMethod, SubscribeTopicMethod,
};
use tether_core::{StreamServer, StreamServerHandle, TopicRegistry};
use tether_daemon::DaemonSupervisor;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

/// Concurrent HTTP requests; websocket streams are limited separately.
const MAX_HTTP_CONCURRENCY: usize = 64;

/// Application state shared across handlers and stream methods.
pub struct AppState {
    pub supervisor: Arc<DaemonSupervisor>,
    pub registry: TopicRegistry,
    pub settings: Arc<SettingsStore>,
}

impl AppState {
    pub fn new(supervisor: DaemonSupervisor, registry: TopicRegistry, settings: SettingsStore) -> Self {
        Self {
            supervisor: Arc::new(supervisor),
            registry,
            settings: Arc::new(settings),
        }
    }
}

/// Every stream method the runtime serves.
pub fn stream_server(state: &AppState) -> tether_core::Result<StreamServer> {
    StreamServer::new()
        .with_method(SubscribeTopicMethod::new(state.registry.clone()))?
        .with_method(GetTopicsMethod::new(state.registry.clone()))?
        .with_method(CreateTopicMethod::new(state.registry.clone()))?
        .with_method(PublishTopicMethod::new(state.registry.clone()))?
        .with_method(RunApp::new(state.supervisor.clone()))?
        .with_method(RestartApp::new(state.supervisor.clone()))?
        .with_method(ListApps::new(state.supervisor.clone()))?
        .with_method(GetAppSettings::new(state.settings.clone()))?
        .with_method(UpdateAppSettings::new(state.settings.clone()))
}

/// Start the runtime server.
///
/// Returns the handle of the bound server (useful when port=0).
pub async fn start_server(
    state: Arc<AppState>,
    host: &str,
    port: u16,
) -> anyhow::Result<StreamServerHandle> {
    // Configure CORS for development
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let http = Router::new()
        .route("/health", get(handle_health))
        .route(
            "/api/internal/rpc/RunAppMethod",
            post(handle_run_app_method),
        )
        .layer(ConcurrencyLimitLayer::new(MAX_HTTP_CONCURRENCY))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state.clone());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let server = stream_server(&state)?;
    info!("Serving stream methods: {}", server.method_names().join(", "));

    let handle = server.start_with(addr, http).await?;
    info!("Server listening on {}", handle.addr());
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn state(dir: &TempDir) -> Arc<AppState> {
        let registry = TopicRegistry::new();
        let settings = SettingsStore::new(dir.path(), registry.clone());
        Arc::new(AppState::new(DaemonSupervisor::new(), registry, settings))
    }

    #[tokio::test]
    async fn test_server_starts() {
        let dir = TempDir::new().unwrap();
        let handle = start_server(state(&dir), "127.0.0.1", 0).await.unwrap();
        assert!(handle.port() > 0);
        handle.stop().await;
    }

    #[test]
    fn test_all_methods_registered() {
        let dir = TempDir::new().unwrap();
        let mut names = stream_server(&state(&dir)).unwrap().method_names();
        names.sort();
        assert_eq!(
            names,
            vec![
                "CreateTopic",
                "GetAppSettings",
                "GetApps",
                "GetTopics",
                "PublishTopic",
                "RestartApp",
                "RunAppMethod",
                "SubscribeTopic",
                "UpdateAppSettings",
            ]
        );
    }
}
