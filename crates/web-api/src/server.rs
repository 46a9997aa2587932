use crate::{handlers, websocket};
use axum::http::HeaderValue;
use axum::{
    routing::{delete, get, post, put},
    Router,
};
use perpbot_core::EventBus;
use perpbot_exchange::ExchangeClient;
use perpbot_orchestrator::BotSupervisor;
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<BotSupervisor>,
    pub client: Arc<ExchangeClient>,
    pub bus: EventBus,
}

/// Dashboard API server.
pub struct ApiServer {
    state: AppState,
    allowed_origin: Option<String>,
}

impl ApiServer {
    #[must_use]
    pub const fn new(state: AppState, allowed_origin: Option<String>) -> Self {
        Self {
            state,
            allowed_origin,
        }
    }

    /// Builds the router with all API routes.
    #[must_use]
    pub fn router(&self) -> Router {
        let cors = match self
            .allowed_origin
            .as_deref()
            .and_then(|origin| origin.parse::<HeaderValue>().ok())
        {
            Some(origin) => CorsLayer::new()
                .allow_origin(origin)
                .allow_methods(Any)
                .allow_headers(Any),
            None => CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        };

        Router::new()
            .route("/api/health", get(handlers::health))
            .route("/api/bots", get(handlers::list_bots))
            .route("/api/bots", post(handlers::create_bot))
            .route("/api/bots/:bot_id", get(handlers::get_bot))
            .route("/api/bots/:bot_id", put(handlers::update_bot))
            .route("/api/bots/:bot_id", delete(handlers::delete_bot))
            .route("/api/bots/:bot_id/start", put(handlers::start_bot))
            .route("/api/bots/:bot_id/stop", put(handlers::stop_bot))
            .route("/api/bots/:bot_id/restart", put(handlers::restart_bot))
            .route("/api/bots/:bot_id/sync", post(handlers::force_sync))
            .route("/api/strategies", get(handlers::list_strategies))
            .route("/api/tokens", get(handlers::available_tokens))
            .route(
                "/api/credentials/validate",
                post(handlers::validate_credentials),
            )
            .route(
                "/api/credentials/duplicates",
                post(handlers::check_duplicate_credentials),
            )
            .route("/ws", get(websocket::websocket_handler))
            .with_state(self.state.clone())
            .layer(cors)
            .layer(TraceLayer::new_for_http())
    }

    /// Serves until `shutdown` resolves, then drains in-flight requests.
    ///
    /// # Errors
    /// Returns an error if binding or serving fails.
    pub async fn serve(
        self,
        addr: &str,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("Dashboard API listening on {}", addr);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}
