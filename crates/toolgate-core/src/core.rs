use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tokio_util::sync::CancellationToken;
use toolgate_transform::ReplacementPipeline;
use toolgate_upstream::UpstreamClient;
use tower_http::trace::TraceLayer;

use crate::config::{ConfigStore, GatewayConfig};
use crate::handler::{chat_completions, legacy_completions, list_models};
use crate::management;

pub struct GatewayState {
    pub config: ConfigStore,
    pub replacements: ReplacementPipeline,
    pub upstream: UpstreamClient,
    /// Cancelled on shutdown; every stream runs under a child of it.
    pub shutdown: CancellationToken,
}

pub struct Gateway {
    state: Arc<GatewayState>,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        replacements: ReplacementPipeline,
        upstream: UpstreamClient,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            state: Arc::new(GatewayState {
                config: ConfigStore::new(config),
                replacements,
                upstream,
                shutdown,
            }),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/v1/chat/completions", post(chat_completions))
            .route("/v1/completions", post(legacy_completions))
            .route("/v1/models", get(list_models))
            .route("/api/v0/models", get(list_models))
            .merge(management::router())
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    pub fn state(&self) -> Arc<GatewayState> {
        self.state.clone()
    }
}
