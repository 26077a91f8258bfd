//! Runtime management API: inspect and update configuration, preview tool
//! synthesis, probe the backend.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue, json};
use toolgate_transform::synthesize;

use crate::core::GatewayState;
use crate::error::ProxyError;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

pub fn router() -> Router<Arc<GatewayState>> {
    Router::new()
        .route("/api/config", get(get_config).post(update_config))
        .route("/api/parse-tools", post(parse_tools))
        .route("/api/test-upstream", get(test_upstream))
}

async fn get_config(State(state): State<Arc<GatewayState>>) -> Response {
    Json(state.config.snapshot().as_ref().clone()).into_response()
}

async fn update_config(
    State(state): State<Arc<GatewayState>>,
    Json(patch): Json<Map<String, JsonValue>>,
) -> Response {
    match state.config.update(patch) {
        Ok(config) => Json(config.as_ref().clone()).into_response(),
        Err(err) => ProxyError::unprocessable(err.to_string()).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct ParseToolsRequest {
    #[serde(default)]
    system_prompt: Option<String>,
    #[serde(default)]
    strict: Option<bool>,
}

async fn parse_tools(
    State(state): State<Arc<GatewayState>>,
    Json(payload): Json<ParseToolsRequest>,
) -> Response {
    let strict = payload
        .strict
        .unwrap_or_else(|| state.config.snapshot().prepare_options().strict);
    let prompt = payload.system_prompt.unwrap_or_default();
    let (context, processed) = synthesize(&prompt, strict);
    Json(json!({
        "processed_system_prompt": processed,
        "schemas": context.declarations(),
    }))
    .into_response()
}

async fn test_upstream(State(state): State<Arc<GatewayState>>) -> Response {
    let url = state.config.snapshot().endpoint("models");
    let outcome = state.upstream.probe(&url, PROBE_TIMEOUT).await;
    tracing::info!(
        event = "upstream_probe",
        url = %url,
        ok = outcome.ok,
        latency_ms = outcome.latency_ms
    );
    Json(outcome).into_response()
}
