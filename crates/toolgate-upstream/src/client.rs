use std::time::{Duration, Instant};

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue, Method};
use serde::Serialize;
use tracing::{info, warn};

use crate::response::{ProxyResponse, UpstreamPassthroughError};
use crate::upstream::{handle_response, network_failure};

/// One outbound call. `url` is the full endpoint; `query` is the client's raw query
/// string, appended unchanged.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub trace_id: String,
    pub op: &'static str,
    pub method: Method,
    pub url: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub is_stream: bool,
}

impl UpstreamRequest {
    fn target(&self) -> String {
        match self.query.as_deref() {
            Some(query) if !query.is_empty() => format!("{}?{query}", self.url),
            _ => self.url.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeOutcome {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub latency_ms: f64,
}

/// Process-wide connection pool. Cloning shares the pool.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    client: wreq::Client,
}

impl UpstreamClient {
    pub fn new() -> Result<Self, wreq::Error> {
        let client = wreq::Client::builder().build()?;
        Ok(Self { client })
    }

    pub fn from_client(client: wreq::Client) -> Self {
        Self { client }
    }

    pub async fn send(&self, request: UpstreamRequest) -> Result<ProxyResponse, UpstreamPassthroughError> {
        let started_at = Instant::now();
        info!(
            event = "upstream_request",
            trace_id = %request.trace_id,
            op = request.op,
            method = %request.method,
            url = %request.url,
            is_stream = request.is_stream
        );

        let mut builder = self
            .client
            .request(request.method.clone(), request.target())
            .headers(request.headers.clone());
        if let Some(body) = request.body.clone() {
            if !request.headers.contains_key(CONTENT_TYPE) {
                builder = builder.header(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            }
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|err| {
            warn!(
                event = "upstream_response",
                trace_id = %request.trace_id,
                op = request.op,
                status = "error",
                elapsed_ms = started_at.elapsed().as_millis(),
                error = %err
            );
            network_failure(err)
        })?;
        info!(
            event = "upstream_response",
            trace_id = %request.trace_id,
            op = request.op,
            status = %response.status().as_u16(),
            elapsed_ms = started_at.elapsed().as_millis(),
            is_stream = request.is_stream
        );
        handle_response(response, request.is_stream).await
    }

    /// Reachability check used by the management API. Never fails; the outcome
    /// carries either the backend status or the transport error.
    pub async fn probe(&self, url: &str, timeout: Duration) -> ProbeOutcome {
        let started_at = Instant::now();
        let result = tokio::time::timeout(timeout, self.client.get(url).send()).await;
        let latency_ms = (started_at.elapsed().as_secs_f64() * 100_000.0).round() / 100.0;
        match result {
            Ok(Ok(response)) => {
                let status = response.status();
                ProbeOutcome {
                    ok: status.as_u16() < 400,
                    status_code: Some(status.as_u16()),
                    error: None,
                    latency_ms,
                }
            }
            Ok(Err(err)) => ProbeOutcome {
                ok: false,
                status_code: None,
                error: Some(err.to_string()),
                latency_ms,
            },
            Err(_) => ProbeOutcome {
                ok: false,
                status_code: None,
                error: Some(format!("timed out after {}s", timeout.as_secs())),
                latency_ms,
            },
        }
    }
}
