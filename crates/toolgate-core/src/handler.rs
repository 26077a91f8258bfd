use std::io;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{RawQuery, State};
use axum::http::{HeaderMap, HeaderValue, Method};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::stream;
use http::StatusCode;
use http::header::CONTENT_TYPE;
use toolgate_protocol::openai::create_chat_completions::{
    CreateChatCompletionRequest, CreateChatCompletionResponse,
};
use toolgate_protocol::openai::create_completion::{CreateCompletionRequest, CreateCompletionResponse};
use toolgate_protocol::sse::{default_done_frame, raw_frame};
use toolgate_transform::messages::to_client_response;
use toolgate_transform::{
    ChatStreamReconstructor, LegacyStreamReconstructor, prepare_chat_request, prepare_completion_request,
};
use toolgate_upstream::{
    ProxyResponse, StreamBody, UpstreamPassthroughError, UpstreamRequest, forward_headers, response_headers,
};
use tracing::warn;
use uuid::Uuid;

use crate::core::GatewayState;
use crate::dump::{dump_chat_request, dump_prompt};
use crate::error::ProxyError;
use crate::stream::reframe;

pub async fn chat_completions(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    let config = state.config.snapshot();
    let request: CreateChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => return error_response(ProxyError::bad_request(format!("invalid chat completion request: {err}"))),
    };
    let prepared = prepare_chat_request(request, config.prepare_options(), &state.replacements);
    dump_chat_request(&config, &prepared.request).await;

    let is_stream = prepared.request.is_stream();
    let body = match serde_json::to_vec(&prepared.request) {
        Ok(body) => Bytes::from(body),
        Err(err) => return error_response(ProxyError::internal(err.to_string())),
    };
    let trace_id = request_id(&headers);
    let upstream = UpstreamRequest {
        trace_id: trace_id.clone(),
        op: "chat.completions",
        method: Method::POST,
        url: config.endpoint("chat/completions"),
        query,
        headers: forward_headers(&headers),
        body: Some(body),
        is_stream,
    };

    match state.upstream.send(upstream).await {
        Ok(ProxyResponse::Json { status, headers, body }) => {
            let mut transform = prepared.transform;
            let body = match serde_json::from_slice::<CreateChatCompletionResponse>(&body) {
                Ok(response) => {
                    let response = to_client_response(&prepared.context, response, &mut transform);
                    match serde_json::to_vec(&response) {
                        Ok(body) => Bytes::from(body),
                        Err(err) => return error_response(ProxyError::internal(err.to_string())),
                    }
                }
                Err(err) => {
                    warn!(event = "response_passthrough", trace_id = %trace_id, error = %err);
                    body
                }
            };
            proxy_response(ProxyResponse::Json { status, headers, body })
        }
        Ok(ProxyResponse::Stream { status, headers, body }) => {
            let reconstructor = ChatStreamReconstructor::new(prepared.context, prepared.transform);
            let cancel = state.shutdown.child_token();
            let stream = reframe(body.stream, reconstructor, cancel, trace_id);
            proxy_response(ProxyResponse::Stream {
                status,
                headers,
                body: StreamBody::new("text/event-stream", stream),
            })
        }
        Err(err) if is_stream => stream_error(err),
        Err(err) => passthrough_error(err),
    }
}

/// Legacy single-prompt form. Only the replacement rules apply.
pub async fn legacy_completions(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    let config = state.config.snapshot();
    let request: CreateCompletionRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => return error_response(ProxyError::bad_request(format!("invalid completion request: {err}"))),
    };
    let (request, mut transform) = prepare_completion_request(request, &state.replacements);
    dump_prompt(&config, &request.prompt).await;

    let is_stream = request.is_stream();
    let body = match serde_json::to_vec(&request) {
        Ok(body) => Bytes::from(body),
        Err(err) => return error_response(ProxyError::internal(err.to_string())),
    };
    let trace_id = request_id(&headers);
    let upstream = UpstreamRequest {
        trace_id: trace_id.clone(),
        op: "completions",
        method: Method::POST,
        url: config.endpoint("completions"),
        query,
        headers: forward_headers(&headers),
        body: Some(body),
        is_stream,
    };

    match state.upstream.send(upstream).await {
        Ok(ProxyResponse::Json { status, headers, body }) => {
            let body = match serde_json::from_slice::<CreateCompletionResponse>(&body) {
                Ok(mut response) => {
                    for choice in &mut response.choices {
                        choice.text = transform.apply(&choice.text);
                    }
                    match serde_json::to_vec(&response) {
                        Ok(body) => Bytes::from(body),
                        Err(err) => return error_response(ProxyError::internal(err.to_string())),
                    }
                }
                Err(err) => {
                    warn!(event = "response_passthrough", trace_id = %trace_id, error = %err);
                    body
                }
            };
            proxy_response(ProxyResponse::Json { status, headers, body })
        }
        Ok(ProxyResponse::Stream { status, headers, body }) => {
            let reconstructor = LegacyStreamReconstructor::new(transform);
            let cancel = state.shutdown.child_token();
            let stream = reframe(body.stream, reconstructor, cancel, trace_id);
            proxy_response(ProxyResponse::Stream {
                status,
                headers,
                body: StreamBody::new("text/event-stream", stream),
            })
        }
        Err(err) if is_stream => stream_error(err),
        Err(err) => passthrough_error(err),
    }
}

pub async fn list_models(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Response {
    let config = state.config.snapshot();
    let upstream = UpstreamRequest {
        trace_id: request_id(&headers),
        op: "models.list",
        method: Method::GET,
        url: config.endpoint("models"),
        query,
        headers: forward_headers(&headers),
        body: None,
        is_stream: false,
    };
    match state.upstream.send(upstream).await {
        Ok(response) => proxy_response(response),
        Err(err) => passthrough_error(err),
    }
}

fn proxy_response(response: ProxyResponse) -> Response {
    match response {
        ProxyResponse::Json {
            status,
            headers,
            body,
        } => {
            let mut resp = Response::new(Body::from(body));
            *resp.status_mut() = status;
            resp.headers_mut().extend(response_headers(&headers));
            resp
        }
        ProxyResponse::Stream {
            status,
            headers,
            body,
        } => {
            let mut resp = Response::new(Body::from_stream(body.stream));
            *resp.status_mut() = status;
            resp.headers_mut().extend(response_headers(&headers));
            if !resp.headers().contains_key(CONTENT_TYPE) {
                resp.headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static(body.content_type));
            }
            resp
        }
    }
}

fn passthrough_error(err: UpstreamPassthroughError) -> Response {
    let mut resp = Response::new(Body::from(err.body));
    *resp.status_mut() = err.status;
    resp.headers_mut().extend(response_headers(&err.headers));
    resp
}

/// A streaming client expects an event stream even when the backend refused the
/// request: the error body becomes one event, followed by the sentinel.
fn stream_error(err: UpstreamPassthroughError) -> Response {
    let frames: [Result<Bytes, io::Error>; 2] = [Ok(raw_frame(&err.body_text())), Ok(default_done_frame())];
    proxy_response(ProxyResponse::Stream {
        status: StatusCode::OK,
        headers: HeaderMap::new(),
        body: StreamBody::new("text/event-stream", stream::iter(frames)),
    })
}

fn error_response(err: ProxyError) -> Response {
    err.into_response()
}

fn request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .or_else(|| headers.get("request-id"))
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}
