use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value as JsonValue, json};
use tokio_util::sync::CancellationToken;
use toolgate_core::{Gateway, GatewayConfig};
use toolgate_transform::{ReplacementPipeline, ReplacementRule};
use toolgate_upstream::UpstreamClient;

const SYSTEM_PROMPT: &str = "You are an agent.\n\n# Tools\n\n## add_numbers\nDescription: Add two numbers.\nParameters:\n- a: (required) First operand\nUsage:\n<add_numbers>\n<a>number</a>\n</add_numbers>\n\n# Rules\n\nBe brief.\n";
const BACKEND_ERROR: &str = r#"{"error":{"message":"model not found","type":"invalid_request_error"}}"#;

#[derive(Debug, Clone)]
struct Recorded {
    path: String,
    query: Option<String>,
    authorization: Option<String>,
    body: JsonValue,
}

type Log = Arc<Mutex<Vec<Recorded>>>;

fn record(log: &Log, uri: &Uri, headers: &HeaderMap, body: JsonValue) {
    log.lock().expect("log").push(Recorded {
        path: uri.path().to_string(),
        query: uri.query().map(str::to_string),
        authorization: headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
        body,
    });
}

fn sse(events: &[JsonValue]) -> Response {
    let mut body = String::new();
    for event in events {
        body.push_str(&format!("data: {event}\n\n"));
    }
    body.push_str("data: [DONE]\n\n");
    ([("content-type", "text/event-stream")], body).into_response()
}

fn backend_error() -> Response {
    (StatusCode::BAD_REQUEST, [("content-type", "application/json")], BACKEND_ERROR).into_response()
}

async fn mock_chat(State(log): State<Log>, uri: Uri, headers: HeaderMap, Json(body): Json<JsonValue>) -> Response {
    record(&log, &uri, &headers, body.clone());
    if body["model"] == json!("missing") {
        return backend_error();
    }
    if body["stream"] == json!(true) {
        let chunk = |delta: JsonValue, finish: JsonValue| {
            json!({ "id": "s", "object": "chat.completion.chunk", "choices": [{ "index": 0, "delta": delta, "finish_reason": finish }] })
        };
        return sse(&[
            chunk(json!({ "role": "assistant" }), JsonValue::Null),
            chunk(
                json!({ "tool_calls": [{ "index": 0, "id": "call_s", "type": "function", "function": { "name": "add_numbers", "arguments": "{\"a\":" } }] }),
                JsonValue::Null,
            ),
            chunk(json!({ "tool_calls": [{ "index": 0, "function": { "arguments": "1" } }] }), JsonValue::Null),
            chunk(json!({ "tool_calls": [{ "index": 0, "function": { "arguments": "}" } }] }), JsonValue::Null),
            chunk(json!({}), json!("tool_calls")),
        ]);
    }
    Json(json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "choices": [{
            "index": 0,
            "finish_reason": "tool_calls",
            "message": {
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": "call_abc",
                    "type": "function",
                    "function": { "name": "add_numbers", "arguments": "{\"a\":\"1\"}" }
                }]
            }
        }]
    }))
    .into_response()
}

async fn mock_completions(
    State(log): State<Log>,
    uri: Uri,
    headers: HeaderMap,
    Json(body): Json<JsonValue>,
) -> Response {
    record(&log, &uri, &headers, body.clone());
    if body["stream"] == json!(true) {
        let chunk = |text: &str, finish: JsonValue| {
            json!({ "id": "c", "object": "text_completion", "choices": [{ "index": 0, "text": text, "finish_reason": finish }] })
        };
        return sse(&[chunk("the sec", JsonValue::Null), chunk("ret word", JsonValue::Null), chunk("", json!("stop"))]);
    }
    Json(json!({
        "id": "c",
        "object": "text_completion",
        "choices": [{ "index": 0, "text": "a secret word", "finish_reason": "stop" }]
    }))
    .into_response()
}

async fn mock_models(State(log): State<Log>, uri: Uri, headers: HeaderMap) -> Response {
    record(&log, &uri, &headers, JsonValue::Null);
    Json(json!({ "object": "list", "data": [{ "id": "gpt-test", "object": "model" }] })).into_response()
}

async fn spawn(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve");
    });
    addr
}

struct Harness {
    gateway: SocketAddr,
    log: Log,
    client: wreq::Client,
}

impl Harness {
    async fn start(replacements: ReplacementPipeline) -> Self {
        let log: Log = Arc::default();
        let backend = spawn(
            Router::new()
                .route("/v1/chat/completions", post(mock_chat))
                .route("/v1/completions", post(mock_completions))
                .route("/v1/models", get(mock_models))
                .with_state(log.clone()),
        )
        .await;
        let config = GatewayConfig {
            target_base_url: format!("http://{backend}/v1"),
            ..GatewayConfig::default()
        };
        let gateway = Gateway::new(
            config,
            replacements,
            UpstreamClient::new().expect("upstream client"),
            CancellationToken::new(),
        );
        let gateway = spawn(gateway.router()).await;
        Self {
            gateway,
            log,
            client: wreq::Client::builder().build().expect("client"),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.gateway)
    }

    fn recorded(&self) -> Vec<Recorded> {
        self.log.lock().expect("log").clone()
    }

    async fn post(&self, path: &str, body: JsonValue) -> (StatusCode, String) {
        let response = self
            .client
            .post(self.url(path))
            .header("authorization", "Bearer sk-test")
            .json(&body)
            .send()
            .await
            .expect("send");
        let status = response.status();
        (status, response.text().await.expect("body"))
    }

    async fn get(&self, path: &str) -> (StatusCode, JsonValue) {
        let response = self.client.get(self.url(path)).send().await.expect("send");
        let status = response.status();
        (status, response.json().await.expect("json"))
    }
}

fn chat_body(stream: bool, model: &str) -> JsonValue {
    json!({
        "model": model,
        "stream": stream,
        "messages": [
            { "role": "system", "content": SYSTEM_PROMPT },
            { "role": "user", "content": "Add one." }
        ]
    })
}

#[tokio::test]
async fn chat_response_tool_calls_become_tagged_text() {
    let harness = Harness::start(ReplacementPipeline::default()).await;
    let (status, body) = harness.post("/v1/chat/completions?api-version=2", chat_body(false, "gpt-test")).await;
    assert_eq!(status, StatusCode::OK);
    let body: JsonValue = serde_json::from_str(&body).expect("json");
    let message = &body["choices"][0]["message"];
    assert!(message.get("tool_calls").is_none());
    assert_eq!(message["content"], json!("<add_numbers>\n<a>1</a>\n<id>call_abc</id>\n</add_numbers>"));
    assert_eq!(body["choices"][0]["finish_reason"], json!("stop"));

    let recorded = harness.recorded();
    assert_eq!(recorded.len(), 1);
    let sent = &recorded[0];
    assert_eq!(sent.path, "/v1/chat/completions");
    assert_eq!(sent.query.as_deref(), Some("api-version=2"));
    assert_eq!(sent.authorization.as_deref(), Some("Bearer sk-test"));
    assert_eq!(sent.body["tools"][0]["function"]["name"], json!("add_numbers"));
    assert_eq!(sent.body["tools"][0]["function"]["strict"], json!(true));
    assert_eq!(sent.body["messages"][0]["role"], json!("system"));
    assert!(sent.body.get("tool_choice").is_none());
}

#[tokio::test]
async fn streamed_fragments_are_reframed_into_one_tagged_event() {
    let harness = Harness::start(ReplacementPipeline::default()).await;
    let (status, body) = harness.post("/v1/chat/completions", chat_body(true, "gpt-test")).await;
    assert_eq!(status, StatusCode::OK);
    let events: Vec<&str> = body.split("\n\n").filter(|event| !event.is_empty()).collect();
    // five forwarded events, one flush, the sentinel
    assert_eq!(events.len(), 7);
    let flushed: Vec<&&str> = events.iter().filter(|event| event.contains("<add_numbers>")).collect();
    assert_eq!(flushed.len(), 1);
    assert!(flushed[0].contains(r#"<add_numbers>\n<a>1</a>\n<id>call_s</id>\n</add_numbers>"#));
    assert!(!body.contains("tool_calls"));
    assert_eq!(events.last(), Some(&"data: [DONE]"));
}

#[tokio::test]
async fn backend_errors_pass_through() {
    let harness = Harness::start(ReplacementPipeline::default()).await;
    let (status, body) = harness.post("/v1/chat/completions", chat_body(false, "missing")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, BACKEND_ERROR);

    let (status, body) = harness.post("/v1/chat/completions", chat_body(true, "missing")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, format!("data: {BACKEND_ERROR}\n\ndata: [DONE]\n\n"));
}

#[tokio::test]
async fn malformed_request_is_rejected_locally() {
    let harness = Harness::start(ReplacementPipeline::default()).await;
    let (status, body) = harness.post("/v1/chat/completions", json!({ "model": "m" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("invalid_request_error"));
    assert!(harness.recorded().is_empty());
}

#[tokio::test]
async fn models_are_passed_through_on_both_paths() {
    let harness = Harness::start(ReplacementPipeline::default()).await;
    for path in ["/v1/models", "/api/v0/models?limit=5"] {
        let (status, body) = harness.get(path).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"][0]["id"], json!("gpt-test"));
    }
    let recorded = harness.recorded();
    assert!(recorded.iter().all(|sent| sent.path == "/v1/models"));
    assert_eq!(recorded[1].query.as_deref(), Some("limit=5"));
}

#[tokio::test]
async fn legacy_completions_apply_completion_rules() {
    let rule = ReplacementRule::new(
        serde_json::from_value(json!({ "role": "completion", "pattern": "secret", "replace": "public" }))
            .expect("settings"),
        0,
    )
    .expect("rule");
    let harness = Harness::start(ReplacementPipeline::new(vec![rule])).await;

    let (status, body) = harness
        .post("/v1/completions", json!({ "model": "m", "prompt": "say it" }))
        .await;
    assert_eq!(status, StatusCode::OK);
    let body: JsonValue = serde_json::from_str(&body).expect("json");
    assert_eq!(body["choices"][0]["text"], json!("a public word"));

    let (status, body) = harness
        .post("/v1/completions", json!({ "model": "m", "prompt": "say it", "stream": true }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("the public word"));
    assert!(!body.contains("secret"));
    assert!(body.ends_with("data: [DONE]\n\n"));
    assert_eq!(harness.recorded()[1].body["prompt"], json!("say it"));
}

#[tokio::test]
async fn config_updates_apply_to_later_requests() {
    let harness = Harness::start(ReplacementPipeline::default()).await;
    let (status, config) = harness.get("/api/config").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(config["force_tool_calling"], json!(false));

    let (status, body) = harness
        .post("/api/config", json!({ "force_tool_calling": true, "disable_strict_schemas": true }))
        .await;
    assert_eq!(status, StatusCode::OK);
    let updated: JsonValue = serde_json::from_str(&body).expect("json");
    assert_eq!(updated["force_tool_calling"], json!(true));

    let (status, _) = harness.post("/api/config", json!({ "force_tool_calling": "sometimes" })).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    harness.post("/v1/chat/completions", chat_body(false, "gpt-test")).await;
    let sent = &harness.recorded()[0];
    assert_eq!(sent.body["tool_choice"], json!("required"));
    assert_eq!(sent.body["tools"][0]["function"]["strict"], json!(false));
}

#[tokio::test]
async fn parse_tools_previews_synthesis() {
    let harness = Harness::start(ReplacementPipeline::default()).await;
    let (status, body) = harness
        .post("/api/parse-tools", json!({ "system_prompt": SYSTEM_PROMPT, "strict": true }))
        .await;
    assert_eq!(status, StatusCode::OK);
    let body: JsonValue = serde_json::from_str(&body).expect("json");
    assert_eq!(body["schemas"][0]["function"]["name"], json!("add_numbers"));
    assert_eq!(body["schemas"][0]["function"]["parameters"]["additionalProperties"], json!(false));
    let processed = body["processed_system_prompt"].as_str().expect("prompt");
    assert!(processed.contains("Be brief."));
    assert!(!processed.contains("<add_numbers>"));
}

#[tokio::test]
async fn upstream_probe_reports_status() {
    let harness = Harness::start(ReplacementPipeline::default()).await;
    let (status, body) = harness.get("/api/test-upstream").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], json!(true));
    assert_eq!(body["status_code"], json!(200));
    assert!(body["latency_ms"].is_number());
}
