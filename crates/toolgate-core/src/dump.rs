//! Debug dumps of what is sent to the backend. A failed dump is logged and never
//! fails the request.

use std::path::Path;

use serde::Serialize;
use serde_json::Value as JsonValue;
use toolgate_protocol::openai::create_chat_completions::CreateChatCompletionRequest;
use toolgate_protocol::openai::create_completion::Prompt;
use tracing::warn;

use crate::config::GatewayConfig;

pub async fn dump_chat_request(config: &GatewayConfig, request: &CreateChatCompletionRequest) {
    if let Some(path) = &config.message_dump_path {
        write_json(path, &request.messages).await;
    }
    if let Some(path) = &config.tool_dump_path {
        let tools: &[JsonValue] = request.tools.as_deref().unwrap_or_default();
        write_json(path, &tools).await;
    }
}

pub async fn dump_prompt(config: &GatewayConfig, prompt: &Prompt) {
    if let Some(path) = &config.message_dump_path {
        write_bytes(path, prompt.as_text().into_bytes()).await;
    }
}

async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) {
    match serde_json::to_vec_pretty(value) {
        Ok(data) => write_bytes(path, data).await,
        Err(err) => warn!(event = "dump_failed", path = %path.display(), error = %err),
    }
}

async fn write_bytes(path: &Path, data: Vec<u8>) {
    if let Err(err) = tokio::fs::write(path, data).await {
        warn!(event = "dump_failed", path = %path.display(), error = %err);
    }
}
