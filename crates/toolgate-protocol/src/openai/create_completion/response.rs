use serde::{Deserialize, Serialize};

use crate::openai::create_chat_completions::types::JsonObject;

/// Used both for full responses and for streamed chunks; the legacy endpoint sends
/// the same shape in either mode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionChoice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub finish_reason: Option<String>,
    #[serde(flatten)]
    pub extra: JsonObject,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateCompletionResponse {
    #[serde(default)]
    pub choices: Vec<CompletionChoice>,
    #[serde(flatten)]
    pub extra: JsonObject,
}
