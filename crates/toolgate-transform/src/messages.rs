//! Whole-message conversions for the non-streaming path.

use std::collections::VecDeque;

use toolgate_protocol::openai::create_chat_completions::{
    ChatMessage, CreateChatCompletionResponse, FINISH_REASON_STOP, FINISH_REASON_TOOL_CALLS, MessageContent, Role,
    ToolCall,
};

use crate::codec::{decode_calls, encode_call};
use crate::replacement::CompletionTransform;
use crate::schema::ParserContext;

/// Client history to backend history: tagged calls in assistant text become
/// `tool_calls`, and the user messages answering them become `tool` messages.
pub fn to_backend_messages(context: &ParserContext, messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    if context.is_empty() {
        return messages;
    }
    // (call id, tool tag) of calls still waiting for their result message.
    let mut pending: VecDeque<(String, String)> = VecDeque::new();
    let mut rewritten = Vec::with_capacity(messages.len());
    for mut message in messages {
        if message.role == Role::Assistant {
            pending.clear();
            if let Some(text) = message.text() {
                let decoded = decode_calls(context, &text);
                if !decoded.calls.is_empty() {
                    let mut tool_calls = message.tool_calls.take().unwrap_or_default();
                    for call in decoded.calls {
                        pending.push_back((call.id.clone(), call.tag));
                        tool_calls.push(ToolCall::function(call.id, call.name, call.arguments));
                    }
                    message.content = (!decoded.text.trim().is_empty()).then(|| MessageContent::Text(decoded.text));
                    message.tool_calls = Some(tool_calls);
                }
            }
            rewritten.push(message);
            continue;
        }
        if message.role == Role::User {
            if let Some(call_id) = answered_call(&message, &mut pending) {
                message.role = Role::Tool;
                message.tool_call_id = Some(call_id);
                rewritten.push(message);
                continue;
            }
        }
        pending.clear();
        rewritten.push(message);
    }
    rewritten
}

/// Pops the pending call a user message answers, if its first text is a
/// `[<tool> ...] Result:` block for the next pending call.
fn answered_call(message: &ChatMessage, pending: &mut VecDeque<(String, String)>) -> Option<String> {
    let (_, tag) = pending.front()?;
    let first = message.content.as_ref()?.first_text()?;
    if !first.starts_with(&format!("[{tag} ")) {
        return None;
    }
    pending.pop_front().map(|(id, _)| id)
}

/// Backend response to client response: native calls are rendered as tagged text
/// after any existing content, and the tool-call finish reason becomes `stop`.
pub fn to_client_response(
    context: &ParserContext,
    mut response: CreateChatCompletionResponse,
    transform: &mut CompletionTransform,
) -> CreateChatCompletionResponse {
    for choice in &mut response.choices {
        let message = &mut choice.message;
        if message.role == Role::Assistant {
            if let Some(tool_calls) = message.tool_calls.take().filter(|calls| !calls.is_empty()) {
                let mut reasoning = message.reasoning_content.take().unwrap_or_default();
                let rendered: Vec<String> = tool_calls
                    .iter()
                    .map(|call| {
                        let text = encode_call(
                            context,
                            &call.function.name,
                            &call.function.arguments,
                            &call.id,
                            &reasoning,
                        );
                        reasoning.clear();
                        text
                    })
                    .collect();
                let mut content = message.text().unwrap_or_default();
                if !content.is_empty() && !content.ends_with('\n') {
                    content.push('\n');
                }
                content.push_str(&rendered.join("\n"));
                message.content = Some(MessageContent::Text(content));
            }
        }
        if let Some(content) = message.content.as_mut() {
            content.map_text(|text| transform.apply(text));
        }
        if choice.finish_reason.as_deref() == Some(FINISH_REASON_TOOL_CALLS) {
            choice.finish_reason = Some(FINISH_REASON_STOP.to_string());
        }
    }
    response
}
