//! Outbound request preparation: schema synthesis, history rewrite, replacement.

use std::sync::Arc;

use serde_json::json;
use toolgate_protocol::openai::create_chat_completions::{CreateChatCompletionRequest, MessageContent, Role};
use toolgate_protocol::openai::create_completion::{CreateCompletionRequest, Prompt};

use crate::messages::to_backend_messages;
use crate::replacement::{CompletionTransform, ReplacementPipeline};
use crate::schema::{ParserContext, synthesize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrepareOptions {
    /// Emit strict declarations.
    pub strict: bool,
    /// Set `tool_choice: "required"` whenever the request carries tools.
    pub force_tool_calling: bool,
}

#[derive(Debug)]
pub struct ChatPreparation {
    /// Ready to send to the backend.
    pub request: CreateChatCompletionRequest,
    pub context: Arc<ParserContext>,
    pub transform: CompletionTransform,
}

/// Only message 0, and only when it is a system or user message, is read for tool
/// definitions. It becomes the system message carrying the rewritten prompt.
pub fn prepare_chat_request(
    mut request: CreateChatCompletionRequest,
    options: PrepareOptions,
    replacements: &ReplacementPipeline,
) -> ChatPreparation {
    let mut context = ParserContext::default();
    if let Some(first) = request.messages.first_mut() {
        if matches!(first.role, Role::System | Role::User) {
            let prompt = first.text().unwrap_or_default();
            let (synthesized, rewritten) = synthesize(&prompt, options.strict);
            if !synthesized.is_empty() {
                first.role = Role::System;
                first.content = Some(MessageContent::Text(rewritten));
                let declarations = synthesized.declarations();
                if !declarations.is_empty() {
                    request.tools.get_or_insert_with(Vec::new).extend(declarations);
                }
                tracing::debug!(
                    event = "tools_declared",
                    tools = synthesized.schemas().len(),
                    strict = options.strict
                );
            }
            context = synthesized;
        }
    }
    if options.force_tool_calling && request.tools.as_ref().is_some_and(|tools| !tools.is_empty()) {
        request.tool_choice = Some(json!("required"));
    }

    let messages = std::mem::take(&mut request.messages);
    request.messages = to_backend_messages(&context, messages);
    let transform = replacements.apply_outbound_messages(&mut request.messages);
    ChatPreparation {
        request,
        context: Arc::new(context),
        transform,
    }
}

/// The legacy form carries no tools; only the replacement rules apply.
pub fn prepare_completion_request(
    mut request: CreateCompletionRequest,
    replacements: &ReplacementPipeline,
) -> (CreateCompletionRequest, CompletionTransform) {
    let transform = match &mut request.prompt {
        Prompt::Text(text) => {
            let (prompt, transform) = replacements.apply_outbound_prompt(text);
            *text = prompt;
            transform
        }
        Prompt::Batch(items) => {
            let (prompts, transform) = replacements.apply_outbound_prompts(items);
            *items = prompts;
            transform
        }
    };
    (request, transform)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value as JsonValue, json};

    const PROMPT: &str = "You are a coding agent.\n\n# Tools\n\n## read_file\nDescription: Read a file.\nParameters:\n- path: (required) The path\nUsage:\n<read_file>\n<path>File path here</path>\n</read_file>\n\n# Rules\n\nBe brief.\n";

    fn request(value: JsonValue) -> CreateChatCompletionRequest {
        serde_json::from_value(value).expect("request")
    }

    #[test]
    fn first_message_supplies_tools_and_becomes_system() {
        let prepared = prepare_chat_request(
            request(json!({
                "model": "m",
                "messages": [
                    { "role": "user", "content": [{ "type": "text", "text": PROMPT }] },
                    { "role": "assistant", "content": "<read_file>\n<path>a.rs</path>\n<id>call_1</id>\n</read_file>" },
                    { "role": "user", "content": [{ "type": "text", "text": "[read_file for 'a.rs'] Result:\nfn main() {}" }] }
                ],
                "tools": [{ "type": "function", "function": { "name": "existing", "parameters": { "type": "object" } } }]
            })),
            PrepareOptions { strict: true, force_tool_calling: true },
            &ReplacementPipeline::default(),
        );
        let request = &prepared.request;
        assert_eq!(request.messages[0].role, Role::System);
        assert!(!request.messages[0].text().unwrap_or_default().contains("<read_file>"));
        let tools = request.tools.as_ref().expect("tools");
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[1]["function"]["name"], json!("read_file"));
        assert_eq!(tools[1]["function"]["strict"], json!(true));
        assert_eq!(request.tool_choice, Some(json!("required")));
        assert_eq!(request.messages[1].tool_calls.as_ref().expect("calls")[0].id, "call_1");
        assert_eq!(request.messages[2].role, Role::Tool);
        assert_eq!(request.extra["model"], json!("m"));
        assert_eq!(prepared.context.schemas().len(), 1);
    }

    #[test]
    fn prompt_without_tools_is_forwarded_as_is() {
        let original = request(json!({
            "messages": [{ "role": "user", "content": "hello <b>there</b>" }],
            "stream": true
        }));
        let prepared = prepare_chat_request(original.clone(), PrepareOptions::default(), &ReplacementPipeline::default());
        assert_eq!(prepared.request, original);
        assert!(prepared.context.is_empty());
    }

    #[test]
    fn force_tool_calling_needs_tools() {
        let prepared = prepare_chat_request(
            request(json!({ "messages": [{ "role": "system", "content": "no tools" }] })),
            PrepareOptions { strict: false, force_tool_calling: true },
            &ReplacementPipeline::default(),
        );
        assert!(prepared.request.tool_choice.is_none());
    }

    #[test]
    fn assistant_first_message_is_not_a_prompt() {
        let prepared = prepare_chat_request(
            request(json!({ "messages": [{ "role": "assistant", "content": PROMPT }] })),
            PrepareOptions::default(),
            &ReplacementPipeline::default(),
        );
        assert!(prepared.request.tools.is_none());
        assert_eq!(prepared.request.messages[0].role, Role::Assistant);
    }

    #[test]
    fn legacy_prompt_gets_replacements() {
        let rule = crate::replacement::ReplacementRule::new(
            serde_json::from_value(json!({ "role": "prompt", "pattern": "world", "replace": "there" })).expect("settings"),
            0,
        )
        .expect("rule");
        let pipeline = ReplacementPipeline::new(vec![rule]);
        let request: CreateCompletionRequest =
            serde_json::from_value(json!({ "model": "m", "prompt": ["hello", "world"], "max_tokens": 5 })).expect("request");
        let (request, _) = prepare_completion_request(request, &pipeline);
        assert_eq!(request.prompt, Prompt::Batch(vec!["hello".to_string(), "there".to_string()]));
        assert_eq!(request.extra["max_tokens"], json!(5));
    }
}
