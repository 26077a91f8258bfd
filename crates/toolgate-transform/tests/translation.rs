use std::sync::Arc;

use serde_json::{Value as JsonValue, json};
use toolgate_protocol::openai::create_chat_completions::{CreateChatCompletionRequest, CreateChatCompletionResponse};
use toolgate_transform::messages::to_client_response;
use toolgate_transform::{
    ChatStreamReconstructor, PrepareOptions, ReplacementPipeline, decode_calls, encode_call, prepare_chat_request,
    synthesize,
};

const SYSTEM_PROMPT: &str = r#"You are an agent.

# Tools

## add_numbers
Description: Add two numbers.
Parameters:
- a: (required) First operand
- b: (optional) Second operand
Usage:
<add_numbers>
<a>first number</a>
<b>second number</b>
</add_numbers>

## ask_followup_question
Description: Ask the user a question.
Parameters:
- question: (required) The question
- follow_up: (optional) Suggested answers
Usage:
<ask_followup_question>
<question>Your question here</question>
<follow_up>
<suggest>First answer</suggest>
<suggest>Second answer</suggest>
</follow_up>
</ask_followup_question>

# Rules

Think first.
"#;

fn chat_request(stream: bool) -> CreateChatCompletionRequest {
    serde_json::from_value(json!({
        "model": "gpt-test",
        "stream": stream,
        "messages": [
            { "role": "system", "content": SYSTEM_PROMPT },
            { "role": "user", "content": "Add 1 and 2." }
        ]
    }))
    .expect("request")
}

fn payload(frame: &[u8]) -> JsonValue {
    let text = std::str::from_utf8(frame).expect("utf8");
    let body = text.strip_prefix("data: ").expect("data frame").trim_end();
    serde_json::from_str(body).unwrap_or_else(|_| JsonValue::String(body.to_string()))
}

#[test]
fn synthesized_declarations_follow_catalogue_order_and_strictness() {
    let (context, rewritten) = synthesize(SYSTEM_PROMPT, true);
    let names: Vec<&str> = context.schemas().iter().map(|schema| schema.name()).collect();
    assert_eq!(names, vec!["add_numbers", "ask_followup_question"]);
    for schema in context.schemas() {
        let parameters = &schema.function.parameters;
        assert_eq!(parameters["additionalProperties"], json!(false));
        let properties: Vec<&String> = parameters["properties"].as_object().expect("properties").keys().collect();
        let required: Vec<&str> = parameters["required"]
            .as_array()
            .expect("required")
            .iter()
            .filter_map(JsonValue::as_str)
            .collect();
        assert_eq!(properties.len(), required.len());
        for property in properties {
            assert!(required.contains(&property.as_str()));
        }
    }
    assert!(rewritten.contains("# Rules\n\nThink first."));
    assert!(!rewritten.contains("<add_numbers>"));

    let (plain, _) = synthesize(SYSTEM_PROMPT, false);
    assert_eq!(plain.schemas()[0].function.parameters["required"], json!(["a"]));
}

#[test]
fn tagged_calls_round_trip() {
    let (context, _) = synthesize(SYSTEM_PROMPT, false);
    let cases = [
        ("add_numbers", json!({ "a": "1", "b": "2" }), "call_1"),
        ("add_numbers", json!({ "a": "x < y && z" }), "call_2"),
        (
            "ask_followup_question",
            json!({ "question": "Which?", "follow_up": { "suggest": ["one", "two"] } }),
            "call_3",
        ),
    ];
    for (name, arguments, id) in cases {
        let text = encode_call(&context, name, &arguments.to_string(), id, "");
        let decoded = decode_calls(&context, &text);
        assert_eq!(decoded.calls.len(), 1);
        let call = &decoded.calls[0];
        assert_eq!((call.name.as_str(), call.id.as_str()), (name, id));
        let parsed: JsonValue = serde_json::from_str(&call.arguments).expect("arguments");
        assert_eq!(parsed, arguments);
    }
}

#[test]
fn non_streaming_tool_call_becomes_tagged_text() {
    let prepared = prepare_chat_request(
        chat_request(false),
        PrepareOptions { strict: true, force_tool_calling: false },
        &ReplacementPipeline::default(),
    );
    let tools = prepared.request.tools.as_ref().expect("tools");
    assert_eq!(tools.len(), 2);

    let response: CreateChatCompletionResponse = serde_json::from_value(json!({
        "id": "chatcmpl-9",
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
                    "function": { "name": "add_numbers", "arguments": "{\"a\":\"1\",\"b\":null}" }
                }]
            }
        }],
        "usage": { "total_tokens": 3 }
    }))
    .expect("response");
    let mut transform = prepared.transform;
    let response = to_client_response(&prepared.context, response, &mut transform);
    let value = serde_json::to_value(&response).expect("json");
    let message = &value["choices"][0]["message"];
    assert!(message.get("tool_calls").is_none());
    assert_eq!(
        message["content"],
        json!("<add_numbers>\n<a>1</a>\n<id>call_abc</id>\n</add_numbers>")
    );
    assert_eq!(value["choices"][0]["finish_reason"], json!("stop"));
    assert_eq!(value["usage"]["total_tokens"], json!(3));
}

#[test]
fn streamed_argument_fragments_flush_once() {
    let prepared = prepare_chat_request(chat_request(true), PrepareOptions::default(), &ReplacementPipeline::default());
    let mut stream = ChatStreamReconstructor::new(Arc::clone(&prepared.context), prepared.transform);

    let fragment = |arguments: &str, first: bool| {
        let mut call = json!({ "index": 0, "function": { "arguments": arguments } });
        if first {
            call["id"] = json!("call_s");
            call["function"]["name"] = json!("add_numbers");
        }
        format!(
            "data: {}",
            json!({ "id": "s", "choices": [{ "index": 0, "delta": { "tool_calls": [call] }, "finish_reason": null }] })
        )
    };
    let lines = [
        format!(
            "data: {}",
            json!({ "id": "s", "choices": [{ "index": 0, "delta": { "role": "assistant" }, "finish_reason": null }] })
        ),
        fragment("{\"a\":", true),
        fragment("1", false),
        fragment("}", false),
        format!(
            "data: {}",
            json!({ "id": "s", "choices": [{ "index": 0, "delta": {}, "finish_reason": "tool_calls" }] })
        ),
        "data: [DONE]".to_string(),
    ];
    let mut frames = Vec::new();
    for line in &lines {
        frames.extend(stream.push_line(line).expect("event"));
    }
    let events: Vec<JsonValue> = frames.iter().map(|frame| payload(frame)).collect();
    let flushed: Vec<&JsonValue> = events
        .iter()
        .filter(|event| event["choices"][0]["delta"]["content"].is_string())
        .collect();
    assert_eq!(flushed.len(), 1);
    assert_eq!(
        flushed[0]["choices"][0]["delta"]["content"],
        json!("<add_numbers>\n<a>1</a>\n<id>call_s</id>\n</add_numbers>")
    );
    assert!(events.iter().all(|event| event["choices"][0]["finish_reason"] != json!("tool_calls")));
    assert_eq!(events.last(), Some(&json!("[DONE]")));
    // one frame per upstream event, plus the flush
    assert_eq!(frames.len(), lines.len() + 1);
}

#[test]
fn abandoned_stream_never_flushes_partial_call() {
    let prepared = prepare_chat_request(chat_request(true), PrepareOptions::default(), &ReplacementPipeline::default());
    let mut stream = ChatStreamReconstructor::new(Arc::clone(&prepared.context), prepared.transform);
    let events = [
        json!({ "role": "assistant" }),
        json!({ "tool_calls": [{ "index": 0, "id": "call_c", "function": { "name": "add_numbers", "arguments": "{\"a\":" } }] }),
        json!({ "tool_calls": [{ "index": 0, "function": { "arguments": "1" } }] }),
        json!({ "tool_calls": [{ "index": 0, "function": { "arguments": "}" } }] }),
        json!({}),
    ];
    let mut frames = Vec::new();
    // the driver stops feeding after the second event; nothing is finished
    for delta in events.iter().take(2) {
        let line = format!(
            "data: {}",
            json!({ "id": "c", "choices": [{ "index": 0, "delta": delta, "finish_reason": null }] })
        );
        frames.extend(stream.push_line(&line).expect("event"));
    }
    drop(stream);
    assert_eq!(frames.len(), 2);
    assert!(frames.iter().all(|frame| !String::from_utf8_lossy(frame).contains("<add_numbers>")));
}
