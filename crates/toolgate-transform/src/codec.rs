//! Conversion between native tool calls and the tagged text clients read and write.

use serde_json::Value as JsonValue;
use toolgate_protocol::openai::create_chat_completions::JsonObject;
use uuid::Uuid;

use crate::schema::{ParamKind, ParameterSpec, ParserContext, ToolDefinition};

/// Child tag carrying the call id inside a tagged call.
pub const ID_TAG: &str = "id";
/// Block rendered ahead of a call when the backend streamed reasoning for it.
pub const REASONING_TAG: &str = "thinking";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedCall {
    /// Tool tag as written in the text.
    pub tag: String,
    /// Native tool name.
    pub name: String,
    /// Native arguments as JSON text.
    pub arguments: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DecodedText {
    /// Input text with every decoded call removed.
    pub text: String,
    pub calls: Vec<DecodedCall>,
}

pub fn generate_call_id() -> String {
    format!("call_{}", Uuid::new_v4().simple())
}

/// Renders one native call as tagged text. Arguments that are not (yet) valid JSON are
/// closed on a best-effort basis; if they still do not parse they are written raw
/// inside the tool tag. A call without a name has no tag to write: its arguments are
/// rendered as plain text.
pub fn encode_call(context: &ParserContext, name: &str, arguments: &str, call_id: &str, reasoning: &str) -> String {
    let mut out = String::new();
    let reasoning = reasoning.trim();
    if !reasoning.is_empty() {
        out.push_str(&format!("<{REASONING_TAG}>\n{reasoning}\n</{REASONING_TAG}>\n"));
    }
    let name = name.trim();
    if name.is_empty() {
        out.push_str(arguments.trim());
        out.truncate(out.trim_end().len());
        return out;
    }
    let Some(object) = parse_arguments(arguments) else {
        out.push_str(&format!("<{name}>\n"));
        if !arguments.trim().is_empty() {
            out.push_str(arguments.trim());
            out.push('\n');
        }
        push_id(&mut out, call_id);
        out.push_str(&format!("</{name}>"));
        return out;
    };
    let (tag, object) = context.tagged_form(name, object);
    out.push_str(&format!("<{tag}>\n"));
    for (key, value) in &object {
        render_value(&mut out, key, value);
    }
    push_id(&mut out, call_id);
    out.push_str(&format!("</{tag}>"));
    out
}

fn push_id(out: &mut String, call_id: &str) {
    if !call_id.is_empty() {
        out.push_str(&format!("<{ID_TAG}>{call_id}</{ID_TAG}>\n"));
    }
}

fn render_value(out: &mut String, tag: &str, value: &JsonValue) {
    match value {
        JsonValue::Null => {}
        JsonValue::Array(items) => {
            for item in items {
                render_value(out, tag, item);
            }
        }
        JsonValue::Object(children) => {
            out.push_str(&format!("<{tag}>\n"));
            for (key, child) in children {
                render_value(out, key, child);
            }
            out.push_str(&format!("</{tag}>\n"));
        }
        scalar => out.push_str(&format!("<{tag}>{}</{tag}>\n", value_text(scalar))),
    }
}

/// Natural text of a JSON value: strings verbatim, other values stringified.
pub(crate) fn value_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(text) => text.clone(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

fn parse_arguments(arguments: &str) -> Option<JsonObject> {
    let trimmed = arguments.trim();
    if trimmed.is_empty() {
        return Some(JsonObject::new());
    }
    let parsed = serde_json::from_str::<JsonValue>(trimmed)
        .or_else(|_| serde_json::from_str::<JsonValue>(&close_partial_json(trimmed)));
    match parsed {
        Ok(JsonValue::Object(object)) => Some(object),
        _ => None,
    }
}

/// Closes an unterminated string and any open objects or arrays of truncated JSON.
pub fn close_partial_json(text: &str) -> String {
    let mut closers = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for c in text.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => closers.push('}'),
            '[' => closers.push(']'),
            '}' | ']' => {
                closers.pop();
            }
            _ => {}
        }
    }
    let mut out = text.to_string();
    if in_string {
        if escaped {
            out.pop();
        }
        out.push('"');
    }
    out.truncate(out.trim_end().len());
    if out.ends_with(',') {
        out.pop();
    } else if out.ends_with(':') {
        out.push_str("null");
    }
    while let Some(closer) = closers.pop() {
        out.push(closer);
    }
    out
}

/// Extracts every tagged call to a declared tool, in document order. Tags of tools the
/// context does not declare, and calls without a closing tag, stay in the text.
pub fn decode_calls(context: &ParserContext, text: &str) -> DecodedText {
    let mut decoded = DecodedText::default();
    let mut kept_from = 0;
    let mut cursor = 0;
    while let Some((start, definition, open_end)) = next_call(context, text, cursor) {
        let closing = format!("</{}>", definition.name);
        let Some(offset) = text[open_end..].find(&closing) else {
            cursor = open_end;
            continue;
        };
        let end = open_end + offset + closing.len();
        let (arguments, id) = parse_fields(&text[open_end..open_end + offset], &definition.parameters, true);
        let (name, arguments) = context.native_form(&definition.name, arguments);
        decoded.calls.push(DecodedCall {
            tag: definition.name.clone(),
            name,
            arguments: serde_json::to_string(&arguments).unwrap_or_else(|_| "{}".to_string()),
            id: id.filter(|id| !id.is_empty()).unwrap_or_else(generate_call_id),
        });
        decoded.text.push_str(&text[kept_from..start]);
        kept_from = end;
        cursor = end;
    }
    decoded.text.push_str(&text[kept_from..]);
    decoded
}

/// Earliest `<tool>` / `<tool attr>` opening of a declared tool at or after `cursor`.
fn next_call<'a>(context: &'a ParserContext, text: &str, cursor: usize) -> Option<(usize, &'a ToolDefinition, usize)> {
    let mut from = cursor;
    while let Some(offset) = text[from..].find('<') {
        let start = from + offset;
        for definition in context.definitions() {
            if let Some(open_end) = opening_end(text, start, &definition.name) {
                return Some((start, definition, open_end));
            }
        }
        from = start + 1;
    }
    None
}

/// End offset of `<tag>` or `<tag ...>` starting at `start`.
fn opening_end(text: &str, start: usize, tag: &str) -> Option<usize> {
    let after = text.get(start + 1..)?.strip_prefix(tag)?;
    let head_end = start + 1 + tag.len();
    match after.chars().next()? {
        '>' => Some(head_end + 1),
        c if c.is_whitespace() => after.find('>').map(|offset| head_end + offset + 1),
        _ => None,
    }
}

/// Reads declared child tags of a call body. String parameters take their content
/// verbatim up to the closing tag; number and boolean parameters parse it.
fn parse_fields(body: &str, parameters: &[ParameterSpec], root: bool) -> (JsonObject, Option<String>) {
    let mut fields = JsonObject::new();
    let mut id = None;
    let read_id = root && !parameters.iter().any(|parameter| parameter.name == ID_TAG);
    let mut cursor = 0;
    while let Some((tag, open_end)) = next_field(body, cursor, parameters, read_id) {
        let closing = format!("</{tag}>");
        let Some(offset) = body[open_end..].find(&closing) else {
            cursor = open_end;
            continue;
        };
        let content = &body[open_end..open_end + offset];
        cursor = open_end + offset + closing.len();
        let Some(parameter) = parameters.iter().find(|parameter| parameter.name == tag) else {
            id = Some(content.trim().to_string());
            continue;
        };
        match &parameter.kind {
            ParamKind::List(item) => {
                let entry = fields
                    .entry(tag.to_string())
                    .or_insert_with(|| JsonValue::Array(Vec::new()));
                if let JsonValue::Array(items) = entry {
                    items.push(field_value(item, content));
                }
            }
            kind => {
                fields.entry(tag.to_string()).or_insert_with(|| field_value(kind, content));
            }
        }
    }
    (fields, id)
}

fn next_field<'p>(body: &str, cursor: usize, parameters: &'p [ParameterSpec], read_id: bool) -> Option<(&'p str, usize)> {
    let mut from = cursor;
    while let Some(offset) = body[from..].find('<') {
        let start = from + offset;
        let candidates = parameters
            .iter()
            .map(|parameter| parameter.name.as_str())
            .chain(read_id.then_some(ID_TAG));
        for tag in candidates {
            if let Some(open_end) = opening_end(body, start, tag) {
                return Some((tag, open_end));
            }
        }
        from = start + 1;
    }
    None
}

fn field_value(kind: &ParamKind, content: &str) -> JsonValue {
    match kind {
        ParamKind::Object(children) => JsonValue::Object(parse_fields(content, children, false).0),
        ParamKind::List(item) => field_value(item, content),
        leaf => leaf.leaf_value(content),
    }
}
