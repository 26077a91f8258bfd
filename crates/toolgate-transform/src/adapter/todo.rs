use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Value as JsonValue, json};
use toolgate_protocol::openai::create_chat_completions::JsonObject;

use super::{RefineInput, Refinement, ToolAdapter, field_text, list_entries, string_record, with_array_property};
use crate::schema::ParserContext;
use crate::schema::section::label_block;

static TODO_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\[([^\]\n]+)\][ \t]*(.+?)\r?$").expect("valid regex"));

const TODOS: &str = "todos";
const TODO: &str = "todo";
const STATUS: &str = "status";

/// `update_todo_list`: `todos` as a required list of `{todo, status}` records.
pub struct UpdateTodoList;

impl UpdateTodoList {
    fn items(text: &str) -> Vec<(String, String)> {
        TODO_LINE
            .captures_iter(text)
            .map(|captures| (captures[2].to_string(), captures[1].to_string()))
            .collect()
    }
}

impl ToolAdapter for UpdateTodoList {
    fn tool_name(&self) -> &'static str {
        "update_todo_list"
    }

    fn refine(&self, input: &RefineInput<'_>) -> Option<Refinement> {
        let (todo, status) = ["Usage Example:", "Usage:", "Example:"]
            .into_iter()
            .filter_map(|label| label_block(input.body, label))
            .find_map(|block| Self::items(&block.text).into_iter().next())?;
        let items = string_record(&[(TODO, &todo), (STATUS, &status)]);
        let mut declaration = with_array_property(input.declaration, TODOS, items)?;
        if let JsonValue::Object(parameters) = &mut declaration.function.parameters {
            let required = parameters.entry("required").or_insert_with(|| json!([]));
            if let JsonValue::Array(required) = required {
                if !required.iter().any(|name| name == TODOS) {
                    required.push(json!(TODOS));
                }
            }
        }
        Some(Refinement::single(declaration))
    }

    fn to_native(&self, arguments: &JsonObject, _context: &ParserContext) -> Option<(String, JsonObject)> {
        let items = Self::items(arguments.get(TODOS)?.as_str()?);
        if items.is_empty() {
            return None;
        }
        let records = items
            .into_iter()
            .map(|(todo, status)| json!({ TODO: todo, STATUS: status }))
            .collect();
        let mut arguments = arguments.clone();
        arguments.insert(TODOS.to_string(), JsonValue::Array(records));
        Some((self.tool_name().to_string(), arguments))
    }

    fn to_tagged(&self, arguments: &JsonObject) -> Option<JsonObject> {
        let entries = list_entries(arguments.get(TODOS)?)?;
        let lines = entries
            .iter()
            .map(|entry| {
                let raw = field_text(entry, STATUS);
                let status = raw.strip_prefix('[').unwrap_or(&raw);
                let status = status.strip_suffix(']').unwrap_or(status);
                let status = if status.is_empty() { " " } else { status };
                format!("[{status}] {}", field_text(entry, TODO).replace('\n', " "))
            })
            .collect::<Vec<_>>()
            .join("\n");
        let mut arguments = arguments.clone();
        arguments.insert(TODOS.to_string(), JsonValue::String(lines));
        Some(arguments)
    }
}
