use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Value as JsonValue, json};
use toolgate_protocol::openai::create_chat_completions::JsonObject;

use super::{RefineInput, Refinement, ToolAdapter, field_text, list_entries, string_record, with_array_property};
use crate::schema::ParserContext;
use crate::schema::section::label_block;

static SEARCH_REPLACE_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)[ \t]*------- SEARCH\n(.*?)\n[ \t]*=======\n(.*?)\n[ \t]*\+{7} REPLACE").expect("valid regex")
});
static MERGE_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<<<<<<< SEARCH\n:start_line:[ \t]*(.*?)\n-------\n(.*?)\n=======\n(.*?)\n>>>>>>> REPLACE")
        .expect("valid regex")
});
static MERGE_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^(<<<<<<< SEARCH|=======|>>>>>>> REPLACE)$").expect("valid regex"));

const DIFF: &str = "diff";
const SEARCH: &str = "SEARCH";
const REPLACE: &str = "REPLACE";
const START_LINE: &str = "start_line";

/// `replace_in_file`: `diff` as a list of `{SEARCH, REPLACE}` records.
pub struct ReplaceInFile;

impl ReplaceInFile {
    fn blocks(text: &str) -> Vec<(String, String)> {
        SEARCH_REPLACE_BLOCK
            .captures_iter(text)
            .map(|captures| (captures[1].to_string(), captures[2].to_string()))
            .collect()
    }
}

impl ToolAdapter for ReplaceInFile {
    fn tool_name(&self) -> &'static str {
        "replace_in_file"
    }

    fn refine(&self, input: &RefineInput<'_>) -> Option<Refinement> {
        let block = label_block(input.body, "Parameters:")?;
        let (search, replace) = Self::blocks(&block.text).into_iter().next()?;
        let items = string_record(&[(SEARCH, &search), (REPLACE, &replace)]);
        with_array_property(input.declaration, DIFF, items).map(Refinement::single)
    }

    fn to_native(&self, arguments: &JsonObject, _context: &ParserContext) -> Option<(String, JsonObject)> {
        let blocks = Self::blocks(arguments.get(DIFF)?.as_str()?);
        if blocks.is_empty() {
            return None;
        }
        let records = blocks
            .into_iter()
            .map(|(search, replace)| json!({ SEARCH: search, REPLACE: replace }))
            .collect();
        let mut arguments = arguments.clone();
        arguments.insert(DIFF.to_string(), JsonValue::Array(records));
        Some((self.tool_name().to_string(), arguments))
    }

    fn to_tagged(&self, arguments: &JsonObject) -> Option<JsonObject> {
        let entries = list_entries(arguments.get(DIFF)?)?;
        let text = entries
            .iter()
            .map(|entry| {
                format!(
                    "------- SEARCH\n{}\n=======\n{}\n+++++++ REPLACE",
                    field_text(entry, SEARCH),
                    field_text(entry, REPLACE)
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        let mut arguments = arguments.clone();
        arguments.insert(DIFF.to_string(), JsonValue::String(text));
        Some(arguments)
    }
}

/// `apply_diff`: `diff` as a list of `{start_line, SEARCH, REPLACE}` records.
pub struct ApplyDiff;

impl ApplyDiff {
    fn blocks(text: &str) -> Vec<[String; 3]> {
        MERGE_BLOCK
            .captures_iter(text)
            .map(|captures| {
                [
                    captures[1].trim().to_string(),
                    captures[2].to_string(),
                    captures[3].to_string(),
                ]
            })
            .collect()
    }

    fn escape_markers(text: &str) -> String {
        MERGE_MARKER.replace_all(text, r"\$1").into_owned()
    }
}

impl ToolAdapter for ApplyDiff {
    fn tool_name(&self) -> &'static str {
        "apply_diff"
    }

    fn refine(&self, input: &RefineInput<'_>) -> Option<Refinement> {
        let block = label_block(input.body, "Diff format:")?;
        let [start_line, search, replace] = Self::blocks(&block.text).into_iter().next()?;
        let items = string_record(&[(START_LINE, &start_line), (SEARCH, &search), (REPLACE, &replace)]);
        with_array_property(input.declaration, DIFF, items).map(Refinement::single)
    }

    fn to_native(&self, arguments: &JsonObject, _context: &ParserContext) -> Option<(String, JsonObject)> {
        let blocks = Self::blocks(arguments.get(DIFF)?.as_str()?);
        if blocks.is_empty() {
            return None;
        }
        let records = blocks
            .into_iter()
            .map(|[start_line, search, replace]| json!({ START_LINE: start_line, SEARCH: search, REPLACE: replace }))
            .collect();
        let mut arguments = arguments.clone();
        arguments.insert(DIFF.to_string(), JsonValue::Array(records));
        Some((self.tool_name().to_string(), arguments))
    }

    fn to_tagged(&self, arguments: &JsonObject) -> Option<JsonObject> {
        let entries = list_entries(arguments.get(DIFF)?)?;
        let text = entries
            .iter()
            .map(|entry| {
                let start_line = match entry.get(START_LINE) {
                    Some(value) if !value.is_null() => crate::codec::value_text(value),
                    _ => "0".to_string(),
                };
                format!(
                    "<<<<<<< SEARCH\n:start_line:{start_line}\n-------\n{}\n=======\n{}\n>>>>>>> REPLACE",
                    Self::escape_markers(&field_text(entry, SEARCH)),
                    Self::escape_markers(&field_text(entry, REPLACE))
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        let mut arguments = arguments.clone();
        arguments.insert(DIFF.to_string(), JsonValue::String(text));
        Some(arguments)
    }
}
