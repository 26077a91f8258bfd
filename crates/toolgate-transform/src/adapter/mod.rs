//! Per-tool adapters that give selected client tools a richer native declaration and
//! convert their argument shapes between the tagged and native forms.

pub mod diff;
pub mod mcp;
pub mod todo;

use serde_json::{Value as JsonValue, json};
use toolgate_protocol::openai::create_chat_completions::JsonObject;

use crate::schema::{McpRoute, ParserContext, ToolSchema};

pub use diff::{ApplyDiff, ReplaceInFile};
pub use mcp::UseMcpTool;
pub use todo::UpdateTodoList;

pub struct RefineInput<'a> {
    /// The tool's own entry in the catalogue.
    pub body: &'a str,
    /// The whole system prompt.
    pub prompt: &'a str,
    /// Declaration synthesized from the tool's samples.
    pub declaration: &'a ToolSchema,
}

#[derive(Debug, Clone, Default)]
pub struct Refinement {
    /// Declarations replacing the synthesized one.
    pub declarations: Vec<ToolSchema>,
    /// Prompt text made redundant by the declarations.
    pub removals: Vec<String>,
    pub routes: Vec<(String, McpRoute)>,
}

impl Refinement {
    pub fn single(declaration: ToolSchema) -> Self {
        Self {
            declarations: vec![declaration],
            ..Self::default()
        }
    }
}

/// Every method returns `None` when its input does not have the expected shape; the
/// caller then keeps the unmodified declaration or arguments.
pub trait ToolAdapter: Send + Sync {
    fn tool_name(&self) -> &'static str;

    fn refine(&self, input: &RefineInput<'_>) -> Option<Refinement>;

    /// Tagged arguments to the native call name and arguments.
    fn to_native(&self, arguments: &JsonObject, context: &ParserContext) -> Option<(String, JsonObject)>;

    /// Native arguments to the tagged shape.
    fn to_tagged(&self, arguments: &JsonObject) -> Option<JsonObject>;
}

static ADAPTERS: &[&dyn ToolAdapter] = &[&ReplaceInFile, &ApplyDiff, &UpdateTodoList, &UseMcpTool];

pub fn adapters() -> &'static [&'static dyn ToolAdapter] {
    ADAPTERS
}

pub fn adapter_for(tool: &str) -> Option<&'static dyn ToolAdapter> {
    ADAPTERS.iter().copied().find(|adapter| adapter.tool_name() == tool)
}

/// Copy of `declaration` whose `property` becomes an array of `items`.
pub(crate) fn with_array_property(declaration: &ToolSchema, property: &str, items: JsonValue) -> Option<ToolSchema> {
    let mut declaration = declaration.clone();
    let node = declaration.property_mut(property)?;
    node.insert("type".to_string(), json!("array"));
    node.insert("items".to_string(), items);
    Some(declaration)
}

/// Object schema of string properties, all required, with example text as descriptions.
pub(crate) fn string_record(fields: &[(&str, &str)]) -> JsonValue {
    let properties: JsonObject = fields
        .iter()
        .map(|(name, example)| {
            (
                (*name).to_string(),
                json!({ "type": "string", "description": example.trim() }),
            )
        })
        .collect();
    let required: Vec<&str> = fields.iter().map(|(name, _)| *name).collect();
    json!({ "type": "object", "properties": properties, "required": required })
}

/// Entries of a native list argument; a single object counts as one entry and a
/// string means the argument is already in tagged form.
pub(crate) fn list_entries(value: &JsonValue) -> Option<Vec<&JsonObject>> {
    match value {
        JsonValue::String(_) => None,
        JsonValue::Array(items) => Some(items.iter().filter_map(JsonValue::as_object).collect()),
        JsonValue::Object(entry) => Some(vec![entry]),
        _ => None,
    }
}

pub(crate) fn field_text(entry: &JsonObject, field: &str) -> String {
    entry.get(field).map(crate::codec::value_text).unwrap_or_default()
}
