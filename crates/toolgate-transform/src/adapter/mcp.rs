use serde_json::{Value as JsonValue, json};
use toolgate_protocol::openai::create_chat_completions::JsonObject;

use super::{RefineInput, Refinement, ToolAdapter};
use crate::schema::mcp::parse_catalogue;
use crate::schema::{McpRoute, ParserContext, ToolSchema};

pub const TOOL_NAME: &str = "use_mcp_tool";

const SERVER_NAME: &str = "server_name";
const MCP_TOOL_NAME: &str = "tool_name";
const ARGUMENTS: &str = "arguments";

/// `use_mcp_tool`: one native declaration per tool of every connected MCP server.
pub struct UseMcpTool;

/// `use_mcp_tool__<server>__<tool>`, restricted to `[A-Za-z0-9_-]`.
pub fn native_tool_name(server: &str, tool: &str) -> String {
    format!("{TOOL_NAME}__{server}__{tool}")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

/// Generic `use_mcp_tool` arguments for a call to a routed native tool.
pub fn tagged_arguments(route: &McpRoute, arguments: &JsonObject) -> JsonObject {
    let mut tagged = JsonObject::new();
    tagged.insert(SERVER_NAME.to_string(), json!(route.server));
    tagged.insert(MCP_TOOL_NAME.to_string(), json!(route.tool));
    let inner = serde_json::to_string(arguments).unwrap_or_else(|_| "{}".to_string());
    tagged.insert(ARGUMENTS.to_string(), JsonValue::String(inner));
    tagged
}

impl ToolAdapter for UseMcpTool {
    fn tool_name(&self) -> &'static str {
        TOOL_NAME
    }

    fn refine(&self, input: &RefineInput<'_>) -> Option<Refinement> {
        let catalogue = parse_catalogue(input.prompt);
        if catalogue.tools.is_empty() {
            return None;
        }
        let mut refinement = Refinement {
            removals: catalogue.listings,
            ..Refinement::default()
        };
        for tool in catalogue.tools {
            let name = native_tool_name(&tool.server, &tool.tool);
            let mut parameters = tool.input_schema;
            if let JsonValue::Object(schema) = &mut parameters {
                schema.entry("type").or_insert_with(|| json!("object"));
                schema.entry("properties").or_insert_with(|| json!({}));
            }
            refinement
                .declarations
                .push(ToolSchema::function(&name, tool.description, parameters));
            refinement.routes.push((
                name,
                McpRoute {
                    server: tool.server,
                    tool: tool.tool,
                },
            ));
        }
        Some(refinement)
    }

    fn to_native(&self, arguments: &JsonObject, context: &ParserContext) -> Option<(String, JsonObject)> {
        let server = arguments.get(SERVER_NAME)?.as_str()?.trim();
        let tool = arguments.get(MCP_TOOL_NAME)?.as_str()?.trim();
        let inner = match arguments.get(ARGUMENTS)? {
            JsonValue::String(text) => serde_json::from_str::<JsonObject>(text.trim()).ok()?,
            JsonValue::Object(object) => object.clone(),
            _ => return None,
        };
        let name = context.native_name_for(server, tool)?;
        Some((name.to_string(), inner))
    }

    fn to_tagged(&self, _arguments: &JsonObject) -> Option<JsonObject> {
        None
    }
}
