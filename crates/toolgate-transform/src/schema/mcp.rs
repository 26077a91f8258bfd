//! The `# Connected MCP Servers` listing clients append to their prompt.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value as JsonValue;

static SECTION_HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^#\s+Connected MCP Servers[ \t]*\r?\n").expect("valid regex"));
static SECTION_END: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(?:## Creating an MCP Server|====[ \t]*\r?$)").expect("valid regex")
});
static SERVER_HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^##\s+([^(\n]+?)(?:\s+\(`([^`\n]+)`\))?[ \t]*\r?$").expect("valid regex")
});
static AVAILABLE_TOOLS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^### Available Tools[ \t]*\r?\n").expect("valid regex"));
static LISTING_END: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^### (?:Resource Templates|Direct Resources)[ \t]*\r?$").expect("valid regex")
});
static TOOL_ENTRY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^-\s+([^:\n]+):\s+([\s\S]+?)\r?\n\s+Input Schema:[ \t]*\r?\n").expect("valid regex")
});

#[derive(Debug, Clone, PartialEq)]
pub struct McpTool {
    pub server: String,
    pub tool: String,
    pub description: String,
    pub input_schema: JsonValue,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct McpCatalogue {
    pub tools: Vec<McpTool>,
    /// `### Available Tools` listings, removed from the prompt once declared natively.
    pub listings: Vec<String>,
}

pub fn parse_catalogue(prompt: &str) -> McpCatalogue {
    let mut catalogue = McpCatalogue::default();
    let Some(heading) = SECTION_HEADING.find(prompt) else {
        return catalogue;
    };
    let rest = &prompt[heading.end()..];
    let section = SECTION_END.find(rest).map(|end| &rest[..end.start()]).unwrap_or(rest);

    let servers: Vec<_> = SERVER_HEADING.captures_iter(section).collect();
    for (position, captures) in servers.iter().enumerate() {
        let (Some(whole), Some(server)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        let end = servers
            .get(position + 1)
            .and_then(|next| next.get(0))
            .map(|next| next.start())
            .unwrap_or(section.len());
        let body = &section[whole.end()..end];
        let Some(listing_start) = AVAILABLE_TOOLS.find_iter(body).last().map(|found| found.end()) else {
            continue;
        };
        let listing = &body[listing_start..];
        let listing = LISTING_END
            .find(listing)
            .map(|end| &listing[..end.start()])
            .unwrap_or(listing);
        catalogue.tools.extend(parse_listing(server.as_str().trim(), listing));
        catalogue.listings.push(listing.to_string());
    }
    catalogue
}

fn parse_listing(server: &str, listing: &str) -> Vec<McpTool> {
    let mut tools = Vec::new();
    for captures in TOOL_ENTRY.captures_iter(listing) {
        let (Some(whole), Some(name), Some(description)) = (captures.get(0), captures.get(1), captures.get(2))
        else {
            continue;
        };
        let mut values = serde_json::Deserializer::from_str(&listing[whole.end()..]).into_iter::<JsonValue>();
        let Some(Ok(input_schema @ JsonValue::Object(_))) = values.next() else {
            tracing::debug!(server, tool = name.as_str(), "mcp tool without a readable input schema");
            continue;
        };
        tools.push(McpTool {
            server: server.to_string(),
            tool: name.as_str().trim().to_string(),
            description: description.as_str().trim().to_string(),
            input_schema,
        });
    }
    tools
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const PROMPT: &str = "# Tools\n\n## use_mcp_tool\n...\n\n# Connected MCP Servers\n\nWhen a server is connected...\n\n## weather (`npx weather-server`)\n\n### Available Tools\n- get_forecast: Get the forecast\n    for a city.\n    Input Schema:\n    {\n      \"type\": \"object\",\n      \"properties\": { \"city\": { \"type\": \"string\" } },\n      \"required\": [\"city\"]\n    }\n\n- ping: Liveness check\n    Input Schema:\n    { \"type\": \"object\", \"properties\": {} }\n\n### Resource Templates\n- weather://{city}\n\n====\n\nCAPABILITIES\n";

    #[test]
    fn reads_servers_tools_and_schemas() {
        let catalogue = parse_catalogue(PROMPT);
        assert_eq!(catalogue.tools.len(), 2);
        let forecast = &catalogue.tools[0];
        assert_eq!(forecast.server, "weather");
        assert_eq!(forecast.tool, "get_forecast");
        assert_eq!(forecast.description, "Get the forecast\n    for a city.");
        assert_eq!(forecast.input_schema["required"], json!(["city"]));
        assert_eq!(catalogue.tools[1].tool, "ping");
        assert_eq!(catalogue.listings.len(), 1);
        assert!(catalogue.listings[0].starts_with("- get_forecast"));
        assert!(!catalogue.listings[0].contains("Resource Templates"));
    }

    #[test]
    fn missing_section_yields_empty_catalogue() {
        assert_eq!(parse_catalogue("# Tools\n## a\n"), McpCatalogue::default());
    }
}
