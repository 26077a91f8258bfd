//! Schema synthesis: tool definitions read from the client's system prompt, the
//! native declarations sent to the backend, and the prompt rewrite.

pub mod mcp;
pub(crate) mod section;
pub mod strict;

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use toolgate_protocol::openai::create_chat_completions::JsonObject;
use tracing::debug;

use crate::adapter::{self, mcp as mcp_adapter, RefineInput};
use crate::markup::{self, Element};

/// Paragraph inserted under the `# Tools` heading of rewritten prompts.
pub const NATIVE_CALLING_INSTRUCTION: &str = "Tools are available through native function calling. \
Call a tool by emitting a function call whose arguments match the declared JSON schema; \
do not write tool tags in your reply. The examples below show the name and arguments of such calls.";

#[derive(Debug, Clone, PartialEq)]
pub enum ParamKind {
    Text,
    Number,
    Boolean,
    Object(Vec<ParameterSpec>),
    List(Box<ParamKind>),
}

impl ParamKind {
    /// Kind of a sampled leaf: JSON number and boolean literals are typed, anything
    /// else is text.
    fn of_literal(text: &str) -> Self {
        match serde_json::from_str::<JsonValue>(text.trim()) {
            Ok(JsonValue::Number(_)) => ParamKind::Number,
            Ok(JsonValue::Bool(_)) => ParamKind::Boolean,
            _ => ParamKind::Text,
        }
    }

    /// JSON value of a leaf's text. Typed leaves whose text is not a literal of their
    /// type fall back to the string.
    pub(crate) fn leaf_value(&self, text: &str) -> JsonValue {
        let typed = match self {
            ParamKind::Number | ParamKind::Boolean => serde_json::from_str::<JsonValue>(text.trim()).ok(),
            _ => None,
        };
        match typed {
            Some(value @ JsonValue::Number(_)) if *self == ParamKind::Number => value,
            Some(value @ JsonValue::Bool(_)) if *self == ParamKind::Boolean => value,
            _ => JsonValue::String(text.to_string()),
        }
    }

    fn schema(&self) -> JsonValue {
        match self {
            ParamKind::Text => json!({ "type": "string" }),
            ParamKind::Number => json!({ "type": "number" }),
            ParamKind::Boolean => json!({ "type": "boolean" }),
            ParamKind::Object(children) => object_schema(children),
            ParamKind::List(item) => json!({ "type": "array", "items": item.schema() }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSpec {
    pub name: String,
    pub description: String,
    pub kind: ParamKind,
    pub required: bool,
}

impl ParameterSpec {
    pub fn text(name: impl Into<String>, description: impl Into<String>, required: bool) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            kind: ParamKind::Text,
            required,
        }
    }

    fn schema(&self) -> JsonValue {
        let mut schema = self.kind.schema();
        if let (false, JsonValue::Object(node)) = (self.description.is_empty(), &mut schema) {
            node.insert("description".to_string(), JsonValue::String(self.description.clone()));
        }
        schema
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ParameterSpec>,
}

impl ToolDefinition {
    pub fn parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|parameter| parameter.name == name)
    }

    pub fn parameters_schema(&self) -> JsonValue {
        object_schema(&self.parameters)
    }

    /// Arguments spelled out by a tag sample, shaped by the declared parameters.
    pub fn sample_arguments(&self, root: &Element) -> JsonObject {
        element_arguments(&self.parameters, root)
    }
}

/// Object schema with one property per parameter, in declaration order.
pub fn object_schema(parameters: &[ParameterSpec]) -> JsonValue {
    let properties: JsonObject = parameters
        .iter()
        .map(|parameter| (parameter.name.clone(), parameter.schema()))
        .collect();
    let required: Vec<&str> = parameters
        .iter()
        .filter(|parameter| parameter.required)
        .map(|parameter| parameter.name.as_str())
        .collect();
    json!({ "type": "object", "properties": properties, "required": required })
}

/// Backend-facing declaration, `{"type": "function", "function": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    #[serde(rename = "type")]
    pub r#type: String,
    pub function: FunctionDeclaration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub parameters: JsonValue,
    #[serde(default)]
    pub strict: bool,
}

impl ToolSchema {
    pub fn function(name: impl Into<String>, description: impl Into<String>, parameters: JsonValue) -> Self {
        Self {
            r#type: "function".to_string(),
            function: FunctionDeclaration {
                name: name.into(),
                description: description.into(),
                parameters,
                strict: false,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }

    pub fn property_mut(&mut self, name: &str) -> Option<&mut JsonObject> {
        self.function
            .parameters
            .get_mut("properties")?
            .get_mut(name)?
            .as_object_mut()
    }

    fn tighten(&mut self) {
        match strict::strictify(&self.function.parameters) {
            Ok(parameters) => {
                self.function.parameters = parameters;
                self.function.strict = true;
            }
            Err(error) => {
                debug!(tool = %self.function.name, %error, "declaration kept non-strict");
            }
        }
    }
}

/// MCP server tool a native declaration stands for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McpRoute {
    pub server: String,
    pub tool: String,
}

/// Per-request result of schema synthesis. Drives tag encoding and decoding for that
/// request only.
#[derive(Debug, Clone, Default)]
pub struct ParserContext {
    definitions: Vec<ToolDefinition>,
    schemas: Vec<ToolSchema>,
    routes: HashMap<String, McpRoute>,
    adapted: HashSet<String>,
}

impl ParserContext {
    /// Context with plain declarations for the given definitions, no adapters.
    pub fn from_definitions(definitions: Vec<ToolDefinition>, strict: bool) -> Self {
        let schemas = definitions
            .iter()
            .map(|definition| {
                let mut schema = ToolSchema::function(
                    &definition.name,
                    &definition.description,
                    definition.parameters_schema(),
                );
                if strict {
                    schema.tighten();
                }
                schema
            })
            .collect();
        Self {
            definitions,
            schemas,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty() && self.definitions.is_empty()
    }

    pub fn schemas(&self) -> &[ToolSchema] {
        &self.schemas
    }

    pub fn definitions(&self) -> &[ToolDefinition] {
        &self.definitions
    }

    pub fn definition(&self, name: &str) -> Option<&ToolDefinition> {
        self.definitions.iter().find(|definition| definition.name == name)
    }

    /// Declarations as raw JSON for the outgoing `tools` list.
    pub fn declarations(&self) -> Vec<JsonValue> {
        self.schemas
            .iter()
            .filter_map(|schema| serde_json::to_value(schema).ok())
            .collect()
    }

    pub fn route(&self, native_name: &str) -> Option<&McpRoute> {
        self.routes.get(native_name)
    }

    pub(crate) fn native_name_for(&self, server: &str, tool: &str) -> Option<&str> {
        self.routes
            .iter()
            .find(|(_, route)| route.server == server && route.tool == tool)
            .map(|(name, _)| name.as_str())
    }

    /// Tag-shaped call (as written by the client) to the shape the backend declared.
    pub fn native_form(&self, name: &str, arguments: JsonObject) -> (String, JsonObject) {
        if self.adapted.contains(name) {
            if let Some(native) = adapter::adapter_for(name).and_then(|adapter| adapter.to_native(&arguments, self)) {
                return native;
            }
        }
        (name.to_string(), arguments)
    }

    /// Native call (as produced by the backend) to the shape the client's tags use.
    pub fn tagged_form(&self, name: &str, arguments: JsonObject) -> (String, JsonObject) {
        if let Some(route) = self.routes.get(name) {
            return (mcp_adapter::TOOL_NAME.to_string(), mcp_adapter::tagged_arguments(route, &arguments));
        }
        match adapter::adapter_for(name).and_then(|adapter| adapter.to_tagged(&arguments)) {
            Some(tagged) => (name.to_string(), tagged),
            None => (name.to_string(), arguments),
        }
    }
}

/// Reads the tool catalogue from `prompt` and returns the per-request context with the
/// rewritten prompt. A prompt without a catalogue comes back unchanged.
pub fn synthesize(prompt: &str, strict: bool) -> (ParserContext, String) {
    let mut context = ParserContext::default();
    let Some(range) = section::tools_section(prompt) else {
        return (context, prompt.to_string());
    };
    let tools = section::split_tools(&prompt[range]);
    if tools.is_empty() {
        return (context, prompt.to_string());
    }

    let mut rewritten = prompt.to_string();
    let mut removals = Vec::new();
    for doc in &tools {
        let definition = build_definition(doc);
        let declaration = ToolSchema::function(
            &definition.name,
            &definition.description,
            definition.parameters_schema(),
        );
        let input = RefineInput {
            body: doc.body,
            prompt,
            declaration: &declaration,
        };
        let declarations = match adapter::adapter_for(doc.name).and_then(|adapter| adapter.refine(&input)) {
            Some(refinement) => {
                context.adapted.insert(definition.name.clone());
                context.routes.extend(refinement.routes);
                removals.extend(refinement.removals);
                refinement.declarations
            }
            None => vec![declaration],
        };
        for mut declaration in declarations {
            if strict {
                declaration.tighten();
            }
            context.schemas.push(declaration);
        }

        for sample in &doc.samples {
            let Some(root) = markup::parse_element(sample) else {
                continue;
            };
            let (name, arguments) = context.native_form(&definition.name, definition.sample_arguments(&root));
            if let Some(example) = json_example(&name, &arguments) {
                rewritten = rewritten.replace(sample, &example);
            }
        }
        context.definitions.push(definition);
    }

    for removal in removals.iter().filter(|removal| !removal.trim().is_empty()) {
        rewritten = rewritten.replace(removal.as_str(), "");
    }
    if let Some(range) = section::tools_section(&rewritten) {
        let stripped = section::strip_descriptive_blocks(&rewritten[range.clone()]);
        rewritten.replace_range(range, &stripped);
    }
    let rewritten = section::insert_after_tools_heading(&rewritten, NATIVE_CALLING_INSTRUCTION);

    debug!(
        event = "tools_synthesized",
        definitions = context.definitions.len(),
        declarations = context.schemas.len(),
        strict,
    );
    (context, rewritten)
}

fn build_definition(doc: &section::ToolDoc<'_>) -> ToolDefinition {
    let (descriptions, required) = section::bullet_index(&doc.bullets);
    let roots: Vec<Element> = doc
        .samples
        .iter()
        .filter_map(|sample| {
            let root = markup::parse_element(sample);
            if root.is_none() {
                debug!(tool = doc.name, "unreadable tool sample skipped");
            }
            root
        })
        .collect();

    let parameters = if !roots.is_empty() {
        parameters_from_samples(&roots, &descriptions, &required)
    } else if doc.samples.is_empty() {
        doc.bullets
            .iter()
            .map(|bullet| ParameterSpec::text(&bullet.name, &bullet.description, bullet.required))
            .collect()
    } else {
        Vec::new()
    };
    ToolDefinition {
        name: doc.name.to_string(),
        description: doc.description.clone(),
        parameters,
    }
}

type ChildKey = (Vec<String>, String);

#[derive(Default)]
struct SampleStats {
    children: HashMap<Vec<String>, Vec<String>>,
    max_count: HashMap<ChildKey, usize>,
    presence: HashMap<ChildKey, usize>,
    leaves: HashMap<Vec<String>, ParamKind>,
}

impl SampleStats {
    fn record(&mut self, element: &Element, path: &[String], seen: &mut HashSet<ChildKey>) {
        for (tag, members) in element.grouped_children() {
            let order = self.children.entry(path.to_vec()).or_default();
            if !order.iter().any(|known| known == tag) {
                order.push(tag.to_string());
            }
            let key = (path.to_vec(), tag.to_string());
            let max = self.max_count.entry(key.clone()).or_default();
            *max = (*max).max(members.len());
            if seen.insert(key.clone()) {
                *self.presence.entry(key).or_default() += 1;
            }
            let mut child_path = path.to_vec();
            child_path.push(tag.to_string());
            for member in members {
                let kind = ParamKind::of_literal(&member.text);
                self.leaves
                    .entry(child_path.clone())
                    .and_modify(|seen| {
                        if *seen != kind {
                            *seen = ParamKind::Text;
                        }
                    })
                    .or_insert(kind);
                self.record(member, &child_path, seen);
            }
        }
    }

    fn parameters(
        &self,
        path: &[String],
        samples: usize,
        descriptions: &HashMap<String, String>,
        required: &HashSet<String>,
    ) -> Vec<ParameterSpec> {
        let Some(children) = self.children.get(path) else {
            return Vec::new();
        };
        children
            .iter()
            .map(|child| {
                let mut child_path = path.to_vec();
                child_path.push(child.clone());
                let key = (path.to_vec(), child.clone());
                let mut kind = if self.children.get(&child_path).is_some_and(|nested| !nested.is_empty()) {
                    ParamKind::Object(self.parameters(&child_path, samples, descriptions, required))
                } else {
                    self.leaves.get(&child_path).cloned().unwrap_or(ParamKind::Text)
                };
                if self.max_count.get(&key).copied().unwrap_or_default() > 1 {
                    kind = ParamKind::List(Box::new(kind));
                }
                let lower = child.to_lowercase();
                let present_everywhere = self.presence.get(&key).copied().unwrap_or_default() >= samples;
                ParameterSpec {
                    name: child.clone(),
                    description: descriptions.get(&lower).cloned().unwrap_or_default(),
                    kind,
                    required: present_everywhere && required.contains(&lower),
                }
            })
            .collect()
    }
}

/// Child elements become objects, repeated children become arrays. Leaves are text
/// unless every sample spells them as a number or every sample as a boolean.
/// A parameter is required when the bullets mark it so and every sample has it.
fn parameters_from_samples(
    roots: &[Element],
    descriptions: &HashMap<String, String>,
    required: &HashSet<String>,
) -> Vec<ParameterSpec> {
    let mut stats = SampleStats::default();
    for root in roots {
        let mut seen = HashSet::new();
        stats.record(root, &[], &mut seen);
    }
    stats.parameters(&[], roots.len(), descriptions, required)
}

fn element_arguments(parameters: &[ParameterSpec], element: &Element) -> JsonObject {
    let mut arguments = JsonObject::new();
    for (tag, members) in element.grouped_children() {
        let (Some(parameter), Some(first)) = (parameters.iter().find(|p| p.name == tag), members.first()) else {
            continue;
        };
        let value = match &parameter.kind {
            ParamKind::List(item) => JsonValue::Array(members.iter().map(|member| element_value(item, member)).collect()),
            kind => element_value(kind, first),
        };
        arguments.insert(tag.to_string(), value);
    }
    arguments
}

fn element_value(kind: &ParamKind, element: &Element) -> JsonValue {
    match kind {
        ParamKind::Object(children) => JsonValue::Object(element_arguments(children, element)),
        ParamKind::List(item) => element_value(item, element),
        leaf => leaf.leaf_value(&element.text),
    }
}

fn json_example(name: &str, arguments: &JsonObject) -> Option<String> {
    let arguments = serde_json::to_string(arguments).ok()?;
    serde_json::to_string_pretty(&json!({ "name": name, "arguments": arguments })).ok()
}
