//! Tightening of parameter schemas into the closed shape strict function calling
//! expects: every property required, no additional properties, optional properties
//! made nullable.

use std::collections::HashSet;

use serde_json::{json, Value as JsonValue};

use crate::error::StrictSchemaError;

const UNSUPPORTED_KEYWORDS: &[&str] = &[
    "allOf",
    "not",
    "dependentRequired",
    "dependentSchemas",
    "if",
    "then",
    "else",
    "$anchor",
    "$dynamicAnchor",
    "$dynamicRef",
    "$id",
    "patternProperties",
    "prefixItems",
    "unevaluatedItems",
    "unevaluatedProperties",
];

/// Returns a strict copy of `schema`. Local `$ref`s (`#/...`) are followed and the
/// referenced definition is tightened once, in place.
pub fn strictify(schema: &JsonValue) -> Result<JsonValue, StrictSchemaError> {
    let mut root = schema.clone();
    let mut visited = HashSet::new();
    tighten(&mut root, String::new(), &mut visited)?;
    Ok(root)
}

fn tighten(root: &mut JsonValue, pointer: String, visited: &mut HashSet<String>) -> Result<(), StrictSchemaError> {
    let Some(node) = root.pointer(&pointer) else {
        return Ok(());
    };
    let Some(object) = node.as_object() else {
        return Ok(());
    };
    if let Some(keyword) = UNSUPPORTED_KEYWORDS.iter().find(|keyword| object.contains_key(**keyword)) {
        return Err(StrictSchemaError::UnsupportedKeyword((*keyword).to_string()));
    }
    if let Some(reference) = object.get("$ref").and_then(JsonValue::as_str) {
        let Some(target) = reference.strip_prefix('#') else {
            return Err(StrictSchemaError::UnsupportedRef(reference.to_string()));
        };
        if !target.is_empty() && !target.starts_with('/') {
            return Err(StrictSchemaError::UnsupportedRef(reference.to_string()));
        }
        if !visited.insert(target.to_string()) {
            return Ok(());
        }
        if root.pointer(target).is_none() {
            return Err(StrictSchemaError::UnresolvedRef(reference.to_string()));
        }
        let target = target.to_string();
        return tighten(root, target, visited);
    }

    let mut branches = Vec::new();
    for keyword in ["anyOf", "oneOf"] {
        if let Some(JsonValue::Array(items)) = object.get(keyword) {
            branches.extend((0..items.len()).map(|index| format!("{pointer}/{keyword}/{index}")));
        }
    }
    let types = type_names(object.get("type"));
    let properties: Vec<String> = object
        .get("properties")
        .and_then(JsonValue::as_object)
        .map(|properties| properties.keys().cloned().collect())
        .unwrap_or_default();
    let originally_required: HashSet<String> = object
        .get("required")
        .and_then(JsonValue::as_array)
        .map(|required| required.iter().filter_map(JsonValue::as_str).map(str::to_string).collect())
        .unwrap_or_default();
    let item_pointer = ["items", "contains"]
        .into_iter()
        .find(|keyword| object.contains_key(*keyword))
        .map(|keyword| format!("{pointer}/{keyword}"));

    for branch in branches {
        tighten(root, branch, visited)?;
    }

    if types.iter().any(|kind| kind == "object") {
        if let Some(JsonValue::Object(node)) = root.pointer_mut(&pointer) {
            node.insert("required".to_string(), json!(properties));
            node.insert("additionalProperties".to_string(), JsonValue::Bool(false));
        }
        for name in &properties {
            let property = format!("{pointer}/properties/{}", escape_token(name));
            if !originally_required.contains(name) {
                if let Some(schema) = root.pointer_mut(&property) {
                    make_nullable(schema);
                }
            }
            tighten(root, property, visited)?;
        }
    }

    if types.iter().any(|kind| kind == "array") {
        if let Some(items) = item_pointer {
            tighten(root, items, visited)?;
        }
    }
    Ok(())
}

fn make_nullable(schema: &mut JsonValue) {
    let Some(object) = schema.as_object_mut() else {
        return;
    };
    if let Some(kind) = object.get("type") {
        let mut types = type_names(Some(kind));
        if !types.iter().any(|name| name == "null") {
            types.push("null".to_string());
            object.insert("type".to_string(), json!(types));
        }
    }
    for keyword in ["anyOf", "oneOf"] {
        let Some(branches) = object.get_mut(keyword) else {
            continue;
        };
        if !branches.is_array() {
            *branches = JsonValue::Array(vec![branches.take()]);
        }
        if let JsonValue::Array(items) = branches {
            let nullable = items
                .iter()
                .any(|item| type_names(item.get("type")).iter().any(|name| name == "null"));
            if !nullable {
                items.push(json!({ "type": "null" }));
            }
        }
    }
}

fn type_names(kind: Option<&JsonValue>) -> Vec<String> {
    match kind {
        Some(JsonValue::String(name)) => vec![name.clone()],
        Some(JsonValue::Array(names)) => names.iter().filter_map(JsonValue::as_str).map(str::to_string).collect(),
        _ => Vec::new(),
    }
}

fn escape_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}
