use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value as JsonValue;

use super::{ReplacementPipeline, ReplacementRule};
use crate::error::SettingsError;

/// Files looked up in the working directory when no settings path is given, in order.
pub const DEFAULT_SETTINGS_FILES: &[&str] = &["setting.yaml", "setting.json"];

/// One entry of `additional_replacement`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RuleSettings {
    #[serde(default)]
    pub name: Option<String>,
    pub role: String,
    #[serde(default)]
    pub trigger: Option<String>,
    pub pattern: String,
    #[serde(default)]
    pub replace: Option<String>,
    #[serde(default, rename = "ref")]
    pub refs: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    #[serde(default)]
    additional_replacement: Vec<RuleSettings>,
}

/// Reads and compiles every rule of a settings file. YAML and TOML files use the list
/// form; JSON files may also use the older `{role: {pattern: replace}}` map form.
pub fn load_rules(path: &Path) -> Result<Vec<ReplacementRule>, SettingsError> {
    let entries = if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
        read_json(path)?
    } else {
        config::Config::builder()
            .add_source(config::File::from(path))
            .build()
            .and_then(|settings| settings.try_deserialize::<SettingsFile>())
            .map_err(|source| SettingsError::Load {
                path: path.to_path_buf(),
                source,
            })?
            .additional_replacement
    };
    entries
        .into_iter()
        .enumerate()
        .map(|(position, entry)| ReplacementRule::new(entry, position))
        .collect()
}

fn read_json(path: &Path) -> Result<Vec<RuleSettings>, SettingsError> {
    let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let legacy_error = |source| SettingsError::LegacyJson {
        path: path.to_path_buf(),
        source,
    };
    let document: JsonValue = serde_json::from_str(&text).map_err(legacy_error)?;
    match document.get("additional_replacement") {
        Some(JsonValue::Object(by_role)) => {
            let mut entries = Vec::new();
            for (role, rules) in by_role {
                let rules: serde_json::Map<String, JsonValue> =
                    serde_json::from_value(rules.clone()).map_err(legacy_error)?;
                for (pattern, replace) in rules {
                    entries.push(RuleSettings {
                        name: None,
                        role: role.clone(),
                        trigger: None,
                        pattern,
                        replace: Some(crate::codec::value_text(&replace)),
                        refs: Vec::new(),
                    });
                }
            }
            Ok(entries)
        }
        _ => Ok(serde_json::from_value::<SettingsFile>(document)
            .map_err(legacy_error)?
            .additional_replacement),
    }
}

/// Loads the pipeline from `explicit`, or from the first default file present in
/// `dir`. No settings file means no rules.
pub fn load_pipeline(explicit: Option<&Path>, dir: &Path) -> Result<ReplacementPipeline, SettingsError> {
    let path: Option<PathBuf> = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => DEFAULT_SETTINGS_FILES
            .iter()
            .map(|name| dir.join(name))
            .find(|candidate| candidate.is_file()),
    };
    let Some(path) = path else {
        return Ok(ReplacementPipeline::default());
    };
    let rules = load_rules(&path)?;
    tracing::info!(
        event = "replacement_rules_loaded",
        path = %path.display(),
        rules = rules.len()
    );
    Ok(ReplacementPipeline::new(rules))
}
