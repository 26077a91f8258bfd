use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use toolgate_transform::PrepareOptions;

pub const DEFAULT_TARGET_BASE_URL: &str = "https://api.openai.com/v1";

/// Process-wide runtime settings. Requests read one immutable snapshot at entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub target_base_url: String,
    pub message_dump_path: Option<PathBuf>,
    pub tool_dump_path: Option<PathBuf>,
    pub disable_strict_schemas: bool,
    pub force_tool_calling: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            target_base_url: DEFAULT_TARGET_BASE_URL.to_string(),
            message_dump_path: None,
            tool_dump_path: None,
            disable_strict_schemas: false,
            force_tool_calling: false,
        }
    }
}

impl GatewayConfig {
    pub fn prepare_options(&self) -> PrepareOptions {
        PrepareOptions {
            strict: !self.disable_strict_schemas,
            force_tool_calling: self.force_tool_calling,
        }
    }

    /// `endpoint("chat/completions")` against the configured base URL.
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.target_base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigUpdateError {
    #[error("unknown config field `{0}`")]
    UnknownField(String),
    #[error("invalid config: {0}")]
    Invalid(#[from] serde_json::Error),
}

#[derive(Debug)]
pub struct ConfigStore {
    current: ArcSwap<GatewayConfig>,
}

impl ConfigStore {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            current: ArcSwap::from_pointee(config),
        }
    }

    pub fn snapshot(&self) -> Arc<GatewayConfig> {
        self.current.load_full()
    }

    /// Merges the given fields over the current snapshot and publishes the result.
    /// Requests already in flight keep the snapshot they started with.
    pub fn update(&self, patch: Map<String, JsonValue>) -> Result<Arc<GatewayConfig>, ConfigUpdateError> {
        let current = self.snapshot();
        let mut merged = match serde_json::to_value(current.as_ref())? {
            JsonValue::Object(fields) => fields,
            _ => Map::new(),
        };
        for (key, value) in patch {
            let Some(slot) = merged.get_mut(&key) else {
                return Err(ConfigUpdateError::UnknownField(key));
            };
            *slot = value;
        }
        let next: GatewayConfig = serde_json::from_value(JsonValue::Object(merged))?;
        let next = Arc::new(next);
        self.current.store(Arc::clone(&next));
        tracing::info!(
            event = "config_updated",
            target_base_url = %next.target_base_url,
            disable_strict_schemas = next.disable_strict_schemas,
            force_tool_calling = next.force_tool_calling
        );
        Ok(next)
    }
}
