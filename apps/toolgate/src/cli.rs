use std::path::PathBuf;

use clap::Parser;
use clap::builder::FalseyValueParser;
use toolgate_core::GatewayConfig;
use toolgate_core::config::DEFAULT_TARGET_BASE_URL;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "toolgate",
    version,
    about = "Serves tagged-text tool calling clients from a native tool-calling backend"
)]
pub struct Cli {
    #[arg(long, env = "TOOL_CALL_ADAPTER_HOST", default_value = "0.0.0.0")]
    pub host: String,
    #[arg(long, env = "TOOL_CALL_ADAPTER_PORT", default_value_t = 8000)]
    pub port: u16,
    /// Base URL of the OpenAI-compatible backend, including the version segment.
    #[arg(long, env = "TARGET_BASE_URL", default_value = DEFAULT_TARGET_BASE_URL)]
    pub target_base_url: String,
    /// Write the outgoing messages (or legacy prompt) of every request here.
    #[arg(long, env = "MESSAGE_DUMP_PATH")]
    pub message_dump_path: Option<PathBuf>,
    /// Write the outgoing tool declarations of every request here.
    #[arg(long, env = "TOOL_DUMP_PATH")]
    pub tool_dump_path: Option<PathBuf>,
    /// Boolean switches read from the environment treat any value other than an
    /// empty string, `0`, `false`, `no` or `off` as set.
    #[arg(long, env = "DISABLE_STRICT_SCHEMAS", value_parser = FalseyValueParser::new())]
    pub disable_strict_schemas: bool,
    #[arg(long, env = "FORCE_TOOL_CALLING", value_parser = FalseyValueParser::new())]
    pub force_tool_calling: bool,
    /// Replacement rules file. Defaults to setting.yaml, then setting.json, in the
    /// working directory.
    #[arg(long, env = "TOOLGATE_SETTINGS")]
    pub settings: Option<PathBuf>,
    #[arg(long, env = "TOOLGATE_LOG_JSON", value_parser = FalseyValueParser::new())]
    pub log_json: bool,
}

impl Cli {
    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            target_base_url: self.target_base_url.clone(),
            message_dump_path: self.message_dump_path.clone(),
            tool_dump_path: self.tool_dump_path.clone(),
            disable_strict_schemas: self.disable_strict_schemas,
            force_tool_calling: self.force_tool_calling,
        }
    }
}
