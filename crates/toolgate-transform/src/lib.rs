//! Tool-call protocol translation between clients that embed tool calls as tagged
//! text and backends that speak native structured tool calling.
//!
//! Outbound, [`request::prepare_chat_request`] synthesizes tool declarations from the
//! system prompt, turns tagged calls in the history into `tool_calls`, and applies the
//! replacement rules. Inbound, [`messages::to_client_response`] and
//! [`stream::ChatStreamReconstructor`] fold native calls back into tagged text.

pub mod adapter;
pub mod codec;
pub mod error;
pub mod markup;
pub mod messages;
pub mod replacement;
pub mod request;
pub mod schema;
pub mod stream;

pub use codec::{decode_calls, encode_call, DecodedCall, DecodedText};
pub use error::{SettingsError, StreamError};
pub use replacement::{CompletionTransform, ReplacementPipeline, ReplacementRule};
pub use request::{prepare_chat_request, prepare_completion_request, ChatPreparation, PrepareOptions};
pub use schema::{synthesize, ParamKind, ParameterSpec, ParserContext, ToolDefinition, ToolSchema};
pub use stream::{ChatStreamReconstructor, LegacyStreamReconstructor};
