pub mod types;
pub mod request;
pub mod response;
pub mod stream;

pub use request::CreateChatCompletionRequest;
pub use response::{ChatCompletionChoice, CreateChatCompletionResponse};
pub use stream::{
    ChatCompletionStreamChoice, ChatCompletionStreamDelta, CreateChatCompletionStreamResponse,
    FunctionCallDelta, ToolCallDelta,
};
pub use types::*;
