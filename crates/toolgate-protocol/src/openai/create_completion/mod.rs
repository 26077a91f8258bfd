pub mod request;
pub mod response;

pub use request::{CreateCompletionRequest, Prompt};
pub use response::{CompletionChoice, CreateCompletionResponse};
