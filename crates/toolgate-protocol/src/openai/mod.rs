pub mod create_chat_completions;
pub mod create_completion;
