//! Per-request state machines that re-frame a streamed backend response for the client.
//!
//! Both reconstructors consume one upstream line at a time and return the frames to
//! send downstream for it. They never see the transport; cancellation and upstream
//! errors are handled by whoever drives them.

pub mod chat;
pub mod legacy;

pub use chat::{CallFragment, ChatStreamReconstructor};
pub use legacy::LegacyStreamReconstructor;

use serde::de::DeserializeOwned;

use crate::error::StreamError;

fn decode_event<T: DeserializeOwned>(payload: &str) -> Result<T, StreamError> {
    serde_json::from_str(payload).map_err(|source| StreamError::Decode {
        payload: payload.to_string(),
        source,
    })
}
