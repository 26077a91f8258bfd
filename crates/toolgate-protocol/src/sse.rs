use bytes::Bytes;
use serde::Serialize;

pub const DATA_PREFIX: &str = "data: ";
pub const DONE_PAYLOAD: &str = "[DONE]";

/// One upstream line, classified by what the gateway does with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseLine {
    /// `data: <payload>` carrying a JSON event.
    Data(String),
    /// The terminal sentinel, kept literally so it can be forwarded unchanged.
    Done(String),
    /// Comments, `event:` fields, blank separators.
    Ignored,
}

pub fn classify_line(line: &str) -> SseLine {
    let line = line.trim_end_matches(['\r', '\n']);
    let Some(payload) = line.strip_prefix("data:") else {
        return SseLine::Ignored;
    };
    let payload = payload.trim();
    if payload == DONE_PAYLOAD {
        return SseLine::Done(line.to_string());
    }
    SseLine::Data(payload.to_string())
}

/// Splits a byte stream into lines. Bytes are buffered until a newline so multi-byte
/// characters split across network reads stay intact.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]);
            lines.push(text.trim_end_matches('\r').to_string());
        }
        lines
    }

    /// Returns the trailing line when the stream ended without a final newline.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        let text = String::from_utf8_lossy(&rest);
        Some(text.trim_end_matches('\r').to_string())
    }
}

pub fn json_frame<T: Serialize>(value: &T) -> Option<Bytes> {
    let payload = serde_json::to_vec(value).ok()?;
    Some(wrap_payload(&payload))
}

/// Frames an arbitrary payload (e.g. an upstream error body) as one data event.
pub fn raw_frame(payload: &str) -> Bytes {
    wrap_payload(payload.as_bytes())
}

/// Re-emits a terminal sentinel line exactly as the backend sent it.
pub fn done_frame(literal: &str) -> Bytes {
    let mut data = Vec::with_capacity(literal.len() + 2);
    data.extend_from_slice(literal.as_bytes());
    data.extend_from_slice(b"\n\n");
    Bytes::from(data)
}

pub fn default_done_frame() -> Bytes {
    done_frame(&format!("{DATA_PREFIX}{DONE_PAYLOAD}"))
}

fn wrap_payload(payload: &[u8]) -> Bytes {
    let mut data = Vec::with_capacity(payload.len() + 8);
    data.extend_from_slice(DATA_PREFIX.as_bytes());
    data.extend_from_slice(payload);
    data.extend_from_slice(b"\n\n");
    Bytes::from(data)
}
