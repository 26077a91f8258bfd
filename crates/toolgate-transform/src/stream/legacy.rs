use bytes::Bytes;
use toolgate_protocol::openai::create_completion::CreateCompletionResponse;
use toolgate_protocol::sse::{SseLine, classify_line, done_frame, json_frame};

use super::decode_event;
use crate::error::StreamError;
use crate::replacement::CompletionTransform;

/// Re-frames a legacy `/completions` stream. Text is buffered and sent in larger
/// chunks so completion-side replacement rules can match across token boundaries.
pub struct LegacyStreamReconstructor {
    transform: CompletionTransform,
    buffer: String,
    choice_index: u32,
    /// Latest event that carried buffered text.
    carrier: Option<CreateCompletionResponse>,
}

impl LegacyStreamReconstructor {
    pub fn new(transform: CompletionTransform) -> Self {
        Self {
            transform,
            buffer: String::new(),
            choice_index: 0,
            carrier: None,
        }
    }

    pub fn push_line(&mut self, line: &str) -> Result<Vec<Bytes>, StreamError> {
        match classify_line(line) {
            SseLine::Data(payload) => Ok(self.push_event(decode_event(&payload)?)),
            SseLine::Done(literal) => Ok(self.finish(&literal)),
            SseLine::Ignored => Ok(Vec::new()),
        }
    }

    pub fn push_event(&mut self, mut event: CreateCompletionResponse) -> Vec<Bytes> {
        let mut frames = Vec::new();
        let choice = event.choices.first();
        let text = choice.map(|choice| choice.text.clone()).unwrap_or_default();
        let index = choice.and_then(|choice| choice.index).unwrap_or(self.choice_index);
        let finished = choice
            .and_then(|choice| choice.finish_reason.as_deref())
            .is_some_and(|reason| !reason.is_empty());

        if text.is_empty() || index != self.choice_index {
            frames.extend(self.flush());
        }
        self.choice_index = index;
        if !text.is_empty() {
            self.buffer.push_str(&text);
            self.carrier = Some(event.clone());
        }
        if finished {
            frames.extend(self.flush());
        }

        for choice in &mut event.choices {
            choice.text.clear();
        }
        frames.extend(json_frame(&event));
        frames
    }

    pub fn finish(&mut self, sentinel: &str) -> Vec<Bytes> {
        let mut frames = self.end_of_stream();
        frames.push(done_frame(sentinel));
        frames
    }

    pub fn end_of_stream(&mut self) -> Vec<Bytes> {
        self.flush().into_iter().collect()
    }

    fn flush(&mut self) -> Option<Bytes> {
        if self.buffer.is_empty() {
            return None;
        }
        let text = self.transform.apply(&std::mem::take(&mut self.buffer));
        let mut carrier = self.carrier.take()?;
        if let Some(choice) = carrier.choices.first_mut() {
            choice.text = text;
            choice.finish_reason = None;
        }
        json_frame(&carrier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value as JsonValue, json};

    use crate::replacement::{ReplacementPipeline, ReplacementRule};

    fn texts(frames: &[Bytes]) -> Vec<String> {
        frames
            .iter()
            .filter_map(|frame| {
                let text = std::str::from_utf8(frame).ok()?;
                let payload: JsonValue = serde_json::from_str(text.strip_prefix("data: ")?.trim_end()).ok()?;
                payload["choices"][0]["text"].as_str().map(str::to_string)
            })
            .filter(|text| !text.is_empty())
            .collect()
    }

    fn event(text: &str, finish: Option<&str>) -> String {
        format!(
            "data: {}",
            json!({ "id": "cmpl-1", "object": "text_completion", "choices": [{ "index": 0, "text": text, "finish_reason": finish }] })
        )
    }

    #[test]
    fn buffered_text_is_transformed_as_one_piece() {
        let rule = ReplacementRule::new(
            serde_json::from_value(json!({ "role": "completion", "pattern": "secret", "replace": "[hidden]" }))
                .expect("settings"),
            0,
        )
        .expect("rule");
        let (_, transform) = ReplacementPipeline::new(vec![rule]).apply_outbound_prompt("p");
        let mut stream = LegacyStreamReconstructor::new(transform);
        let mut frames = Vec::new();
        for line in [event("the sec", None), event("ret is", None), event(" out", Some("stop"))] {
            frames.extend(stream.push_line(&line).expect("event"));
        }
        frames.extend(stream.push_line("data: [DONE]").expect("sentinel"));
        assert_eq!(texts(&frames), vec!["the [hidden] is out".to_string()]);
        assert_eq!(frames.last(), Some(&Bytes::from_static(b"data: [DONE]\n\n")));
    }

    #[test]
    fn empty_text_event_flushes_the_buffer() {
        let mut stream = LegacyStreamReconstructor::new(CompletionTransform::identity());
        let mut frames = Vec::new();
        for line in [event("a", None), event("b", None), event("", None), event("c", None)] {
            frames.extend(stream.push_line(&line).expect("event"));
        }
        assert_eq!(texts(&frames), vec!["ab".to_string()]);
        frames.extend(stream.finish("data: [DONE]"));
        assert_eq!(texts(&frames), vec!["ab".to_string(), "c".to_string()]);
    }

    #[test]
    fn forwarded_events_keep_their_finish_reason() {
        let mut stream = LegacyStreamReconstructor::new(CompletionTransform::identity());
        let frames = stream.push_line(&event("x", Some("length"))).expect("event");
        assert_eq!(frames.len(), 2);
        let forwarded: JsonValue =
            serde_json::from_str(std::str::from_utf8(&frames[1]).expect("utf8").trim_start_matches("data: ").trim_end())
                .expect("json");
        assert_eq!(forwarded["choices"][0]["finish_reason"], json!("length"));
        assert_eq!(forwarded["choices"][0]["text"], json!(""));
    }

    #[test]
    fn end_of_stream_flushes_without_a_sentinel() {
        let mut stream = LegacyStreamReconstructor::new(CompletionTransform::identity());
        let mut frames = stream.push_line(&event("tail", None)).expect("event");
        frames.extend(stream.end_of_stream());
        assert_eq!(texts(&frames), vec!["tail".to_string()]);
        assert!(frames.iter().all(|frame| !frame.starts_with(b"data: [DONE]")));
    }
}
