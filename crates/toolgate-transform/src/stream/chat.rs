use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use toolgate_protocol::openai::create_chat_completions::{
    ChatCompletionStreamDelta, CreateChatCompletionStreamResponse, FINISH_REASON_STOP, FINISH_REASON_TOOL_CALLS, Role,
    ToolCallDelta,
};
use toolgate_protocol::sse::{SseLine, classify_line, done_frame, json_frame};

use super::decode_event;
use crate::codec::{REASONING_TAG, encode_call};
use crate::error::StreamError;
use crate::replacement::CompletionTransform;
use crate::schema::ParserContext;

/// Key some backends use instead of `reasoning_content`.
const REASONING_KEY: &str = "reasoning";

/// A tool call being assembled from streamed fragments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallFragment {
    pub tool_name: String,
    pub arguments: String,
    pub call_id: String,
    pub reasoning: String,
    pub choice_index: u32,
    pub call_index: u32,
}

#[derive(Debug, Default)]
enum FragmentState {
    #[default]
    Idle,
    Accumulating {
        /// Open calls of one choice, in the order their indices first appeared.
        calls: Vec<CallFragment>,
        /// Call index of the latest fragment. Reasoning is appended to that call.
        current: u32,
        /// Latest upstream event that carried a fragment. Each flushed call is sent in
        /// a copy of it.
        carrier: CreateChatCompletionStreamResponse,
    },
}

/// Rebuilds a chat completion stream so that native tool calls reach the client as
/// tagged text. One instance per streaming request.
pub struct ChatStreamReconstructor {
    context: Arc<ParserContext>,
    transform: CompletionTransform,
    state: FragmentState,
    choice_index: u32,
    role: Option<Role>,
    /// Reasoning seen while no call was open, per choice.
    pending_reasoning: BTreeMap<u32, String>,
}

impl ChatStreamReconstructor {
    pub fn new(context: Arc<ParserContext>, transform: CompletionTransform) -> Self {
        Self {
            context,
            transform,
            state: FragmentState::Idle,
            choice_index: 0,
            role: None,
            pending_reasoning: BTreeMap::new(),
        }
    }

    /// Calls currently being assembled, in first-seen order.
    pub fn open_calls(&self) -> &[CallFragment] {
        match &self.state {
            FragmentState::Idle => &[],
            FragmentState::Accumulating { calls, .. } => calls,
        }
    }

    /// Handles one upstream line. Lines that are not `data:` events produce nothing.
    pub fn push_line(&mut self, line: &str) -> Result<Vec<Bytes>, StreamError> {
        match classify_line(line) {
            SseLine::Data(payload) => Ok(self.push_event(decode_event(&payload)?)),
            SseLine::Done(literal) => Ok(self.finish(&literal)),
            SseLine::Ignored => Ok(Vec::new()),
        }
    }

    pub fn push_event(&mut self, mut event: CreateChatCompletionStreamResponse) -> Vec<Bytes> {
        let mut frames = Vec::new();
        let choice = event.choices.first();
        let index = choice.and_then(|choice| choice.index).unwrap_or(self.choice_index);
        let delta = choice.and_then(|choice| choice.delta.as_ref());
        let empty_delta = delta.is_none_or(ChatCompletionStreamDelta::is_empty);
        let role = delta.and_then(|delta| delta.role).or(self.role);
        let call = delta
            .and_then(|delta| delta.tool_calls.as_ref())
            .and_then(|calls| calls.first())
            .cloned();
        let reasoning = delta.map(reasoning_text).unwrap_or_default();
        let finished = choice
            .and_then(|choice| choice.finish_reason.as_deref())
            .is_some_and(|reason| !reason.is_empty());

        if !reasoning.is_empty() {
            let open = match &mut self.state {
                FragmentState::Accumulating { calls, current, .. } => calls
                    .iter_mut()
                    .find(|fragment| fragment.call_index == *current && fragment.choice_index == index),
                FragmentState::Idle => None,
            };
            match open {
                Some(fragment) => fragment.reasoning.push_str(&reasoning),
                None => self.pending_reasoning.entry(index).or_default().push_str(&reasoning),
            }
        }

        let boundary = self.open_calls().first().is_some_and(|open| {
            open.choice_index != index || empty_delta || role != self.role || call.is_none()
        });
        if boundary {
            frames.extend(self.flush());
        }
        self.choice_index = index;
        self.role = role;

        if matches!(role, None | Some(Role::Assistant)) {
            if let Some(call) = call {
                self.accumulate(index, &call, &event);
            }
        }

        if finished && !self.open_calls().is_empty() {
            frames.extend(self.flush());
        }

        self.release_pending_reasoning(&mut event);
        for choice in &mut event.choices {
            if choice.finish_reason.as_deref() == Some(FINISH_REASON_TOOL_CALLS) {
                choice.finish_reason = Some(FINISH_REASON_STOP.to_string());
            }
            if let Some(delta) = choice.delta.as_mut() {
                delta.tool_calls = None;
                delta.reasoning_content = None;
                delta.extra.remove(REASONING_KEY);
            }
        }
        frames.extend(json_frame(&event));
        frames
    }

    /// Terminal sentinel: open calls are flushed before the sentinel is forwarded.
    pub fn finish(&mut self, sentinel: &str) -> Vec<Bytes> {
        let mut frames = self.end_of_stream();
        frames.push(done_frame(sentinel));
        frames
    }

    /// Upstream closed without a sentinel. Open calls are still flushed.
    pub fn end_of_stream(&mut self) -> Vec<Bytes> {
        let frames = self.flush();
        if !self.pending_reasoning.is_empty() {
            tracing::debug!(
                event = "stream_reasoning_dropped",
                choices = self.pending_reasoning.len()
            );
            self.pending_reasoning.clear();
        }
        frames
    }

    /// Appends a fragment to the call with its index, opening the call on first sight.
    /// Indices that come back after another call streamed continue their own call.
    fn accumulate(&mut self, index: u32, call: &ToolCallDelta, event: &CreateChatCompletionStreamResponse) {
        if matches!(self.state, FragmentState::Idle) {
            self.state = FragmentState::Accumulating {
                calls: Vec::new(),
                current: call.index.unwrap_or(0),
                carrier: event.clone(),
            };
        }
        let FragmentState::Accumulating { calls, current, carrier } = &mut self.state else {
            return;
        };
        let call_index = call.index.unwrap_or(*current);
        let position = match calls.iter().position(|fragment| fragment.call_index == call_index) {
            Some(position) => position,
            None => {
                calls.push(CallFragment {
                    reasoning: self.pending_reasoning.remove(&index).unwrap_or_default(),
                    choice_index: index,
                    call_index,
                    ..CallFragment::default()
                });
                calls.len() - 1
            }
        };
        let fragment = &mut calls[position];
        if let Some(function) = &call.function {
            fragment.tool_name.push_str(function.name.as_deref().unwrap_or_default());
            fragment.arguments.push_str(function.arguments.as_deref().unwrap_or_default());
        }
        fragment.call_id.push_str(call.id.as_deref().unwrap_or_default());
        *current = call_index;
        *carrier = event.clone();
    }

    /// Renders every open call, once each and in first-seen order, into a copy of the
    /// carrier event.
    fn flush(&mut self) -> Vec<Bytes> {
        let FragmentState::Accumulating { calls, carrier, .. } = std::mem::take(&mut self.state) else {
            return Vec::new();
        };
        calls
            .into_iter()
            .filter_map(|fragment| self.render_call(fragment, carrier.clone()))
            .collect()
    }

    fn render_call(&mut self, fragment: CallFragment, mut carrier: CreateChatCompletionStreamResponse) -> Option<Bytes> {
        let text = encode_call(
            &self.context,
            &fragment.tool_name,
            &fragment.arguments,
            &fragment.call_id,
            &fragment.reasoning,
        );
        if text.is_empty() {
            return None;
        }
        let text = self.transform.apply(&text);
        tracing::debug!(
            event = "stream_flush",
            tool = %fragment.tool_name,
            choice = fragment.choice_index,
            call = fragment.call_index
        );
        if let Some(choice) = carrier.choices.first_mut() {
            let delta = choice.delta.get_or_insert_with(ChatCompletionStreamDelta::default);
            delta.content = Some(text);
            delta.tool_calls = None;
            delta.reasoning_content = None;
            delta.extra.remove(REASONING_KEY);
            choice.finish_reason = None;
        }
        json_frame(&carrier)
    }

    /// Reasoning that no call claimed is sent as a thinking block ahead of the next text
    /// or finish of its choice.
    fn release_pending_reasoning(&mut self, event: &mut CreateChatCompletionStreamResponse) {
        if self.pending_reasoning.is_empty() {
            return;
        }
        let mut last_index = self.choice_index;
        for choice in &mut event.choices {
            let index = choice.index.unwrap_or(last_index);
            last_index = index;
            let has_text = choice
                .delta
                .as_ref()
                .and_then(|delta| delta.content.as_deref())
                .is_some_and(|content| !content.is_empty());
            let finished = choice.finish_reason.as_deref().is_some_and(|reason| !reason.is_empty());
            if !has_text && !finished {
                continue;
            }
            let Some(reasoning) = self.pending_reasoning.remove(&index) else {
                continue;
            };
            let reasoning = reasoning.trim();
            if reasoning.is_empty() {
                continue;
            }
            let delta = choice.delta.get_or_insert_with(ChatCompletionStreamDelta::default);
            let content = delta.content.take().unwrap_or_default();
            let block = format!("<{REASONING_TAG}>\n{reasoning}\n</{REASONING_TAG}>\n");
            delta.content = Some(self.transform.apply(&block) + &content);
        }
    }
}

fn reasoning_text(delta: &ChatCompletionStreamDelta) -> String {
    let mut text = delta.reasoning_content.clone().unwrap_or_default();
    if let Some(extra) = delta.extra.get(REASONING_KEY).and_then(|value| value.as_str()) {
        if text.is_empty() {
            text = extra.to_string();
        }
    }
    text
}
