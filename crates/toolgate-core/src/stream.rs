//! Drives a reconstructor over a live upstream body, one line at a time.
//!
//! The driver owns the cancellation check: it is consulted before every upstream
//! read, every line and every outgoing frame. Once it fires nothing else is sent,
//! and whatever the reconstructor still holds is discarded.

use std::collections::VecDeque;
use std::io;

use bytes::Bytes;
use futures_util::{Stream, StreamExt, stream};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use toolgate_protocol::sse::{LineDecoder, SseLine, classify_line, default_done_frame, raw_frame};
use toolgate_transform::{ChatStreamReconstructor, LegacyStreamReconstructor, StreamError};
use tracing::{debug, info, warn};

pub trait LineReconstructor: Send + 'static {
    fn push_line(&mut self, line: &str) -> Result<Vec<Bytes>, StreamError>;

    /// Upstream closed without a terminal sentinel.
    fn end_of_stream(&mut self) -> Vec<Bytes>;
}

impl LineReconstructor for ChatStreamReconstructor {
    fn push_line(&mut self, line: &str) -> Result<Vec<Bytes>, StreamError> {
        ChatStreamReconstructor::push_line(self, line)
    }

    fn end_of_stream(&mut self) -> Vec<Bytes> {
        ChatStreamReconstructor::end_of_stream(self)
    }
}

impl LineReconstructor for LegacyStreamReconstructor {
    fn push_line(&mut self, line: &str) -> Result<Vec<Bytes>, StreamError> {
        LegacyStreamReconstructor::push_line(self, line)
    }

    fn end_of_stream(&mut self) -> Vec<Bytes> {
        LegacyStreamReconstructor::end_of_stream(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DriverState {
    Reading,
    /// Upstream is done or sent its sentinel; only queued frames remain.
    Draining,
    Closed,
}

struct Driver<S, R> {
    upstream: S,
    reconstructor: R,
    decoder: LineDecoder,
    pending: VecDeque<Bytes>,
    cancel: CancellationToken,
    trace_id: String,
    sent: usize,
    state: DriverState,
}

pub fn reframe<S, R>(
    upstream: S,
    reconstructor: R,
    cancel: CancellationToken,
    trace_id: String,
) -> impl Stream<Item = Result<Bytes, io::Error>> + Send + 'static
where
    S: Stream<Item = Result<Bytes, io::Error>> + Send + Unpin + 'static,
    R: LineReconstructor,
{
    let driver = Driver {
        upstream,
        reconstructor,
        decoder: LineDecoder::new(),
        pending: VecDeque::new(),
        cancel,
        trace_id,
        sent: 0,
        state: DriverState::Reading,
    };
    stream::unfold(driver, |mut driver| async move {
        let frame = driver.next_frame().await?;
        Some((Ok(frame), driver))
    })
}

impl<S, R> Driver<S, R>
where
    S: Stream<Item = Result<Bytes, io::Error>> + Unpin,
    R: LineReconstructor,
{
    async fn next_frame(&mut self) -> Option<Bytes> {
        loop {
            if self.cancel.is_cancelled() {
                self.cancelled();
                return None;
            }
            if let Some(frame) = self.pending.pop_front() {
                self.sent += 1;
                return Some(frame);
            }
            if self.state != DriverState::Reading {
                self.state = DriverState::Closed;
                return None;
            }

            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => None,
                chunk = self.upstream.next() => Some(chunk),
            };
            let Some(chunk) = next else {
                self.cancelled();
                return None;
            };
            match chunk {
                Some(Ok(bytes)) => {
                    for line in self.decoder.push_bytes(&bytes) {
                        if self.cancel.is_cancelled() || !self.push_line(&line) {
                            break;
                        }
                    }
                }
                Some(Err(err)) => self.fail("upstream_stream_error", err.to_string()),
                None => {
                    if let Some(line) = self.decoder.finish() {
                        self.push_line(&line);
                    }
                    if self.state == DriverState::Reading {
                        let frames = self.reconstructor.end_of_stream();
                        self.pending.extend(frames);
                        self.state = DriverState::Draining;
                    }
                }
            }
        }
    }

    /// Returns false once nothing after this line may be read.
    fn push_line(&mut self, line: &str) -> bool {
        match self.reconstructor.push_line(line) {
            Ok(frames) => {
                self.pending.extend(frames);
                if matches!(classify_line(line), SseLine::Done(_)) {
                    debug!(event = "stream_sentinel", trace_id = %self.trace_id);
                    self.state = DriverState::Draining;
                    return false;
                }
                true
            }
            Err(err) => {
                self.fail("stream_decode_error", err.to_string());
                false
            }
        }
    }

    /// The failure is surfaced as one error event and the sentinel. Nothing the
    /// reconstructor still holds is flushed.
    fn fail(&mut self, kind: &str, message: String) {
        warn!(
            event = "stream_failed",
            trace_id = %self.trace_id,
            kind = kind,
            error = %message
        );
        let payload = json!({ "error": { "message": message, "type": kind } });
        self.pending.push_back(raw_frame(&payload.to_string()));
        self.pending.push_back(default_done_frame());
        self.state = DriverState::Draining;
    }

    fn cancelled(&mut self) {
        if self.state != DriverState::Closed {
            info!(
                event = "stream_cancelled",
                trace_id = %self.trace_id,
                frames_sent = self.sent,
                discarded = self.pending.len()
            );
        }
        self.pending.clear();
        self.state = DriverState::Closed;
    }
}

impl<S, R> Drop for Driver<S, R> {
    fn drop(&mut self) {
        if self.state != DriverState::Closed {
            debug!(
                event = "stream_cancelled",
                trace_id = %self.trace_id,
                reason = "client_disconnected",
                frames_sent = self.sent
            );
        }
    }
}
