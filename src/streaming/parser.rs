//! Provider delta parsing.
//!
//! Turns a provider-specific delta stream into [`StreamEvent`]s. Two raw
//! frame shapes are understood:
//!
//! ```text
//! Anthropic  {"type":"content_block_delta","delta":{"type":"text_delta","text":"Hi"}}
//! OpenAI     {"choices":[{"delta":{"content":"Hi"},"finish_reason":null}]}
//! SSE data   "[DONE]"
//! ```
//!
//! Metadata frames (pings, usage, block start/stop) and reasoning deltas
//! carry no deliverable output and produce no event. Anything unrecognised
//! becomes an `error` event holding the raw payload. The parser is fused
//! after the first terminal event, so `turn-end`/`error` is always last.

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use serde_json::Value;

use super::event::{ProviderDelta, StreamEvent, StreamEventKind};

/// Classified content of one frame, before sequencing.
#[derive(Debug, Clone, PartialEq)]
enum Classified {
    Text(String),
    Tool(String),
    End,
    Error(String),
}

/// Lazy, single-use parser over a raw delta stream.
pub struct StreamParser<S> {
    source: S,
    next_seq: u64,
    pending: VecDeque<StreamEvent>,
    finished: bool,
    source_done: bool,
}

impl<S> StreamParser<S>
where
    S: Stream<Item = ProviderDelta> + Unpin,
{
    pub fn new(source: S) -> Self {
        Self {
            source,
            next_seq: 0,
            pending: VecDeque::new(),
            finished: false,
            source_done: false,
        }
    }

    /// Whether a terminal event has been yielded.
    pub fn is_finished(&self) -> bool {
        self.finished && self.pending.is_empty()
    }

    fn push(&mut self, item: Classified) {
        if self.finished {
            return;
        }
        let (kind, payload) = match item {
            Classified::Text(text) => (StreamEventKind::TextDelta, text),
            Classified::Tool(marker) => (StreamEventKind::ToolMarker, marker),
            Classified::End => (StreamEventKind::TurnEnd, String::new()),
            Classified::Error(raw) => (StreamEventKind::Error, raw),
        };
        let event = StreamEvent::new(self.next_seq, kind, payload);
        self.next_seq += 1;
        self.finished = kind.is_terminal();
        self.pending.push_back(event);
    }
}

impl<S> Stream for StreamParser<S>
where
    S: Stream<Item = ProviderDelta> + Unpin,
{
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamEvent>> {
        let this = &mut *self;
        loop {
            if let Some(event) = this.pending.pop_front() {
                return Poll::Ready(Some(event));
            }
            if this.finished || this.source_done {
                return Poll::Ready(None);
            }

            match Pin::new(&mut this.source).poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(delta)) => {
                    for item in classify(delta) {
                        this.push(item);
                    }
                }
                Poll::Ready(None) => {
                    this.source_done = true;
                    if !this.finished {
                        tracing::debug!(
                            seq = this.next_seq,
                            "Delta stream ended without a terminal frame; closing turn"
                        );
                        this.push(Classified::End);
                    }
                }
            }
        }
    }
}

fn classify(delta: ProviderDelta) -> Vec<Classified> {
    match delta {
        ProviderDelta::Text(text) => vec![Classified::Text(text)],
        ProviderDelta::ToolCall { name, arguments } => {
            vec![Classified::Tool(format!("{}({})", name, arguments))]
        }
        ProviderDelta::Done => vec![Classified::End],
        ProviderDelta::Failed(reason) => vec![Classified::Error(reason)],
        ProviderDelta::Json(value) => classify_frame(&value),
        ProviderDelta::Raw(raw) => classify_raw(&raw),
    }
}

fn classify_raw(raw: &str) -> Vec<Classified> {
    let trimmed = raw.trim();
    let data = trimmed.strip_prefix("data:").map(str::trim).unwrap_or(trimmed);
    if data == "[DONE]" {
        return vec![Classified::End];
    }
    match serde_json::from_str::<Value>(data) {
        Ok(value) => classify_frame(&value),
        Err(_) => vec![Classified::Error(raw.to_string())],
    }
}

fn classify_frame(frame: &Value) -> Vec<Classified> {
    if let Some(choices) = frame.get("choices") {
        return classify_openai(frame, choices);
    }
    if let Some(frame_type) = frame.get("type").and_then(Value::as_str) {
        return classify_anthropic(frame, frame_type);
    }
    if let Some(error) = frame.get("error") {
        return vec![Classified::Error(error_message(error))];
    }
    vec![Classified::Error(frame.to_string())]
}

fn classify_anthropic(frame: &Value, frame_type: &str) -> Vec<Classified> {
    match frame_type {
        "content_block_delta" => {
            let delta = &frame["delta"];
            match delta.get("type").and_then(Value::as_str) {
                Some("text_delta") => match delta.get("text").and_then(Value::as_str) {
                    Some(text) => vec![Classified::Text(text.to_string())],
                    None => vec![Classified::Error(frame.to_string())],
                },
                Some("input_json_delta") => {
                    let partial = delta
                        .get("partial_json")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    vec![Classified::Tool(partial.to_string())]
                }
                Some("thinking_delta") | Some("signature_delta") => Vec::new(),
                _ => vec![Classified::Error(frame.to_string())],
            }
        }
        "content_block_start" => {
            let block = &frame["content_block"];
            match block.get("type").and_then(Value::as_str) {
                Some("tool_use") => {
                    let name = block.get("name").and_then(Value::as_str).unwrap_or("tool");
                    vec![Classified::Tool(name.to_string())]
                }
                Some("text") => match block.get("text").and_then(Value::as_str) {
                    Some(text) if !text.is_empty() => vec![Classified::Text(text.to_string())],
                    _ => Vec::new(),
                },
                _ => Vec::new(),
            }
        }
        "message_stop" => vec![Classified::End],
        "error" => vec![Classified::Error(error_message(&frame["error"]))],
        "ping" | "message_start" | "message_delta" | "content_block_stop" => Vec::new(),
        _ => vec![Classified::Error(frame.to_string())],
    }
}

fn classify_openai(frame: &Value, choices: &Value) -> Vec<Classified> {
    let Some(choice) = choices.as_array().and_then(|c| c.first()) else {
        // Usage-only chunks carry an empty choices array.
        return if choices.is_array() {
            Vec::new()
        } else {
            vec![Classified::Error(frame.to_string())]
        };
    };

    let mut items = Vec::new();
    let delta = &choice["delta"];
    if let Some(content) = delta.get("content").and_then(Value::as_str)
        && !content.is_empty()
    {
        items.push(Classified::Text(content.to_string()));
    }
    if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
        for call in calls {
            items.push(Classified::Tool(call["function"].to_string()));
        }
    }
    if choice
        .get("finish_reason")
        .and_then(Value::as_str)
        .is_some()
    {
        items.push(Classified::End);
    }
    items
}

fn error_message(error: &Value) -> String {
    error
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string())
}
