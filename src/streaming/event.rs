//! Event model shared by the parser, accumulator and handler.

use serde::{Deserialize, Serialize};

/// One raw increment from the model-invocation layer.
///
/// Upstream code may hand over deltas it already understands, or the
/// provider's raw frames for the parser to classify.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ProviderDelta {
    /// Plain output text.
    Text(String),
    /// A tool invocation. Opaque to the pipeline.
    ToolCall { name: String, arguments: String },
    /// Explicit end of the model turn.
    Done,
    /// The provider reported a failure.
    Failed(String),
    /// A decoded provider frame (Anthropic or OpenAI streaming shape).
    Json(serde_json::Value),
    /// An undecoded frame, e.g. the `data:` payload of an SSE line.
    Raw(String),
}

/// Kind of a [`StreamEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamEventKind {
    TextDelta,
    ToolMarker,
    TurnEnd,
    Error,
}

impl StreamEventKind {
    /// Whether this kind ends the stream.
    pub fn is_terminal(self) -> bool {
        matches!(self, StreamEventKind::TurnEnd | StreamEventKind::Error)
    }
}

impl std::fmt::Display for StreamEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StreamEventKind::TextDelta => "text-delta",
            StreamEventKind::ToolMarker => "tool-marker",
            StreamEventKind::TurnEnd => "turn-end",
            StreamEventKind::Error => "error",
        };
        f.write_str(name)
    }
}

/// One semantic increment of model output.
///
/// `seq` is assigned by the parser and strictly increases within a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub seq: u64,
    pub kind: StreamEventKind,
    pub payload: String,
}

impl StreamEvent {
    pub fn new(seq: u64, kind: StreamEventKind, payload: impl Into<String>) -> Self {
        Self {
            seq,
            kind,
            payload: payload.into(),
        }
    }

    pub fn text(seq: u64, payload: impl Into<String>) -> Self {
        Self::new(seq, StreamEventKind::TextDelta, payload)
    }

    pub fn turn_end(seq: u64) -> Self {
        Self::new(seq, StreamEventKind::TurnEnd, String::new())
    }

    pub fn error(seq: u64, payload: impl Into<String>) -> Self {
        Self::new(seq, StreamEventKind::Error, payload)
    }

    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}

/// Why a flush fired. Exactly one per flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlushReason {
    Size,
    Age,
    SentenceBoundary,
    StreamEnd,
    Error,
}

impl std::fmt::Display for FlushReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FlushReason::Size => "size",
            FlushReason::Age => "age",
            FlushReason::SentenceBoundary => "sentence-boundary",
            FlushReason::StreamEnd => "stream-end",
            FlushReason::Error => "error",
        };
        f.write_str(name)
    }
}
