//! Streaming response pipeline.
//!
//! ```text
//! ProviderDelta ─► StreamParser ─► StreamEvent ─► TokenAccumulator
//!                                                      │ FlushDecision
//!                                                      ▼
//!                         adapter ◄─ MessageChunk ◄─ splitter
//! ```
//!
//! [`StreamingResponseHandler`] wires the stages together for one
//! generation attempt under the session lock.

pub mod accumulator;
pub mod event;
pub mod handler;
pub mod markup;
pub mod parser;
pub mod splitter;

pub use accumulator::{FlushDecision, TokenAccumulator};
pub use event::{FlushReason, ProviderDelta, StreamEvent, StreamEventKind};
pub use handler::{
    DeliveryFailure, FlushResult, HandlerState, StreamSummary, StreamingResponseHandler,
};
pub use parser::StreamParser;
pub use splitter::{SplitReport, split, split_with_report};
