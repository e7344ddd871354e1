//! Streaming response pipeline for chat channels.
//!
//! Turns an incremental, provider-specific model output stream into
//! ordered, platform-sized messages, while keeping concurrent generation
//! attempts for the same conversation from interleaving.
//!
//! ```text
//! deltas ─► StreamParser ─► TokenAccumulator ─► splitter ─► StreamAdapter
//!                      (all under the per-session SessionLock)
//! ```
//!
//! Entry point for one attempt is [`StreamingResponseHandler`]; platform
//! tuning comes from [`resolve_config`] or a loaded [`PlatformTable`].

pub mod agent;
pub mod channels;
pub mod cli;
pub mod config;
pub mod error;
pub mod streaming;

pub use agent::{CancelHandle, CancelSignal, LockHandle, LockStats, SessionLock};
pub use channels::{
    AdapterCapabilities, BatchFallbackAdapter, DeliveryRetryManager, MessageChunk, RetryConfig,
    StreamAdapter,
};
pub use config::{DEFAULT_STREAM_CONFIG, LockMode, PlatformTable, StreamConfig, resolve_config};
pub use error::{ConfigError, DeliveryError, Error, LockError, Result, SplitError, StreamError};
pub use streaming::{
    FlushReason, HandlerState, ProviderDelta, StreamEvent, StreamEventKind, StreamParser,
    StreamSummary, StreamingResponseHandler, split,
};
