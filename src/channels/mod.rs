//! Outbound delivery to messaging platforms.
//!
//! ```text
//!   StreamingResponseHandler
//!            │ MessageChunk
//!            ▼
//!   DeliveryRetryManager ── timeout + backoff per attempt
//!            │
//!            ▼
//!   dyn StreamAdapter ──┬── platform adapter (streaming)
//!                       ├── BatchFallbackAdapter (wraps any adapter)
//!                       └── ConsoleAdapter (CLI)
//! ```

pub mod adapter;
pub mod batch;
pub mod console;
pub mod delivery_retry;

pub use adapter::{AdapterCapabilities, MessageChunk, StreamAdapter};
pub use batch::{BatchFallbackAdapter, chunk_delay};
pub use console::{ConsoleAdapter, ConsoleFormat};
pub use delivery_retry::{DeliveryOutcome, DeliveryRetryManager, DeliverySnapshot, RetryConfig};
