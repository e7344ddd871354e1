//! Platform adapter interface.
//!
//! A [`StreamAdapter`] pushes finished chunks to one messaging platform. It
//! reports what the platform can take and fails per chunk. Retry and
//! ordering live in the handler; batch delivery in
//! [`BatchFallbackAdapter`](super::batch::BatchFallbackAdapter).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;

/// What a platform accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterCapabilities {
    /// Incremental messages are acceptable.
    pub supports_streaming: bool,
    /// Hard per-message character limit.
    pub max_message_chars: usize,
}

impl AdapterCapabilities {
    pub fn streaming(max_message_chars: usize) -> Self {
        Self {
            supports_streaming: true,
            max_message_chars,
        }
    }

    pub fn batch_only(max_message_chars: usize) -> Self {
        Self {
            supports_streaming: false,
            max_message_chars,
        }
    }
}

/// One outbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageChunk {
    pub text: String,
    /// Position of this chunk within the whole response.
    pub index: usize,
    /// Last chunk of the response.
    pub is_final: bool,
}

impl MessageChunk {
    pub fn new(text: impl Into<String>, index: usize, is_final: bool) -> Self {
        Self {
            text: text.into(),
            index,
            is_final,
        }
    }

    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

/// Delivery side of a messaging platform.
#[async_trait]
pub trait StreamAdapter: Send + Sync {
    /// Adapter name used in logs and delivery errors.
    fn name(&self) -> &str;

    /// Queried once per handler run.
    fn capabilities(&self) -> AdapterCapabilities;

    /// Push one chunk. The caller enforces timeouts.
    async fn deliver(&self, chunk: &MessageChunk, session_key: &str) -> Result<(), DeliveryError>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording adapter shared by unit tests.

    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    /// Records every delivered chunk; can be scripted to fail.
    pub struct RecordingAdapter {
        name: String,
        capabilities: AdapterCapabilities,
        pub delivered: Mutex<Vec<(String, MessageChunk)>>,
        failures: Mutex<VecDeque<Option<DeliveryError>>>,
        stall: AtomicBool,
    }

    impl RecordingAdapter {
        pub fn new(name: &str, capabilities: AdapterCapabilities) -> Self {
            Self {
                name: name.to_string(),
                capabilities,
                delivered: Mutex::new(Vec::new()),
                failures: Mutex::new(VecDeque::new()),
                stall: AtomicBool::new(false),
            }
        }

        /// Script the next attempts: `None` succeeds, `Some(e)` fails.
        pub fn script(&self, outcomes: Vec<Option<DeliveryError>>) {
            self.failures.lock().unwrap().extend(outcomes);
        }

        /// The next attempt never settles; later attempts behave normally.
        pub fn stall_next(&self) {
            self.stall.store(true, Ordering::SeqCst);
        }

        pub fn texts(&self) -> Vec<String> {
            self.delivered
                .lock()
                .unwrap()
                .iter()
                .map(|(_, c)| c.text.clone())
                .collect()
        }

        pub fn chunks(&self) -> Vec<MessageChunk> {
            self.delivered
                .lock()
                .unwrap()
                .iter()
                .map(|(_, c)| c.clone())
                .collect()
        }

        pub fn rejection(&self, reason: &str) -> DeliveryError {
            DeliveryError::Rejected {
                adapter: self.name.clone(),
                reason: reason.to_string(),
            }
        }
    }

    #[async_trait]
    impl StreamAdapter for RecordingAdapter {
        fn name(&self) -> &str {
            &self.name
        }

        fn capabilities(&self) -> AdapterCapabilities {
            self.capabilities
        }

        async fn deliver(
            &self,
            chunk: &MessageChunk,
            session_key: &str,
        ) -> Result<(), DeliveryError> {
            if self.stall.swap(false, Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if let Some(Some(err)) = self.failures.lock().unwrap().pop_front() {
                return Err(err);
            }
            self.delivered
                .lock()
                .unwrap()
                .push((session_key.to_string(), chunk.clone()));
            Ok(())
        }
    }
}
