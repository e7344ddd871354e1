//! Batch delivery for platforms without incremental output.
//!
//! [`BatchFallbackAdapter`] wraps any adapter and presents it as
//! non-streaming. The handler holds the whole response until the stream
//! ends and hands the split result to [`BatchFallbackAdapter::deliver_batch`],
//! which sends it as one ordered batch paced by [`chunk_delay`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use super::adapter::{AdapterCapabilities, MessageChunk, StreamAdapter};
use super::delivery_retry::{DeliveryOutcome, DeliveryRetryManager};
use crate::config::{DEFAULT_STREAM_CONFIG, StreamConfig};
use crate::error::DeliveryError;

/// Non-streaming view of another adapter.
#[derive(Clone)]
pub struct BatchFallbackAdapter {
    inner: Arc<dyn StreamAdapter>,
    retry: Arc<DeliveryRetryManager>,
    attempt_timeout: Duration,
    inter_chunk_delay_ms: u64,
    stop_on_error: bool,
}

impl BatchFallbackAdapter {
    pub fn new(inner: Arc<dyn StreamAdapter>) -> Self {
        Self {
            inner,
            retry: Arc::new(DeliveryRetryManager::new()),
            attempt_timeout: Duration::from_millis(DEFAULT_STREAM_CONFIG.delivery_timeout_ms),
            inter_chunk_delay_ms: 0,
            stop_on_error: false,
        }
    }

    /// Take timeout, pacing and the abort policy from a stream config.
    pub fn with_config(mut self, config: &StreamConfig) -> Self {
        self.attempt_timeout = Duration::from_millis(config.delivery_timeout_ms);
        self.inter_chunk_delay_ms = config.inter_chunk_delay_ms;
        self.stop_on_error = config.abort_on_delivery_error;
        self
    }

    /// Share a retry manager (and its metrics) with the caller.
    pub fn with_retry_manager(mut self, retry: Arc<DeliveryRetryManager>) -> Self {
        self.retry = retry;
        self
    }

    pub fn inner(&self) -> &Arc<dyn StreamAdapter> {
        &self.inner
    }

    /// Send a complete response in order.
    ///
    /// One outcome is pushed per attempted chunk as soon as it settles, so a
    /// caller that drops this future part-way still sees how far it got.
    /// Failures are retried per the retry manager; the batch continues past a
    /// failed chunk unless the config asked to stop on the first error.
    pub async fn deliver_batch(
        &self,
        chunks: &[MessageChunk],
        session_key: &str,
        outcomes: &mut Vec<DeliveryOutcome>,
    ) {
        for (i, chunk) in chunks.iter().enumerate() {
            let delay = pacing_delay(self.inter_chunk_delay_ms, i);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let outcome = self
                .retry
                .deliver_chunk(self.inner.as_ref(), chunk, session_key, self.attempt_timeout)
                .await;
            let failed = !outcome.is_delivered();
            outcomes.push(outcome);

            if failed && self.stop_on_error {
                tracing::debug!(
                    session_key,
                    adapter = self.inner.name(),
                    chunk = chunk.index,
                    remaining = chunks.len() - i - 1,
                    "Stopping batch after failed chunk"
                );
                break;
            }
        }
    }
}

impl std::fmt::Debug for BatchFallbackAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchFallbackAdapter")
            .field("inner", &self.inner.name())
            .field("attempt_timeout", &self.attempt_timeout)
            .field("inter_chunk_delay_ms", &self.inter_chunk_delay_ms)
            .field("stop_on_error", &self.stop_on_error)
            .finish()
    }
}

#[async_trait]
impl StreamAdapter for BatchFallbackAdapter {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities::batch_only(self.inner.capabilities().max_message_chars)
    }

    async fn deliver(&self, chunk: &MessageChunk, session_key: &str) -> Result<(), DeliveryError> {
        self.inner.deliver(chunk, session_key).await
    }
}

/// Delay before sending chunk `index` of a flush group.
///
/// The first chunk goes out immediately. Later chunks wait
/// `inter_chunk_delay_ms` with +/-20% jitter.
pub fn chunk_delay(config: &StreamConfig, index: usize) -> Duration {
    pacing_delay(config.inter_chunk_delay_ms, index)
}

fn pacing_delay(base_ms: u64, index: usize) -> Duration {
    if index == 0 || base_ms == 0 {
        return Duration::ZERO;
    }

    let base_ms = base_ms as f64;
    let jitter_range = base_ms * 0.2;
    let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
    let delay_ms = (base_ms + jitter).max(0.0) as u64;

    Duration::from_millis(delay_ms)
}
