//! End-to-end streaming of one generation attempt.
//!
//! A [`StreamingResponseHandler`] owns one attempt: it takes the session
//! lock, parses the provider deltas, lets the accumulator decide when to
//! flush, splits each flush to the platform limit and pushes the chunks to
//! the adapter in order. The lock is released before the summary is
//! returned, whatever happened.
//!
//! ```text
//! Idle ─► Locking ─► Streaming ◄─► Flushing
//!            │           │            │
//!            │           └──────┬─────┘
//!            │                  ▼
//!            │              Draining ─► Closed
//!            └──────────────────────────► Closed(error)
//! ```
//!
//! The handler suspends only while waiting for the next delta (bounded by
//! `delta_read_timeout_ms`, and by the age deadline of the buffer) and while
//! waiting for a delivery acknowledgement. Cancellation is observed at both
//! points and leads to a best-effort final flush without retries.

use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::time::Instant;

use super::accumulator::{FlushDecision, TokenAccumulator};
use super::event::{FlushReason, ProviderDelta, StreamEvent, StreamEventKind};
use super::markup::count_fence_delimiters;
use super::parser::StreamParser;
use super::splitter::{SplitReport, split_with_report};
use crate::agent::cancel::CancelSignal;
use crate::agent::session_lock::SessionLock;
use crate::channels::adapter::{MessageChunk, StreamAdapter};
use crate::channels::batch::{BatchFallbackAdapter, chunk_delay};
use crate::channels::delivery_retry::{DeliveryOutcome, DeliveryRetryManager};
use crate::config::StreamConfig;
use crate::error::{DeliveryError, LockError, StreamError};

/// Lifecycle of a handler run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum HandlerState {
    Idle,
    Locking,
    Streaming,
    Flushing,
    Draining,
    Closed { error: Option<String> },
}

impl HandlerState {
    pub fn is_closed(&self) -> bool {
        matches!(self, HandlerState::Closed { .. })
    }
}

impl std::fmt::Display for HandlerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerState::Idle => write!(f, "idle"),
            HandlerState::Locking => write!(f, "locking"),
            HandlerState::Streaming => write!(f, "streaming"),
            HandlerState::Flushing => write!(f, "flushing"),
            HandlerState::Draining => write!(f, "draining"),
            HandlerState::Closed { error: None } => write!(f, "closed"),
            HandlerState::Closed { error: Some(e) } => write!(f, "closed({e})"),
        }
    }
}

/// Outcome of delivering one flush.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushResult {
    /// Chunks of this flush handed to the adapter, in order, delivered or
    /// not. Chunks never attempted (cancellation, abort) are left out.
    pub chunks: Vec<String>,
    pub reason: FlushReason,
    /// UTF-8 bytes acknowledged by the adapter.
    pub bytes_delivered: usize,
    /// First delivery failure in this flush.
    pub error: Option<DeliveryError>,
    /// Cut by the safety ceiling inside an open code fence.
    pub truncated: bool,
}

/// A chunk the adapter did not accept.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryFailure {
    pub flush_index: usize,
    pub chunk_index: usize,
    pub error: DeliveryError,
}

/// Result of one handler run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSummary {
    pub session_key: String,
    pub total_chars_delivered: usize,
    /// Chunks acknowledged by the adapter.
    pub chunk_count: usize,
    pub flush_reasons: Vec<FlushReason>,
    pub partial_delivery_errors: Vec<DeliveryFailure>,
    pub possibly_malformed: bool,
    pub cancelled: bool,
    pub truncated: bool,
    /// Delivery stopped early because `abort_on_delivery_error` is set.
    pub aborted: bool,
    /// Global indices of chunks longer than the platform limit.
    pub oversized_chunks: Vec<usize>,
    /// Payload of a provider error event, or a read timeout.
    pub stream_error: Option<String>,
    /// Delivery ran through the batch fallback.
    pub batch_mode: bool,
    pub flushes: Vec<FlushResult>,
    pub final_state: HandlerState,
}

impl StreamSummary {
    fn new(session_key: &str) -> Self {
        Self {
            session_key: session_key.to_string(),
            total_chars_delivered: 0,
            chunk_count: 0,
            flush_reasons: Vec::new(),
            partial_delivery_errors: Vec::new(),
            possibly_malformed: false,
            cancelled: false,
            truncated: false,
            aborted: false,
            oversized_chunks: Vec::new(),
            stream_error: None,
            batch_mode: false,
            flushes: Vec::new(),
            final_state: HandlerState::Idle,
        }
    }

    pub fn has_delivery_errors(&self) -> bool {
        !self.partial_delivery_errors.is_empty()
    }

    /// Delivered text in order, for checking reassembly.
    pub fn delivered_text(&self) -> String {
        self.flushes
            .iter()
            .flat_map(|f| f.chunks.iter())
            .map(String::as_str)
            .collect()
    }
}

/// How a flush ended.
enum FlushOutcome {
    Completed,
    /// Cancelled mid-flush; unattempted text carried into the drain.
    Cancelled { pending: String },
    Aborted { error: DeliveryError },
}

/// A split chunk waiting for delivery.
struct PendingChunk {
    text: String,
    flush_index: usize,
    oversized: bool,
}

/// Per-run state that does not outlive [`StreamingResponseHandler::run`].
struct RunContext {
    adapter: Arc<dyn StreamAdapter>,
    /// Set in batch mode; the whole response goes through it at the end.
    batch: Option<BatchFallbackAdapter>,
    max_chars: usize,
    next_chunk_index: usize,
    /// Last chunk of the latest streaming flush. It is sent with the next
    /// flush, so the terminal chunk can carry `is_final` even when the
    /// response ends on a flush boundary.
    held: Option<(PendingChunk, Instant)>,
    summary: StreamSummary,
}

enum Step {
    Event(StreamEvent),
    SourceEnded,
    ReadTimeout,
    AgeDue,
    ReleaseHeld,
    Cancelled,
}

enum Work {
    Flush(FlushDecision),
    Release(PendingChunk),
}

/// Drives one generation attempt from raw deltas to delivered chunks.
pub struct StreamingResponseHandler {
    session_key: String,
    adapter: Arc<dyn StreamAdapter>,
    config: StreamConfig,
    lock: SessionLock,
    retry: Arc<DeliveryRetryManager>,
    state: HandlerState,
    transitions: Vec<HandlerState>,
}

impl StreamingResponseHandler {
    /// Fails fast on an invalid configuration.
    pub fn new(
        session_key: impl Into<String>,
        adapter: Arc<dyn StreamAdapter>,
        config: StreamConfig,
        lock: SessionLock,
    ) -> Result<Self, StreamError> {
        let config = config.validated()?;
        Ok(Self {
            session_key: session_key.into(),
            adapter,
            config,
            lock,
            retry: Arc::new(DeliveryRetryManager::new()),
            state: HandlerState::Idle,
            transitions: vec![HandlerState::Idle],
        })
    }

    /// Share a retry manager (and its metrics) across handlers.
    pub fn with_retry_manager(mut self, retry: Arc<DeliveryRetryManager>) -> Self {
        self.retry = retry;
        self
    }

    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    pub fn state(&self) -> &HandlerState {
        &self.state
    }

    /// Every state entered so far, in order.
    pub fn transitions(&self) -> &[HandlerState] {
        &self.transitions
    }

    fn transition(&mut self, next: HandlerState) {
        tracing::debug!(
            session_key = %self.session_key,
            from = %self.state,
            to = %next,
            "Handler state change"
        );
        self.state = next.clone();
        self.transitions.push(next);
    }

    /// Run the attempt to completion.
    ///
    /// Returns `Err` only when the session lock could not be taken; nothing
    /// is delivered in that case. Every other failure is reported in the
    /// summary. A handler runs once.
    pub async fn run<S>(
        &mut self,
        deltas: S,
        mut cancel: CancelSignal,
    ) -> Result<StreamSummary, StreamError>
    where
        S: Stream<Item = ProviderDelta> + Unpin,
    {
        if self.state != HandlerState::Idle {
            return Err(StreamError::AlreadyRun {
                session_key: self.session_key.clone(),
            });
        }

        let mut accumulator = TokenAccumulator::new(&self.config)?;
        let mut summary = StreamSummary::new(&self.session_key);

        self.transition(HandlerState::Locking);
        let acquired = self
            .lock
            .acquire_with(
                &self.session_key,
                self.config.lock_mode,
                Duration::from_millis(self.config.acquire_timeout_ms),
                Some(&mut cancel),
            )
            .await;
        let handle = match acquired {
            Ok(handle) => handle,
            Err(LockError::Cancelled { .. }) => {
                tracing::info!(session_key = %self.session_key, "Cancelled while waiting for session lock");
                summary.cancelled = true;
                self.transition(HandlerState::Draining);
                self.transition(HandlerState::Closed { error: None });
                summary.final_state = self.state.clone();
                return Ok(summary);
            }
            Err(err) => {
                self.transition(HandlerState::Closed {
                    error: Some(err.to_string()),
                });
                return Err(err.into());
            }
        };

        let capabilities = self.adapter.capabilities();
        let batch_mode = !(self.config.supports_streaming && capabilities.supports_streaming);
        let max_chars = match capabilities.max_message_chars {
            0 => self.config.platform_max_message_chars,
            limit => limit.min(self.config.platform_max_message_chars),
        };
        let batch = batch_mode.then(|| {
            BatchFallbackAdapter::new(Arc::clone(&self.adapter))
                .with_config(&self.config)
                .with_retry_manager(Arc::clone(&self.retry))
        });
        let adapter: Arc<dyn StreamAdapter> = match &batch {
            Some(batch) => Arc::new(batch.clone()),
            None => Arc::clone(&self.adapter),
        };
        summary.batch_mode = batch_mode;

        tracing::info!(
            session_key = %self.session_key,
            adapter = adapter.name(),
            batch_mode,
            max_chars,
            "Streaming response"
        );

        self.transition(HandlerState::Streaming);
        let mut ctx = RunContext {
            adapter,
            batch,
            max_chars,
            next_chunk_index: 0,
            held: None,
            summary,
        };

        let close_error = self
            .stream(&mut ctx, &mut accumulator, deltas, &mut cancel)
            .await;

        ctx.summary.possibly_malformed = ctx.summary.truncated
            || ctx.summary.flushes.iter().any(|f| {
                f.chunks
                    .iter()
                    .map(|c| count_fence_delimiters(c))
                    .sum::<usize>()
                    % 2
                    == 1
            })
            || accumulator.fence_open();

        if self.state != HandlerState::Draining {
            self.transition(HandlerState::Draining);
        }
        self.lock.release(&handle);
        self.transition(HandlerState::Closed { error: close_error });

        let mut summary = ctx.summary;
        summary.final_state = self.state.clone();
        tracing::info!(
            session_key = %self.session_key,
            chunks = summary.chunk_count,
            chars = summary.total_chars_delivered,
            flushes = summary.flushes.len(),
            cancelled = summary.cancelled,
            failures = summary.partial_delivery_errors.len(),
            "Response stream closed"
        );
        Ok(summary)
    }

    /// Main loop. Returns the close error, if the run ended in one.
    async fn stream<S>(
        &mut self,
        ctx: &mut RunContext,
        accumulator: &mut TokenAccumulator,
        deltas: S,
        cancel: &mut CancelSignal,
    ) -> Option<String>
    where
        S: Stream<Item = ProviderDelta> + Unpin,
    {
        let mut parser = StreamParser::new(deltas);
        let read_timeout = Duration::from_millis(self.config.delta_read_timeout_ms);
        let hold_limit = Duration::from_millis(self.config.max_buffer_age_ms);
        // Batch mode bypasses flush timing; text is kept here until the end.
        let mut batch_text = String::new();

        loop {
            let age_deadline = if ctx.summary.batch_mode {
                None
            } else {
                accumulator.age_deadline()
            };
            let release_deadline = ctx.held.as_ref().map(|(_, since)| *since + hold_limit);

            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Cancelled,
                next = tokio::time::timeout(read_timeout, parser.next()) => match next {
                    Ok(Some(event)) => Step::Event(event),
                    Ok(None) => Step::SourceEnded,
                    Err(_) => Step::ReadTimeout,
                },
                _ = sleep_until(age_deadline) => Step::AgeDue,
                _ = sleep_until(release_deadline) => Step::ReleaseHeld,
            };

            let (work, is_final) = match step {
                Step::Event(event) => {
                    if event.kind == StreamEventKind::Error {
                        tracing::warn!(
                            session_key = %self.session_key,
                            seq = event.seq,
                            payload = %event.payload,
                            "Provider stream reported an error; finalizing"
                        );
                        ctx.summary.stream_error = Some(event.payload.clone());
                    }
                    let terminal = event.is_terminal();
                    let decision = if ctx.summary.batch_mode {
                        match event.kind {
                            StreamEventKind::TextDelta => {
                                batch_text.push_str(&event.payload);
                                None
                            }
                            StreamEventKind::ToolMarker => None,
                            StreamEventKind::TurnEnd => {
                                Some(batch_decision(&mut batch_text, FlushReason::StreamEnd))
                            }
                            StreamEventKind::Error => {
                                Some(batch_decision(&mut batch_text, FlushReason::Error))
                            }
                        }
                    } else {
                        accumulator.ingest(&event, Instant::now())
                    };
                    (decision.map(Work::Flush), terminal)
                }
                Step::SourceEnded => {
                    let decision =
                        self.drain(ctx, accumulator, &mut batch_text, FlushReason::StreamEnd);
                    (Some(Work::Flush(decision)), true)
                }
                Step::ReadTimeout => {
                    tracing::warn!(
                        session_key = %self.session_key,
                        timeout_ms = self.config.delta_read_timeout_ms,
                        "Timed out waiting for the next delta; finalizing"
                    );
                    ctx.summary.stream_error =
                        Some(format!("no delta received within {read_timeout:?}"));
                    let decision = self.drain(ctx, accumulator, &mut batch_text, FlushReason::Error);
                    (Some(Work::Flush(decision)), true)
                }
                Step::AgeDue => (accumulator.poll_age(Instant::now()).map(Work::Flush), false),
                Step::ReleaseHeld => {
                    let released = ctx.held.take().map(|(chunk, _)| Work::Release(chunk));
                    (released, false)
                }
                Step::Cancelled => {
                    self.cancel_drain(ctx, accumulator, &mut batch_text, String::new())
                        .await;
                    return None;
                }
            };

            let Some(work) = work else {
                continue;
            };

            self.transition(HandlerState::Flushing);
            let outcome = match work {
                Work::Flush(decision) => self.deliver_flush(ctx, decision, is_final, cancel).await,
                Work::Release(chunk) => self.deliver_chunks(ctx, vec![chunk], false, cancel).await,
            };
            match outcome {
                FlushOutcome::Completed if is_final => {
                    self.transition(HandlerState::Draining);
                    return None;
                }
                FlushOutcome::Completed => self.transition(HandlerState::Streaming),
                FlushOutcome::Cancelled { pending } => {
                    self.cancel_drain(ctx, accumulator, &mut batch_text, pending)
                        .await;
                    return None;
                }
                FlushOutcome::Aborted { error } => {
                    tracing::warn!(
                        session_key = %self.session_key,
                        error = %error,
                        "Aborting stream after delivery failure"
                    );
                    ctx.summary.aborted = true;
                    self.transition(HandlerState::Draining);
                    return Some(error.to_string());
                }
            }
        }
    }

    fn drain(
        &self,
        ctx: &RunContext,
        accumulator: &mut TokenAccumulator,
        batch_text: &mut String,
        reason: FlushReason,
    ) -> FlushDecision {
        if ctx.summary.batch_mode {
            batch_decision(batch_text, reason)
        } else {
            accumulator.drain(reason)
        }
    }

    /// Split one flush and deliver its chunks in order.
    ///
    /// A streaming flush that is not the last one keeps its final chunk back
    /// until the next flush, or until it has waited `max_buffer_age_ms`.
    async fn deliver_flush(
        &self,
        ctx: &mut RunContext,
        decision: FlushDecision,
        is_final: bool,
        cancel: &mut CancelSignal,
    ) -> FlushOutcome {
        let flush_index = ctx.summary.flushes.len();
        let report = self.split(&decision.text, ctx.max_chars);

        tracing::debug!(
            session_key = %self.session_key,
            reason = %decision.reason,
            chars = decision.text.chars().count(),
            chunks = report.chunks.len(),
            truncated = decision.truncated,
            "Flushing buffer"
        );

        ctx.summary.flush_reasons.push(decision.reason);
        ctx.summary.truncated |= decision.truncated;
        ctx.summary.flushes.push(FlushResult {
            chunks: Vec::new(),
            reason: decision.reason,
            bytes_delivered: 0,
            error: None,
            truncated: decision.truncated,
        });

        let oversized = report.oversized;
        let mut queue: Vec<PendingChunk> = ctx.held.take().map(|(chunk, _)| chunk).into_iter().collect();
        queue.extend(report.chunks.into_iter().enumerate().map(|(i, text)| PendingChunk {
            text,
            flush_index,
            oversized: oversized.contains(&i),
        }));

        if let Some(batch) = ctx.batch.clone() {
            return self.deliver_batch(ctx, &batch, queue, cancel).await;
        }
        if !is_final {
            ctx.held = queue.pop().map(|chunk| (chunk, Instant::now()));
        }
        self.deliver_chunks(ctx, queue, is_final, cancel).await
    }

    /// Deliver chunks one at a time through the retry manager.
    async fn deliver_chunks(
        &self,
        ctx: &mut RunContext,
        queue: Vec<PendingChunk>,
        is_final: bool,
        cancel: &mut CancelSignal,
    ) -> FlushOutcome {
        let timeout = Duration::from_millis(self.config.delivery_timeout_ms);
        let last = queue.len().saturating_sub(1);

        for (i, pending) in queue.iter().enumerate() {
            let chunk = MessageChunk::new(
                pending.text.as_str(),
                ctx.next_chunk_index,
                is_final && i == last,
            );
            let delay = chunk_delay(&self.config, i);

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                outcome = async {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    self.retry
                        .deliver_chunk(ctx.adapter.as_ref(), &chunk, &self.session_key, timeout)
                        .await
                } => Some(outcome),
            };

            let Some(outcome) = outcome else {
                let mut carried: String = queue[i..].iter().map(|c| c.text.as_str()).collect();
                if let Some((held, _)) = ctx.held.take() {
                    carried.push_str(&held.text);
                }
                return FlushOutcome::Cancelled { pending: carried };
            };

            ctx.next_chunk_index += 1;
            let failed = self.record_attempt(ctx, pending, &chunk, outcome);
            if let Some(error) = failed.filter(|_| self.config.abort_on_delivery_error) {
                return FlushOutcome::Aborted { error };
            }
        }

        FlushOutcome::Completed
    }

    /// Hand the whole response to the batch adapter as one ordered batch.
    async fn deliver_batch(
        &self,
        ctx: &mut RunContext,
        batch: &BatchFallbackAdapter,
        queue: Vec<PendingChunk>,
        cancel: &mut CancelSignal,
    ) -> FlushOutcome {
        let first_index = ctx.next_chunk_index;
        let last = queue.len().saturating_sub(1);
        let chunks: Vec<MessageChunk> = queue
            .iter()
            .enumerate()
            .map(|(i, pending)| MessageChunk::new(pending.text.as_str(), first_index + i, i == last))
            .collect();

        let mut outcomes = Vec::with_capacity(chunks.len());
        let cancelled = tokio::select! {
            biased;
            _ = cancel.cancelled() => true,
            _ = batch.deliver_batch(&chunks, &self.session_key, &mut outcomes) => false,
        };

        let attempted = outcomes.len();
        ctx.next_chunk_index += attempted;
        let mut first_error = None;
        for ((pending, chunk), outcome) in queue.iter().zip(&chunks).zip(outcomes) {
            if let Some(error) = self.record_attempt(ctx, pending, chunk, outcome) {
                first_error.get_or_insert(error);
            }
        }

        if cancelled {
            let carried: String = queue[attempted..].iter().map(|c| c.text.as_str()).collect();
            return FlushOutcome::Cancelled { pending: carried };
        }
        match first_error {
            Some(error) if self.config.abort_on_delivery_error => FlushOutcome::Aborted { error },
            _ => FlushOutcome::Completed,
        }
    }

    /// Fold one settled delivery into the summary. Returns the error if the
    /// chunk failed.
    fn record_attempt(
        &self,
        ctx: &mut RunContext,
        pending: &PendingChunk,
        chunk: &MessageChunk,
        outcome: DeliveryOutcome,
    ) -> Option<DeliveryError> {
        if pending.oversized {
            ctx.summary.oversized_chunks.push(chunk.index);
        }
        let flush = ctx.summary.flushes.get_mut(pending.flush_index);

        match outcome {
            DeliveryOutcome::Delivered { .. } => {
                ctx.summary.chunk_count += 1;
                ctx.summary.total_chars_delivered += chunk.char_len();
                if let Some(flush) = flush {
                    flush.chunks.push(chunk.text.clone());
                    flush.bytes_delivered += chunk.text.len();
                }
                None
            }
            DeliveryOutcome::Failed { last_error: error, .. }
            | DeliveryOutcome::NotRetried { error } => {
                tracing::warn!(
                    session_key = %self.session_key,
                    chunk = chunk.index,
                    error = %error,
                    "Chunk delivery failed"
                );
                if let Some(flush) = flush {
                    flush.chunks.push(chunk.text.clone());
                    if flush.error.is_none() {
                        flush.error = Some(error.clone());
                    }
                }
                ctx.summary.partial_delivery_errors.push(DeliveryFailure {
                    flush_index: pending.flush_index,
                    chunk_index: chunk.index,
                    error: error.clone(),
                });
                Some(error)
            }
        }
    }

    /// Best-effort final flush after cancellation: one attempt per chunk,
    /// failures ignored.
    async fn cancel_drain(
        &mut self,
        ctx: &mut RunContext,
        accumulator: &mut TokenAccumulator,
        batch_text: &mut String,
        pending: String,
    ) {
        tracing::info!(session_key = %self.session_key, "Stream cancelled; draining buffer");
        ctx.summary.cancelled = true;
        self.transition(HandlerState::Draining);

        let mut decision = self.drain(ctx, accumulator, batch_text, FlushReason::StreamEnd);
        let mut carried = ctx
            .held
            .take()
            .map(|(chunk, _)| chunk.text)
            .unwrap_or_default();
        carried.push_str(&pending);
        decision.text.insert_str(0, &carried);
        if decision.text.is_empty() {
            return;
        }

        let report = self.split(&decision.text, ctx.max_chars);
        let timeout = Duration::from_millis(self.config.delivery_timeout_ms);
        let last = report.chunks.len().saturating_sub(1);
        let mut bytes_delivered = 0;

        for (i, text) in report.chunks.iter().enumerate() {
            let index = ctx.next_chunk_index;
            ctx.next_chunk_index += 1;
            let chunk = MessageChunk::new(text.as_str(), index, i == last);
            let attempt =
                tokio::time::timeout(timeout, ctx.adapter.deliver(&chunk, &self.session_key)).await;
            match attempt {
                Ok(Ok(())) => {
                    ctx.summary.chunk_count += 1;
                    ctx.summary.total_chars_delivered += chunk.char_len();
                    bytes_delivered += chunk.text.len();
                }
                Ok(Err(e)) => {
                    tracing::debug!(session_key = %self.session_key, error = %e, "Ignoring delivery failure during cancellation");
                }
                Err(_) => {
                    tracing::debug!(session_key = %self.session_key, "Ignoring delivery timeout during cancellation");
                }
            }
        }

        ctx.summary.flush_reasons.push(decision.reason);
        ctx.summary.truncated |= decision.truncated;
        ctx.summary.flushes.push(FlushResult {
            chunks: report.chunks,
            reason: decision.reason,
            bytes_delivered,
            error: None,
            truncated: decision.truncated,
        });
    }

    fn split(&self, text: &str, max_chars: usize) -> SplitReport {
        match split_with_report(text, max_chars) {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(session_key = %self.session_key, error = %e, "Split failed; sending flush whole");
                SplitReport {
                    chunks: vec![text.to_string()],
                    oversized: vec![0],
                }
            }
        }
    }
}

fn batch_decision(buffer: &mut String, reason: FlushReason) -> FlushDecision {
    let text = std::mem::take(buffer);
    FlushDecision {
        fence_open: count_fence_delimiters(&text) % 2 == 1,
        reason,
        text,
        truncated: false,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::stream;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::agent::cancel::CancelHandle;
    use crate::channels::adapter::AdapterCapabilities;
    use crate::channels::adapter::testing::RecordingAdapter;
    use crate::channels::delivery_retry::RetryConfig;
    use crate::config::{DEFAULT_STREAM_CONFIG, LockMode};

    fn texts(parts: &[&str]) -> Vec<ProviderDelta> {
        let mut deltas: Vec<ProviderDelta> = parts
            .iter()
            .map(|p| ProviderDelta::Text(p.to_string()))
            .collect();
        deltas.push(ProviderDelta::Done);
        deltas
    }

    fn scenario_config() -> StreamConfig {
        StreamConfig {
            min_flush_chars: 5,
            max_buffer_chars: 1000,
            sentence_boundary_pattern: r"\. $".into(),
            ..DEFAULT_STREAM_CONFIG
        }
    }

    fn handler(
        adapter: Arc<RecordingAdapter>,
        config: StreamConfig,
    ) -> StreamingResponseHandler {
        StreamingResponseHandler::new("test:1", adapter, config, SessionLock::new())
            .unwrap()
            .with_retry_manager(Arc::new(DeliveryRetryManager::with_default_config(
                RetryConfig::disabled(),
            )))
    }

    #[tokio::test]
    async fn test_sentence_then_stream_end() {
        let adapter = Arc::new(RecordingAdapter::new(
            "rec",
            AdapterCapabilities::streaming(4000),
        ));
        let mut h = handler(adapter.clone(), scenario_config());
        let deltas = stream::iter(texts(&["Hello ", "world", ". ", "This is a second sentence."]));

        let summary = h.run(deltas, CancelSignal::never()).await.unwrap();

        assert_eq!(
            summary.flush_reasons,
            vec![FlushReason::SentenceBoundary, FlushReason::StreamEnd]
        );
        assert_eq!(adapter.texts(), vec!["Hello world. ", "This is a second sentence."]);
        assert_eq!(summary.delivered_text(), "Hello world. This is a second sentence.");
        assert_eq!(summary.chunk_count, 2);
        assert!(!summary.possibly_malformed);
        assert!(!summary.cancelled);

        let chunks = adapter.chunks();
        assert!(!chunks[0].is_final);
        assert!(chunks[1].is_final);
        assert_eq!(chunks[1].index, 1);
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let adapter = Arc::new(RecordingAdapter::new(
            "rec",
            AdapterCapabilities::streaming(4000),
        ));
        let mut h = handler(adapter, scenario_config());
        h.run(stream::iter(texts(&["Hello. ", "Bye"])), CancelSignal::never())
            .await
            .unwrap();

        assert_eq!(
            h.transitions(),
            &[
                HandlerState::Idle,
                HandlerState::Locking,
                HandlerState::Streaming,
                HandlerState::Flushing,
                HandlerState::Streaming,
                HandlerState::Flushing,
                HandlerState::Draining,
                HandlerState::Closed { error: None },
            ]
        );
        assert!(h.state().is_closed());
    }

    #[tokio::test]
    async fn test_handler_runs_once() {
        let adapter = Arc::new(RecordingAdapter::new(
            "rec",
            AdapterCapabilities::streaming(4000),
        ));
        let mut h = handler(adapter, scenario_config());
        h.run(stream::iter(texts(&["a"])), CancelSignal::never())
            .await
            .unwrap();
        let again = h.run(stream::iter(texts(&["b"])), CancelSignal::never()).await;
        assert!(matches!(again, Err(StreamError::AlreadyRun { .. })));
    }

    #[test]
    fn test_invalid_config_fails_fast() {
        let adapter = Arc::new(RecordingAdapter::new(
            "rec",
            AdapterCapabilities::streaming(4000),
        ));
        let config = StreamConfig {
            max_buffer_chars: 0,
            ..DEFAULT_STREAM_CONFIG
        };
        let result = StreamingResponseHandler::new("s", adapter, config, SessionLock::new());
        assert!(matches!(result, Err(StreamError::Config(_))));
    }

    #[tokio::test]
    async fn test_busy_session_rejected_without_delivery() {
        let adapter = Arc::new(RecordingAdapter::new(
            "rec",
            AdapterCapabilities::streaming(4000),
        ));
        let lock = SessionLock::new();
        let _held = lock.try_acquire("test:1").unwrap();
        let config = StreamConfig {
            lock_mode: LockMode::ExclusiveReject,
            ..scenario_config()
        };
        let mut h =
            StreamingResponseHandler::new("test:1", adapter.clone(), config, lock).unwrap();

        let result = h.run(stream::iter(texts(&["x"])), CancelSignal::never()).await;

        assert!(matches!(result, Err(StreamError::Lock(LockError::Busy { .. }))));
        assert!(adapter.texts().is_empty());
        assert!(matches!(h.state(), HandlerState::Closed { error: Some(_) }));
    }

    #[tokio::test]
    async fn test_error_event_finalizes_with_partial_buffer() {
        let adapter = Arc::new(RecordingAdapter::new(
            "rec",
            AdapterCapabilities::streaming(4000),
        ));
        let mut h = handler(adapter.clone(), scenario_config());
        let deltas = stream::iter(vec![
            ProviderDelta::Text("partial answer".to_string()),
            ProviderDelta::Failed("overloaded".to_string()),
            ProviderDelta::Text("never seen".to_string()),
        ]);

        let summary = h.run(deltas, CancelSignal::never()).await.unwrap();

        assert_eq!(summary.flush_reasons, vec![FlushReason::Error]);
        assert_eq!(summary.stream_error.as_deref(), Some("overloaded"));
        assert_eq!(adapter.texts(), vec!["partial answer"]);
    }

    #[tokio::test]
    async fn test_delivery_failure_continues_by_default() {
        let adapter = Arc::new(RecordingAdapter::new(
            "rec",
            AdapterCapabilities::streaming(4000),
        ));
        adapter.script(vec![Some(adapter.rejection("flood wait"))]);
        let mut h = handler(adapter.clone(), scenario_config());

        let summary = h
            .run(stream::iter(texts(&["One. ", "Two. ", "Three"])), CancelSignal::never())
            .await
            .unwrap();

        assert_eq!(summary.partial_delivery_errors.len(), 1);
        assert_eq!(summary.partial_delivery_errors[0].chunk_index, 0);
        assert_eq!(adapter.texts(), vec!["Two. ", "Three"]);
        assert!(!summary.aborted);
        assert_eq!(summary.final_state, HandlerState::Closed { error: None });
    }

    #[tokio::test]
    async fn test_abort_on_delivery_error() {
        let adapter = Arc::new(RecordingAdapter::new(
            "rec",
            AdapterCapabilities::streaming(4000),
        ));
        adapter.script(vec![Some(adapter.rejection("forbidden"))]);
        let lock = SessionLock::new();
        let config = StreamConfig {
            abort_on_delivery_error: true,
            ..scenario_config()
        };
        let mut h = StreamingResponseHandler::new("test:1", adapter.clone(), config, lock.clone())
            .unwrap();

        let summary = h
            .run(stream::iter(texts(&["One. ", "Two. ", "Three"])), CancelSignal::never())
            .await
            .unwrap();

        assert!(summary.aborted);
        assert!(adapter.texts().is_empty());
        assert!(matches!(summary.final_state, HandlerState::Closed { error: Some(_) }));
        assert!(!lock.is_held("test:1"), "lock released after abort");
    }

    #[tokio::test]
    async fn test_long_flush_is_split_to_platform_limit() {
        let adapter = Arc::new(RecordingAdapter::new(
            "rec",
            AdapterCapabilities::streaming(2000),
        ));
        let body = "x".repeat(5000);
        let mut h = handler(adapter.clone(), DEFAULT_STREAM_CONFIG);

        let summary = h
            .run(stream::iter(texts(&[&body])), CancelSignal::never())
            .await
            .unwrap();

        assert_eq!(adapter.texts().concat(), body);
        assert!(adapter.texts().iter().all(|t| t.chars().count() <= 2000));
        assert_eq!(summary.flush_reasons, vec![FlushReason::Size, FlushReason::StreamEnd]);
    }

    #[tokio::test]
    async fn test_batch_mode_delivers_after_stream_end() {
        let adapter = Arc::new(RecordingAdapter::new(
            "rec",
            AdapterCapabilities::batch_only(4000),
        ));
        let mut h = handler(adapter.clone(), scenario_config());

        let summary = h
            .run(stream::iter(texts(&["First. ", "Second. ", "Third."])), CancelSignal::never())
            .await
            .unwrap();

        assert!(summary.batch_mode);
        assert_eq!(summary.flush_reasons, vec![FlushReason::StreamEnd]);
        assert_eq!(adapter.texts(), vec!["First. Second. Third."]);
    }

    #[tokio::test]
    async fn test_open_fence_at_end_is_flagged() {
        let adapter = Arc::new(RecordingAdapter::new(
            "rec",
            AdapterCapabilities::streaming(4000),
        ));
        let mut h = handler(adapter.clone(), scenario_config());

        let summary = h
            .run(
                stream::iter(texts(&["Code:\n", "```rust\n", "fn main() {}\n"])),
                CancelSignal::never(),
            )
            .await
            .unwrap();

        assert!(summary.possibly_malformed);
        assert_eq!(summary.flush_reasons, vec![FlushReason::StreamEnd]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_age_flush() {
        let adapter = Arc::new(RecordingAdapter::new(
            "rec",
            AdapterCapabilities::streaming(4000),
        ));
        let config = StreamConfig {
            min_flush_chars: 3,
            max_buffer_age_ms: 500,
            ..DEFAULT_STREAM_CONFIG
        };
        let mut h = handler(adapter.clone(), config);

        let deltas = stream::iter(vec![
            Some(ProviderDelta::Text("waiting".to_string())),
            None,
            Some(ProviderDelta::Text(" done".to_string())),
            Some(ProviderDelta::Done),
        ])
        .then(|delta| async move {
            if delta.is_none() {
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
            delta
        })
        .filter_map(|d| async move { d });

        let summary = h
            .run(Box::pin(deltas), CancelSignal::never())
            .await
            .unwrap();

        assert_eq!(summary.flush_reasons, vec![FlushReason::Age, FlushReason::StreamEnd]);
        assert_eq!(adapter.texts(), vec!["waiting", " done"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_timeout_finalizes() {
        let adapter = Arc::new(RecordingAdapter::new(
            "rec",
            AdapterCapabilities::streaming(4000),
        ));
        let config = StreamConfig {
            delta_read_timeout_ms: 1000,
            ..scenario_config()
        };
        let mut h = handler(adapter.clone(), config);
        let deltas = stream::iter(vec![ProviderDelta::Text("stalled".to_string())])
            .chain(stream::pending());

        let summary = h.run(deltas, CancelSignal::never()).await.unwrap();

        assert_eq!(summary.flush_reasons, vec![FlushReason::Error]);
        assert!(summary.stream_error.is_some());
        assert_eq!(adapter.texts(), vec!["stalled"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_drains_buffer() {
        let adapter = Arc::new(RecordingAdapter::new(
            "rec",
            AdapterCapabilities::streaming(4000),
        ));
        let lock = SessionLock::new();
        let mut h = StreamingResponseHandler::new(
            "test:1",
            adapter.clone(),
            scenario_config(),
            lock.clone(),
        )
        .unwrap();
        let (cancel, signal) = CancelHandle::pair();
        let deltas = stream::iter(vec![ProviderDelta::Text("half a thought".to_string())])
            .chain(stream::pending());

        let task = tokio::spawn(async move {
            let summary = h.run(deltas, signal).await;
            (h, summary)
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        let (h, summary) = task.await.unwrap();
        let summary = summary.unwrap();

        assert!(summary.cancelled);
        assert_eq!(adapter.texts(), vec!["half a thought"]);
        assert!(adapter.chunks()[0].is_final);
        assert!(h.transitions().contains(&HandlerState::Draining));
        assert!(!lock.is_held("test:1"));
    }

    #[tokio::test]
    async fn test_cancel_while_queued_delivers_nothing() {
        let adapter = Arc::new(RecordingAdapter::new(
            "rec",
            AdapterCapabilities::streaming(4000),
        ));
        let lock = SessionLock::new();
        let held = lock.try_acquire("test:1").unwrap();
        let mut h = StreamingResponseHandler::new(
            "test:1",
            adapter.clone(),
            scenario_config(),
            lock.clone(),
        )
        .unwrap();
        let (cancel, signal) = CancelHandle::pair();
        cancel.cancel();

        let summary = h
            .run(stream::iter(texts(&["never"])), signal)
            .await
            .unwrap();

        assert!(summary.cancelled);
        assert!(adapter.texts().is_empty());
        assert_eq!(lock.stats("test:1").unwrap().holder, Some(held.token()));
    }

    #[tokio::test]
    async fn test_final_marker_when_response_ends_on_flush_boundary() {
        let adapter = Arc::new(RecordingAdapter::new(
            "rec",
            AdapterCapabilities::streaming(4000),
        ));
        let mut h = handler(adapter.clone(), scenario_config());

        let summary = h
            .run(stream::iter(texts(&["Hello world. "])), CancelSignal::never())
            .await
            .unwrap();

        assert_eq!(
            summary.flush_reasons,
            vec![FlushReason::SentenceBoundary, FlushReason::StreamEnd]
        );
        let chunks = adapter.chunks();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Hello world. ");
        assert_eq!(chunks[0].index, 0);
        assert!(chunks[0].is_final);
        assert_eq!(summary.flushes[0].chunks, vec!["Hello world. "]);
        assert!(summary.flushes[1].chunks.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_stalled_delivery_sends_text_once() {
        let adapter = Arc::new(RecordingAdapter::new(
            "rec",
            AdapterCapabilities::streaming(4000),
        ));
        adapter.stall_next();
        let mut h = handler(adapter.clone(), scenario_config());
        let (cancel, signal) = CancelHandle::pair();
        let deltas = stream::iter(vec![
            ProviderDelta::Text("One. ".to_string()),
            ProviderDelta::Text("Two. ".to_string()),
        ])
        .chain(stream::pending());

        let task = tokio::spawn(async move { h.run(deltas, signal).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        let summary = task.await.unwrap().unwrap();

        assert!(summary.cancelled);
        assert_eq!(adapter.texts(), vec!["One. Two. "]);
        assert_eq!(summary.delivered_text(), "One. Two. ");
        assert_eq!(summary.chunk_count, 1);
        assert!(adapter.chunks()[0].is_final);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_mode_retries_through_shared_manager() {
        let adapter = Arc::new(RecordingAdapter::new(
            "rec",
            AdapterCapabilities::batch_only(4000),
        ));
        adapter.script(vec![Some(DeliveryError::Unavailable {
            adapter: "rec".to_string(),
            reason: "restarting".to_string(),
        })]);
        let retry = Arc::new(DeliveryRetryManager::with_default_config(RetryConfig::default()));
        let mut h = StreamingResponseHandler::new(
            "test:1",
            adapter.clone(),
            scenario_config(),
            SessionLock::new(),
        )
        .unwrap()
        .with_retry_manager(retry.clone());

        let summary = h
            .run(stream::iter(texts(&["First. ", "Second."])), CancelSignal::never())
            .await
            .unwrap();

        assert!(summary.batch_mode);
        assert!(!summary.has_delivery_errors());
        assert_eq!(adapter.texts(), vec!["First. Second."]);
        assert!(adapter.chunks()[0].is_final);
        assert_eq!(retry.get_metrics("rec").await.unwrap().total_attempts, 2);
    }
}
