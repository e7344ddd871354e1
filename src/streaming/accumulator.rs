//! Token accumulation and flush timing.
//!
//! Folds [`StreamEvent`]s into a text buffer and decides, event by event,
//! whether the buffer should be flushed. Triggers are checked in priority
//! order:
//!
//! ```text
//! (a) turn-end / error                         -> stream-end / error
//! (b) len >= max_buffer_chars, fence closed    -> size
//! (c) age >= max_buffer_age, fence closed,
//!     len >= min_flush_chars                   -> age
//! (d) sentence boundary at tail, fence closed,
//!     len >= min_flush_chars                   -> sentence-boundary
//! ```
//!
//! While a code fence is open nothing flushes except the end of the stream,
//! or the safety ceiling (`4 * max_buffer_chars`), which forces a size flush
//! marked as truncated.

use std::time::Duration;

use regex::Regex;
use tokio::time::Instant;

use super::event::{FlushReason, StreamEvent, StreamEventKind};
use super::markup::FenceTracker;
use crate::config::StreamConfig;
use crate::error::ConfigError;

/// A flush the handler must perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushDecision {
    pub reason: FlushReason,
    /// Buffered text taken out of the accumulator.
    pub text: String,
    /// Forced by the safety ceiling while a fence was open.
    pub truncated: bool,
    /// A code fence was still open when this flush was cut.
    pub fence_open: bool,
}

/// Live buffer state for one stream.
#[derive(Debug)]
pub struct TokenAccumulator {
    buffer: String,
    buffer_chars: usize,
    marker_chars: usize,
    opened_at: Option<Instant>,
    last_seen_at: Option<Instant>,
    fences: FenceTracker,
    sentence: Regex,
    max_buffer_chars: usize,
    max_age: Duration,
    min_flush_chars: usize,
    ceiling_chars: usize,
}

impl TokenAccumulator {
    /// Build an accumulator. Fails on invalid configuration.
    pub fn new(config: &StreamConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            buffer: String::new(),
            buffer_chars: 0,
            marker_chars: 0,
            opened_at: None,
            last_seen_at: None,
            fences: FenceTracker::new(),
            sentence: config.sentence_regex()?,
            max_buffer_chars: config.max_buffer_chars,
            max_age: Duration::from_millis(config.max_buffer_age_ms),
            min_flush_chars: config.min_flush_chars,
            ceiling_chars: config.safety_ceiling_chars(),
        })
    }

    /// Fold one event in and return a flush decision if one is due.
    pub fn ingest(&mut self, event: &StreamEvent, now: Instant) -> Option<FlushDecision> {
        self.last_seen_at = Some(now);

        match event.kind {
            StreamEventKind::TextDelta => {
                if event.payload.is_empty() {
                    return None;
                }
                self.open_if_empty(now);
                self.buffer.push_str(&event.payload);
                self.buffer_chars += event.payload.chars().count();
                self.fences.feed(&event.payload);
            }
            StreamEventKind::ToolMarker => {
                self.open_if_empty(now);
                self.marker_chars += event.payload.chars().count();
            }
            StreamEventKind::TurnEnd => return Some(self.take(FlushReason::StreamEnd, false)),
            StreamEventKind::Error => return Some(self.take(FlushReason::Error, false)),
        }

        self.evaluate(now)
    }

    /// Check the age trigger without new input (idle timer).
    pub fn poll_age(&mut self, now: Instant) -> Option<FlushDecision> {
        if self.age_due(now) {
            return Some(self.take(FlushReason::Age, false));
        }
        None
    }

    /// When the age trigger could next fire, if the buffer is eligible.
    pub fn age_deadline(&self) -> Option<Instant> {
        if self.fences.is_open() || self.buffered_len() < self.min_flush_chars {
            return None;
        }
        self.opened_at.map(|opened| opened + self.max_age)
    }

    /// Flush whatever is buffered, e.g. on cancellation.
    pub fn drain(&mut self, reason: FlushReason) -> FlushDecision {
        self.take(reason, false)
    }

    /// Chars counted toward size triggers (text plus tool markers).
    pub fn buffered_len(&self) -> usize {
        self.buffer_chars + self.marker_chars
    }

    pub fn buffered_text(&self) -> &str {
        &self.buffer
    }

    pub fn fence_open(&self) -> bool {
        self.fences.is_open()
    }

    pub fn fence_depth(&self) -> usize {
        self.fences.depth()
    }

    pub fn last_seen_at(&self) -> Option<Instant> {
        self.last_seen_at
    }

    fn open_if_empty(&mut self, now: Instant) {
        if self.opened_at.is_none() {
            self.opened_at = Some(now);
        }
    }

    fn evaluate(&mut self, now: Instant) -> Option<FlushDecision> {
        let len = self.buffered_len();

        if self.fences.is_open() {
            if len >= self.ceiling_chars {
                tracing::warn!(
                    buffered = len,
                    ceiling = self.ceiling_chars,
                    "Open code fence exceeded safety ceiling; forcing flush"
                );
                return Some(self.take(FlushReason::Size, true));
            }
            return None;
        }

        if len >= self.max_buffer_chars {
            return Some(self.take(FlushReason::Size, false));
        }
        if self.age_due(now) {
            return Some(self.take(FlushReason::Age, false));
        }
        if len >= self.min_flush_chars && self.sentence.is_match(&self.buffer) {
            return Some(self.take(FlushReason::SentenceBoundary, false));
        }
        None
    }

    fn age_due(&self, now: Instant) -> bool {
        match self.age_deadline() {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }

    fn take(&mut self, reason: FlushReason, truncated: bool) -> FlushDecision {
        let text = std::mem::take(&mut self.buffer);
        self.buffer_chars = 0;
        self.marker_chars = 0;
        self.opened_at = None;
        FlushDecision {
            reason,
            text,
            truncated,
            fence_open: self.fences.is_open(),
        }
    }
}
