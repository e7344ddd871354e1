//! Console adapter used by the CLI.
//!
//! Writes each delivered chunk to a terminal (or any writer), either as
//! plain text with a separator line or as one JSON object per line.

use std::io::Write;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::Serialize;

use super::adapter::{AdapterCapabilities, MessageChunk, StreamAdapter};
use crate::error::DeliveryError;

/// Output layout for [`ConsoleAdapter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleFormat {
    Plain,
    JsonLines,
}

#[derive(Serialize)]
struct ChunkLine<'a> {
    session_key: &'a str,
    index: usize,
    is_final: bool,
    chars: usize,
    text: &'a str,
}

/// Prints chunks as they are delivered.
pub struct ConsoleAdapter {
    name: String,
    capabilities: AdapterCapabilities,
    format: ConsoleFormat,
    out: Mutex<Box<dyn Write + Send>>,
}

impl ConsoleAdapter {
    /// Console adapter on stdout.
    pub fn stdout(name: &str, capabilities: AdapterCapabilities, format: ConsoleFormat) -> Self {
        Self::with_writer(name, capabilities, format, Box::new(std::io::stdout()))
    }

    pub fn with_writer(
        name: &str,
        capabilities: AdapterCapabilities,
        format: ConsoleFormat,
        out: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            name: name.to_string(),
            capabilities,
            format,
            out: Mutex::new(out),
        }
    }

    fn render(&self, chunk: &MessageChunk, session_key: &str) -> Result<String, DeliveryError> {
        match self.format {
            ConsoleFormat::Plain => Ok(format!(
                "--- [{}] chunk {}{} ({} chars) ---\n{}\n",
                session_key,
                chunk.index,
                if chunk.is_final { ", final" } else { "" },
                chunk.char_len(),
                chunk.text
            )),
            ConsoleFormat::JsonLines => {
                let line = ChunkLine {
                    session_key,
                    index: chunk.index,
                    is_final: chunk.is_final,
                    chars: chunk.char_len(),
                    text: &chunk.text,
                };
                serde_json::to_string(&line)
                    .map(|json| json + "\n")
                    .map_err(|e| DeliveryError::Rejected {
                        adapter: self.name.clone(),
                        reason: e.to_string(),
                    })
            }
        }
    }
}

#[async_trait]
impl StreamAdapter for ConsoleAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> AdapterCapabilities {
        self.capabilities
    }

    async fn deliver(&self, chunk: &MessageChunk, session_key: &str) -> Result<(), DeliveryError> {
        let rendered = self.render(chunk, session_key)?;
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        out.write_all(rendered.as_bytes())
            .and_then(|()| out.flush())
            .map_err(|e| DeliveryError::Unavailable {
                adapter: self.name.clone(),
                reason: e.to_string(),
            })
    }
}
