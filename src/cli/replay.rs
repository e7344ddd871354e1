//! `replay`: run a recorded delta stream through the pipeline.
//!
//! Each non-empty line of the input is one delta. A line may be a tagged
//! [`ProviderDelta`] (`{"type":"text","data":"Hi"}`), a raw provider frame
//! (Anthropic or OpenAI streaming JSON), or an SSE `data:` line.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Args;
use tokio_stream::wrappers::ReceiverStream;

use crate::agent::{CancelHandle, SessionLock};
use crate::channels::{AdapterCapabilities, ConsoleAdapter, ConsoleFormat};
use crate::config::PlatformTable;
use crate::streaming::{ProviderDelta, StreamingResponseHandler};

#[derive(Args, Debug, Clone)]
pub struct ReplayArgs {
    /// JSON-lines file of provider deltas
    pub file: PathBuf,

    /// Platform id used to resolve the stream configuration
    #[arg(short, long, default_value = "webchat")]
    pub platform: String,

    /// Session key the deltas belong to
    #[arg(short, long, default_value = "cli:replay")]
    pub session: String,

    /// Pause between deltas, to exercise age flushes
    #[arg(long, default_value = "0")]
    pub delta_delay_ms: u64,

    /// Print chunks as JSON lines instead of plain text
    #[arg(long)]
    pub json_chunks: bool,

    /// Cancel the stream after this many milliseconds
    #[arg(long)]
    pub cancel_after_ms: Option<u64>,
}

/// Run the replay command.
pub async fn run_replay_command(args: ReplayArgs, table: &PlatformTable) -> anyhow::Result<()> {
    let deltas = read_deltas(&args.file)?;
    let config = table.resolve(&args.platform).with_env_overrides();

    tracing::info!(
        platform = %args.platform,
        session_key = %args.session,
        deltas = deltas.len(),
        "Replaying delta stream"
    );

    let capabilities = AdapterCapabilities {
        supports_streaming: config.supports_streaming,
        max_message_chars: config.platform_max_message_chars,
    };
    let format = if args.json_chunks {
        ConsoleFormat::JsonLines
    } else {
        ConsoleFormat::Plain
    };
    let adapter = Arc::new(ConsoleAdapter::stdout(&args.platform, capabilities, format));

    let mut handler =
        StreamingResponseHandler::new(&args.session, adapter, config, SessionLock::new())?;

    let (cancel, signal) = CancelHandle::pair();
    if let Some(ms) = args.cancel_after_ms {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            cancel.cancel();
        });
    }

    // Feed deltas from a separate task, the way a provider client would.
    let (tx, rx) = tokio::sync::mpsc::channel(64);
    let delay = Duration::from_millis(args.delta_delay_ms);
    tokio::spawn(async move {
        for delta in deltas {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if tx.send(delta).await.is_err() {
                break;
            }
        }
    });

    let summary = handler.run(ReceiverStream::new(rx), signal).await?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    if summary.has_delivery_errors() {
        anyhow::bail!(
            "{} chunk(s) failed to deliver",
            summary.partial_delivery_errors.len()
        );
    }
    Ok(())
}

/// Read a JSON-lines delta file.
pub fn read_deltas(path: &Path) -> anyhow::Result<Vec<ProviderDelta>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read delta file {}", path.display()))?;
    Ok(parse_deltas(&contents))
}

fn parse_deltas(contents: &str) -> Vec<ProviderDelta> {
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(parse_line)
        .collect()
}

fn parse_line(line: &str) -> ProviderDelta {
    if let Ok(delta) = serde_json::from_str::<ProviderDelta>(line) {
        return delta;
    }
    match serde_json::from_str::<serde_json::Value>(line) {
        Ok(value) => ProviderDelta::Json(value),
        Err(_) => ProviderDelta::Raw(line.to_string()),
    }
}
