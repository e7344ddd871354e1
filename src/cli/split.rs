//! `split`: run the message splitter over a file.

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Args;
use serde::Serialize;

use crate::config::PlatformTable;
use crate::streaming::split_with_report;

#[derive(Args, Debug, Clone)]
pub struct SplitArgs {
    /// Text file to split (`-` reads stdin)
    pub file: PathBuf,

    /// Per-chunk limit in characters (defaults to the platform limit)
    #[arg(short, long)]
    pub max_chars: Option<usize>,

    /// Platform whose message limit applies when --max-chars is absent
    #[arg(short, long, default_value = "default")]
    pub platform: String,

    /// Print chunks as a JSON document
    #[arg(long)]
    pub json: bool,
}

#[derive(Serialize)]
struct ChunkView<'a> {
    index: usize,
    chars: usize,
    oversized: bool,
    text: &'a str,
}

/// Run the split command.
pub fn run_split_command(args: SplitArgs, table: &PlatformTable) -> anyhow::Result<()> {
    let text = read_input(&args.file)?;
    let max_chars = args
        .max_chars
        .unwrap_or_else(|| table.resolve(&args.platform).platform_max_message_chars);
    let report = split_with_report(&text, max_chars)?;

    if report.has_oversized() {
        tracing::warn!(
            oversized = ?report.oversized,
            max_chars,
            "Some chunks exceed the limit to keep code blocks intact"
        );
    }

    let views: Vec<ChunkView<'_>> = report
        .chunks
        .iter()
        .enumerate()
        .map(|(index, chunk)| ChunkView {
            index,
            chars: chunk.chars().count(),
            oversized: report.oversized.contains(&index),
            text: chunk,
        })
        .collect();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&views)?);
        return Ok(());
    }

    for view in &views {
        println!(
            "--- chunk {} ({} chars{}) ---",
            view.index,
            view.chars,
            if view.oversized { ", oversized" } else { "" }
        );
        println!("{}", view.text);
    }
    println!("{} chunk(s), limit {} chars", views.len(), max_chars);
    Ok(())
}

fn read_input(path: &Path) -> anyhow::Result<String> {
    if path.as_os_str() == "-" {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("Failed to read stdin")?;
        return Ok(text);
    }
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}
