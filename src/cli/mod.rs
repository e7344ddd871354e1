//! CLI command handling.
//!
//! Provides subcommands for:
//! - Replaying a recorded delta stream through the pipeline (`replay`)
//! - Splitting a text file to a message limit (`split`)
//! - Inspecting resolved platform configurations (`platforms`)

mod platforms;
mod replay;
mod split;

pub use platforms::{PlatformsArgs, run_platforms_command};
pub use replay::{ReplayArgs, read_deltas, run_replay_command};
pub use split::{SplitArgs, run_split_command};

use std::path::Path;

use clap::{Parser, Subcommand};

use crate::config::PlatformTable;

#[derive(Parser, Debug)]
#[command(name = "ironclaw-stream")]
#[command(about = "Streaming response pipeline: parse, buffer, split and deliver model output")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Platform table file (.json, .yaml, .yml or .json5)
    #[arg(short, long, global = true, env = "STREAM_PLATFORM_TABLE")]
    pub table: Option<std::path::PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub log_json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Feed a JSON-lines delta file through the full pipeline
    Replay(ReplayArgs),

    /// Split a text file into platform-sized chunks
    Split(SplitArgs),

    /// Show resolved stream configurations
    Platforms(PlatformsArgs),
}

/// Dispatch a parsed command line.
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let table = load_table(cli.table.as_deref())?;
    match cli.command {
        Command::Replay(args) => run_replay_command(args, &table).await,
        Command::Split(args) => run_split_command(args, &table),
        Command::Platforms(args) => run_platforms_command(args, &table),
    }
}

fn load_table(path: Option<&Path>) -> anyhow::Result<PlatformTable> {
    let table = match path {
        Some(path) => PlatformTable::load(path)
            .map_err(|e| anyhow::anyhow!("Failed to load platform table {}: {}", path.display(), e))?,
        None => PlatformTable::builtin(),
    };
    Ok(table)
}
