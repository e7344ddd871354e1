//! `platforms`: show resolved stream configurations.

use std::collections::BTreeMap;

use clap::{Args, ValueEnum};

use crate::config::{PlatformTable, StreamConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
    Yaml,
}

#[derive(Args, Debug, Clone)]
pub struct PlatformsArgs {
    /// Show a single platform (unknown ids show the default)
    #[arg(short, long)]
    pub platform: Option<String>,

    #[arg(short, long, value_enum, default_value = "table")]
    pub format: OutputFormat,
}

/// Run the platforms command.
pub fn run_platforms_command(args: PlatformsArgs, table: &PlatformTable) -> anyhow::Result<()> {
    let mut configs: BTreeMap<String, StreamConfig> = BTreeMap::new();
    match &args.platform {
        Some(id) => {
            configs.insert(id.clone(), table.resolve(id));
        }
        None => {
            for id in table.platform_ids() {
                configs.insert(id.clone(), table.resolve(&id));
            }
            configs.insert("default".to_string(), table.default_config().clone());
        }
    }

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&configs)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(&configs)?),
        OutputFormat::Table => print!("{}", render_table(&configs)),
    }
    Ok(())
}

fn render_table(configs: &BTreeMap<String, StreamConfig>) -> String {
    let mut out = format!(
        "{:<12} {:>9} {:>10} {:>8} {:>9} {:<9}\n",
        "PLATFORM", "MAX MSG", "MAX BUF", "MIN", "AGE MS", "MODE"
    );
    for (id, config) in configs {
        out.push_str(&format!(
            "{:<12} {:>9} {:>10} {:>8} {:>9} {:<9}\n",
            id,
            config.platform_max_message_chars,
            config.max_buffer_chars,
            config.min_flush_chars,
            config.max_buffer_age_ms,
            if config.supports_streaming { "stream" } else { "batch" },
        ));
    }
    out
}
