use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "octocache")]
#[command(about = "octocache - tiered read-through cache playground")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (defaults to ./octocache.toml when present)
    #[arg(short, long, global = true, env = "OCTOCACHE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (overrides the config file; RUST_LOG wins over both)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// Output format
    #[arg(short, long, global = true)]
    pub format: Option<OutputFormat>,
}

#[derive(Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Walk through a read-through lifecycle for one key
    Demo,
    /// Hammer one key with concurrent callers
    Stampede(StampedeArgs),
    /// Inspect configuration
    Config(ConfigArgs),
}

#[derive(clap::Args)]
pub struct StampedeArgs {
    /// Number of concurrent callers
    #[arg(long, default_value_t = 100)]
    pub callers: usize,
    /// Simulated load time of the factory, in milliseconds
    #[arg(long, default_value_t = 200)]
    pub delay_ms: u64,
    /// Cancel this many callers halfway through the load
    #[arg(long, default_value_t = 0)]
    pub cancel: usize,
}

#[derive(clap::Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
}
