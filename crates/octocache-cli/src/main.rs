mod cli;
mod commands;
mod observability;
mod output;

use anyhow::Result;
use clap::Parser;
use octocache_core::config::loader;

use cli::{Cli, Commands, ConfigCommands};
use output::print_error;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        print_error(&format!("{e:#}"));
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let format = cli.format.unwrap_or_default();

    let mut settings = loader::load_settings(cli.config.as_deref()).map_err(anyhow::Error::msg)?;
    if let Some(level) = &cli.log_level {
        settings.logging.level = level.clone();
    }
    observability::init_tracing_with_level(&settings.logging.level);

    match &cli.command {
        Commands::Demo => {
            commands::demo::run(&settings, format).await?;
        }
        Commands::Stampede(args) => {
            commands::stampede::run(&settings, args, format).await?;
        }
        Commands::Config(args) => match &args.command {
            ConfigCommands::Show => commands::config::show(&settings, format)?,
        },
    }

    Ok(())
}
