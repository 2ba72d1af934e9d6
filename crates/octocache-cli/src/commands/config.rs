use anyhow::Result;
use octocache_core::CacheSettings;

use crate::cli::OutputFormat;
use crate::output::print_json;

pub fn show(settings: &CacheSettings, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => print_json(settings)?,
        OutputFormat::Text => print!("{}", toml::to_string_pretty(settings)?),
    }
    Ok(())
}
