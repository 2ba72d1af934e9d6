use anyhow::Result;
use colored::Colorize;
use octocache_core::CacheStats;
use serde::Serialize;

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

pub fn print_step(msg: &str) {
    println!("{} {}", "→".cyan(), msg);
}

pub fn print_field(label: &str, value: impl std::fmt::Display) {
    println!("  {}: {}", label.cyan(), value);
}

pub fn print_stats(stats: &CacheStats) {
    println!("{}", "Cache statistics".bold());
    print_field("Local hits", stats.local_hits);
    print_field("Shared hits", stats.shared_hits);
    print_field("Misses", stats.misses);
    print_field("Hit rate", format!("{:.1}%", stats.hit_rate()));
    print_field("Factory invocations", stats.factory_invocations);
    print_field("Stampede joins", stats.stampede_joins);
    print_field("Shared reads completed inline", stats.shared_sync_completions);
    if stats.shared_faults > 0 {
        print_field("Shared faults", stats.shared_faults.to_string().yellow());
    }
    if stats.corrupt_payloads > 0 {
        print_field("Corrupt payloads", stats.corrupt_payloads.to_string().yellow());
    }
    if stats.oversized_payloads > 0 {
        print_field("Oversized payloads", stats.oversized_payloads.to_string().yellow());
    }
}
