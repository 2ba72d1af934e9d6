use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use colored::Colorize;
use octocache_core::{CacheSettings, CacheStats, CallOptions, CancellationToken};
use octocache_db_memory::create_shared_store;
use serde::Serialize;

use super::{backend_config, build_node};
use crate::cli::{OutputFormat, StampedeArgs};
use crate::output::{print_field, print_json, print_stats, print_success};

const KEY: &str = "report:daily";

#[derive(Serialize)]
struct StampedeReport {
    callers: usize,
    cancelled_callers: usize,
    factory_invocations: usize,
    succeeded: usize,
    cancelled: usize,
    failed: usize,
    elapsed_ms: u128,
    stats: CacheStats,
}

async fn build_report(
    runs: Arc<AtomicUsize>,
    delay: Duration,
    token: CancellationToken,
) -> anyhow::Result<Option<String>> {
    runs.fetch_add(1, Ordering::SeqCst);
    tokio::select! {
        () = tokio::time::sleep(delay) => {
            Ok(Some(format!("report built in {} ms", delay.as_millis())))
        }
        () = token.cancelled() => Err(anyhow::anyhow!("report build cancelled")),
    }
}

pub async fn run(
    settings: &CacheSettings,
    args: &StampedeArgs,
    format: OutputFormat,
) -> Result<()> {
    if args.callers == 0 {
        bail!("--callers must be at least 1");
    }
    if args.cancel > args.callers {
        bail!("--cancel ({}) cannot exceed --callers ({})", args.cancel, args.callers);
    }

    let backend = backend_config(settings);
    let cache = build_node(settings, &backend, create_shared_store(&backend));
    let runs = Arc::new(AtomicUsize::new(0));
    let delay = Duration::from_millis(args.delay_ms);

    let started = Instant::now();
    let mut tokens = Vec::with_capacity(args.cancel);
    let mut handles = Vec::with_capacity(args.callers);
    for i in 0..args.callers {
        let mut options = CallOptions::new();
        if i < args.cancel {
            let token = CancellationToken::new();
            tokens.push(token.clone());
            options = options.with_cancellation(token);
        }
        let cache = cache.clone();
        let runs = runs.clone();
        handles.push(tokio::spawn(async move {
            cache
                .get_or_create(
                    KEY,
                    runs,
                    move |runs, token| build_report(runs, delay, token),
                    &options,
                )
                .await
        }));
    }

    if !tokens.is_empty() {
        tokio::time::sleep(delay / 2).await;
        tracing::info!(count = tokens.len(), "cancelling callers");
        for token in &tokens {
            token.cancel();
        }
    }

    let (mut succeeded, mut cancelled, mut failed) = (0, 0, 0);
    for handle in handles {
        match handle.await? {
            Ok(_) => succeeded += 1,
            Err(e) if e.is_cancelled() => cancelled += 1,
            Err(e) => {
                tracing::warn!(error = %e, "caller failed");
                failed += 1;
            }
        }
    }

    let report = StampedeReport {
        callers: args.callers,
        cancelled_callers: args.cancel,
        factory_invocations: runs.load(Ordering::SeqCst),
        succeeded,
        cancelled,
        failed,
        elapsed_ms: started.elapsed().as_millis(),
        stats: cache.stats(),
    };

    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Text => print_report(&report),
    }
    Ok(())
}

fn print_report(report: &StampedeReport) {
    print_success(&format!(
        "{} callers, factory ran {} time(s)",
        report.callers, report.factory_invocations
    ));
    print_field("Succeeded", report.succeeded.to_string().green());
    print_field("Cancelled", report.cancelled);
    if report.failed > 0 {
        print_field("Failed", report.failed.to_string().red());
    }
    print_field("Elapsed", format!("{} ms", report.elapsed_ms));
    println!();
    print_stats(&report.stats);
}
