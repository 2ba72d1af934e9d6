use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use colored::Colorize;
use octocache_core::{CacheSettings, CacheStats, CacheValue, CallOptions, CancellationToken};
use octocache_db_memory::create_shared_store;
use serde::{Deserialize, Serialize};

use super::{backend_config, build_node};
use crate::cli::OutputFormat;
use crate::output::{print_field, print_json, print_stats, print_step, print_success};

const KEY: &str = "user:42";
const TAG: &str = "users";
const LOAD_TIME: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    pub name: String,
}

impl CacheValue for User {}

#[derive(Serialize)]
struct DemoStep {
    step: &'static str,
    value: Option<User>,
    elapsed_ms: u128,
}

#[derive(Serialize)]
struct DemoReport {
    loads: usize,
    steps: Vec<DemoStep>,
    node_a: CacheStats,
    node_b: CacheStats,
}

/// Simulated database read.
async fn load_user(
    loads: Arc<AtomicUsize>,
    token: CancellationToken,
) -> anyhow::Result<Option<User>> {
    loads.fetch_add(1, Ordering::SeqCst);
    tokio::select! {
        () = tokio::time::sleep(LOAD_TIME) => Ok(Some(User {
            id: 42,
            name: "Ann".to_string(),
        })),
        () = token.cancelled() => Err(anyhow::anyhow!("user load cancelled")),
    }
}

/// Two cache nodes over one shared tier, walking one key through its lifecycle.
pub async fn run(settings: &CacheSettings, format: OutputFormat) -> Result<()> {
    let backend = backend_config(settings);
    let shared = create_shared_store(&backend);
    let node_a = build_node(settings, &backend, shared.clone());
    let node_b = build_node(settings, &backend, shared);
    let loads = Arc::new(AtomicUsize::new(0));
    let tagged = CallOptions::new().with_tags([TAG]);
    let plain = CallOptions::new();
    let mut steps = Vec::new();

    let started = Instant::now();
    let (first, second) = tokio::join!(
        node_a.get_or_create(KEY, loads.clone(), load_user, &tagged),
        node_a.get_or_create(KEY, loads.clone(), load_user, &tagged),
    );
    let elapsed_ms = started.elapsed().as_millis();
    let (first, second) = (first?, second?);
    if first != second {
        anyhow::bail!("concurrent callers observed different values");
    }
    steps.push(DemoStep {
        step: "node A: two concurrent get_or_create calls",
        value: first,
        elapsed_ms,
    });

    let started = Instant::now();
    let value = node_a.get::<User>(KEY, &plain).await?;
    steps.push(DemoStep {
        step: "node A: get (local tier)",
        value,
        elapsed_ms: started.elapsed().as_millis(),
    });

    let started = Instant::now();
    let value = node_b.get::<User>(KEY, &plain).await?;
    steps.push(DemoStep {
        step: "node B: get (shared tier)",
        value,
        elapsed_ms: started.elapsed().as_millis(),
    });

    let started = Instant::now();
    let evicted = node_a.remove_by_tag(TAG).await?;
    tracing::info!(evicted, tag = TAG, "invalidated by tag on node A");
    let value = node_a.get::<User>(KEY, &plain).await?;
    steps.push(DemoStep {
        step: "node A: get after remove_by_tag",
        value,
        elapsed_ms: started.elapsed().as_millis(),
    });

    // Node B keeps its local copy; only the shared tier is shared
    let started = Instant::now();
    let value = node_b.get::<User>(KEY, &plain).await?;
    steps.push(DemoStep {
        step: "node B: get after remove_by_tag on node A",
        value,
        elapsed_ms: started.elapsed().as_millis(),
    });

    let report = DemoReport {
        loads: loads.load(Ordering::SeqCst),
        steps,
        node_a: node_a.stats(),
        node_b: node_b.stats(),
    };

    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Text => print_report(&report),
    }
    Ok(())
}

fn print_report(report: &DemoReport) {
    for step in &report.steps {
        print_step(step.step);
        match &step.value {
            Some(user) => print_field("Value", format!("{} (id {})", user.name, user.id)),
            None => print_field("Value", "(none)".dimmed()),
        }
        print_field("Elapsed", format!("{} ms", step.elapsed_ms));
    }
    println!();
    print_success(&format!("factory ran {} time(s)", report.loads));
    println!();
    println!("{}", "Node A".bold());
    print_stats(&report.node_a);
    println!();
    println!("{}", "Node B".bold());
    print_stats(&report.node_b);
}
