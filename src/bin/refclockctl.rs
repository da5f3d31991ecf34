//! One-shot diagnostic dump of `refclockd`'s published status snapshot,
//! in the spirit of the teacher's auxiliary `clocktest`/`timetest` bins.

use anyhow::{Context, Result};
use clap::Parser;
use refclockd::status::{ClockState, ManagerSnapshot, SourceSnapshot};
use std::path::PathBuf;

const DEFAULT_STATUS_PATH: &str = "/run/refclockd/status.json";

#[derive(Parser, Debug)]
#[command(author, version, about = "Dump refclockd's current status", long_about = None)]
struct Args {
    /// Path to the status snapshot `refclockd` publishes each tick.
    #[arg(long, default_value = DEFAULT_STATUS_PATH)]
    status_path: PathBuf,

    /// Print the raw JSON instead of the human-readable table.
    #[arg(long, default_value_t = false)]
    json: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let content = std::fs::read_to_string(&args.status_path)
        .with_context(|| format!("reading status snapshot from {}", args.status_path.display()))?;
    let snapshot: ManagerSnapshot = serde_json::from_str(&content).context("parsing status snapshot")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    print_snapshot(&snapshot);
    Ok(())
}

fn print_snapshot(snapshot: &ManagerSnapshot) {
    println!("clock state: {}", describe_state(snapshot.clock_state));
    match &snapshot.selected_source_id {
        Some(id) => println!("selected source: {id}"),
        None => println!("selected source: (none)"),
    }
    println!("healthy: {}", snapshot.healthy());
    println!();

    println!("primary sources:");
    print_sources(&snapshot.primary_sources);
    println!("secondary sources:");
    print_sources(&snapshot.secondary_sources);
}

fn print_sources(sources: &[SourceSnapshot]) {
    if sources.is_empty() {
        println!("  (none configured)");
        return;
    }
    for s in sources {
        println!(
            "  {:<16} proto={:<12} active={:<5} selected={:<5} offset={:>10}ns quality={:>3} errors={}{}",
            s.id,
            s.protocol,
            s.active,
            s.selected,
            s.offset_ns,
            s.quality,
            s.error_count,
            s.last_error.as_deref().map(|e| format!("  last_error={e}")).unwrap_or_default(),
        );
    }
}

fn describe_state(state: ClockState) -> &'static str {
    match state {
        ClockState::Unknown => "unknown",
        ClockState::Synchronized => "synchronized",
        ClockState::Unsynchronized => "unsynchronized",
        ClockState::Holdover => "holdover",
        ClockState::FreeRunning => "free-running",
    }
}
