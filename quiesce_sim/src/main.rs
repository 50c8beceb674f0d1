//! quiesce deterministic harness CLI
//!
//! Run the built-in scenarios under standard, random, replayed or explored
//! schedules.

use clap::Parser;
use quiesce_sim::scenarios::ScenarioId;
use quiesce_sim::{ExploreConfig, ReportExport, ScenarioResult, ScenarioRunner, Schedule, SchedulePolicy};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// quiesce deterministic concurrency harness CLI
#[derive(Parser, Debug)]
#[command(name = "quiesce-sim")]
#[command(about = "Run deterministic concurrency scenarios", long_about = None)]
struct Args {
    /// Master seed for determinism (0 = random from time)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Scenario to run (after_func, with_timeout, expect_continue, ..., all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Number of consecutive seeds to run (for CI mode)
    #[arg(long, default_value = "1")]
    seeds: usize,

    /// Explore schedules instead of running once
    #[arg(short, long)]
    explore: bool,

    /// Schedule bound for --explore
    #[arg(long, default_value = "1000")]
    max_schedules: usize,

    /// Choice-point depth bound for --explore
    #[arg(long, default_value = "64")]
    max_depth: usize,

    /// Break ties randomly (seeded) instead of FIFO
    #[arg(long)]
    random: bool,

    /// Replay a recorded schedule, e.g. "1.0" (single scenario only)
    #[arg(long, conflicts_with = "explore")]
    replay: Option<Schedule>,

    /// Per-run step budget before a livelock is reported
    #[arg(long, default_value = "1000000")]
    max_steps: u64,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,

    /// Export the full report (with event logs) to a JSON file
    #[arg(long)]
    export: Option<String>,
}

fn main() {
    let args = Args::parse();

    // Initialize logging; RUST_LOG wins over --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }

    if !args.json {
        info!("quiesce harness v{}", env!("CARGO_PKG_VERSION"));
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    // Parse scenarios
    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        vec![args.scenario.parse().unwrap_or_else(|e| {
            eprintln!("Error: {}", e);
            let names: Vec<&str> = ScenarioId::all().iter().map(|s| s.name()).collect();
            eprintln!("Available scenarios: {}, all", names.join(", "));
            std::process::exit(1);
        })]
    };

    if args.replay.is_some() && (scenarios.len() > 1 || args.seeds > 1) {
        eprintln!("Error: --replay only supports a single scenario and seed");
        std::process::exit(1);
    }

    // Determine base seed
    let base_seed = if args.seed == 0 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(42)
    } else {
        args.seed
    };

    let seeds: Vec<u64> = (0..args.seeds)
        .map(|offset| base_seed.wrapping_add(offset as u64))
        .collect();
    let mut export = ReportExport::new(seeds.clone());

    // Run scenarios
    for &seed in &seeds {
        let mut runner = ScenarioRunner::new(seed)
            .with_max_steps(args.max_steps)
            .with_event_log(args.export.is_some());
        if args.random {
            runner = runner.with_policy(SchedulePolicy::Random { seed });
        }
        if args.explore {
            runner = runner.with_explore(
                ExploreConfig::default()
                    .with_max_schedules(args.max_schedules)
                    .with_max_depth(args.max_depth),
            );
        }
        if let Some(schedule) = &args.replay {
            runner = runner.with_replay(schedule.clone());
        }

        for scenario in &scenarios {
            let result = runner.run(*scenario);
            if !args.json {
                report(&result);
            }
            export.add_result(result);
        }
    }

    if let Some(path) = &args.export {
        match export.write_to_file(path) {
            Ok(()) => info!("Exported {} result(s) to {}", export.results.len(), path),
            Err(e) => error!("Failed to write export: {:?}", e),
        }
    }

    // Summary
    if args.json {
        match export.to_json() {
            Ok(json) => println!("{}", json),
            Err(e) => error!("Failed to serialize report: {}", e),
        }
    } else {
        info!("");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        if export.all_passed() {
            info!("✅ All {} scenario runs passed!", export.summary.total);
        } else {
            error!(
                "❌ {}/{} scenario runs failed!",
                export.summary.failed, export.summary.total
            );
            for result in export.results.iter().filter(|r| !r.passed) {
                error!(
                    "  - {} seed={}: {}",
                    result.scenario.name(),
                    result.seed,
                    result.failure_reason.as_deref().unwrap_or("unknown")
                );
            }
        }
    }

    // Exit with proper code for CI
    if !export.all_passed() {
        std::process::exit(1);
    }
}

fn report(result: &ScenarioResult) {
    let schedule = result
        .schedule
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "-".to_string());
    if result.passed {
        match &result.failure_kind {
            Some(kind) => info!(
                "✓ {} (seed={}) PASSED: expected {} caught after {} schedule(s), replay with --replay {}",
                result.scenario, result.seed, kind, result.schedules_run, schedule
            ),
            None => info!(
                "✓ {} (seed={}) PASSED ({} schedule(s), t={:.3}s)",
                result.scenario, result.seed, result.schedules_run, result.final_time_secs
            ),
        }
    } else {
        error!(
            "✗ {} (seed={}) FAILED: {} (schedule {})",
            result.scenario,
            result.seed,
            result.failure_reason.as_deref().unwrap_or("unknown"),
            schedule
        );
    }
}
