//! FrameSync Simulator CLI
//!
//! Run the frame-sync coordinator against the deterministic SimWorld, either
//! through the fault scenarios or live until Ctrl-C.

use clap::Parser;
use framesync_core::{CancelToken, StepReport, SyncConfig};
use framesync_sim::{ScenarioId, ScenarioResult, ScenarioRunner};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// FrameSync simulation CLI
#[derive(Parser, Debug)]
#[command(name = "framesync-sim")]
#[command(about = "Run the frame-sync coordinator against a simulated world", long_about = None)]
struct Args {
    /// Scenario to run (nominal, dropped_sensor, slow_sensor, blueprint_fault,
    /// crowded_map, interrupt, clock_loss, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Master seed for determinism [default: 42, or the config file's]
    #[arg(short, long)]
    seed: Option<u64>,

    /// Steps per scenario (live mode: stop after this many)
    #[arg(short = 'n', long)]
    steps: Option<u64>,

    /// Autopilot vehicles besides the ego vehicle
    #[arg(long)]
    vehicles: Option<usize>,

    /// Fleet vehicles given the adversarial override
    #[arg(long)]
    adversarial: Option<usize>,

    /// Wait per sensor delivery in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write sensor payloads under this directory
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Export per-step results of a single scenario to a JSON file
    #[arg(long)]
    export: Option<PathBuf>,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Run without injected faults until Ctrl-C
    #[arg(long)]
    live: bool,
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

fn build_runner(args: &Args) -> Result<ScenarioRunner, framesync_core::SyncError> {
    let mut runner = match &args.config {
        Some(path) => ScenarioRunner::from_config(SyncConfig::from_json_file(path)?),
        None => ScenarioRunner::new(42),
    };

    if let Some(seed) = args.seed {
        runner = runner.with_seed(seed);
    }
    if let Some(steps) = args.steps {
        runner = runner.with_steps(steps);
    }
    if let Some(vehicles) = args.vehicles {
        runner = runner.with_vehicles(vehicles);
    }
    if let Some(adversarial) = args.adversarial {
        runner = runner.with_adversarial(adversarial);
    }
    if let Some(timeout_ms) = args.timeout_ms {
        runner = runner.with_timeout_ms(timeout_ms);
    }
    if let Some(dir) = &args.output {
        runner = runner.with_output(dir.clone());
    }

    runner.config().validate()?;
    Ok(runner)
}

/// Cancels `cancel` on the first Ctrl-C.
fn install_interrupt(cancel: CancelToken) -> std::io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    std::thread::Builder::new()
        .name("interrupt".to_string())
        .spawn(move || {
            runtime.block_on(async {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        warn!("Interrupt received, finishing the current step");
                        cancel.cancel();
                    }
                    Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
                }
            });
        })?;
    Ok(())
}

fn log_report(report: &StepReport) {
    if !report.late.is_empty() {
        info!("  {} late record(s) arrived during {}", report.late.len(), report.step);
    }
}

fn run_live(args: &Args, runner: &ScenarioRunner) -> i32 {
    let cancel = CancelToken::new();
    if let Err(e) = install_interrupt(cancel.clone()) {
        error!("Cannot install the interrupt handler: {}", e);
        return 1;
    }

    info!("Live run, press Ctrl-C to stop");
    match runner.run_live(&cancel, args.steps, log_report) {
        Ok(summary) => {
            info!(
                "{} steps: {} full, {} partial, {} missing, {} late, {} overflow drops",
                summary.steps,
                summary.full_steps,
                summary.partial_steps,
                summary.missing_deliveries,
                summary.late_deliveries,
                summary.queue.overflow_drops
            );
            0
        }
        Err(e) => {
            error!("Fatal: {}", e);
            e.exit_code()
        }
    }
}

fn print_json(results: &[ScenarioResult], failed: usize) {
    let summary = serde_json::json!({
        "total": results.len(),
        "passed": results.len() - failed,
        "failed": failed,
        "results": results.iter().map(|r| {
            serde_json::json!({
                "scenario": r.scenario.name(),
                "seed": r.seed,
                "passed": r.passed,
                "steps": r.summary.steps,
                "full_steps": r.summary.full_steps,
                "partial_steps": r.summary.partial_steps,
                "late_deliveries": r.summary.late_deliveries,
                "fatal": r.fatal,
                "failure_reason": r.failure_reason,
            })
        }).collect::<Vec<_>>(),
    });
    match serde_json::to_string_pretty(&summary) {
        Ok(text) => println!("{}", text),
        Err(e) => error!("Failed to encode results: {}", e),
    }
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    let runner = match build_runner(&args) {
        Ok(runner) => runner,
        Err(e) => {
            error!("{}", e);
            std::process::exit(e.exit_code());
        }
    };

    if args.live {
        std::process::exit(run_live(&args, &runner));
    }

    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        match args.scenario.parse() {
            Ok(scenario) => vec![scenario],
            Err(e) => {
                eprintln!("Error: {}", e);
                eprintln!(
                    "Available scenarios: {}, all",
                    ScenarioId::all().iter().map(|s| s.name()).collect::<Vec<_>>().join(", ")
                );
                std::process::exit(1);
            }
        }
    };

    if args.export.is_some() && scenarios.len() > 1 {
        eprintln!("Error: --export only supports a single scenario, not 'all'");
        std::process::exit(1);
    }

    if !args.json {
        info!("FrameSync simulator v{}", env!("CARGO_PKG_VERSION"));
    }

    let mut results: Vec<ScenarioResult> = Vec::new();
    for scenario in scenarios {
        let result = runner.run(scenario);

        if !args.json {
            if result.passed {
                info!("✓ {} (seed={}) PASSED", scenario.name(), result.seed);
            } else {
                error!(
                    "✗ {} (seed={}) FAILED: {}",
                    scenario.name(),
                    result.seed,
                    result.failure_reason.as_deref().unwrap_or("unknown")
                );
            }
        }
        results.push(result);
    }

    if let (Some(path), Some(result)) = (&args.export, results.first()) {
        match result.export.write_to_file(path) {
            Ok(()) => info!("Exported {} steps to {}", result.export.steps.len(), path.display()),
            Err(e) => error!("Failed to write export: {}", e),
        }
    }

    let failed = results.iter().filter(|r| !r.passed).count();
    if args.json {
        print_json(&results, failed);
    } else if failed == 0 {
        info!("All {} scenario runs passed", results.len());
    } else {
        error!("{}/{} scenario runs failed", failed, results.len());
    }

    if failed > 0 {
        std::process::exit(1);
    }
}
