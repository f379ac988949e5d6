use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use gym_runner::config::{MAX_DESIRED_RUNS, MIN_DESIRED_RUNS};
use gym_runner::{
    enumerate_pairings, filter_missing_images, missing_images, parse_desired_runs, plan_runs,
    resolve_root, survey, ContainerRuntime, DockerCli, GymConfig, PairingPlan, ResourceGate,
    ScheduleReport, Scheduler, SystemProbe,
};
use serde_json::{json, Value};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gym", version, about = "RESTgym experiment scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan and execute the remaining runs of every enabled pairing.
    Run {
        #[arg(long)]
        root: Option<PathBuf>,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Show how many runs each pairing still needs, without running anything.
    Plan {
        #[arg(long, value_parser = clap::value_parser!(u32).range(MIN_DESIRED_RUNS as i64..=MAX_DESIRED_RUNS as i64))]
        runs: u32,
        #[arg(long)]
        root: Option<PathBuf>,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run { root, config } => {
            let root = resolve_root(root.as_deref())?;
            let config = GymConfig::load_for_root(&root, config.as_deref())?;
            execute(&root, config)?;
        }
        Commands::Plan {
            runs: desired,
            root,
            config,
            json,
        } => {
            let root = resolve_root(root.as_deref())?;
            let config = GymConfig::load_for_root(&root, config.as_deref())?;
            let pairings = enumerate_pairings(&root)?;
            let plans = survey(&config.results_root(&root), &pairings, desired);
            let total: u32 = plans.iter().map(|p| p.needed).sum();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "plan",
                    "root": root.display().to_string(),
                    "desired_runs": desired,
                    "pairings": plans.iter().map(plan_to_json).collect::<Vec<_>>(),
                    "total_needed": total,
                })));
            }
            print_plan(&plans);
            println!("total_needed: {}", total);
        }
    }
    Ok(None)
}

fn execute(root: &Path, config: GymConfig) -> Result<()> {
    print_banner();
    println!(
        "This is the run module. It will run up to {} repetitions of the experiment for each tool and API.",
        MAX_DESIRED_RUNS
    );
    let answer = prompt(&format!(
        "How many runs? [{}-{}]: ",
        MIN_DESIRED_RUNS, MAX_DESIRED_RUNS
    ))?;
    let desired = match parse_desired_runs(&answer) {
        Ok(desired) => desired,
        Err(err) => {
            eprintln!("{}", err);
            std::process::exit(1);
        }
    };

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerCli::new());
    let pairings = enumerate_pairings(root)?;
    let results_root = config.results_root(root);
    let planned = plan_runs(&results_root, &pairings, desired);
    let planned_count = planned.len();
    let missing = missing_images(runtime.as_ref(), &config.image_prefix, &planned);
    let items = if missing.is_empty() {
        println!("Runs planned for execution: {}.", planned_count);
        planned
    } else {
        let items = filter_missing_images(planned, &missing);
        println!(
            "Some container images required for the experiment have not been built ({}). Skipping experiment runs that involve these images. Only {} out of {} runs can be launched.",
            missing.iter().cloned().collect::<Vec<_>>().join(", "),
            items.len(),
            planned_count
        );
        items
    };

    let confirmation =
        prompt("Press ENTER to start the execution of the experiment (or CTRL+C to cancel)...")?;
    if confirmation.is_empty() {
        return Err(anyhow!("input closed before confirmation, nothing was started"));
    }

    info!(items = items.len(), results_root = %results_root.display(), "starting scheduler");
    let gate = ResourceGate::from_config(Box::new(SystemProbe::new()), &config);
    let mut scheduler = Scheduler::new(runtime, config, results_root, gate);
    let report = scheduler.run(items);
    print_report(&report);
    Ok(())
}

/// Returns the raw line including its newline; an empty string means EOF.
fn prompt(message: &str) -> Result<String> {
    print!("{}", message);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line)
}

fn print_banner() {
    println!("    ____  _________________                    ");
    println!("   / __ \\/ ____/ ___/_  __/___ ___  ______ ___ ");
    println!("  / /_/ / __/  \\__ \\ / / / __ `/ / / / __ `__ \\");
    println!(" / _, _/ /___ ___/ // / / /_/ / /_/ / / / / / /");
    println!("/_/ |_/_____//____//_/  \\__, /\\__, /_/ /_/ /_/ ");
    println!("                       /____//____/            ");
    println!("Welcome to the RESTgym experiment infrastructure.");
}

fn print_plan(plans: &[PairingPlan]) {
    for plan in plans {
        println!(
            "{}/{}: existing {}, needed {}",
            plan.pairing.target, plan.pairing.exerciser, plan.existing, plan.needed
        );
    }
}

fn print_report(report: &ScheduleReport) {
    println!(
        "Experiment finished: {} work item(s) completed, {} failed, {} attempt(s) in total.",
        report.completed(),
        report.failed(),
        report.attempts()
    );
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Plan { json, .. } => *json,
        Commands::Run { .. } => false,
    }
}

fn plan_to_json(plan: &PairingPlan) -> Value {
    json!({
        "target": plan.pairing.target,
        "exerciser": plan.pairing.exerciser,
        "existing": plan.existing,
        "needed": plan.needed,
    })
}
