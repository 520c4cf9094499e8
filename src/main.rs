use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use jobrunner::config::{ManagerConfig, ProcessConfig};
use jobrunner::persist::{load_snapshot, JobRecord};
use jobrunner::scheduler::{JobSpec, JobState, Manager, RetryPolicy};
use jobrunner::shutdown::install_shutdown_handler;
use jobrunner::worker::ProcessBackend;

#[derive(Parser, Debug)]
#[command(name = "jobrunner")]
#[command(version)]
#[command(about = "Run commands as supervised jobs with retries, timeouts and snapshots")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a command as a job and wait for its final state
    Run(RunArgs),

    /// Print the jobs recorded in a snapshot file
    Inspect {
        /// Snapshot file written by a job manager
        path: PathBuf,

        /// Only show jobs in this state (e.g. FAILED)
        #[arg(long)]
        state: Option<JobState>,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },
}

// =============================================================================
// Run Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct RunArgs {
    /// Job name, used as the id prefix
    #[arg(long)]
    name: Option<String>,

    /// Per-attempt timeout in seconds
    #[arg(long)]
    timeout: Option<f64>,

    /// Extra attempts after the first failure
    #[arg(long, default_value = "0")]
    retries: u32,

    /// Backoff base in seconds (attempt i waits base^i)
    #[arg(long, default_value = "2.0")]
    backoff: f64,

    /// Upper bound of the random jitter added to each backoff, in seconds
    #[arg(long, default_value = "0.5")]
    jitter: f64,

    /// Ceiling on total wall time across all attempts, in seconds
    #[arg(long)]
    runtime_limit: Option<f64>,

    /// Maximum number of jobs running at once
    #[arg(long, default_value = "32")]
    max_concurrent: usize,

    /// Root directory for per-job logs
    #[arg(long, default_value = "./job_logs")]
    log_root: PathBuf,

    /// Write a JSON snapshot of job state to this file
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Environment override, KEY=VALUE (repeatable)
    #[arg(long = "env", value_parser = parse_env)]
    env: Vec<(String, String)>,

    /// Working directory for the command
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Seconds between SIGTERM and SIGKILL when stopping the command
    #[arg(long, default_value = "5")]
    grace: f64,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,

    /// The whole command as one shell-style string, instead of `-- CMD`
    #[arg(long, conflicts_with = "command")]
    command_line: Option<String>,

    /// The command and its arguments, after `--`
    #[arg(last = true, required_unless_present = "command_line")]
    command: Vec<String>,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobListOutput<'a> {
    jobs: Vec<&'a JobRecord>,
    total_count: usize,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_env(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}

fn seconds(value: f64, flag: &str) -> Result<Duration, Box<dyn std::error::Error>> {
    Duration::try_from_secs_f64(value).map_err(|e| format!("--{}: {}", flag, e).into())
}

fn build_spec(args: &RunArgs) -> Result<JobSpec, Box<dyn std::error::Error>> {
    let retry = RetryPolicy::new(args.retries)
        .with_backoff_base(args.backoff)
        .with_jitter(args.jitter);
    let spec = match &args.command_line {
        Some(line) => JobSpec::command_line(line)?,
        None => JobSpec::command(args.command.iter()),
    };
    let mut spec = spec.with_retry(retry);
    if let Some(name) = &args.name {
        spec = spec.with_name(name);
    }
    if let Some(timeout) = args.timeout {
        spec = spec.with_timeout(seconds(timeout, "timeout")?);
    }
    if let Some(limit) = args.runtime_limit {
        spec = spec.with_runtime_limit(seconds(limit, "runtime-limit")?);
    }
    if let Some(cwd) = &args.cwd {
        spec = spec.with_cwd(cwd);
    }
    for (key, value) in &args.env {
        spec = spec.with_env(key, value);
    }
    Ok(spec)
}

fn print_record(record: &JobRecord) {
    println!("Job ID:     {}", record.id);
    println!("State:      {}", record.state);
    println!("Attempts:   {}", record.attempts);
    if let Some(exit_code) = record.exit_code {
        println!("Exit Code:  {}", exit_code);
    }
    if let (Some(started), Some(ended)) = (record.started_at, record.ended_at) {
        let elapsed = (ended - started).num_milliseconds() as f64 / 1000.0;
        println!("Last Run:   {:.3}s", elapsed);
    }
    if let Some(path) = &record.stdout_path {
        println!("Stdout:     {}", path.display());
    }
    if let Some(path) = &record.stderr_path {
        println!("Stderr:     {}", path.display());
    }
    if let Some(error) = &record.error {
        println!("Error:");
        for line in error.lines() {
            println!("  {}", line);
        }
    }
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn handle_run(args: RunArgs) -> Result<bool, Box<dyn std::error::Error>> {
    let spec = build_spec(&args)?;

    let mut config = ManagerConfig::new(&args.log_root).with_max_concurrent(args.max_concurrent);
    if let Some(path) = &args.state_file {
        config = config.with_snapshot_path(path);
    }
    let backend = ProcessBackend::new(
        ProcessConfig::default().with_grace_period(seconds(args.grace, "grace")?),
    );
    let manager = Manager::new(Arc::new(backend), config)?;
    let shutdown = install_shutdown_handler();

    let id = manager.submit(spec).await?;
    tracing::info!(job_id = %id, "Waiting for job");

    let job = tokio::select! {
        job = manager.wait(&id) => job?,
        _ = shutdown.cancelled() => {
            manager.cancel(&id).await?;
            manager.wait(&id).await?
        }
    };

    match args.output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        OutputFormat::Table => {
            let record: JobRecord = serde_json::from_value(serde_json::to_value(&job)?)?;
            print_record(&record);
        }
    }
    Ok(job.state == JobState::Succeeded)
}

fn handle_inspect(
    path: PathBuf,
    state: Option<JobState>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let snapshot = load_snapshot(&path)?;
    let mut records: Vec<&JobRecord> = snapshot
        .values()
        .filter(|r| state.map_or(true, |s| r.state == s))
        .collect();
    records.sort_by_key(|r| r.created_at);

    match output_format {
        OutputFormat::Json => {
            let output = JobListOutput {
                total_count: records.len(),
                jobs: records,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            if records.is_empty() {
                println!("No jobs found.");
                return Ok(());
            }
            println!(
                "{:<40} {:<10} {:<8} {:<6} ERROR",
                "JOB ID", "STATE", "ATTEMPTS", "EXIT"
            );
            println!("{}", "-".repeat(90));
            for record in &records {
                let exit = record
                    .exit_code
                    .map_or_else(|| "-".to_string(), |c| c.to_string());
                // First line only, truncated
                let error = record
                    .error
                    .as_deref()
                    .and_then(|e| e.lines().next())
                    .unwrap_or("");
                let error = if error.chars().count() > 30 {
                    format!("{}...", error.chars().take(27).collect::<String>())
                } else {
                    error.to_string()
                };
                println!(
                    "{:<40} {:<10} {:<8} {:<6} {}",
                    record.id, record.state, record.attempts, exit, error
                );
            }
            println!();
            println!("Showing {} of {} jobs", records.len(), snapshot.len());
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Commands::Run(run_args) => {
            if !handle_run(run_args).await? {
                std::process::exit(1);
            }
        }
        Commands::Inspect {
            path,
            state,
            output,
        } => {
            handle_inspect(path, state, &output)?;
        }
    }

    Ok(())
}
