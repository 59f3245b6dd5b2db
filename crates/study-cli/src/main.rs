use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

use study_runner::{ClusterScatter, StudyConfig, StudyDriver, StudyReport, Variant};

#[derive(Parser)]
#[command(name = "study", version, about = "k-means scaling study harness")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TargetArg {
    #[value(name = "serial")]
    Serial,
    #[value(name = "omp")]
    Omp,
    #[value(name = "mpi")]
    Mpi,
    #[value(name = "cuda")]
    Cuda,
    #[value(name = "cuda_mpi")]
    CudaMpi,
}

impl From<TargetArg> for Variant {
    fn from(value: TargetArg) -> Self {
        match value {
            TargetArg::Serial => Variant::Serial,
            TargetArg::Omp => Variant::Omp,
            TargetArg::Mpi => Variant::Mpi,
            TargetArg::Cuda => Variant::Cuda,
            TargetArg::CudaMpi => Variant::CudaMpi,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full study and render the comparison chart.
    Run {
        #[arg(long, default_value = "study.yaml")]
        config: PathBuf,
        /// Restrict the study to these targets (default: all configured).
        #[arg(long = "target", value_enum)]
        targets: Vec<TargetArg>,
        #[arg(long)]
        json: bool,
    },
    /// Time one target's sweep and write its record to an explicit path.
    Time {
        #[arg(long, value_enum)]
        target: TargetArg,
        #[arg(long)]
        output: PathBuf,
        /// Node count for the distributed family.
        #[arg(long)]
        nodes: Option<u32>,
        #[arg(long, default_value = "study.yaml")]
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Submit one distributed target through the batch queue and wait.
    Submit {
        #[arg(long, value_enum)]
        target: TargetArg,
        #[arg(long, default_value = "study.yaml")]
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Re-render the comparison chart from persisted records.
    Plot {
        #[arg(long, default_value = "study.yaml")]
        config: PathBuf,
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Render a labeled 3-D scatter of one clustering artifact.
    Visualize {
        clusters: PathBuf,
        #[arg(long, default_value = "danceability")]
        axis_x: String,
        #[arg(long, default_value = "energy")]
        axis_y: String,
        #[arg(long, default_value = "key")]
        axis_z: String,
        #[arg(long, default_value = "clusters.svg")]
        output: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Write a starter study configuration.
    Init {
        #[arg(long, default_value = "study.yaml")]
        config: PathBuf,
        #[arg(long)]
        force: bool,
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
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            config,
            targets,
            json,
        } => {
            let loaded = StudyConfig::load(&config)?;
            let variants: Vec<Variant> = targets.into_iter().map(Into::into).collect();
            let queued = loaded.queue.enabled
                && requested_variants(&loaded, &variants)
                    .iter()
                    .any(Variant::is_distributed);
            let interrupt = interrupt_flag(queued)?;
            let driver = StudyDriver::new(loaded, &config)?;
            let report = driver.run(&variants, &interrupt)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "report": report_to_json(&report),
                })));
            }
            print_report(&report);
        }
        Commands::Time {
            target,
            output,
            nodes,
            config,
            json,
        } => {
            let loaded = StudyConfig::load(&config)?;
            let driver = StudyDriver::new(loaded, &config)?;
            let variant: Variant = target.into();
            let table = driver.run_time_target(variant, nodes, &output)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "time",
                    "target": variant.to_string(),
                    "nodes": nodes,
                    "output": output.display().to_string(),
                    "measured_points": table.len() - table.failed_count(),
                    "failed_points": table.failed_count(),
                })));
            }
            println!("target: {}", variant);
            println!("output: {}", output.display());
            println!("measured_points: {}", table.len() - table.failed_count());
            println!("failed_points: {}", table.failed_count());
        }
        Commands::Submit {
            target,
            config,
            json,
        } => {
            let loaded = StudyConfig::load(&config)?;
            let interrupt = interrupt_flag(true)?;
            let driver = StudyDriver::new(loaded, &config)?;
            let variant: Variant = target.into();
            let records = driver.submit_distributed(variant, &interrupt)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "submit",
                    "target": variant.to_string(),
                    "records": records
                        .iter()
                        .map(|p| p.display().to_string())
                        .collect::<Vec<_>>(),
                })));
            }
            println!("target: {}", variant);
            for record in &records {
                println!("record: {}", record.display());
            }
        }
        Commands::Plot {
            config,
            output,
            json,
        } => {
            let loaded = StudyConfig::load(&config)?;
            let driver = StudyDriver::new(loaded, &config)?;
            let chart = driver.replot(output.as_deref())?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "plot",
                    "chart": chart.display().to_string(),
                })));
            }
            println!("chart: {}", chart.display());
        }
        Commands::Visualize {
            clusters,
            axis_x,
            axis_y,
            axis_z,
            output,
            json,
        } => {
            let scatter = ClusterScatter::from_csv(&clusters, &axis_x, &axis_y, &axis_z)?;
            scatter.render(&output)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "visualize",
                    "clusters": clusters.display().to_string(),
                    "points": scatter.points.len(),
                    "figure": output.display().to_string(),
                })));
            }
            println!("points: {}", scatter.points.len());
            println!("figure: {}", output.display());
        }
        Commands::Init { config, force } => {
            if !force && config.exists() {
                return Err(anyhow::anyhow!(format!(
                    "config already exists (use --force): {}",
                    config.display()
                )));
            }
            write_config_template(&config)?;
            println!("wrote: {}", config.display());
            println!(
                "next: edit {} and fill in the fields marked REQUIRED",
                config.display()
            );
            println!("next: study run --config {}", config.display());
        }
    }
    Ok(None)
}

/// The variants a `run` invocation will actually touch: the explicit
/// list, or everything configured when the list is empty.
fn requested_variants(config: &StudyConfig, requested: &[Variant]) -> Vec<Variant> {
    if requested.is_empty() {
        config.configured_variants()
    } else {
        requested.to_vec()
    }
}

/// Interrupt flag for queue-backed commands. Direct runs keep the
/// default signal disposition so a Ctrl-C kills the harness and its
/// child outright; only flows with outstanding queue jobs trap it, so
/// cancellation can run first.
fn interrupt_flag(install: bool) -> Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    if install {
        let handler_flag = Arc::clone(&flag);
        ctrlc::set_handler(move || handler_flag.store(true, Ordering::SeqCst))
            .context("cannot install interrupt handler")?;
    }
    Ok(flag)
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
        Commands::Run { json, .. }
        | Commands::Time { json, .. }
        | Commands::Submit { json, .. }
        | Commands::Plot { json, .. }
        | Commands::Visualize { json, .. } => *json,
        Commands::Init { .. } => false,
    }
}

fn report_to_json(report: &StudyReport) -> Value {
    json!({
        "started_at": report.started_at.to_rfc3339(),
        "tables": report
            .tables
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>(),
        "chart": report.chart.as_ref().map(|p| p.display().to_string()),
        "measured_points": report.measured_points,
        "failed_points": report.failed_points,
    })
}

fn print_report(report: &StudyReport) {
    println!("started_at: {}", report.started_at.to_rfc3339());
    println!("measured_points: {}", report.measured_points);
    println!("failed_points: {}", report.failed_points);
    for table in &report.tables {
        println!("record: {}", table.display());
    }
    if let Some(chart) = &report.chart {
        println!("chart: {}", chart.display());
    }
}

fn write_config_template(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let template = "\
study:
  name: ''                              # REQUIRED
  results_dir: data/out
  chart_path: study_results.svg
  repetitions: 3                        # REQUIRED: set > 0
context:
  base_dir: .
  data_file: ''                         # REQUIRED: input CSV for every target
  cluster_output_file: ''               # REQUIRED: fixed path the targets write
targets:
  serial:
    executable: ./build/genre_reveal_party
  omp:
    executable: ./build/genre_reveal_party_omp
  mpi:
    executable: ./build/genre_reveal_party_mpi
  cuda:
    executable: ./build/genre_reveal_party_cuda
  cuda_mpi:
    executable: ./build/genre_reveal_party_cuda_mpi
sweeps:
  thread_counts: [1, 16, 32, 64, 1024]
  processes_per_node: [1, 8, 16, 32]
  node_counts: [2, 3, 4]
  block_sizes: [1, 64, 128, 1023]
queue:
  enabled: false
  partition: ''
  account: ''
  time_limit: '00:30:00'
  poll_interval_seconds: 30
";
    std::fs::write(path, template)?;
    Ok(())
}
