use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use agent_relay::agents;
use agent_relay::benchmark::{BenchmarkOptions, run_benchmark};
use agent_relay::catalog::Catalog;
use agent_relay::error::StageFailure;
use agent_relay::listener::PipelineListener;
use agent_relay::observability::{MetricsCollector, StageReport, log_report};
use agent_relay::pipeline::{
    DEFAULT_INTER_STAGE_DELAY_MS, PipelineConfig, PipelineResult, build_pipeline,
};
use agent_relay::stage::{StageDescriptor, StageId, StageOutcome};
use agent_relay::validation::validate_catalog;
use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand, ValueHint};
use serde::Serialize;
use serde_json::to_writer_pretty;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

fn main() -> Result<()> {
    let Cli { command } = Cli::parse();
    configure_tracing()?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .context("Failed to start async runtime")?;

    match command {
        Commands::Run {
            catalog,
            speed,
            fail_stage,
            quiet,
            print_metrics,
            metrics_json,
            metrics_prometheus,
            result_json,
        } => runtime.block_on(run_catalog(RunOptions {
            catalog,
            speed,
            fail_stage: fail_stage.map(StageId),
            quiet,
            print_metrics,
            metrics_json,
            metrics_prometheus,
            result_json,
        })),
        Commands::ListStages { catalog } => list_stages(catalog.as_deref()),
        Commands::Validate { catalog } => validate_catalog_cmd(catalog),
        Commands::Bench {
            catalog,
            runs,
            speed,
            fail_stage,
            report,
        } => runtime.block_on(bench_command(
            BenchmarkOptions {
                catalog_path: catalog,
                runs,
                speed,
                fail_stage: fail_stage.map(StageId),
                config: PipelineConfig::default(),
            },
            report,
        )),
    }
}

fn configure_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .try_init()
        .map_err(|err| anyhow!(err.to_string()))?;

    Ok(())
}

struct RunOptions {
    catalog: Option<PathBuf>,
    speed: f64,
    fail_stage: Option<StageId>,
    quiet: bool,
    print_metrics: bool,
    metrics_json: Option<PathBuf>,
    metrics_prometheus: Option<PathBuf>,
    result_json: Option<PathBuf>,
}

async fn run_catalog(options: RunOptions) -> Result<()> {
    let mut catalog = Catalog::load_or_builtin(options.catalog.as_deref())?;
    catalog.scale_durations(options.speed)?;
    if let Some(stage) = options.fail_stage {
        catalog.inject_failure(stage, format!("Simulated outage in stage {stage}"))?;
    }

    let config = PipelineConfig {
        inter_stage_delay_ms: (DEFAULT_INTER_STAGE_DELAY_MS as f64 / options.speed).round()
            as u64,
        ..PipelineConfig::default()
    };
    let metrics = MetricsCollector::global().clone();
    let registry = agents::default_registry();
    let orchestrator = build_pipeline(&registry, &catalog, config, metrics.clone())?;
    if !options.quiet {
        orchestrator.register_listener(Arc::new(ConsoleRenderer::new(catalog.stages.len())));
        println!("Query: \"{}\"", catalog.query);
    }

    info!(stages = catalog.stages.len(), speed = options.speed, "Starting pipeline");
    let result = orchestrator.run(catalog.initial_input()).await?;

    if let Some(path) = &options.result_json {
        write_json(path, &result, "result")?;
    }

    if options.print_metrics || options.metrics_json.is_some() || options.metrics_prometheus.is_some()
    {
        let snapshot = metrics.snapshot();
        if options.print_metrics {
            log_report(&snapshot);
            print_metrics_table(&snapshot.report());
        }
        if let Some(path) = &options.metrics_json {
            write_json(path, &snapshot, "metrics")?;
        }
        if let Some(path) = &options.metrics_prometheus {
            ensure_parent(path)?;
            fs::write(path, snapshot.to_prometheus()).with_context(|| {
                format!("Failed to write Prometheus metrics: {}", path.display())
            })?;
            info!(metrics = %path.display(), "Prometheus metrics written");
        }
    }

    match (&result.failed_at, &result.error) {
        (Some(stage), Some(failure)) => Err(anyhow!(
            "Pipeline failed at stage {stage}: {}",
            failure.message
        )),
        _ if !result.success => Err(anyhow!("Pipeline failed")),
        _ => Ok(()),
    }
}

fn print_metrics_table(report: &BTreeMap<StageId, StageReport>) {
    println!();
    println!("{:<4} {:<30} {:>6} {:>9} {:>8}", "ID", "STAGE", "CALLS", "AVG(ms)", "SUCCESS");
    for (id, stage) in report {
        let average = stage
            .average_duration_ms
            .map(|ms| ms.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<4} {:<30} {:>6} {:>9} {:>7}%",
            id,
            stage.name.as_deref().unwrap_or("-"),
            stage.total_calls,
            average,
            stage.success_rate_percent
        );
    }
}

fn list_stages(catalog_path: Option<&Path>) -> Result<()> {
    let registry = agents::default_registry();
    println!("Available agents:");
    for name in registry.known_stages() {
        println!("- {name}");
    }

    let catalog = Catalog::load_or_builtin(catalog_path)?;
    println!();
    println!("Catalog stages:");
    for stage in &catalog.stages {
        println!(
            "{:>2}. {} ({}, {}ms)",
            stage.id, stage.name, stage.agent, stage.duration_ms
        );
    }
    Ok(())
}

fn validate_catalog_cmd(catalog_path: Option<PathBuf>) -> Result<()> {
    let label = catalog_path
        .as_ref()
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| "<built-in>".to_string());
    let catalog = Catalog::load_or_builtin(catalog_path.as_deref())?;
    let registry = agents::default_registry();
    let report = validate_catalog(&catalog, &registry);

    for warning in &report.warnings {
        warn!(file = %label, "{warning}");
    }

    if report.is_ok() {
        info!(file = %label, "Catalog validation passed");
        println!("Catalog {label} is valid ({} stage(s))", catalog.stages.len());
        Ok(())
    } else {
        for error_msg in &report.errors {
            error!(file = %label, "{error_msg}");
        }
        Err(anyhow!(
            "Catalog validation failed with {} error(s)",
            report.errors.len()
        ))
    }
}

async fn bench_command(options: BenchmarkOptions, report_path: Option<PathBuf>) -> Result<()> {
    let report = run_benchmark(options).await?;

    println!(
        "Benchmark finished {}/{} run(s) successfully",
        report.summary.succeeded, report.summary.runs
    );
    if let Some(average) = report.summary.average_total_ms {
        println!("Average pipeline time: {average}ms");
    }
    print_metrics_table(&report.stages);

    if let Some(path) = report_path {
        write_json(&path, &report, "report")?;
    }

    Ok(())
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

fn write_json<T: Serialize>(path: &Path, value: &T, what: &str) -> Result<()> {
    ensure_parent(path)?;
    let file = File::create(path)
        .with_context(|| format!("Failed to create {what} file: {}", path.display()))?;
    to_writer_pretty(file, value)
        .with_context(|| format!("Failed to write {what} JSON: {}", path.display()))?;
    info!(path = %path.display(), "{what} JSON written");
    Ok(())
}

/// Terminal renderer: one progress bar per stage.
struct ConsoleRenderer {
    total_stages: usize,
    bar_width: usize,
}

impl ConsoleRenderer {
    fn new(total_stages: usize) -> Self {
        Self {
            total_stages: total_stages.max(1),
            bar_width: 30,
        }
    }

    fn bar(&self, percent: u8) -> String {
        let filled = (usize::from(percent.min(100)) * self.bar_width).div_ceil(100);
        format!(
            "[{}{}]",
            "=".repeat(filled),
            " ".repeat(self.bar_width - filled)
        )
    }
}

impl PipelineListener for ConsoleRenderer {
    fn on_step_start(&self, stage: &StageDescriptor) {
        println!(
            "[{}/{}] {}{}",
            stage.id,
            self.total_stages,
            stage.name,
            stage
                .description
                .as_deref()
                .map(|d| format!(": {d}"))
                .unwrap_or_default()
        );
    }

    fn on_step_progress(&self, _stage: &StageDescriptor, percent: u8) {
        print!("\r      {} {:>3}%", self.bar(percent), percent);
        let _ = io::stdout().flush();
    }

    fn on_step_complete(&self, stage: &StageDescriptor, outcome: &StageOutcome) {
        println!();
        println!(
            "      \x1b[32mdone\x1b[0m {} in {}ms",
            stage.name, outcome.elapsed_ms
        );
    }

    fn on_failure(&self, _stage: &StageDescriptor, error: &StageFailure) {
        println!();
        println!("      \x1b[31mfailed\x1b[0m {error}");
    }

    fn on_all_complete(&self, result: &PipelineResult) {
        println!();
        println!(
            "\x1b[32mAll {} stages completed in {}ms\x1b[0m",
            result.per_stage.len(),
            result.total_elapsed_ms
        );
        if let Some(top) = result
            .final_output()
            .and_then(|output| output.get("top_recommendation"))
        {
            println!(
                "Top pick: {} (${}, {}% match)",
                top["name"].as_str().unwrap_or("?"),
                top["price"],
                top["match_score"]
            );
        }
    }
}

#[derive(Parser)]
#[command(
    name = "agent-relay",
    version,
    about = "Sequential multi-agent pipeline runner for the product recommendation demo"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline once, rendering progress to the terminal.
    Run {
        #[arg(long, value_hint = ValueHint::FilePath)]
        catalog: Option<PathBuf>,
        /// Divide every stage duration and delay by this factor.
        #[arg(long, default_value_t = 1.0)]
        speed: f64,
        #[arg(long = "fail-stage")]
        fail_stage: Option<u32>,
        #[arg(long)]
        quiet: bool,
        #[arg(long)]
        print_metrics: bool,
        #[arg(long = "metrics-json")]
        metrics_json: Option<PathBuf>,
        #[arg(long = "metrics-prometheus")]
        metrics_prometheus: Option<PathBuf>,
        #[arg(long = "result-json")]
        result_json: Option<PathBuf>,
    },
    ListStages {
        #[arg(long, value_hint = ValueHint::FilePath)]
        catalog: Option<PathBuf>,
    },
    Validate {
        #[arg(value_hint = ValueHint::FilePath)]
        catalog: Option<PathBuf>,
    },
    /// Run the pipeline repeatedly and report per-stage statistics.
    Bench {
        #[arg(long, value_hint = ValueHint::FilePath)]
        catalog: Option<PathBuf>,
        #[arg(long, default_value_t = 5)]
        runs: u32,
        #[arg(long, default_value_t = 1.0)]
        speed: f64,
        #[arg(long = "fail-stage")]
        fail_stage: Option<u32>,
        #[arg(long)]
        report: Option<PathBuf>,
    },
}
