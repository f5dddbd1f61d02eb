use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::agents;
use crate::catalog::Catalog;
use crate::observability::{MetricsCollector, MetricsSnapshot, StageReport};
use crate::pipeline::{PipelineConfig, build_pipeline};
use crate::stage::StageId;

#[derive(Debug)]
pub struct BenchmarkOptions {
    pub catalog_path: Option<PathBuf>,
    pub runs: u32,
    /// Divides every stage duration and the inter-stage delay.
    pub speed: f64,
    pub fail_stage: Option<StageId>,
    pub config: PipelineConfig,
}

impl Default for BenchmarkOptions {
    fn default() -> Self {
        Self {
            catalog_path: None,
            runs: 5,
            speed: 1.0,
            fail_stage: None,
            config: PipelineConfig::default(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BenchmarkRun {
    pub run: u32,
    pub success: bool,
    pub total_elapsed_ms: u64,
    pub failed_at: Option<StageId>,
}

#[derive(Debug, Serialize)]
pub struct BenchmarkSummary {
    pub runs: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub average_total_ms: Option<u64>,
    pub slowest_total_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct BenchmarkReport {
    pub generated_at: DateTime<Utc>,
    pub catalog: Option<PathBuf>,
    pub speed: f64,
    pub entries: Vec<BenchmarkRun>,
    pub summary: BenchmarkSummary,
    pub stages: BTreeMap<StageId, StageReport>,
    pub metrics: MetricsSnapshot,
}

/// Run the catalog pipeline `runs` times back to back on one orchestrator
/// and aggregate the per-stage statistics.
pub async fn run_benchmark(options: BenchmarkOptions) -> Result<BenchmarkReport> {
    if options.runs == 0 {
        return Err(anyhow!("Benchmark needs at least one run"));
    }

    let mut catalog = Catalog::load_or_builtin(options.catalog_path.as_deref())?;
    catalog.scale_durations(options.speed)?;
    if let Some(stage) = options.fail_stage {
        catalog.inject_failure(stage, format!("Injected failure at stage {stage}"))?;
    }

    let mut config = options.config.clone();
    config.inter_stage_delay_ms =
        (config.inter_stage_delay_ms as f64 / options.speed).round() as u64;

    let metrics = MetricsCollector::new();
    let registry = agents::default_registry();
    let orchestrator = build_pipeline(&registry, &catalog, config, metrics.clone())?;

    let mut entries = Vec::with_capacity(options.runs as usize);
    for run in 1..=options.runs {
        orchestrator.reset();
        let result = orchestrator.run(catalog.initial_input()).await?;
        info!(
            run,
            success = result.success,
            total_ms = result.total_elapsed_ms,
            "Benchmark run finished"
        );
        entries.push(BenchmarkRun {
            run,
            success: result.success,
            total_elapsed_ms: result.total_elapsed_ms,
            failed_at: result.failed_at,
        });
    }

    let metrics = metrics.snapshot();
    Ok(BenchmarkReport {
        generated_at: Utc::now(),
        catalog: options.catalog_path,
        speed: options.speed,
        summary: summarize(&entries),
        stages: metrics.report(),
        metrics,
        entries,
    })
}

fn summarize(entries: &[BenchmarkRun]) -> BenchmarkSummary {
    let runs = entries.len() as u32;
    let succeeded = entries.iter().filter(|entry| entry.success).count() as u32;
    let total: u64 = entries.iter().map(|entry| entry.total_elapsed_ms).sum();
    let average_total_ms =
        (runs > 0).then(|| (total as f64 / runs as f64).round() as u64);

    BenchmarkSummary {
        runs,
        succeeded,
        failed: runs - succeeded,
        average_total_ms,
        slowest_total_ms: entries.iter().map(|entry| entry.total_elapsed_ms).max(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn repeated_runs_accumulate_per_stage_stats() {
        let report = run_benchmark(BenchmarkOptions {
            runs: 3,
            speed: 10.0,
            ..BenchmarkOptions::default()
        })
        .await
        .unwrap();

        assert_eq!(report.summary.runs, 3);
        assert_eq!(report.summary.succeeded, 3);
        assert_eq!(report.metrics.runs_completed, 3);
        assert_eq!(report.stages.len(), 5);
        let graph = &report.stages[&StageId(2)];
        assert_eq!(graph.total_calls, 3);
        assert_eq!(graph.success_rate_percent, 100);
        assert!(graph.average_duration_ms.unwrap() >= 150);
        // 5500ms of stage time plus 4 x 300ms of delay, all divided by ten.
        assert!(report.summary.average_total_ms.unwrap() >= 670);
    }

    #[tokio::test(start_paused = true)]
    async fn injected_failure_stops_every_run_at_that_stage() {
        let report = run_benchmark(BenchmarkOptions {
            runs: 2,
            speed: 100.0,
            fail_stage: Some(StageId(3)),
            ..BenchmarkOptions::default()
        })
        .await
        .unwrap();

        assert_eq!(report.summary.failed, 2);
        assert!(report.entries.iter().all(|e| e.failed_at == Some(StageId(3))));
        assert_eq!(report.stages[&StageId(3)].success_rate_percent, 0);
        assert!(!report.stages.contains_key(&StageId(4)));
        assert_eq!(report.metrics.runs_failed, 2);
    }

    #[tokio::test]
    async fn zero_runs_is_rejected() {
        let err = run_benchmark(BenchmarkOptions {
            runs: 0,
            ..BenchmarkOptions::default()
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("at least one run"));
    }

    #[test]
    fn summary_of_nothing_has_no_average() {
        let summary = summarize(&[]);
        assert_eq!(summary.average_total_ms, None);
        assert_eq!(summary.slowest_total_ms, None);
    }
}
