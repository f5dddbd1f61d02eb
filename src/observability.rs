use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use once_cell::sync::Lazy;
use serde::Serialize;
use tracing::{debug, info};

use crate::stage::{StageDescriptor, StageId};

#[derive(Debug, Default, Serialize, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub stages: BTreeMap<StageId, MetricsRecord>,
    pub runs_completed: u64,
    pub runs_failed: u64,
}

/// Accumulated statistics for one stage id.
///
/// `success_count + failure_count == call_count` holds after every update.
#[derive(Debug, Default, Serialize, Clone, PartialEq)]
pub struct MetricsRecord {
    pub name: Option<String>,
    pub call_count: u64,
    pub total_duration_ms: u64,
    pub max_duration_ms: u64,
    pub success_count: u64,
    pub failure_count: u64,
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub name: Option<String>,
    pub average_duration_ms: Option<u64>,
    pub success_rate_percent: u32,
    pub total_calls: u64,
}

impl MetricsRecord {
    pub fn report(&self) -> StageReport {
        let average_duration_ms = (self.call_count > 0).then(|| {
            (self.total_duration_ms as f64 / self.call_count as f64).round() as u64
        });
        let success_rate_percent = if self.call_count == 0 {
            0
        } else {
            (100.0 * self.success_count as f64 / self.call_count as f64).round() as u32
        };
        StageReport {
            name: self.name.clone(),
            average_duration_ms,
            success_rate_percent,
            total_calls: self.call_count,
        }
    }
}

/// Shared, clonable handle onto stage statistics. Every clone observes the
/// same counters, so several orchestrators may report into one collector.
#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn global() -> &'static MetricsCollector {
        static INSTANCE: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);
        &INSTANCE
    }

    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsSnapshot::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MetricsSnapshot> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record(&self, stage: StageId, duration_ms: u64, success: bool) {
        self.update(stage, None, duration_ms, success);
    }

    /// Like `record`, also remembering the stage name for reports.
    pub fn record_for(&self, stage: &StageDescriptor, duration_ms: u64, success: bool) {
        self.update(stage.id, Some(&stage.name), duration_ms, success);
    }

    fn update(&self, stage: StageId, name: Option<&str>, duration_ms: u64, success: bool) {
        {
            let mut guard = self.lock();
            let record = guard.stages.entry(stage).or_default();
            if record.name.is_none() {
                record.name = name.map(str::to_string);
            }
            record.call_count += 1;
            record.total_duration_ms += duration_ms;
            record.max_duration_ms = record.max_duration_ms.max(duration_ms);
            if success {
                record.success_count += 1;
            } else {
                record.failure_count += 1;
            }
        }
        debug!(
            stage_id = %stage,
            duration_ms,
            success,
            "Stage duration recorded"
        );
    }

    pub fn record_run(&self, success: bool) {
        let mut guard = self.lock();
        if success {
            guard.runs_completed += 1;
        } else {
            guard.runs_failed += 1;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.lock().clone()
    }

    pub fn report(&self) -> BTreeMap<StageId, StageReport> {
        self.lock()
            .stages
            .iter()
            .map(|(id, record)| (*id, record.report()))
            .collect()
    }

    pub fn reset(&self) {
        *self.lock() = MetricsSnapshot::default();
    }
}

pub fn log_report(snapshot: &MetricsSnapshot) {
    info!(
        runs_completed = snapshot.runs_completed,
        runs_failed = snapshot.runs_failed,
        stage_count = snapshot.stages.len(),
        "Pipeline metrics summary"
    );
    for (stage_id, record) in &snapshot.stages {
        let report = record.report();
        info!(
            stage_id = %stage_id,
            stage = record.name.as_deref().unwrap_or("-"),
            calls = report.total_calls,
            average_ms = report.average_duration_ms,
            max_ms = record.max_duration_ms,
            success_rate = report.success_rate_percent,
            "Stage metrics"
        );
    }
}

impl MetricsSnapshot {
    pub fn report(&self) -> BTreeMap<StageId, StageReport> {
        self.stages
            .iter()
            .map(|(id, record)| (*id, record.report()))
            .collect()
    }

    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        output.push_str("# HELP agent_relay_runs_total Pipeline runs by terminal state\n");
        output.push_str("# TYPE agent_relay_runs_total counter\n");
        output.push_str(&format!(
            "agent_relay_runs_total{{state=\"completed\"}} {}\n",
            self.runs_completed
        ));
        output.push_str(&format!(
            "agent_relay_runs_total{{state=\"failed\"}} {}\n",
            self.runs_failed
        ));
        output.push_str("# HELP agent_relay_stage_calls_total Stage invocation count\n");
        output.push_str("# TYPE agent_relay_stage_calls_total counter\n");
        output.push_str("# HELP agent_relay_stage_failures_total Stage failure count\n");
        output.push_str("# TYPE agent_relay_stage_failures_total counter\n");
        output.push_str(
            "# HELP agent_relay_stage_duration_seconds_total Accumulated stage duration in seconds\n",
        );
        output.push_str("# TYPE agent_relay_stage_duration_seconds_total counter\n");
        output.push_str(
            "# HELP agent_relay_stage_duration_seconds_max Maximum stage duration in seconds\n",
        );
        output.push_str("# TYPE agent_relay_stage_duration_seconds_max gauge\n");
        for (stage, record) in &self.stages {
            output.push_str(&format!(
                "agent_relay_stage_calls_total{{stage=\"{}\"}} {}\n",
                stage, record.call_count
            ));
            output.push_str(&format!(
                "agent_relay_stage_failures_total{{stage=\"{}\"}} {}\n",
                stage, record.failure_count
            ));
            output.push_str(&format!(
                "agent_relay_stage_duration_seconds_total{{stage=\"{}\"}} {:.6}\n",
                stage,
                record.total_duration_ms as f64 / 1_000.0
            ));
            output.push_str(&format!(
                "agent_relay_stage_duration_seconds_max{{stage=\"{}\"}} {:.6}\n",
                stage,
                record.max_duration_ms as f64 / 1_000.0
            ));
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_successes_report_full_rate() {
        let metrics = MetricsCollector::new();
        for duration in [240, 250, 245] {
            metrics.record(StageId(1), duration, true);
        }
        let report = metrics.report();
        let discovery = &report[&StageId(1)];
        assert_eq!(discovery.total_calls, 3);
        assert_eq!(discovery.success_rate_percent, 100);
        assert_eq!(discovery.average_duration_ms, Some(245));
    }

    #[test]
    fn mixed_outcomes_round_success_rate() {
        let metrics = MetricsCollector::new();
        metrics.record(StageId(3), 100, true);
        metrics.record(StageId(3), 100, true);
        metrics.record(StageId(3), 100, false);

        let snapshot = metrics.snapshot();
        let record = &snapshot.stages[&StageId(3)];
        assert_eq!(record.success_count + record.failure_count, record.call_count);
        assert_eq!(metrics.report()[&StageId(3)].success_rate_percent, 67);
    }

    #[test]
    fn empty_record_has_no_average() {
        let report = MetricsRecord::default().report();
        assert_eq!(report.average_duration_ms, None);
        assert_eq!(report.success_rate_percent, 0);
        assert_eq!(report.total_calls, 0);
    }

    #[test]
    fn clones_share_state_and_reset_clears_it() {
        let metrics = MetricsCollector::new();
        let other = metrics.clone();
        other.record_for(&StageDescriptor::new(2, "Knowledge Graph Query Agent", 1500), 412, true);
        other.record_run(true);

        let snapshot = metrics.snapshot();
        assert_eq!(
            snapshot.stages[&StageId(2)].name.as_deref(),
            Some("Knowledge Graph Query Agent")
        );
        assert_eq!(snapshot.runs_completed, 1);

        let prom = snapshot.to_prometheus();
        assert!(prom.contains("agent_relay_stage_calls_total{stage=\"2\"} 1"));
        assert!(prom.contains("agent_relay_runs_total{state=\"completed\"} 1"));

        metrics.reset();
        assert!(other.report().is_empty());
    }
}
