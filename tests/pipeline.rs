use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_relay::error::PipelineError;
use agent_relay::listener::Callbacks;
use agent_relay::observability::MetricsCollector;
use agent_relay::pipeline::{PipelineConfig, PipelineOrchestrator, PipelineState};
use agent_relay::stage::{StageDefinition, StageId};
use anyhow::anyhow;
use serde_json::{Value, json};
use tokio::time;

const DURATIONS: [u64; 5] = [1000, 1500, 1200, 1000, 800];

type Log = Arc<Mutex<Vec<String>>>;

fn demo_stages(fail_at: Option<u32>) -> Vec<StageDefinition> {
    DURATIONS
        .iter()
        .zip(1u32..)
        .map(|(&duration, id)| {
            StageDefinition::from_fn(id, format!("agent-{id}"), duration, move |ctx| {
                if fail_at == Some(id) {
                    return Err(anyhow!("agent {id} unavailable"));
                }
                Ok(json!({ "stage": id, "seen": ctx.len() }))
            })
        })
        .collect()
}

fn orchestrator(fail_at: Option<u32>, metrics: &MetricsCollector) -> PipelineOrchestrator {
    PipelineOrchestrator::builder()
        .with_stages(demo_stages(fail_at))
        .with_metrics(metrics.clone())
        .build()
        .unwrap()
}

fn recorder(log: &Log) -> Callbacks {
    let start = log.clone();
    let progress = log.clone();
    let complete = log.clone();
    let failure = log.clone();
    let all = log.clone();
    Callbacks::new()
        .on_step_start(move |stage| start.lock().unwrap().push(format!("start:{}", stage.id)))
        .on_step_progress(move |stage, pct| {
            progress
                .lock()
                .unwrap()
                .push(format!("progress:{}:{pct}", stage.id))
        })
        .on_step_complete(move |stage, _| {
            complete
                .lock()
                .unwrap()
                .push(format!("complete:{}", stage.id))
        })
        .on_failure(move |stage, err| {
            failure
                .lock()
                .unwrap()
                .push(format!("failure:{}:{}", stage.id, err.message))
        })
        .on_all_complete(move |result| {
            all.lock()
                .unwrap()
                .push(format!("all:{}", result.per_stage.len()))
        })
}

fn milestones(log: &Log) -> Vec<String> {
    log.lock()
        .unwrap()
        .iter()
        .filter(|entry| !entry.starts_with("progress:"))
        .cloned()
        .collect()
}

#[tokio::test(start_paused = true)]
async fn five_stages_run_in_order() {
    let metrics = MetricsCollector::new();
    let pipeline = orchestrator(None, &metrics);
    let log = Log::default();
    pipeline.register_callbacks(recorder(&log));

    let result = pipeline.run(json!({ "query": "shoes" })).await.unwrap();

    assert!(result.success);
    assert_eq!(result.per_stage.len(), 5);
    assert!(result.total_elapsed_ms >= 5500);
    assert!(result.failed_at.is_none());
    for (outcome, nominal) in result.per_stage.iter().zip(DURATIONS) {
        assert!(outcome.elapsed_ms >= nominal);
    }
    assert_eq!(
        result.data(StageId(5)),
        Some(&json!({ "stage": 5, "seen": 4 }))
    );
    assert_eq!(
        milestones(&log),
        vec![
            "start:1", "complete:1", "start:2", "complete:2", "start:3", "complete:3", "start:4",
            "complete:4", "start:5", "complete:5", "all:5",
        ]
    );
    assert_eq!(pipeline.state(), PipelineState::Completed);
}

#[tokio::test(start_paused = true)]
async fn failing_stage_halts_the_run() {
    let metrics = MetricsCollector::new();
    let pipeline = orchestrator(Some(3), &metrics);
    let log = Log::default();
    pipeline.register_callbacks(recorder(&log));

    let result = pipeline.run(Value::Null).await.unwrap();

    assert!(!result.success);
    assert_eq!(result.per_stage.len(), 3);
    assert_eq!(result.failed_at, Some(StageId(3)));
    let error = result.error.as_ref().unwrap();
    assert_eq!(error.message, "agent 3 unavailable");
    assert_eq!(error.to_string(), "Stage 3 failed: agent 3 unavailable");

    let events = milestones(&log);
    assert_eq!(events.last().unwrap(), "failure:3:agent 3 unavailable");
    assert!(!events.iter().any(|e| e == "start:4" || e.starts_with("all:")));
    assert!(!log.lock().unwrap().iter().any(|e| e == "progress:3:100"));
    assert_eq!(pipeline.state(), PipelineState::Failed);

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.stages[&StageId(3)].failure_count, 1);
    assert!(!snapshot.stages.contains_key(&StageId(4)));
    assert_eq!(snapshot.runs_failed, 1);
}

#[tokio::test(start_paused = true)]
async fn second_run_is_rejected_while_first_is_in_flight() {
    let pipeline = orchestrator(None, &MetricsCollector::new());

    let (first, second) = tokio::join!(pipeline.run(Value::Null), pipeline.run(Value::Null));

    assert!(first.unwrap().success);
    assert!(matches!(second, Err(PipelineError::AlreadyRunning)));
    assert_eq!(pipeline.statistics().runs_started, 1);
}

#[tokio::test(start_paused = true)]
async fn reset_cancels_the_in_flight_run() {
    let metrics = MetricsCollector::new();
    let pipeline = orchestrator(None, &metrics);
    let log = Log::default();
    pipeline.register_callbacks(recorder(&log));

    let (outcome, observed) = tokio::join!(pipeline.run(Value::Null), async {
        time::sleep(Duration::from_millis(1600)).await;
        let during = pipeline.statistics();
        pipeline.reset();
        during
    });

    assert!(observed.is_processing);
    assert_eq!(observed.current_step, Some(StageId(2)));
    assert!(matches!(outcome, Err(PipelineError::Cancelled)));
    assert_eq!(pipeline.state(), PipelineState::Idle);
    assert_eq!(pipeline.statistics().current_step, None);

    let events = milestones(&log);
    assert_eq!(events, vec!["start:1", "complete:1", "start:2"]);
    assert!(!metrics.snapshot().stages.contains_key(&StageId(2)));

    log.lock().unwrap().clear();
    let rerun = pipeline.run(Value::Null).await.unwrap();
    assert!(rerun.success);
    assert_eq!(milestones(&log).len(), 11);
    assert_eq!(pipeline.statistics().runs_started, 2);
}

#[tokio::test(start_paused = true)]
async fn reset_between_stages_cancels_the_run() {
    let metrics = MetricsCollector::new();
    let pipeline = orchestrator(None, &metrics);
    let log = Log::default();
    pipeline.register_callbacks(recorder(&log));

    // Stage 1 ends at 1000ms; stage 2 would start after the 300ms pause.
    let (outcome, ()) = tokio::join!(pipeline.run(Value::Null), async {
        time::sleep(Duration::from_millis(1150)).await;
        pipeline.reset();
    });

    assert!(matches!(outcome, Err(PipelineError::Cancelled)));
    assert_eq!(pipeline.state(), PipelineState::Idle);
    assert_eq!(milestones(&log), vec!["start:1", "complete:1"]);

    time::sleep(Duration::from_millis(2000)).await;
    assert_eq!(milestones(&log), vec!["start:1", "complete:1"]);
    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.stages[&StageId(1)].call_count, 1);
    assert!(!snapshot.stages.contains_key(&StageId(2)));
}

#[tokio::test(start_paused = true)]
async fn progress_climbs_to_100_before_each_completion() {
    let pipeline = orchestrator(None, &MetricsCollector::new());
    let log = Log::default();
    pipeline.register_callbacks(recorder(&log));

    pipeline.run(Value::Null).await.unwrap();

    let events = log.lock().unwrap().clone();
    for id in 1..=5 {
        let prefix = format!("progress:{id}:");
        let values: Vec<u8> = events
            .iter()
            .filter_map(|e| e.strip_prefix(prefix.as_str()))
            .map(|pct| pct.parse().unwrap())
            .collect();
        assert!(values.windows(2).all(|w| w[0] < w[1]), "stage {id}: {values:?}");
        assert_eq!(values.last(), Some(&100));
        assert_eq!(values.iter().filter(|&&v| v == 100).count(), 1);

        let last_progress = events
            .iter()
            .rposition(|e| e.starts_with(prefix.as_str()))
            .unwrap();
        let completed = events
            .iter()
            .position(|e| *e == format!("complete:{id}"))
            .unwrap();
        assert!(last_progress < completed);
    }
}

#[tokio::test(start_paused = true)]
async fn metrics_accumulate_across_runs() {
    let metrics = MetricsCollector::new();
    let pipeline = orchestrator(None, &metrics);

    pipeline.run(Value::Null).await.unwrap();
    pipeline.run(Value::Null).await.unwrap();

    let report = metrics.report();
    assert_eq!(report.len(), 5);
    for (id, nominal) in (1..=5).zip(DURATIONS) {
        let stage = &report[&StageId(id)];
        assert_eq!(stage.total_calls, 2);
        assert_eq!(stage.success_rate_percent, 100);
        assert!(stage.average_duration_ms.unwrap() >= nominal);
        assert_eq!(stage.name.as_deref(), Some(format!("agent-{id}").as_str()));
    }
    assert_eq!(metrics.snapshot().runs_completed, 2);
}

#[tokio::test(start_paused = true)]
async fn panicking_listener_does_not_break_the_run() {
    let pipeline = orchestrator(None, &MetricsCollector::new());
    let log = Log::default();
    pipeline.register_callbacks(Callbacks::new().on_step_start(|_| panic!("renderer gone")));
    pipeline.register_callbacks(recorder(&log));

    let result = pipeline.run(Value::Null).await.unwrap();

    assert!(result.success);
    assert_eq!(milestones(&log).last().unwrap(), "all:5");
}

#[tokio::test(start_paused = true)]
async fn zero_duration_stage_reports_only_completion() {
    let pipeline = PipelineOrchestrator::builder()
        .add_stage(StageDefinition::from_fn(1, "instant", 0, |_| Ok(json!("ok"))))
        .with_config(PipelineConfig {
            inter_stage_delay_ms: 0,
            ..PipelineConfig::default()
        })
        .with_metrics(MetricsCollector::new())
        .build()
        .unwrap();
    let log = Log::default();
    pipeline.register_callbacks(recorder(&log));

    let result = pipeline.run(Value::Null).await.unwrap();

    assert!(result.success);
    assert_eq!(
        *log.lock().unwrap(),
        vec!["start:1", "progress:1:100", "complete:1", "all:1"]
    );
}

#[tokio::test(start_paused = true)]
async fn async_stages_share_the_clock() {
    let pipeline = PipelineOrchestrator::builder()
        .add_stage(StageDefinition::from_async(1, "fetch", 500, |_ctx| async {
            time::sleep(Duration::from_millis(900)).await;
            Ok(json!({ "fetched": true }))
        }))
        .add_stage(StageDefinition::from_fn(2, "use", 100, |ctx| {
            Ok(json!({ "upstream": ctx.output(StageId(1)).cloned() }))
        }))
        .with_metrics(MetricsCollector::new())
        .build()
        .unwrap();

    let result = pipeline.run(Value::Null).await.unwrap();

    assert!(result.per_stage[0].elapsed_ms >= 900);
    assert_eq!(
        result.final_output(),
        Some(&json!({ "upstream": { "fetched": true } }))
    );
}
