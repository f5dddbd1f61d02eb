use std::fs;

use assert_cmd::Command;
use serde_json::Value;
use tempfile::tempdir;

fn relay() -> Command {
    Command::cargo_bin("agent-relay").expect("binary present")
}

#[test]
fn run_completes_and_writes_reports() {
    let temp = tempdir().unwrap();
    let result_path = temp.path().join("out/result.json");
    let metrics_path = temp.path().join("out/metrics.json");
    let prom_path = temp.path().join("out/metrics.prom");

    let output = relay()
        .args(["run", "--speed", "1000", "--result-json"])
        .arg(&result_path)
        .arg("--metrics-json")
        .arg(&metrics_path)
        .arg("--metrics-prometheus")
        .arg(&prom_path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let stdout = String::from_utf8_lossy(&output);
    assert!(stdout.contains("All 5 stages completed"));
    assert!(stdout.contains("Nike AirZoom Pro Runner"));

    let result: Value = serde_json::from_str(&fs::read_to_string(&result_path).unwrap()).unwrap();
    assert_eq!(result["success"], true);
    assert_eq!(result["per_stage"].as_array().unwrap().len(), 5);

    let metrics: Value =
        serde_json::from_str(&fs::read_to_string(&metrics_path).unwrap()).unwrap();
    assert_eq!(metrics["runs_completed"], 1);
    assert!(
        fs::read_to_string(&prom_path)
            .unwrap()
            .contains("agent_relay_stage_calls_total{stage=\"5\"} 1")
    );
}

#[test]
fn run_with_failed_stage_exits_non_zero() {
    let temp = tempdir().unwrap();
    let result_path = temp.path().join("result.json");

    let assert = relay()
        .args(["run", "--speed", "1000", "--quiet", "--fail-stage", "3"])
        .arg("--result-json")
        .arg(&result_path)
        .assert()
        .failure();
    let stderr = String::from_utf8_lossy(&assert.get_output().stderr).into_owned();
    assert!(stderr.contains("Pipeline failed at stage 3"));

    let result: Value = serde_json::from_str(&fs::read_to_string(&result_path).unwrap()).unwrap();
    assert_eq!(result["success"], false);
    assert_eq!(result["failed_at"], 3);
    assert_eq!(result["per_stage"].as_array().unwrap().len(), 3);
}

#[test]
fn fail_stage_must_exist() {
    relay()
        .args(["run", "--speed", "1000", "--fail-stage", "9"])
        .assert()
        .failure();
}

#[test]
fn list_stages_shows_agents_and_catalog() {
    let output = relay().arg("list-stages").assert().success().get_output().stdout.clone();
    let stdout = String::from_utf8_lossy(&output);
    for agent in [
        "product_discovery",
        "knowledge_graph",
        "inventory",
        "comparison",
        "orchestrator",
    ] {
        assert!(stdout.contains(agent), "missing {agent}");
    }
    assert!(stdout.contains("Knowledge Graph Query Agent (knowledge_graph, 1500ms)"));
}

#[test]
fn validate_accepts_builtin_and_rejects_unknown_agents() {
    relay().arg("validate").assert().success();

    let temp = tempdir().unwrap();
    let path = temp.path().join("bad.yaml");
    fs::write(
        &path,
        r#"
version: 1
query: "shoes"
customer: { id: c, name: C, budget: 50, size: 8 }
stages:
  - { id: 1, agent: telepathy, name: Mind Reader, duration_ms: 10 }
"#,
    )
    .unwrap();
    relay().arg("validate").arg(&path).assert().failure();
}

#[test]
fn bench_writes_report() {
    let temp = tempdir().unwrap();
    let report_path = temp.path().join("bench.json");

    relay()
        .args(["bench", "--runs", "2", "--speed", "1000", "--report"])
        .arg(&report_path)
        .assert()
        .success();

    let report: Value = serde_json::from_str(&fs::read_to_string(&report_path).unwrap()).unwrap();
    assert_eq!(report["summary"]["runs"], 2);
    assert_eq!(report["summary"]["succeeded"], 2);
    assert_eq!(report["stages"]["1"]["total_calls"], 2);
}
