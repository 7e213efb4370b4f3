mod common;

use common::Harness;
use ttl_deploy::artifact::ArtifactStore;
use ttl_deploy::pipeline::{StageKind, StageStatus};
use ttl_deploy::quality::{EvaluationReport, QualityGateResult};
use ttl_deploy::stages::{EVALUATION_REPORT, GATE_RESULT};

fn store(harness: &Harness, run_id: &str) -> ArtifactStore {
    ArtifactStore::open(&harness.config.run.artifact_root(), run_id).unwrap()
}

#[test]
fn gate_result_and_report_are_published() {
    let harness = Harness::new();
    harness.run("run-report");

    let store = store(&harness, "run-report");
    let result: QualityGateResult = store.get_json(GATE_RESULT).unwrap();
    assert!(result.admit());
    assert_eq!(result.threshold(), 20.0);
    assert!((result.metric() - 15.2).abs() < 1e-9);

    let report: EvaluationReport = store.get_json(EVALUATION_REPORT).unwrap();
    assert!(report.evaluation_passed);
    assert_eq!(report.token_count, 128);
    assert_eq!(report.sample_generations.len(), 3);
    assert_eq!(report.sample_generations[0].prompt, "The future of renewable energy is");
}

#[test]
fn threshold_boundary() {
    let mut harness = Harness::new();
    harness.perplexity = 19.99;
    let (run, _) = harness.run("run-under");
    assert_eq!(run.status_of(StageKind::Gate), StageStatus::Succeeded);

    harness.perplexity = 20.01;
    let (run, _) = harness.run("run-over");
    assert_eq!(run.status_of(StageKind::Gate), StageStatus::Failed);
    let error = run.record(StageKind::Gate).unwrap().error.clone().unwrap();
    assert!(error.contains("exceeds threshold 20"), "{error}");
}

#[test]
fn rejected_report_is_still_recorded() {
    let mut harness = Harness::new();
    harness.perplexity = 25.0;
    harness.run("run-rejected");

    let report: EvaluationReport = store(&harness, "run-rejected")
        .get_json(EVALUATION_REPORT)
        .unwrap();
    assert!(!report.evaluation_passed);
    assert!((report.perplexity - 25.0).abs() < 1e-9);
}

#[test]
fn invalid_threshold_fails_evaluation_before_scoring() {
    let mut harness = Harness::new();
    harness.config.evaluate.perplexity_threshold = 0.0;
    let (run, metrics) = harness.run("run-bad-threshold");

    let record = run.record(StageKind::Evaluate).unwrap();
    assert_eq!(record.status, StageStatus::Failed);
    assert_eq!(record.error_code.as_deref(), Some("QualityGateFailure"));
    assert!(record.error.as_deref().unwrap().contains("invalid perplexity threshold"));
    assert_eq!(run.status_of(StageKind::Gate), StageStatus::Skipped);
    assert_eq!(metrics.gate_admits + metrics.gate_rejects, 0);
    assert!(!store(&harness, "run-bad-threshold").contains(GATE_RESULT));
}

#[test]
fn non_finite_loss_is_a_gate_failure() {
    let mut harness = Harness::new();
    harness.perplexity = -1.0;
    let (run, _) = harness.run("run-nan");
    let record = run.record(StageKind::Evaluate).unwrap();
    assert_eq!(record.error_code.as_deref(), Some("QualityGateFailure"));
    assert!(record.error.as_deref().unwrap().contains("non-finite"));
}
