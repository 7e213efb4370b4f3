mod common;

use std::fs;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::Harness;
use ttl_deploy::lifecycle::{Destroyer, PendingTeardowns, SlotLock};
use ttl_deploy::pipeline::{PipelineRun, RunStatus, StageKind, StageStatus};
use ttl_deploy::provision::Environment;

fn status(run: &PipelineRun, kind: StageKind) -> StageStatus {
    run.status_of(kind)
}

fn error_code(run: &PipelineRun, kind: StageKind) -> Option<String> {
    run.record(kind).and_then(|r| r.error_code.clone())
}

fn deletes(calls: &[String]) -> usize {
    calls.iter().filter(|c| c.starts_with("delete_service")).count()
}

#[test]
fn admitted_model_is_deployed_held_and_destroyed() {
    let harness = Harness::new();
    let (run, metrics) = harness.run("run-ok");

    assert_eq!(run.status, RunStatus::Succeeded);
    for record in &run.stages {
        assert_eq!(record.status, StageStatus::Succeeded, "{}", record.stage);
    }

    assert_eq!(
        harness.builder.images.lock().unwrap().as_slice(),
        ["us-docker.pkg.dev/demo/apps/chat:sha-0123456789ab"]
    );
    assert_eq!(
        harness.pusher.pushed.lock().unwrap().as_slice(),
        [
            "us-docker.pkg.dev/demo/apps/chat:sha-0123456789ab",
            "us-docker.pkg.dev/demo/apps/chat:latest"
        ]
    );

    let calls = harness.cloud.calls();
    assert_eq!(
        calls,
        vec![
            "create_identity chat-runner",
            "apply_service chat",
            "set_public_access chat true",
            "set_public_access chat false",
            "delete_service chat",
            "delete_identity chat-runner@demo.iam.gserviceaccount.com",
        ]
    );
    assert_eq!(harness.cloud.service_count(), 0);
    assert_eq!(harness.cloud.identity_count(), 0);

    assert!(harness.sleeper.recorded().contains(&Duration::from_secs(3600)));
    assert!(PendingTeardowns::new(harness.config.run.environment_dir()).list().unwrap().is_empty());
    assert!(!SlotLock::path_for(&harness.config.run.lock_dir(), &harness.slot()).exists());

    assert_eq!(metrics.gate_admits, 1);
    assert_eq!(metrics.teardowns, 1);
    assert_eq!(metrics.stages.len(), 11);
}

#[test]
fn perplexity_under_threshold_is_admitted() {
    let mut harness = Harness::new();
    harness.perplexity = 15.2;
    let (run, _) = harness.run("run-152");
    assert_eq!(status(&run, StageKind::Gate), StageStatus::Succeeded);
    assert_eq!(status(&run, StageKind::Provision), StageStatus::Succeeded);
}

#[test]
fn rejected_model_never_reaches_provision() {
    let mut harness = Harness::new();
    harness.perplexity = 25.0;
    let (run, metrics) = harness.run("run-reject");

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(status(&run, StageKind::Evaluate), StageStatus::Succeeded);
    assert_eq!(status(&run, StageKind::Gate), StageStatus::Failed);
    assert_eq!(error_code(&run, StageKind::Gate).as_deref(), Some("QualityGateFailure"));
    for kind in [
        StageKind::Build,
        StageKind::Scan,
        StageKind::Push,
        StageKind::Provision,
        StageKind::Probe,
        StageKind::Wait,
        StageKind::Destroy,
    ] {
        assert_eq!(status(&run, kind), StageStatus::Skipped, "{kind}");
    }
    assert!(harness.builder.images.lock().unwrap().is_empty());
    assert!(harness.cloud.calls().is_empty());
    assert_eq!(metrics.gate_rejects, 1);
}

#[test]
fn empty_validation_set_is_a_no_data_failure() {
    let harness = Harness::new();
    std::fs::write(harness.root().join("validation.txt"), "\n  \n").unwrap();
    let (run, _) = harness.run("run-empty");

    assert_eq!(status(&run, StageKind::Evaluate), StageStatus::Failed);
    let record = run.record(StageKind::Evaluate).unwrap();
    assert_eq!(record.error_code.as_deref(), Some("QualityGateFailure"));
    assert!(record.error.as_deref().unwrap().contains("no-data"));
    assert!(harness.cloud.calls().is_empty());
}

#[test]
fn failed_startup_probe_destroys_without_waiting_for_ttl() {
    let harness = Harness::new();
    harness.health.healthy.store(false, Ordering::SeqCst);
    let (run, _) = harness.run("run-unhealthy");

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(error_code(&run, StageKind::Probe).as_deref(), Some("HealthCheckFailure"));
    assert_eq!(status(&run, StageKind::Wait), StageStatus::Skipped);
    assert_eq!(status(&run, StageKind::Destroy), StageStatus::Succeeded);

    assert_eq!(harness.health.checks.load(Ordering::SeqCst), 12);
    let sleeps = harness.sleeper.recorded();
    assert_eq!(sleeps.len(), 12);
    assert_eq!(sleeps.iter().sum::<Duration>(), Duration::from_secs(60));
    assert!(!sleeps.contains(&Duration::from_secs(3600)));

    assert_eq!(deletes(&harness.cloud.calls()), 1);
    assert_eq!(harness.cloud.service_count(), 0);
}

#[test]
fn cancellation_during_ttl_still_tears_down() {
    let harness = Harness::new();
    *harness.sleeper.cancel_on.lock().unwrap() = Some(Duration::from_secs(3600));
    let (run, _) = harness.run("run-cancel");

    assert_eq!(run.status, RunStatus::Aborted);
    assert_eq!(error_code(&run, StageKind::Wait).as_deref(), Some("Cancelled"));
    assert_eq!(status(&run, StageKind::Destroy), StageStatus::Succeeded);
    assert_eq!(deletes(&harness.cloud.calls()), 1);
    assert_eq!(harness.cloud.service_count(), 0);
}

#[test]
fn cancellation_while_waiting_for_health_still_tears_down() {
    let harness = Harness::new();
    harness.health.healthy.store(false, Ordering::SeqCst);
    *harness.sleeper.cancel_on.lock().unwrap() = Some(Duration::from_secs(5));
    let (run, _) = harness.run("run-cancel-health");

    assert_eq!(run.status, RunStatus::Aborted);
    assert_eq!(error_code(&run, StageKind::Probe).as_deref(), Some("Cancelled"));
    assert_eq!(status(&run, StageKind::Wait), StageStatus::Skipped);
    assert_eq!(status(&run, StageKind::Destroy), StageStatus::Succeeded);
    assert_eq!(harness.health.checks.load(Ordering::SeqCst), 1);
    assert_eq!(harness.cloud.service_count(), 0);
    assert_eq!(harness.cloud.identity_count(), 0);
}

#[test]
fn cancellation_before_start_skips_everything() {
    let harness = Harness::new();
    harness.cancel.cancel();
    let (run, _) = harness.run("run-precancel");

    assert_eq!(run.status, RunStatus::Aborted);
    assert!(run.stages.iter().all(|r| r.status == StageStatus::Skipped));
    assert_eq!(harness.trainer.calls.load(Ordering::SeqCst), 0);
    assert!(harness.cloud.calls().is_empty());
}

#[test]
fn failed_teardown_is_recorded_for_retry() {
    let harness = Harness::new();
    harness.cloud.fail_next_deletes(3);
    let (run, metrics) = harness.run("run-stuck");

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(error_code(&run, StageKind::Destroy).as_deref(), Some("DestroyFailure"));
    assert_eq!(metrics.teardown_failures, 1);
    assert_eq!(harness.cloud.service_count(), 1);

    let records = PendingTeardowns::new(harness.config.run.environment_dir());
    let pending: Vec<Environment> = records.list().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].run_id, "run-stuck");
    assert!(SlotLock::path_for(&harness.config.run.lock_dir(), &harness.slot()).exists());

    // The slot stays blocked until the leftover is destroyed.
    let (second, _) = harness.run("run-next");
    assert_eq!(error_code(&second, StageKind::Provision).as_deref(), Some("SlotBusy"));

    let destroyer = Destroyer::new(
        harness.cloud.clone(),
        harness.sleeper.clone(),
        &harness.config.lifecycle,
    );
    let report = destroyer.teardown(&pending[0]).unwrap();
    assert!(report.service_deleted);
    assert_eq!(harness.cloud.service_count(), 0);
}

#[test]
fn busy_slot_rejects_the_second_run() {
    let harness = Harness::new();
    SlotLock::acquire(&harness.config.run.lock_dir(), &harness.slot(), "other-run")
        .unwrap()
        .persist();
    let (run, _) = harness.run("run-busy");

    let record = run.record(StageKind::Provision).unwrap();
    assert_eq!(record.error_code.as_deref(), Some("SlotBusy"));
    assert!(record.error.as_deref().unwrap().contains("other-run"));
    assert_eq!(status(&run, StageKind::Destroy), StageStatus::Skipped);
    assert!(harness.cloud.calls().is_empty());
}

#[test]
fn unique_suffix_lets_runs_use_disjoint_slots() {
    let mut harness = Harness::new();
    harness.config.deploy.unique_suffix = true;
    SlotLock::acquire(&harness.config.run.lock_dir(), &harness.slot(), "other-run")
        .unwrap()
        .persist();
    let (run, _) = harness.run("abcdef12-3456");
    assert_eq!(run.status, RunStatus::Succeeded);
    assert!(harness.cloud.calls().contains(&"apply_service chat-abcdef12".to_string()));
    assert!(harness.cloud.calls().contains(&"create_identity chat-runner-abcdef12".to_string()));
}

#[test]
fn blocking_vulnerability_stops_before_provision() {
    let harness = Harness::new();
    harness.scanner.add("CVE-2024-0001", "CRITICAL");
    harness.scanner.add("CVE-2024-0002", "LOW");
    let (run, _) = harness.run("run-vuln");

    let record = run.record(StageKind::Scan).unwrap();
    assert_eq!(record.error_code.as_deref(), Some("ScanFailure"));
    assert!(record.error.as_deref().unwrap().contains("CVE-2024-0001"));
    assert!(!record.error.as_deref().unwrap().contains("CVE-2024-0002"));
    assert_eq!(status(&run, StageKind::Provision), StageStatus::Skipped);
    assert!(harness.pusher.pushed.lock().unwrap().is_empty());
    assert!(harness.cloud.calls().is_empty());
}

#[test]
fn ignored_vulnerability_does_not_block() {
    let mut harness = Harness::new();
    harness.config.scan.ignore = vec!["CVE-2024-*".to_string()];
    harness.scanner.add("CVE-2024-0001", "CRITICAL");
    let (run, _) = harness.run("run-ignored");
    assert_eq!(run.status, RunStatus::Succeeded);
}

#[test]
fn partial_rollout_is_torn_down() {
    let harness = Harness::new();
    harness.cloud.fail_next_applies(1);
    let (run, _) = harness.run("run-partial");

    assert_eq!(error_code(&run, StageKind::Provision).as_deref(), Some("DeployFailure"));
    assert_eq!(status(&run, StageKind::Probe), StageStatus::Skipped);
    assert_eq!(status(&run, StageKind::Destroy), StageStatus::Succeeded);
    assert_eq!(harness.cloud.service_count(), 0);
    assert_eq!(harness.cloud.identity_count(), 0);
}

/// Blocks the pending-teardown directory with a plain file.
fn block_environment_records(harness: &Harness) {
    let dir = harness.config.run.environment_dir();
    fs::create_dir_all(dir.parent().unwrap()).unwrap();
    fs::write(&dir, "not a directory").unwrap();
}

#[test]
fn unrecordable_environment_is_torn_down_at_once() {
    let harness = Harness::new();
    block_environment_records(&harness);
    let (run, _) = harness.run("run-unrecorded");

    let record = run.record(StageKind::Provision).unwrap();
    assert_eq!(record.error_code.as_deref(), Some("DeployFailure"));
    assert!(record.error.as_deref().unwrap().contains("torn down"));
    assert_eq!(status(&run, StageKind::Destroy), StageStatus::Skipped);
    assert_eq!(harness.cloud.service_count(), 0);
    assert_eq!(harness.cloud.identity_count(), 0);
    assert!(!SlotLock::path_for(&harness.config.run.lock_dir(), &harness.slot()).exists());
}

#[test]
fn unrecordable_partial_environment_with_failed_teardown_is_reported() {
    let harness = Harness::new();
    block_environment_records(&harness);
    harness.cloud.fail_next_applies(1);
    harness.cloud.fail_next_deletes(3);
    let (run, _) = harness.run("run-lost");

    assert_eq!(run.status, RunStatus::Failed);
    let record = run.record(StageKind::Provision).unwrap();
    assert_eq!(record.error_code.as_deref(), Some("DestroyFailure"));
    let error = record.error.as_deref().unwrap();
    assert!(error.contains("could not record environment"), "{error}");
    assert!(error.contains(r#""run_id":"run-lost""#), "{error}");
    assert_eq!(harness.cloud.service_count(), 1);
    assert!(SlotLock::path_for(&harness.config.run.lock_dir(), &harness.slot()).exists());
}

#[test]
fn cached_model_skips_training() {
    let mut harness = Harness::new();
    harness.config.train.cache_dir = Some(harness.root().join("cache"));

    let (first, _) = harness.run("run-cache-1");
    let (second, _) = harness.run("run-cache-2");
    assert_eq!(first.status, RunStatus::Succeeded);
    assert_eq!(second.status, RunStatus::Succeeded);
    assert_eq!(harness.trainer.calls.load(Ordering::SeqCst), 1);
    let leftovers = fs::read_dir(harness.root().join("cache"))
        .unwrap()
        .filter(|entry| entry.as_ref().unwrap().file_name().to_string_lossy().ends_with(".partial"))
        .count();
    assert_eq!(leftovers, 0);

    harness.config.train.force = true;
    harness.run("run-cache-3");
    assert_eq!(harness.trainer.calls.load(Ordering::SeqCst), 2);
}

#[test]
fn disabled_probes_wait_grace_then_ttl() {
    let mut harness = Harness::new();
    harness.config.probe.enabled = false;
    let (run, _) = harness.run("run-unconfirmed");

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(harness.health.checks.load(Ordering::SeqCst), 0);
    assert_eq!(
        harness.sleeper.recorded(),
        vec![Duration::from_secs(60), Duration::from_secs(3600)]
    );
}

#[test]
fn run_record_round_trips_through_disk() {
    let harness = Harness::new();
    let (run, _) = harness.run("run-record");
    let path = run.write(&harness.config.run.run_dir()).unwrap();
    let loaded = PipelineRun::load(&path).unwrap();
    assert_eq!(loaded.status, RunStatus::Succeeded);
    assert_eq!(loaded.stages.len(), 11);
    let train = loaded.record(StageKind::Train).unwrap();
    assert_eq!(train.artifacts[0].name, "model.tar.gz");
}
