use std::fs;
use std::path::Path;

use assert_cmd::Command;
use assert_cmd::assert::Assert;
use tempfile::tempdir;

fn bin() -> Command {
    Command::cargo_bin("ttl-deploy").expect("binary present")
}

fn stdout(assert: Assert) -> String {
    String::from_utf8_lossy(&assert.get_output().stdout).into_owned()
}

fn stderr(assert: Assert) -> String {
    String::from_utf8_lossy(&assert.get_output().stderr).into_owned()
}

/// A config whose collaborators are small shell scripts and whose cloud is simulated.
fn write_project(root: &Path, loss: f64) -> std::path::PathBuf {
    fs::write(root.join("train.txt"), "the sun\nthe wind\n").unwrap();
    fs::write(root.join("validation.txt"), "solar panels\nwind farms\n").unwrap();
    fs::create_dir_all(root.join("context")).unwrap();
    fs::write(root.join("context/Dockerfile"), "FROM scratch\n").unwrap();
    fs::write(
        root.join("train.sh"),
        "set -e\nmkdir -p \"$1/tokenizer\"\nprintf 'weights' > \"$1/weights.bin\"\nprintf '{}' > \"$1/tokenizer/vocab.json\"\n",
    )
    .unwrap();
    fs::write(
        root.join("score.sh"),
        format!(
            "test -f \"$1/weights.bin\"\necho '{{\"sequences\":[{{\"loss\":{loss},\"tokens\":64}}],\"samples\":[]}}'\n"
        ),
    )
    .unwrap();
    fs::write(root.join("scan.sh"), "echo '{\"Results\":[]}'\n").unwrap();

    let config = format!(
        r#"
version: 1
run:
  state_dir: {root}/state
train:
  command: {{ program: sh, args: ["{root}/train.sh", "{{model_dir}}"] }}
  data_file: {root}/train.txt
evaluate:
  command: {{ program: sh, args: ["{root}/score.sh", "{{model_dir}}"] }}
  validation_file: {root}/validation.txt
  perplexity_threshold: 20
build:
  context: {root}/context
  repository: us-docker.pkg.dev/demo/apps/chat
  command: {{ program: "true" }}
scan:
  command: {{ program: sh, args: ["{root}/scan.sh"] }}
push:
  command: {{ program: "true" }}
deploy:
  backend: simulated
  project: demo
  region: us-central1
  service: chat
  identity: chat-runner
lifecycle:
  ttl_secs: 1
  unconfirmed_grace_secs: 1
  destroy_backoff_secs: 0
"#,
        root = root.display()
    );
    let path = root.join("pipeline.yaml");
    fs::write(&path, config).unwrap();
    path
}

#[test]
fn run_deploys_and_expires_with_simulated_cloud() {
    let temp = tempdir().unwrap();
    let config = write_project(temp.path(), 2.0);
    let metrics = temp.path().join("out/metrics.json");
    let prometheus = temp.path().join("out/metrics.prom");

    bin()
        .arg("run")
        .arg(&config)
        .args(["--commit", "0123456789abcdef", "--run-id", "cli-run"])
        .arg("--metrics-json")
        .arg(&metrics)
        .arg("--metrics-prometheus")
        .arg(&prometheus)
        .assert()
        .success();

    let record = fs::read_to_string(temp.path().join("state/runs/cli-run.json")).unwrap();
    let record: serde_json::Value = serde_json::from_str(&record).unwrap();
    assert_eq!(record["status"], "succeeded");
    assert_eq!(record["stages"].as_array().unwrap().len(), 11);
    assert_eq!(
        fs::read_to_string(temp.path().join("state/artifacts/cli-run/image-ref.txt")).unwrap(),
        "us-docker.pkg.dev/demo/apps/chat:sha-0123456789ab"
    );
    assert!(temp.path().join("context/model/weights.bin").is_file());

    let snapshot: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&metrics).unwrap()).unwrap();
    assert_eq!(snapshot["gate_admits"], 1);
    assert_eq!(snapshot["teardowns"], 1);
    assert!(fs::read_to_string(&prometheus).unwrap().contains("ttl_deploy_"));
}

#[test]
fn rejected_run_exits_non_zero() {
    let temp = tempdir().unwrap();
    let config = write_project(temp.path(), 4.0);

    let err = stderr(
        bin()
            .arg("run")
            .arg(&config)
            .args(["--commit", "abc", "--run-id", "cli-reject"])
            .assert()
            .failure(),
    );
    assert!(err.contains("QualityGateFailure"), "{err}");

    let record = fs::read_to_string(temp.path().join("state/runs/cli-reject.json")).unwrap();
    assert!(record.contains("\"status\": \"failed\""));
    assert!(!temp.path().join("state/artifacts/cli-reject/image.json").exists());
}

#[test]
fn run_rejects_an_unusable_run_id() {
    let temp = tempdir().unwrap();
    let config = write_project(temp.path(), 2.0);

    let err = stderr(
        bin()
            .arg("run")
            .arg(&config)
            .args(["--commit", "abc", "--run-id", "../Bad Id"])
            .assert()
            .failure(),
    );
    assert!(err.contains("Run id"), "{err}");
}

#[test]
fn validate_reports_errors() {
    let temp = tempdir().unwrap();
    let config = write_project(temp.path(), 2.0);
    let out = stdout(bin().arg("validate").arg(&config).assert().success());
    assert!(out.contains("Configuration is valid"));
    assert!(out.contains("warning: deploy.backend is 'simulated'"));

    let broken = fs::read_to_string(&config)
        .unwrap()
        .replace("identity: chat-runner", "identity: x");
    fs::write(&config, broken).unwrap();
    let out = stdout(bin().arg("validate").arg(&config).assert().failure());
    assert!(out.contains("error: deploy.identity"), "{out}");
}

#[test]
fn plan_is_written() {
    let temp = tempdir().unwrap();
    let config = write_project(temp.path(), 2.0);
    let output = temp.path().join("pipeline.plan.yaml");
    bin().arg("plan").arg(&config).arg(&output).assert().success();
    let plan = fs::read_to_string(&output).unwrap();
    assert!(plan.contains("name: provision"));
    assert!(plan.contains("config_hash:"));
}

#[test]
fn gate_admits_and_rejects() {
    let temp = tempdir().unwrap();
    let report = temp.path().join("scores.json");
    fs::write(
        &report,
        r#"{"sequences":[{"loss":2.0,"tokens":10},{"loss":3.0,"tokens":10}]}"#,
    )
    .unwrap();

    let output = temp.path().join("eval/evaluation.json");
    let out = stdout(
        bin()
            .arg("gate")
            .arg(&report)
            .args(["--threshold", "20"])
            .arg("--output")
            .arg(&output)
            .assert()
            .success(),
    );
    assert!(out.contains("\"evaluation_passed\": true"));
    assert!(output.is_file());

    let err = stderr(bin().arg("gate").arg(&report).args(["--threshold", "5"]).assert().failure());
    assert!(err.contains("exceeds threshold 5"), "{err}");

    fs::write(&report, r#"{"sequences":[]}"#).unwrap();
    let err = stderr(bin().arg("gate").arg(&report).args(["--threshold", "20"]).assert().failure());
    assert!(err.contains("no-data"), "{err}");
}

#[test]
fn archive_round_trip_and_digest() {
    let temp = tempdir().unwrap();
    let source = temp.path().join("model");
    fs::create_dir_all(source.join("tokenizer")).unwrap();
    fs::write(source.join("weights.bin"), [9u8, 8, 7]).unwrap();
    fs::write(source.join("tokenizer/vocab.json"), "{}").unwrap();
    let archive = temp.path().join("model.tar.gz");

    let out = stdout(
        bin()
            .args(["archive", "pack"])
            .arg(&source)
            .arg(&archive)
            .assert()
            .success(),
    );
    assert!(out.contains("model.tar.gz"));

    let restored = temp.path().join("restored");
    bin()
        .args(["archive", "unpack"])
        .arg(&archive)
        .arg(&restored)
        .assert()
        .success();
    assert_eq!(fs::read(restored.join("weights.bin")).unwrap(), [9u8, 8, 7]);

    let sidecar = temp.path().join("model.tar.gz.sha256");
    bin()
        .arg("digest")
        .arg(&archive)
        .arg("--output")
        .arg(&sidecar)
        .assert()
        .success();
    let line = fs::read_to_string(&sidecar).unwrap();
    assert_eq!(line.split_whitespace().next().unwrap().len(), 64);
}

#[test]
fn destroy_without_leftovers_is_a_no_op() {
    let temp = tempdir().unwrap();
    let config = write_project(temp.path(), 2.0);
    let out = stdout(bin().arg("destroy").arg(&config).assert().success());
    assert!(out.contains("No pending environments"));
}

#[test]
fn list_stages_shows_topology() {
    let out = stdout(bin().arg("list-stages").assert().success());
    assert!(out.contains("- lint\n"));
    assert!(out.contains("- gate <- evaluate"));
    assert!(out.contains("- destroy <- wait (cleanup"));
}
