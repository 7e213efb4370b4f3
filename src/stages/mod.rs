use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::artifact::{ArtifactRef, pack_directory, unpack_archive};
use crate::error::{GateError, StageError, StageResult};
use crate::image::ImageReference;
use crate::lifecycle::{
    Destroyer, EnvironmentLease, LifecycleTimer, PendingTeardowns, SlotLock, Wake,
};
use crate::pipeline::{RunContext, Stage, StageKind, StageRegistry};
use crate::probe::{ProbeReport, join_url, wait_until_healthy};
use crate::provision::{DesiredEnvironment, Provisioner};
use crate::quality::{
    EvaluationReport, QualityGate, QualityGateResult, count_validation_samples, perplexity,
};
use crate::security::{ScanPolicy, compute_sha256};

pub const MODEL_ARCHIVE: &str = "model.tar.gz";
pub const EVALUATION_REPORT: &str = "evaluation.json";
pub const GATE_RESULT: &str = "quality-gate.json";
pub const IMAGE: &str = "image.json";
pub const SCAN_REPORT: &str = "scan.json";
pub const PUSH_RECORD: &str = "push.json";
pub const IMAGE_REF: &str = "image-ref.txt";
pub const ENVIRONMENT: &str = "environment.json";
pub const PROBE_REPORT: &str = "probe.json";
pub const TEARDOWN_REPORT: &str = "teardown.json";

pub fn register_defaults(registry: &mut StageRegistry) {
    registry.register(StageKind::Lint, |_| Ok(Box::new(LintStage)));
    registry.register(StageKind::Train, |_| Ok(Box::new(TrainStage)));
    registry.register(StageKind::Evaluate, |_| Ok(Box::new(EvaluateStage)));
    registry.register(StageKind::Gate, |_| Ok(Box::new(GateStage)));
    registry.register(StageKind::Build, |_| Ok(Box::new(BuildStage)));
    registry.register(StageKind::Scan, |config| {
        let policy = ScanPolicy::new(&config.scan.severities, &config.scan.ignore)?;
        Ok(Box::new(ScanStage { policy }))
    });
    registry.register(StageKind::Push, |_| Ok(Box::new(PushStage)));
    registry.register(StageKind::Provision, |_| Ok(Box::new(ProvisionStage)));
    registry.register(StageKind::Probe, |_| Ok(Box::new(ProbeStage)));
    registry.register(StageKind::Wait, |_| Ok(Box::new(WaitStage)));
    registry.register(StageKind::Destroy, |_| Ok(Box::new(DestroyStage)));
}

pub fn default_registry() -> StageRegistry {
    let mut registry = StageRegistry::new();
    register_defaults(&mut registry);
    registry
}

fn artifact_error(err: anyhow::Error) -> StageError {
    StageError::Artifact(StageError::chain(&err))
}

fn reset_dir(path: &Path) -> anyhow::Result<()> {
    if path.exists() {
        fs::remove_dir_all(path)
            .with_context(|| format!("Failed to clear {}", path.display()))?;
    }
    fs::create_dir_all(path).with_context(|| format!("Failed to create {}", path.display()))
}

struct LintStage;

impl Stage for LintStage {
    fn kind(&self) -> StageKind {
        StageKind::Lint
    }

    fn run(&self, ctx: &mut RunContext) -> StageResult<Vec<ArtifactRef>> {
        if ctx.config.lint.commands.is_empty() {
            info!("No lint commands configured");
        }
        ctx.toolchain
            .linter
            .lint()
            .map_err(|err| StageError::Lint(StageError::chain(&err)))?;
        Ok(Vec::new())
    }
}

struct TrainStage;

impl TrainStage {
    fn cached_archive(cache_dir: &Path, data_digest: &str) -> PathBuf {
        cache_dir.join(format!("{data_digest}.tar.gz"))
    }

    /// Readers only ever see a complete archive: write beside it, then rename over.
    fn store_cached(path: &Path, archive: &[u8], run_id: &str) -> std::io::Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
        let partial = path.with_file_name(format!(".{name}.{run_id}.partial"));
        let stored = fs::write(&partial, archive).and_then(|_| fs::rename(&partial, path));
        if stored.is_err() {
            let _ = fs::remove_file(&partial);
        }
        stored
    }
}

impl Stage for TrainStage {
    fn kind(&self) -> StageKind {
        StageKind::Train
    }

    fn run(&self, ctx: &mut RunContext) -> StageResult<Vec<ArtifactRef>> {
        let train = &ctx.config.train;
        let train_err = |err: anyhow::Error| StageError::Train(StageError::chain(&err));
        let data_digest = compute_sha256(&train.data_file).map_err(train_err)?;
        let cached = train
            .cache_dir
            .as_deref()
            .map(|dir| Self::cached_archive(dir, &data_digest));

        if let Some(path) = &cached
            && path.is_file()
            && !train.force
        {
            info!(cache = %path.display(), "Reusing cached model for identical training data");
            let artifact = ctx.artifacts.put_file(MODEL_ARCHIVE, path).map_err(artifact_error)?;
            return Ok(vec![artifact]);
        }

        let model_dir = ctx.work_dir.join("model");
        reset_dir(&model_dir).map_err(train_err)?;
        ctx.toolchain
            .trainer
            .train(&model_dir, &train.data_file, train.cache_dir.as_deref())
            .map_err(train_err)?;
        let archive = pack_directory(&model_dir).map_err(train_err)?;
        let artifact = ctx.artifacts.put(MODEL_ARCHIVE, &archive).map_err(artifact_error)?;

        if let Some(path) = cached
            && let Err(err) = Self::store_cached(&path, &archive, &ctx.run_id)
        {
            warn!(cache = %path.display(), error = %err, "Failed to store model in cache");
        }
        Ok(vec![artifact])
    }
}

struct EvaluateStage;

impl Stage for EvaluateStage {
    fn kind(&self) -> StageKind {
        StageKind::Evaluate
    }

    fn run(&self, ctx: &mut RunContext) -> StageResult<Vec<ArtifactRef>> {
        let evaluate = &ctx.config.evaluate;
        let eval_err = |err: anyhow::Error| GateError::Evaluation(StageError::chain(&err));
        let gate = QualityGate::new(evaluate.perplexity_threshold)?;

        let samples = count_validation_samples(&evaluate.validation_file).map_err(eval_err)?;
        if samples == 0 {
            return Err(GateError::NoData.into());
        }

        let archive = ctx.artifacts.get(MODEL_ARCHIVE).map_err(artifact_error)?;
        let model_dir = ctx.work_dir.join("eval-model");
        reset_dir(&model_dir).map_err(eval_err)?;
        unpack_archive(&archive, &model_dir).map_err(artifact_error)?;

        let report = ctx
            .toolchain
            .scorer
            .score(&model_dir, &evaluate.validation_file, &evaluate.sample_prompts)
            .map_err(eval_err)?;
        let ppl = perplexity(&report.sequences)?;
        let result = gate.evaluate(ppl.value);
        info!(
            perplexity = ppl.value,
            threshold = gate.threshold(),
            tokens = ppl.token_count,
            admit = result.admit(),
            "Model evaluated"
        );

        let summary = EvaluationReport::new(&ppl, &result, report.samples);
        Ok(vec![
            ctx.artifacts
                .put_json(EVALUATION_REPORT, &summary)
                .map_err(artifact_error)?,
            ctx.artifacts
                .put_json(GATE_RESULT, &result)
                .map_err(artifact_error)?,
        ])
    }
}

struct GateStage;

impl Stage for GateStage {
    fn kind(&self) -> StageKind {
        StageKind::Gate
    }

    fn run(&self, ctx: &mut RunContext) -> StageResult<Vec<ArtifactRef>> {
        let result: QualityGateResult = ctx
            .artifacts
            .get_json(GATE_RESULT)
            .map_err(artifact_error)?;
        ctx.gate = Some(result);
        result.into_decision()?;
        info!(perplexity = result.metric(), threshold = result.threshold(), "Quality gate admitted the model");
        Ok(Vec::new())
    }
}

struct BuildStage;

impl Stage for BuildStage {
    fn kind(&self) -> StageKind {
        StageKind::Build
    }

    fn run(&self, ctx: &mut RunContext) -> StageResult<Vec<ArtifactRef>> {
        let build = &ctx.config.build;
        let build_err = |err: anyhow::Error| StageError::Build(StageError::chain(&err));
        let image = ImageReference::for_commit(&build.repository, &ctx.commit);

        let archive = ctx.artifacts.get(MODEL_ARCHIVE).map_err(artifact_error)?;
        let model_target = build.context.join(&build.model_subdir);
        reset_dir(&model_target).map_err(build_err)?;
        unpack_archive(&archive, &model_target).map_err(artifact_error)?;

        let dockerfile = if build.dockerfile.is_relative() {
            build.context.join(&build.dockerfile)
        } else {
            build.dockerfile.clone()
        };
        ctx.toolchain
            .builder
            .build(&build.context, &dockerfile, &image)
            .map_err(build_err)?;
        info!(image = %image, latest = %image.latest(), "Image built");

        ctx.image = Some(image.clone());
        let artifact = ctx.artifacts.put_json(IMAGE, &image).map_err(artifact_error)?;
        Ok(vec![artifact])
    }
}

struct ScanStage {
    policy: ScanPolicy,
}

impl Stage for ScanStage {
    fn kind(&self) -> StageKind {
        StageKind::Scan
    }

    fn run(&self, ctx: &mut RunContext) -> StageResult<Vec<ArtifactRef>> {
        let image: ImageReference = ctx.artifacts.get_json(IMAGE).map_err(artifact_error)?;
        let report = ctx
            .toolchain
            .scanner
            .scan(&image)
            .map_err(|err| StageError::Scan(StageError::chain(&err)))?;
        let artifact = ctx
            .artifacts
            .put_json(SCAN_REPORT, &report)
            .map_err(artifact_error)?;

        let blocking = self.policy.blocking(&report);
        if !blocking.is_empty() {
            let ids: Vec<String> = blocking
                .iter()
                .map(|v| format!("{} ({} {})", v.id, v.package, v.severity))
                .collect();
            return Err(StageError::Scan(format!(
                "{} blocking vulnerabilities in {image}: {}",
                blocking.len(),
                ids.join(", ")
            )));
        }
        info!(findings = report.vulnerabilities().count(), "Scan passed");
        Ok(vec![artifact])
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PushRecord {
    reference: String,
    latest: String,
    digest: Option<String>,
}

struct PushStage;

impl Stage for PushStage {
    fn kind(&self) -> StageKind {
        StageKind::Push
    }

    fn run(&self, ctx: &mut RunContext) -> StageResult<Vec<ArtifactRef>> {
        let image: ImageReference = ctx.artifacts.get_json(IMAGE).map_err(artifact_error)?;
        let push_err = |err: anyhow::Error| StageError::Push(StageError::chain(&err));
        let pusher = &ctx.toolchain.pusher;
        let digest = pusher.push(&image).map_err(push_err)?;
        pusher.push(&image.latest()).map_err(push_err)?;
        info!(image = %image, digest = digest.as_deref().unwrap_or("-"), "Image pushed");

        let record = PushRecord {
            reference: image.to_string(),
            latest: image.latest().to_string(),
            digest,
        };
        Ok(vec![
            ctx.artifacts
                .put_json(PUSH_RECORD, &record)
                .map_err(artifact_error)?,
            ctx.artifacts
                .put(IMAGE_REF, image.to_string().as_bytes())
                .map_err(artifact_error)?,
        ])
    }
}

struct ProvisionStage;

impl Stage for ProvisionStage {
    fn kind(&self) -> StageKind {
        StageKind::Provision
    }

    fn run(&self, ctx: &mut RunContext) -> StageResult<Vec<ArtifactRef>> {
        let config = ctx.config.clone();
        let image_ref = ctx.artifacts.get_string(IMAGE_REF).map_err(artifact_error)?;
        let desired = DesiredEnvironment::from_config(&config, &ctx.run_id, image_ref.trim());

        let lock = SlotLock::acquire(&config.run.lock_dir(), &desired.slot, &ctx.run_id)?;
        let destroyer = Destroyer::new(
            ctx.toolchain.cloud.clone(),
            ctx.toolchain.sleeper.clone(),
            &config.lifecycle,
        );
        let records = PendingTeardowns::new(config.run.environment_dir());
        let provisioner = Provisioner::new(ctx.toolchain.cloud.as_ref());

        match provisioner.reconcile(&desired, &ctx.run_id, config.lifecycle.ttl_secs) {
            Ok(env) => {
                let lease = EnvironmentLease::register(env.clone(), destroyer, records, Some(lock))?;
                ctx.lease = Some(lease);
                info!(
                    url = env.url.as_deref().unwrap_or("-"),
                    identity_created = env.identity_created,
                    "Environment provisioned"
                );
                let artifact = ctx.artifacts.put_json(ENVIRONMENT, &env).map_err(artifact_error)?;
                Ok(vec![artifact])
            }
            Err(failure) => {
                if let Some(env) = failure.partial {
                    warn!(slot = %env.slot, "Provisioning stopped part way; leasing what exists for teardown");
                    match EnvironmentLease::register(env, destroyer, records, Some(lock)) {
                        Ok(lease) => ctx.lease = Some(lease),
                        Err(StageError::Deploy(detail)) => {
                            return Err(StageError::Deploy(format!(
                                "{}; {detail}",
                                StageError::chain(&failure.error)
                            )));
                        }
                        Err(err) => return Err(err),
                    }
                }
                Err(StageError::Deploy(StageError::chain(&failure.error)))
            }
        }
    }
}

struct ProbeStage;

impl Stage for ProbeStage {
    fn kind(&self) -> StageKind {
        StageKind::Probe
    }

    fn run(&self, ctx: &mut RunContext) -> StageResult<Vec<ArtifactRef>> {
        let probe = &ctx.config.probe;
        let env = ctx
            .lease
            .as_ref()
            .map(|lease| lease.environment().clone())
            .ok_or_else(|| StageError::HealthCheck("no environment to probe".to_string()))?;

        if !probe.enabled {
            info!("Health probing disabled; environment stays unconfirmed");
            ctx.health_confirmed = false;
            let report = ProbeReport {
                url: env.url.unwrap_or_default(),
                attempts: 0,
                healthy: false,
                elapsed_ms: 0,
                smoke_response: None,
            };
            let artifact = ctx.artifacts.put_json(PROBE_REPORT, &report).map_err(artifact_error)?;
            return Ok(vec![artifact]);
        }

        let base_url = env
            .url
            .ok_or_else(|| StageError::HealthCheck(format!("{} has no URL", env.slot)))?;
        let health = ctx.toolchain.health.as_ref();
        let mut report = wait_until_healthy(
            health,
            &join_url(&base_url, &probe.health_path),
            &probe.startup,
            ctx.toolchain.sleeper.as_ref(),
            &ctx.cancel,
        )?;

        if let Some(prompt) = &probe.smoke_prompt {
            let timeout = std::time::Duration::from_secs(ctx.config.deploy.request_timeout_secs);
            let response = health
                .generate(&base_url, prompt, timeout)
                .map_err(|err| StageError::HealthCheck(StageError::chain(&err)))?;
            info!(chars = response.len(), "Generation endpoint answered");
            report.smoke_response = Some(response);
        }

        ctx.health_confirmed = true;
        let artifact = ctx.artifacts.put_json(PROBE_REPORT, &report).map_err(artifact_error)?;
        Ok(vec![artifact])
    }
}

struct WaitStage;

impl Stage for WaitStage {
    fn kind(&self) -> StageKind {
        StageKind::Wait
    }

    fn run(&self, ctx: &mut RunContext) -> StageResult<Vec<ArtifactRef>> {
        let timer = LifecycleTimer::from_settings(&ctx.config.lifecycle);
        let outcome = timer.hold(
            ctx.health_confirmed,
            ctx.toolchain.sleeper.as_ref(),
            &ctx.cancel,
        );
        match outcome.wake {
            Wake::Elapsed => Ok(Vec::new()),
            Wake::Cancelled => Err(StageError::Cancelled),
        }
    }
}

struct DestroyStage;

impl Stage for DestroyStage {
    fn kind(&self) -> StageKind {
        StageKind::Destroy
    }

    fn run(&self, ctx: &mut RunContext) -> StageResult<Vec<ArtifactRef>> {
        let lease = ctx
            .lease
            .take()
            .ok_or_else(|| StageError::Destroy("no environment lease held".to_string()))?;
        let report = lease.release()?;
        ctx.teardown = Some(report.clone());
        let artifact = ctx
            .artifacts
            .put_json(TEARDOWN_REPORT, &report)
            .map_err(artifact_error)?;
        Ok(vec![artifact])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cached_archive_replaces_a_truncated_one() {
        let dir = tempfile::tempdir().unwrap();
        let path = TrainStage::cached_archive(&dir.path().join("cache"), "abc123");
        TrainStage::store_cached(&path, b"trunc", "run-1").unwrap();
        TrainStage::store_cached(&path, b"complete archive", "run-2").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"complete archive");
        let names: Vec<String> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["abc123.tar.gz"]);
    }
}
