use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use crate::artifact::{ArtifactRef, ArtifactStore};
use crate::config::PipelineConfig;
use crate::error::StageResult;
use crate::image::ImageReference;
use crate::lifecycle::{CancelToken, EnvironmentLease, TeardownReport};
use crate::observability::MetricsCollector;
use crate::quality::QualityGateResult;
use crate::toolchain::Toolchain;

/// The fixed stage topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageKind {
    Lint,
    Train,
    Evaluate,
    Gate,
    Build,
    Scan,
    Push,
    Provision,
    Probe,
    Wait,
    Destroy,
}

impl StageKind {
    pub const ORDER: [StageKind; 11] = [
        StageKind::Lint,
        StageKind::Train,
        StageKind::Evaluate,
        StageKind::Gate,
        StageKind::Build,
        StageKind::Scan,
        StageKind::Push,
        StageKind::Provision,
        StageKind::Probe,
        StageKind::Wait,
        StageKind::Destroy,
    ];

    pub fn name(self) -> &'static str {
        match self {
            StageKind::Lint => "lint",
            StageKind::Train => "train",
            StageKind::Evaluate => "evaluate",
            StageKind::Gate => "gate",
            StageKind::Build => "build",
            StageKind::Scan => "scan",
            StageKind::Push => "push",
            StageKind::Provision => "provision",
            StageKind::Probe => "probe",
            StageKind::Wait => "wait",
            StageKind::Destroy => "destroy",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ORDER.into_iter().find(|kind| kind.name() == name)
    }

    /// Each stage depends on the one before it.
    pub fn prerequisites(self) -> &'static [StageKind] {
        static CHAIN: [StageKind; 11] = StageKind::ORDER;
        let idx = self as usize;
        if idx == 0 { &[] } else { &CHAIN[idx - 1..idx] }
    }

    /// Cleanup stages run whenever an environment exists, whatever failed before them.
    pub fn is_cleanup(self) -> bool {
        matches!(self, StageKind::Destroy)
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Aborted,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StageRecord {
    pub stage: StageKind,
    pub prerequisites: Vec<StageKind>,
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactRef>,
}

impl StageRecord {
    fn pending(stage: StageKind) -> Self {
        Self {
            stage,
            prerequisites: stage.prerequisites().to_vec(),
            status: StageStatus::Pending,
            error_code: None,
            error: None,
            skip_reason: None,
            started_at: None,
            duration_ms: None,
            artifacts: Vec::new(),
        }
    }
}

/// One end-to-end execution, mutated only by the executor.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineRun {
    pub run_id: String,
    pub commit: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub stages: Vec<StageRecord>,
}

impl PipelineRun {
    pub fn new(run_id: &str, commit: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            commit: commit.to_string(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            stages: StageKind::ORDER.into_iter().map(StageRecord::pending).collect(),
        }
    }

    pub fn record(&self, kind: StageKind) -> Option<&StageRecord> {
        self.stages.iter().find(|r| r.stage == kind)
    }

    fn record_mut(&mut self, kind: StageKind) -> &mut StageRecord {
        let idx = self
            .stages
            .iter()
            .position(|r| r.stage == kind)
            .unwrap_or(kind as usize);
        &mut self.stages[idx]
    }

    pub fn status_of(&self, kind: StageKind) -> StageStatus {
        self.record(kind)
            .map(|r| r.status)
            .unwrap_or(StageStatus::Pending)
    }

    /// First stage that failed, if any.
    pub fn failure(&self) -> Option<&StageRecord> {
        self.stages.iter().find(|r| r.status == StageStatus::Failed)
    }

    fn finish(&mut self, cancelled: bool) {
        let status = if self.status_of(StageKind::Destroy) == StageStatus::Failed {
            RunStatus::Failed
        } else if cancelled {
            RunStatus::Aborted
        } else if self.stages.iter().any(|r| r.status == StageStatus::Failed) {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    /// Persist as `<dir>/<run_id>.json`.
    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create run directory: {}", dir.display()))?;
        let path = dir.join(format!("{}.json", self.run_id));
        let body = serde_json::to_vec_pretty(self)?;
        fs::write(&path, body)
            .with_context(|| format!("Failed to write run record: {}", path.display()))?;
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read(path)
            .with_context(|| format!("Failed to read run record: {}", path.display()))?;
        Ok(serde_json::from_slice(&content)?)
    }
}

/// Mutable state threaded through the stages of one run.
pub struct RunContext {
    pub run_id: String,
    pub commit: String,
    pub config: Arc<PipelineConfig>,
    pub artifacts: ArtifactStore,
    pub toolchain: Toolchain,
    pub cancel: CancelToken,
    pub work_dir: PathBuf,
    pub gate: Option<QualityGateResult>,
    pub image: Option<ImageReference>,
    pub lease: Option<EnvironmentLease>,
    pub health_confirmed: bool,
    pub teardown: Option<TeardownReport>,
}

impl RunContext {
    pub fn new(
        run_id: &str,
        commit: &str,
        config: Arc<PipelineConfig>,
        toolchain: Toolchain,
        cancel: CancelToken,
    ) -> Result<Self> {
        let artifacts = ArtifactStore::open(&config.run.artifact_root(), run_id)?;
        let work_dir = config.run.work_dir(run_id);
        fs::create_dir_all(&work_dir)
            .with_context(|| format!("Failed to create work directory: {}", work_dir.display()))?;
        Ok(Self {
            run_id: run_id.to_string(),
            commit: commit.to_string(),
            config,
            artifacts,
            toolchain,
            cancel,
            work_dir,
            gate: None,
            image: None,
            lease: None,
            health_confirmed: false,
            teardown: None,
        })
    }
}

pub trait Stage: Send + Sync {
    fn kind(&self) -> StageKind;
    fn run(&self, ctx: &mut RunContext) -> StageResult<Vec<ArtifactRef>>;
}

type StageConstructor = Arc<dyn Fn(&PipelineConfig) -> Result<Box<dyn Stage>> + Send + Sync>;

pub struct StageRegistry {
    factories: HashMap<StageKind, StageConstructor>,
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StageRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register (or replace) the action behind `kind`.
    pub fn register<F>(&mut self, kind: StageKind, constructor: F)
    where
        F: Fn(&PipelineConfig) -> Result<Box<dyn Stage>> + Send + Sync + 'static,
    {
        self.factories.insert(kind, Arc::new(constructor));
    }

    pub fn create(&self, kind: StageKind, config: &PipelineConfig) -> Result<Box<dyn Stage>> {
        let factory = self.factories.get(&kind).ok_or_else(|| {
            anyhow!(
                "No action registered for stage '{}'. Registered: {}",
                kind,
                self.known_stages().join(", ")
            )
        })?;
        let stage = factory(config)?;
        if stage.kind() != kind {
            bail!("Stage registered as '{}' reports itself as '{}'", kind, stage.kind());
        }
        Ok(stage)
    }

    pub fn known_stages(&self) -> Vec<String> {
        let mut kinds: Vec<_> = self.factories.keys().copied().collect();
        kinds.sort();
        kinds.into_iter().map(|k| k.name().to_string()).collect()
    }
}

pub struct PipelineExecutor {
    stages: Vec<Box<dyn Stage>>,
    metrics: MetricsCollector,
}

impl PipelineExecutor {
    pub fn new(stages: Vec<Box<dyn Stage>>) -> Result<Self> {
        let kinds: Vec<StageKind> = stages.iter().map(|s| s.kind()).collect();
        if kinds != StageKind::ORDER {
            bail!(
                "Stages must follow the fixed topology {:?}, got {:?}",
                StageKind::ORDER,
                kinds
            );
        }
        Ok(Self {
            stages,
            metrics: MetricsCollector::new(),
        })
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.metrics.clone()
    }

    fn admission(&self, kind: StageKind, run: &PipelineRun, ctx: &RunContext) -> Option<String> {
        if kind.is_cleanup() {
            return ctx
                .lease
                .is_none()
                .then(|| "no environment was provisioned".to_string());
        }
        if ctx.cancel.is_cancelled() {
            return Some("run cancelled by operator".to_string());
        }
        kind.prerequisites()
            .iter()
            .find(|p| run.status_of(**p) != StageStatus::Succeeded)
            .map(|p| format!("prerequisite '{}' is {:?}", p, run.status_of(*p)))
    }

    #[instrument(skip(self, ctx), fields(run_id = %ctx.run_id, commit = %ctx.commit))]
    pub fn execute(&self, ctx: &mut RunContext) -> PipelineRun {
        let mut run = PipelineRun::new(&ctx.run_id, &ctx.commit);
        let total_start = Instant::now();
        info!("Pipeline run started");

        for stage in &self.stages {
            let kind = stage.kind();
            if let Some(reason) = self.admission(kind, &run, ctx) {
                info!(stage = %kind, %reason, "Stage skipped");
                let record = run.record_mut(kind);
                record.status = StageStatus::Skipped;
                record.skip_reason = Some(reason);
                continue;
            }

            let span = tracing::span!(tracing::Level::INFO, "stage", stage = kind.name());
            let _span_guard = span.enter();
            let _timer = self.metrics.start_stage(kind.name());
            {
                let record = run.record_mut(kind);
                record.status = StageStatus::Running;
                record.started_at = Some(Utc::now());
            }
            let started = Instant::now();
            let outcome = stage.run(ctx);
            let record = run.record_mut(kind);
            record.duration_ms = Some(started.elapsed().as_millis() as u64);

            match outcome {
                Ok(artifacts) => {
                    info!(artifacts = artifacts.len(), "Stage succeeded");
                    record.status = StageStatus::Succeeded;
                    record.artifacts = artifacts;
                }
                Err(err) => {
                    error!(code = err.code(), error = %err, "Stage failed");
                    record.status = StageStatus::Failed;
                    record.error_code = Some(err.code().to_string());
                    record.error = Some(err.to_string());
                }
            }

            match kind {
                StageKind::Gate => match ctx.gate {
                    Some(result) if result.admit() => self.metrics.record_gate_admit(),
                    _ => self.metrics.record_gate_reject(),
                },
                StageKind::Destroy => {
                    if run.status_of(kind) == StageStatus::Succeeded {
                        self.metrics.record_teardown();
                    } else {
                        self.metrics.record_teardown_failure();
                    }
                }
                _ => {}
            }
        }

        if let Some(lease) = ctx.lease.take() {
            warn!("Environment still leased after the last stage; releasing");
            if lease.release().is_err() {
                self.metrics.record_teardown_failure();
            }
        }

        run.finish(ctx.cancel.is_cancelled());
        self.metrics.record_total_duration(total_start.elapsed());
        info!(status = ?run.status, "Pipeline run finished");
        run
    }
}

pub fn build_pipeline(registry: &StageRegistry, config: &PipelineConfig) -> Result<PipelineExecutor> {
    let mut stages = Vec::with_capacity(StageKind::ORDER.len());
    for kind in StageKind::ORDER {
        stages.push(registry.create(kind, config)?);
    }
    PipelineExecutor::new(stages)
}
