#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};
use tempfile::{TempDir, tempdir};
use ttl_deploy::config::PipelineConfig;
use ttl_deploy::image::ImageReference;
use ttl_deploy::lifecycle::{CancelToken, Sleeper, Wake};
use ttl_deploy::observability::MetricsSnapshot;
use ttl_deploy::pipeline::{PipelineRun, RunContext, build_pipeline};
use ttl_deploy::probe::HealthProbe;
use ttl_deploy::provision::Slot;
use ttl_deploy::provision::memory::InMemoryCloud;
use ttl_deploy::quality::{SampleGeneration, ScorerReport, SequenceLoss};
use ttl_deploy::security::{ScanReport, ScanTarget, Vulnerability};
use ttl_deploy::stages::default_registry;
use ttl_deploy::toolchain::{
    ImageBuilder, ImagePusher, Linter, ModelScorer, Scanner, Toolchain, Trainer,
};

pub const COMMIT: &str = "0123456789ABCDEF0123";

pub struct OkLinter;

impl Linter for OkLinter {
    fn lint(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct CountingTrainer {
    pub calls: AtomicU32,
}

impl Trainer for CountingTrainer {
    fn train(&self, model_dir: &Path, _data_file: &Path, _cache: Option<&Path>) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        fs::create_dir_all(model_dir.join("tokenizer"))?;
        fs::write(model_dir.join("weights.bin"), [0u8, 1, 2, 3, 255])?;
        fs::write(model_dir.join("tokenizer/vocab.json"), r#"{"a":0}"#)?;
        Ok(())
    }
}

/// Reports one sequence whose mean loss yields `perplexity`.
pub struct FixedScorer {
    pub perplexity: f64,
}

impl ModelScorer for FixedScorer {
    fn score(&self, model_dir: &Path, _validation_file: &Path, prompts: &[String]) -> Result<ScorerReport> {
        if !model_dir.join("weights.bin").is_file() {
            bail!("model was not extracted");
        }
        Ok(ScorerReport {
            sequences: vec![SequenceLoss {
                loss: self.perplexity.ln(),
                tokens: 128,
            }],
            samples: prompts
                .iter()
                .map(|p| SampleGeneration {
                    prompt: p.clone(),
                    response: "carbon capture".into(),
                })
                .collect(),
        })
    }
}

#[derive(Default)]
pub struct RecordingBuilder {
    pub images: Mutex<Vec<String>>,
}

impl ImageBuilder for RecordingBuilder {
    fn build(&self, context: &Path, _dockerfile: &Path, image: &ImageReference) -> Result<()> {
        if !context.join("model/weights.bin").is_file() {
            bail!("model missing from build context");
        }
        self.images.lock().unwrap().push(image.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct FixedScanner {
    pub findings: Mutex<Vec<(String, String)>>,
}

impl FixedScanner {
    pub fn add(&self, id: &str, severity: &str) {
        self.findings
            .lock()
            .unwrap()
            .push((id.to_string(), severity.to_string()));
    }
}

impl Scanner for FixedScanner {
    fn scan(&self, image: &ImageReference) -> Result<ScanReport> {
        let vulnerabilities = self
            .findings
            .lock()
            .unwrap()
            .iter()
            .map(|(id, severity)| Vulnerability {
                id: id.clone(),
                package: "openssl".into(),
                severity: severity.clone(),
            })
            .collect();
        Ok(ScanReport {
            results: vec![ScanTarget {
                target: image.to_string(),
                vulnerabilities: Some(vulnerabilities),
            }],
        })
    }
}

#[derive(Default)]
pub struct RecordingPusher {
    pub pushed: Mutex<Vec<String>>,
}

impl ImagePusher for RecordingPusher {
    fn push(&self, image: &ImageReference) -> Result<Option<String>> {
        self.pushed.lock().unwrap().push(image.to_string());
        Ok(Some(format!("{}@sha256:{}", image.repository, "0".repeat(64))))
    }
}

pub struct FakeHealth {
    pub healthy: AtomicBool,
    pub checks: AtomicU32,
}

impl Default for FakeHealth {
    fn default() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            checks: AtomicU32::new(0),
        }
    }
}

impl HealthProbe for FakeHealth {
    fn check(&self, _url: &str, _timeout: Duration) -> Result<bool> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        Ok(self.healthy.load(Ordering::SeqCst))
    }

    fn generate(&self, _base_url: &str, prompt: &str, _timeout: Duration) -> Result<String> {
        Ok(format!("{prompt} solar"))
    }
}

/// Never blocks; records every requested wait. Cancels the run on a wait of `cancel_on`.
#[derive(Default)]
pub struct RecordingSleeper {
    pub sleeps: Mutex<Vec<Duration>>,
    pub cancel_on: Mutex<Option<Duration>>,
}

impl RecordingSleeper {
    pub fn recorded(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> Wake {
        self.sleeps.lock().unwrap().push(duration);
        if *self.cancel_on.lock().unwrap() == Some(duration) {
            cancel.cancel();
        }
        if cancel.is_cancelled() {
            Wake::Cancelled
        } else {
            Wake::Elapsed
        }
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub config: PipelineConfig,
    pub cloud: Arc<InMemoryCloud>,
    pub trainer: Arc<CountingTrainer>,
    pub builder: Arc<RecordingBuilder>,
    pub scanner: Arc<FixedScanner>,
    pub pusher: Arc<RecordingPusher>,
    pub health: Arc<FakeHealth>,
    pub sleeper: Arc<RecordingSleeper>,
    pub perplexity: f64,
    pub cancel: CancelToken,
}

pub fn config_yaml(root: &Path) -> String {
    format!(
        r#"
version: 1
run:
  state_dir: {root}/state
train:
  command: {{ program: "true" }}
  data_file: {root}/train.txt
evaluate:
  command: {{ program: "true" }}
  validation_file: {root}/validation.txt
  perplexity_threshold: 20
build:
  context: {root}/context
  repository: us-docker.pkg.dev/demo/apps/chat
deploy:
  backend: simulated
  project: demo
  region: us-central1
  service: chat
  identity: chat-runner
  allow_unauthenticated: true
"#,
        root = root.display()
    )
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::write(root.join("train.txt"), "the sun\nthe wind\n").unwrap();
        fs::write(root.join("validation.txt"), "solar panels\n\nwind farms\n").unwrap();
        fs::create_dir_all(root.join("context")).unwrap();
        fs::write(root.join("context/Dockerfile"), "FROM scratch\n").unwrap();
        let config = PipelineConfig::from_yaml(&config_yaml(root)).unwrap();

        Self {
            dir,
            config,
            cloud: Arc::new(InMemoryCloud::new()),
            trainer: Arc::default(),
            builder: Arc::default(),
            scanner: Arc::default(),
            pusher: Arc::default(),
            health: Arc::default(),
            sleeper: Arc::default(),
            perplexity: 15.2,
            cancel: CancelToken::new(),
        }
    }

    pub fn root(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    pub fn slot(&self) -> Slot {
        Slot {
            project: "demo".into(),
            region: "us-central1".into(),
            service: "chat".into(),
        }
    }

    pub fn toolchain(&self) -> Toolchain {
        Toolchain {
            linter: Arc::new(OkLinter),
            trainer: self.trainer.clone(),
            scorer: Arc::new(FixedScorer {
                perplexity: self.perplexity,
            }),
            builder: self.builder.clone(),
            scanner: self.scanner.clone(),
            pusher: self.pusher.clone(),
            cloud: self.cloud.clone(),
            health: self.health.clone(),
            sleeper: self.sleeper.clone(),
        }
    }

    pub fn run(&self, run_id: &str) -> (PipelineRun, MetricsSnapshot) {
        let executor = build_pipeline(&default_registry(), &self.config).unwrap();
        let mut ctx = RunContext::new(
            run_id,
            COMMIT,
            Arc::new(self.config.clone()),
            self.toolchain(),
            self.cancel.clone(),
        )
        .unwrap();
        let run = executor.execute(&mut ctx);
        (run, executor.metrics().snapshot())
    }
}
