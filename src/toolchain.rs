//! External collaborators invoked by the stages.
//!
//! Each collaborator is a narrow trait so the executor can be driven by fakes;
//! the `Command*` implementations shell out through [`ToolCommand`].

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::{BackendKind, PipelineConfig};
use crate::image::ImageReference;
use crate::lifecycle::{Sleeper, ThreadSleeper};
use crate::probe::{AssumeHealthy, HealthProbe, HttpProbe};
use crate::process::{ToolCommand, Vars};
use crate::provision::CloudBackend;
use crate::provision::gcloud::GcloudBackend;
use crate::provision::memory::InMemoryCloud;
use crate::quality::ScorerReport;
use crate::security::ScanReport;

pub trait Linter: Send + Sync {
    fn lint(&self) -> Result<()>;
}

pub trait Trainer: Send + Sync {
    /// Populate `model_dir` with a trained model.
    fn train(&self, model_dir: &Path, data_file: &Path, cache: Option<&Path>) -> Result<()>;
}

pub trait ModelScorer: Send + Sync {
    /// Inference-only pass over the validation set plus sample generations.
    fn score(&self, model_dir: &Path, validation_file: &Path, prompts: &[String]) -> Result<ScorerReport>;
}

pub trait ImageBuilder: Send + Sync {
    fn build(&self, context: &Path, dockerfile: &Path, image: &ImageReference) -> Result<()>;
}

pub trait Scanner: Send + Sync {
    fn scan(&self, image: &ImageReference) -> Result<ScanReport>;
}

pub trait ImagePusher: Send + Sync {
    /// Push `image` and return the registry digest reference when the tool reports one.
    fn push(&self, image: &ImageReference) -> Result<Option<String>>;
}

pub struct CommandLinter {
    commands: Vec<ToolCommand>,
}

impl Linter for CommandLinter {
    fn lint(&self) -> Result<()> {
        for command in &self.commands {
            command.run(&Vars::new())?;
        }
        Ok(())
    }
}

pub struct CommandTrainer {
    command: ToolCommand,
}

impl Trainer for CommandTrainer {
    fn train(&self, model_dir: &Path, data_file: &Path, cache: Option<&Path>) -> Result<()> {
        let mut vars = Vars::new();
        vars.insert("model_dir", display(model_dir));
        vars.insert("data_file", display(data_file));
        vars.insert("cache", cache.map(display).unwrap_or_default());
        self.command.run(&vars)?;
        Ok(())
    }
}

pub struct CommandScorer {
    command: ToolCommand,
}

impl ModelScorer for CommandScorer {
    fn score(&self, model_dir: &Path, validation_file: &Path, prompts: &[String]) -> Result<ScorerReport> {
        let prompts_file = model_dir.with_file_name("prompts.json");
        fs::write(&prompts_file, serde_json::to_vec(prompts)?)
            .with_context(|| format!("Failed to write {}", prompts_file.display()))?;

        let mut vars = Vars::new();
        vars.insert("model_dir", display(model_dir));
        vars.insert("validation_file", display(validation_file));
        vars.insert("prompts_file", display(&prompts_file));
        let output = self.command.run(&vars)?;
        serde_json::from_str(output.stdout.trim()).with_context(|| {
            format!(
                "'{}' did not print a scorer report on stdout",
                self.command.program
            )
        })
    }
}

pub struct CommandBuilder {
    command: ToolCommand,
}

impl ImageBuilder for CommandBuilder {
    fn build(&self, context: &Path, dockerfile: &Path, image: &ImageReference) -> Result<()> {
        let mut vars = Vars::new();
        vars.insert("context", display(context));
        vars.insert("dockerfile", display(dockerfile));
        vars.insert("image", image.to_string());
        vars.insert("latest", image.latest().to_string());
        self.command.run(&vars)?;
        Ok(())
    }
}

pub struct CommandScanner {
    command: ToolCommand,
}

impl Scanner for CommandScanner {
    fn scan(&self, image: &ImageReference) -> Result<ScanReport> {
        let mut vars = Vars::new();
        vars.insert("image", image.to_string());
        let output = self.command.run(&vars)?;
        ScanReport::parse(&output.stdout)
    }
}

pub struct CommandPusher {
    command: ToolCommand,
}

impl ImagePusher for CommandPusher {
    fn push(&self, image: &ImageReference) -> Result<Option<String>> {
        let mut vars = Vars::new();
        vars.insert("image", image.to_string());
        let output = self.command.run(&vars)?;
        Ok(parse_push_digest(&output.stdout).map(|digest| format!("{}@{digest}", image.repository)))
    }
}

/// Extract `sha256:<hex>` from `docker push` output such as
/// `sha-abc: digest: sha256:9f.. size: 1573`.
pub fn parse_push_digest(output: &str) -> Option<String> {
    output.lines().rev().find_map(|line| {
        let rest = &line[line.find("digest: ")? + "digest: ".len()..];
        let token = rest.split_whitespace().next()?;
        let hex = token.strip_prefix("sha256:")?;
        (hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit())).then(|| token.to_string())
    })
}

fn display(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// Every collaborator a run needs, resolved once from configuration.
#[derive(Clone)]
pub struct Toolchain {
    pub linter: Arc<dyn Linter>,
    pub trainer: Arc<dyn Trainer>,
    pub scorer: Arc<dyn ModelScorer>,
    pub builder: Arc<dyn ImageBuilder>,
    pub scanner: Arc<dyn Scanner>,
    pub pusher: Arc<dyn ImagePusher>,
    pub cloud: Arc<dyn CloudBackend>,
    pub health: Arc<dyn HealthProbe>,
    pub sleeper: Arc<dyn Sleeper>,
}

impl Toolchain {
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let (cloud, health): (Arc<dyn CloudBackend>, Arc<dyn HealthProbe>) =
            match config.deploy.backend {
                BackendKind::Gcloud => (
                    Arc::new(GcloudBackend::new(
                        config.deploy.gcloud_bin.clone(),
                        manifest_dir(config),
                    )),
                    Arc::new(HttpProbe::new()?),
                ),
                BackendKind::Simulated => {
                    info!("Using the simulated cloud backend; nothing is deployed");
                    (Arc::new(InMemoryCloud::new()), Arc::new(AssumeHealthy))
                }
            };

        Ok(Self {
            linter: Arc::new(CommandLinter {
                commands: config.lint.commands.clone(),
            }),
            trainer: Arc::new(CommandTrainer {
                command: config.train.command.clone(),
            }),
            scorer: Arc::new(CommandScorer {
                command: config.evaluate.command.clone(),
            }),
            builder: Arc::new(CommandBuilder {
                command: config.build.command.clone(),
            }),
            scanner: Arc::new(CommandScanner {
                command: config.scan.command.clone(),
            }),
            pusher: Arc::new(CommandPusher {
                command: config.push.command.clone(),
            }),
            cloud,
            health,
            sleeper: Arc::new(ThreadSleeper),
        })
    }
}

fn manifest_dir(config: &PipelineConfig) -> PathBuf {
    config.run.state_dir.join("manifests")
}
