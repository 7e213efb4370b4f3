use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::process::ToolCommand;
use crate::security::{Severity, sha256_bytes};

/// Immutable per-run configuration, loaded once and shared by every stage.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    pub version: u32,
    #[serde(default)]
    pub run: RunSettings,
    #[serde(default)]
    pub lint: LintSettings,
    pub train: TrainSettings,
    pub evaluate: EvaluateSettings,
    pub build: BuildSettings,
    #[serde(default)]
    pub scan: ScanSettings,
    #[serde(default)]
    pub push: PushSettings,
    pub deploy: DeploySettings,
    #[serde(default)]
    pub probe: ProbeSettings,
    #[serde(default)]
    pub lifecycle: LifecycleSettings,
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline config: {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse pipeline config: {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunSettings {
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
        }
    }
}

impl RunSettings {
    pub fn artifact_root(&self) -> PathBuf {
        self.state_dir.join("artifacts")
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.state_dir.join("locks")
    }

    pub fn environment_dir(&self) -> PathBuf {
        self.state_dir.join("environments")
    }

    pub fn run_dir(&self) -> PathBuf {
        self.state_dir.join("runs")
    }

    pub fn work_dir(&self, run_id: &str) -> PathBuf {
        self.state_dir.join("work").join(run_id)
    }
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".ttl-deploy")
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LintSettings {
    #[serde(default)]
    pub commands: Vec<ToolCommand>,
}

/// Placeholders: `{model_dir}`, `{data_file}`, `{cache}`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrainSettings {
    pub command: ToolCommand,
    pub data_file: PathBuf,
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default)]
    pub force: bool,
}

/// Placeholders: `{model_dir}`, `{validation_file}`, `{prompts_file}`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EvaluateSettings {
    pub command: ToolCommand,
    pub validation_file: PathBuf,
    #[serde(default = "default_threshold")]
    pub perplexity_threshold: f64,
    #[serde(default = "default_prompts")]
    pub sample_prompts: Vec<String>,
}

fn default_threshold() -> f64 {
    1000.0
}

fn default_prompts() -> Vec<String> {
    vec![
        "The future of renewable energy is".to_string(),
        "Climate change mitigation requires".to_string(),
        "The most efficient way to reduce carbon emissions is".to_string(),
    ]
}

/// Placeholders: `{context}`, `{dockerfile}`, `{image}`, `{latest}`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BuildSettings {
    pub context: PathBuf,
    #[serde(default = "default_dockerfile")]
    pub dockerfile: PathBuf,
    /// Fully-qualified repository without tag, e.g. `us-docker.pkg.dev/proj/repo/chat`.
    pub repository: String,
    #[serde(default = "default_model_subdir")]
    pub model_subdir: PathBuf,
    #[serde(default = "default_build_command")]
    pub command: ToolCommand,
}

fn default_dockerfile() -> PathBuf {
    PathBuf::from("Dockerfile")
}

fn default_model_subdir() -> PathBuf {
    PathBuf::from("model")
}

fn default_build_command() -> ToolCommand {
    ToolCommand::new(
        "docker",
        &[
            "build",
            "-f",
            "{dockerfile}",
            "-t",
            "{image}",
            "-t",
            "{latest}",
            "{context}",
        ],
    )
}

/// Placeholder: `{image}`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScanSettings {
    #[serde(default = "default_scan_command")]
    pub command: ToolCommand,
    #[serde(default = "default_severities")]
    pub severities: Vec<Severity>,
    #[serde(default)]
    pub ignore: Vec<String>,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            command: default_scan_command(),
            severities: default_severities(),
            ignore: Vec::new(),
        }
    }
}

fn default_scan_command() -> ToolCommand {
    ToolCommand::new(
        "trivy",
        &["image", "--format", "json", "--quiet", "{image}"],
    )
}

fn default_severities() -> Vec<Severity> {
    vec![Severity::High, Severity::Critical]
}

/// Placeholder: `{image}`. Invoked once per tag.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PushSettings {
    #[serde(default = "default_push_command")]
    pub command: ToolCommand,
}

impl Default for PushSettings {
    fn default() -> Self {
        Self {
            command: default_push_command(),
        }
    }
}

fn default_push_command() -> ToolCommand {
    ToolCommand::new("docker", &["push", "{image}"])
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    #[default]
    Gcloud,
    Simulated,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeploySettings {
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default = "default_gcloud_bin")]
    pub gcloud_bin: String,
    pub project: String,
    pub region: String,
    pub service: String,
    pub identity: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_cpu")]
    pub cpu: String,
    #[serde(default = "default_memory")]
    pub memory: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub min_instances: u32,
    #[serde(default = "default_max_instances")]
    pub max_instances: u32,
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
    #[serde(default)]
    pub allow_unauthenticated: bool,
    #[serde(default)]
    pub unique_suffix: bool,
}

impl DeploySettings {
    /// Service name for a run; suffixed with the short run id when slots must not collide.
    pub fn service_name(&self, run_id: &str) -> String {
        self.suffixed(&self.service, run_id)
    }

    /// Service account id for a run. Suffixed like the service so one run's teardown
    /// never removes the identity another run's service executes as.
    pub fn identity_name(&self, run_id: &str) -> String {
        self.suffixed(&self.identity, run_id)
    }

    fn suffixed(&self, base: &str, run_id: &str) -> String {
        if self.unique_suffix {
            format!("{base}-{}", run_suffix(run_id))
        } else {
            base.to_string()
        }
    }
}

/// Eight lowercase alphanumerics taken from the run id, or from its digest when the id has none.
pub fn run_suffix(run_id: &str) -> String {
    let short: String = run_id
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .take(8)
        .collect();
    if short.is_empty() {
        sha256_bytes(run_id.as_bytes())[..8].to_string()
    } else {
        short
    }
}

fn default_gcloud_bin() -> String {
    "gcloud".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_cpu() -> String {
    "1".to_string()
}

fn default_memory() -> String {
    "2Gi".to_string()
}

fn default_request_timeout() -> u64 {
    300
}

fn default_max_instances() -> u32 {
    1
}

fn default_concurrency() -> u32 {
    80
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProbeTiming {
    pub initial_delay_secs: u64,
    pub period_secs: u64,
    pub failure_threshold: u32,
    pub timeout_secs: u64,
}

impl ProbeTiming {
    pub fn startup() -> Self {
        Self {
            initial_delay_secs: 0,
            period_secs: 5,
            failure_threshold: 12,
            timeout_secs: 3,
        }
    }

    pub fn liveness() -> Self {
        Self {
            initial_delay_secs: 10,
            period_secs: 15,
            failure_threshold: 3,
            timeout_secs: 5,
        }
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }

    /// Total time a unit is given before it is declared unhealthy.
    pub fn budget(&self) -> Duration {
        self.initial_delay() + self.period() * self.failure_threshold
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProbeSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    #[serde(default = "ProbeTiming::startup")]
    pub startup: ProbeTiming,
    #[serde(default = "ProbeTiming::liveness")]
    pub liveness: ProbeTiming,
    #[serde(default)]
    pub smoke_prompt: Option<String>,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            health_path: default_health_path(),
            startup: ProbeTiming::startup(),
            liveness: ProbeTiming::liveness(),
            smoke_prompt: None,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_health_path() -> String {
    "/health".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LifecycleSettings {
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_grace")]
    pub unconfirmed_grace_secs: u64,
    #[serde(default = "default_destroy_attempts")]
    pub destroy_attempts: u32,
    #[serde(default = "default_destroy_backoff")]
    pub destroy_backoff_secs: u64,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl(),
            unconfirmed_grace_secs: default_grace(),
            destroy_attempts: default_destroy_attempts(),
            destroy_backoff_secs: default_destroy_backoff(),
        }
    }
}

impl LifecycleSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn unconfirmed_grace(&self) -> Duration {
        Duration::from_secs(self.unconfirmed_grace_secs)
    }

    pub fn destroy_backoff(&self) -> Duration {
        Duration::from_secs(self.destroy_backoff_secs)
    }
}

fn default_ttl() -> u64 {
    3600
}

fn default_grace() -> u64 {
    60
}

fn default_destroy_attempts() -> u32 {
    3
}

fn default_destroy_backoff() -> u64 {
    5
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
version: 1
train:
  command: { program: python, args: [train.py, --model-dir, "{model_dir}"] }
  data_file: data/train.txt
evaluate:
  command: { program: python, args: [score.py] }
  validation_file: data/validation.txt
build:
  context: .
  repository: us-docker.pkg.dev/demo/apps/chat
deploy:
  project: demo
  region: us-central1
  service: chat
  identity: chat-runner
"#;

    #[test]
    fn defaults_fill_every_optional_knob() {
        let config = PipelineConfig::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.deploy.port, 8000);
        assert_eq!(config.deploy.backend, BackendKind::Gcloud);
        assert_eq!(config.evaluate.perplexity_threshold, 1000.0);
        assert_eq!(config.evaluate.sample_prompts.len(), 3);
        assert_eq!(config.probe.startup, ProbeTiming::startup());
        assert_eq!(config.probe.startup.budget(), Duration::from_secs(60));
        assert_eq!(config.probe.liveness.initial_delay_secs, 10);
        assert_eq!(config.probe.liveness.period_secs, 15);
        assert_eq!(config.probe.liveness.failure_threshold, 3);
        assert_eq!(config.scan.severities, vec![Severity::High, Severity::Critical]);
        assert_eq!(config.build.command.program, "docker");
        assert_eq!(config.lifecycle.ttl(), Duration::from_secs(3600));
    }

    #[test]
    fn unique_suffix_derives_disjoint_service_names() {
        let mut config = PipelineConfig::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.deploy.service_name("1234abcd-ffff"), "chat");
        config.deploy.unique_suffix = true;
        assert_eq!(config.deploy.service_name("1234abcd-ffff"), "chat-1234abcd");
        assert_ne!(
            config.deploy.service_name("1234abcd-ffff"),
            config.deploy.service_name("99999999-ffff")
        );
    }

    #[test]
    fn unique_suffix_also_applies_to_the_identity() {
        let mut config = PipelineConfig::from_yaml(MINIMAL).unwrap();
        let fixed = config.deploy.identity_name("1234abcd-ffff");
        assert_eq!(fixed, config.deploy.identity);
        config.deploy.unique_suffix = true;
        assert_eq!(
            config.deploy.identity_name("1234abcd-ffff"),
            format!("{}-1234abcd", config.deploy.identity)
        );
    }

    #[test]
    fn run_suffix_is_a_valid_name_fragment() {
        assert_eq!(run_suffix("ABC_def-12345"), "abcdef12");
        assert_eq!(run_suffix("nightly.7"), "nightly7");
        let fallback = run_suffix("__--__");
        assert_eq!(fallback.len(), 8);
        assert!(fallback.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
