use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::PipelineConfig;
use crate::pipeline::StageKind;

/// Reviewable snapshot of what a run with this configuration will do.
#[derive(Debug, Serialize)]
pub struct PipelinePlan {
    pub config_version: u32,
    pub generated_at: DateTime<Utc>,
    pub repository: String,
    pub slot: String,
    pub stages: Vec<StagePlan>,
}

#[derive(Debug, Serialize)]
pub struct StagePlan {
    pub name: String,
    pub prerequisites: Vec<String>,
    pub cleanup: bool,
    pub config_hash: String,
}

pub fn generate_plan(config: &PipelineConfig) -> Result<PipelinePlan> {
    let mut stages = Vec::with_capacity(StageKind::ORDER.len());
    for kind in StageKind::ORDER {
        stages.push(StagePlan {
            name: kind.name().to_string(),
            prerequisites: kind
                .prerequisites()
                .iter()
                .map(|p| p.name().to_string())
                .collect(),
            cleanup: kind.is_cleanup(),
            config_hash: hash_section(kind, &section_for(config, kind)?),
        });
    }

    let deploy = &config.deploy;
    Ok(PipelinePlan {
        config_version: config.version,
        generated_at: Utc::now(),
        repository: config.build.repository.clone(),
        slot: format!("{}/{}/{}", deploy.project, deploy.region, deploy.service),
        stages,
    })
}

pub fn write_plan(plan: &PipelinePlan, path: &Path) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create plan file: {}", path.display()))?;
    serde_yaml::to_writer(file, plan)
        .with_context(|| format!("Failed to write plan file: {}", path.display()))
}

/// The configuration section a stage consumes.
fn section_for(config: &PipelineConfig, kind: StageKind) -> Result<Value> {
    let value = match kind {
        StageKind::Lint => serde_json::to_value(&config.lint)?,
        StageKind::Train => serde_json::to_value(&config.train)?,
        StageKind::Evaluate | StageKind::Gate => serde_json::to_value(&config.evaluate)?,
        StageKind::Build => serde_json::to_value(&config.build)?,
        StageKind::Scan => serde_json::to_value(&config.scan)?,
        StageKind::Push => serde_json::to_value(&config.push)?,
        StageKind::Provision => serde_json::to_value(&config.deploy)?,
        StageKind::Probe => serde_json::to_value(&config.probe)?,
        StageKind::Wait | StageKind::Destroy => serde_json::to_value(&config.lifecycle)?,
    };
    Ok(value)
}

fn hash_section(kind: StageKind, section: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.name().as_bytes());
    hasher.update(section.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
version: 1
train:
  command: { program: python, args: [train.py] }
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
    fn hash_changes_only_for_the_touched_section() {
        let base = PipelineConfig::from_yaml(CONFIG).unwrap();
        let mut changed = base.clone();
        changed.deploy.max_instances = 4;

        let a = generate_plan(&base).unwrap();
        let b = generate_plan(&changed).unwrap();
        for (left, right) in a.stages.iter().zip(&b.stages) {
            if left.name == "provision" {
                assert_ne!(left.config_hash, right.config_hash);
            } else {
                assert_eq!(left.config_hash, right.config_hash, "{}", left.name);
            }
        }
        assert_eq!(a.stages.len(), 11);
        assert!(a.stages.last().unwrap().cleanup);
    }
}
