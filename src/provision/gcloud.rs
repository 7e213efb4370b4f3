//! `gcloud`-driven Cloud Run backend.
//!
//! Services are applied declaratively: the desired [`ServiceSpec`] is rendered as a
//! Knative `Service` manifest and handed to `gcloud run services replace`.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::backend::{CloudBackend, CreateOutcome};
use super::{ObservedService, ServiceSpec, Slot};
use crate::config::ProbeTiming;
use crate::process::{ToolCommand, ToolOutput, Vars, tail};

const MIN_SCALE: &str = "autoscaling.knative.dev/minScale";
const MAX_SCALE: &str = "autoscaling.knative.dev/maxScale";
const INVOKER_ROLE: &str = "roles/run.invoker";
const PUBLIC_MEMBER: &str = "allUsers";

pub struct GcloudBackend {
    bin: String,
    manifest_dir: PathBuf,
}

impl GcloudBackend {
    pub fn new(bin: impl Into<String>, manifest_dir: impl Into<PathBuf>) -> Self {
        Self {
            bin: bin.into(),
            manifest_dir: manifest_dir.into(),
        }
    }

    fn gcloud(&self, args: &[&str]) -> Result<ToolOutput> {
        ToolCommand::new(self.bin.clone(), args).execute(&Vars::new())
    }

    fn gcloud_ok(&self, args: &[&str]) -> Result<ToolOutput> {
        let out = self.gcloud(args)?;
        if !out.success {
            bail!("gcloud {} failed: {}", args.join(" "), tail(&out.stderr, 10));
        }
        Ok(out)
    }

    fn run_args<'a>(slot: &'a Slot, head: &[&'a str]) -> Vec<&'a str> {
        let mut args = head.to_vec();
        args.extend([
            "--project",
            slot.project.as_str(),
            "--region",
            slot.region.as_str(),
        ]);
        args
    }
}

fn is_not_found(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("not_found") || lower.contains("not found") || lower.contains("does not exist")
}

fn is_already_exists(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("already_exists") || lower.contains("already exists")
}

impl CloudBackend for GcloudBackend {
    fn identity_exists(&self, project: &str, email: &str) -> Result<bool> {
        let out = self.gcloud(&[
            "iam",
            "service-accounts",
            "describe",
            email,
            "--project",
            project,
            "--format=json",
        ])?;
        match (out.success, is_not_found(&out.stderr)) {
            (true, _) => Ok(true),
            (false, true) => Ok(false),
            (false, false) => bail!("Failed to describe {email}: {}", tail(&out.stderr, 10)),
        }
    }

    fn create_identity(&self, project: &str, account_id: &str) -> Result<CreateOutcome> {
        let out = self.gcloud(&[
            "iam",
            "service-accounts",
            "create",
            account_id,
            "--project",
            project,
            "--display-name",
            "ttl-deploy runtime identity",
        ])?;
        if out.success {
            Ok(CreateOutcome::Created)
        } else if is_already_exists(&out.stderr) {
            Ok(CreateOutcome::AlreadyExists)
        } else {
            bail!("Failed to create {account_id}: {}", tail(&out.stderr, 10))
        }
    }

    fn delete_identity(&self, project: &str, email: &str) -> Result<()> {
        let out = self.gcloud(&[
            "iam",
            "service-accounts",
            "delete",
            email,
            "--project",
            project,
            "--quiet",
        ])?;
        if out.success || is_not_found(&out.stderr) {
            Ok(())
        } else {
            bail!("Failed to delete {email}: {}", tail(&out.stderr, 10))
        }
    }

    fn describe_service(&self, slot: &Slot) -> Result<Option<ObservedService>> {
        let args = Self::run_args(slot, &["run", "services", "describe", &slot.service, "--format=json"]);
        let out = self.gcloud(&args)?;
        if !out.success {
            if is_not_found(&out.stderr) {
                return Ok(None);
            }
            bail!("Failed to describe service {slot}: {}", tail(&out.stderr, 10));
        }
        let manifest: ServiceManifest = serde_json::from_str(&out.stdout)
            .with_context(|| format!("Unexpected describe output for {slot}"))?;
        let url = manifest
            .status
            .as_ref()
            .and_then(|s| s.url.clone())
            .unwrap_or_default();
        Ok(Some(ObservedService {
            spec: manifest.to_spec()?,
            url,
        }))
    }

    fn apply_service(&self, slot: &Slot, spec: &ServiceSpec) -> Result<String> {
        fs::create_dir_all(&self.manifest_dir).with_context(|| {
            format!("Failed to create manifest directory: {}", self.manifest_dir.display())
        })?;
        let path = self.manifest_dir.join(format!("{}.yaml", slot.key()));
        let manifest = ServiceManifest::from_spec(&slot.service, spec);
        let yaml = serde_yaml::to_string(&manifest).context("Failed to render service manifest")?;
        fs::write(&path, yaml)
            .with_context(|| format!("Failed to write service manifest: {}", path.display()))?;
        debug!(manifest = %path.display(), "Service manifest rendered");

        let path_arg = path.to_string_lossy().to_string();
        let args = Self::run_args(slot, &["run", "services", "replace", &path_arg]);
        self.gcloud_ok(&args)?;

        self.describe_service(slot)?
            .map(|svc| svc.url)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| anyhow!("Service {slot} has no URL after apply"))
    }

    fn delete_service(&self, slot: &Slot) -> Result<()> {
        let args = Self::run_args(slot, &["run", "services", "delete", &slot.service, "--quiet"]);
        let out = self.gcloud(&args)?;
        if out.success || is_not_found(&out.stderr) {
            Ok(())
        } else {
            bail!("Failed to delete service {slot}: {}", tail(&out.stderr, 10))
        }
    }

    fn public_access(&self, slot: &Slot) -> Result<bool> {
        let args = Self::run_args(
            slot,
            &["run", "services", "get-iam-policy", &slot.service, "--format=json"],
        );
        let out = self.gcloud_ok(&args)?;
        parse_public_access(&out.stdout)
            .with_context(|| format!("Failed to read IAM policy of {slot}"))
    }

    fn set_public_access(&self, slot: &Slot, allowed: bool) -> Result<()> {
        let verb = if allowed {
            "add-iam-policy-binding"
        } else {
            "remove-iam-policy-binding"
        };
        let member = format!("--member={PUBLIC_MEMBER}");
        let role = format!("--role={INVOKER_ROLE}");
        let args = Self::run_args(slot, &["run", "services", verb, &slot.service, &member, &role]);
        let out = self.gcloud(&args)?;
        if out.success || (!allowed && is_not_found(&out.stderr)) {
            Ok(())
        } else {
            bail!("Failed to {verb} on {slot}: {}", tail(&out.stderr, 10))
        }
    }
}

fn parse_public_access(raw: &str) -> Result<bool> {
    let policy: Value = serde_json::from_str(raw.trim()).context("IAM policy is not valid JSON")?;
    Ok(policy_grants_public(&policy))
}

fn policy_grants_public(policy: &Value) -> bool {
    policy
        .get("bindings")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter(|binding| binding.get("role").and_then(Value::as_str) == Some(INVOKER_ROLE))
        .filter_map(|binding| binding.get("members").and_then(Value::as_array))
        .flatten()
        .any(|member| member.as_str() == Some(PUBLIC_MEMBER))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceManifest {
    api_version: String,
    kind: String,
    metadata: Metadata,
    spec: ServiceBody,
    #[serde(default, skip_serializing)]
    status: Option<ServiceStatus>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Metadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    annotations: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ServiceBody {
    template: RevisionTemplate,
}

#[derive(Debug, Serialize, Deserialize)]
struct RevisionTemplate {
    #[serde(default)]
    metadata: Metadata,
    spec: RevisionSpec,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RevisionSpec {
    #[serde(default)]
    container_concurrency: u32,
    #[serde(default)]
    timeout_seconds: u64,
    #[serde(default)]
    service_account_name: String,
    containers: Vec<Container>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Container {
    image: String,
    #[serde(default)]
    ports: Vec<ContainerPort>,
    #[serde(default)]
    resources: Resources,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    startup_probe: Option<Probe>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    liveness_probe: Option<Probe>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContainerPort {
    container_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Resources {
    #[serde(default)]
    limits: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Probe {
    http_get: HttpGet,
    #[serde(default)]
    initial_delay_seconds: u64,
    #[serde(default)]
    period_seconds: u64,
    #[serde(default)]
    failure_threshold: u32,
    #[serde(default)]
    timeout_seconds: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct HttpGet {
    path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    port: Option<u16>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ServiceStatus {
    #[serde(default)]
    url: Option<String>,
}

impl Probe {
    fn new(path: &str, port: u16, timing: &ProbeTiming) -> Self {
        Self {
            http_get: HttpGet {
                path: path.to_string(),
                port: Some(port),
            },
            initial_delay_seconds: timing.initial_delay_secs,
            period_seconds: timing.period_secs,
            failure_threshold: timing.failure_threshold,
            timeout_seconds: timing.timeout_secs,
        }
    }

    fn timing(&self) -> ProbeTiming {
        ProbeTiming {
            initial_delay_secs: self.initial_delay_seconds,
            period_secs: self.period_seconds,
            failure_threshold: self.failure_threshold,
            timeout_secs: self.timeout_seconds,
        }
    }
}

impl ServiceManifest {
    fn from_spec(name: &str, spec: &ServiceSpec) -> Self {
        let mut template_annotations = BTreeMap::new();
        template_annotations.insert(MIN_SCALE.to_string(), spec.min_instances.to_string());
        template_annotations.insert(MAX_SCALE.to_string(), spec.max_instances.to_string());

        let mut labels = BTreeMap::new();
        labels.insert("managed-by".to_string(), "ttl-deploy".to_string());

        let mut limits = BTreeMap::new();
        limits.insert("cpu".to_string(), spec.cpu.clone());
        limits.insert("memory".to_string(), spec.memory.clone());

        Self {
            api_version: "serving.knative.dev/v1".to_string(),
            kind: "Service".to_string(),
            metadata: Metadata {
                name: Some(name.to_string()),
                labels,
                annotations: BTreeMap::new(),
            },
            spec: ServiceBody {
                template: RevisionTemplate {
                    metadata: Metadata {
                        name: None,
                        labels: BTreeMap::new(),
                        annotations: template_annotations,
                    },
                    spec: RevisionSpec {
                        container_concurrency: spec.concurrency,
                        timeout_seconds: spec.request_timeout_secs,
                        service_account_name: spec.service_account.clone(),
                        containers: vec![Container {
                            image: spec.image.clone(),
                            ports: vec![ContainerPort {
                                container_port: spec.port,
                                name: Some("http1".to_string()),
                            }],
                            resources: Resources { limits },
                            startup_probe: Some(Probe::new(
                                &spec.health_path,
                                spec.port,
                                &spec.startup_probe,
                            )),
                            liveness_probe: Some(Probe::new(
                                &spec.health_path,
                                spec.port,
                                &spec.liveness_probe,
                            )),
                        }],
                    },
                },
            },
            status: None,
        }
    }

    fn to_spec(&self) -> Result<ServiceSpec> {
        let template = &self.spec.template;
        let container = template
            .spec
            .containers
            .first()
            .ok_or_else(|| anyhow!("Service manifest has no containers"))?;
        let scale = |key: &str| {
            template
                .metadata
                .annotations
                .get(key)
                .and_then(|v| v.parse().ok())
                .unwrap_or_default()
        };
        let health_path = container
            .startup_probe
            .as_ref()
            .or(container.liveness_probe.as_ref())
            .map(|p| p.http_get.path.clone())
            .unwrap_or_default();
        let zero = ProbeTiming {
            initial_delay_secs: 0,
            period_secs: 0,
            failure_threshold: 0,
            timeout_secs: 0,
        };

        Ok(ServiceSpec {
            image: container.image.clone(),
            port: container.ports.first().map(|p| p.container_port).unwrap_or(8080),
            cpu: container.resources.limits.get("cpu").cloned().unwrap_or_default(),
            memory: container
                .resources
                .limits
                .get("memory")
                .cloned()
                .unwrap_or_default(),
            request_timeout_secs: template.spec.timeout_seconds,
            min_instances: scale(MIN_SCALE),
            max_instances: scale(MAX_SCALE),
            concurrency: template.spec.container_concurrency,
            service_account: template.spec.service_account_name.clone(),
            health_path,
            startup_probe: container.startup_probe.as_ref().map(Probe::timing).unwrap_or(zero),
            liveness_probe: container.liveness_probe.as_ref().map(Probe::timing).unwrap_or(zero),
        })
    }
}
