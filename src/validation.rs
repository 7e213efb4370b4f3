use serde::Serialize;

use crate::config::{BackendKind, PipelineConfig, ProbeTiming};
use crate::process::ToolCommand;
use crate::quality::QualityGate;

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    fn warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

/// Everything that must hold before a run is allowed to start.
pub fn validate_config(config: &PipelineConfig) -> ValidationReport {
    let mut report = ValidationReport::default();

    if config.version != 1 {
        report.error(format!("Unsupported config version: {}", config.version));
    }

    if let Err(err) = QualityGate::new(config.evaluate.perplexity_threshold) {
        report.error(format!("evaluate.perplexity_threshold: {err}"));
    }

    for (idx, command) in config.lint.commands.iter().enumerate() {
        report.merge(validate_command(&format!("lint.commands[{idx}]"), command));
    }
    report.merge(validate_command("train.command", &config.train.command));
    report.merge(validate_command("evaluate.command", &config.evaluate.command));
    report.merge(validate_command("build.command", &config.build.command));
    report.merge(validate_command("scan.command", &config.scan.command));
    report.merge(validate_command("push.command", &config.push.command));

    if !config.train.data_file.exists() {
        report.warning(format!(
            "train.data_file {} does not exist yet",
            config.train.data_file.display()
        ));
    }
    if !config.evaluate.validation_file.exists() {
        report.warning(format!(
            "evaluate.validation_file {} does not exist yet",
            config.evaluate.validation_file.display()
        ));
    }

    let repository = &config.build.repository;
    if repository.trim().is_empty() {
        report.error("build.repository cannot be empty");
    } else if repository
        .rsplit('/')
        .next()
        .is_some_and(|last| last.contains(':') || last.contains('@'))
    {
        report.error(format!(
            "build.repository '{repository}' must not carry a tag or digest; tags derive from the commit"
        ));
    }

    if config.scan.severities.is_empty() {
        report.warning("scan.severities is empty; no finding will ever block a deployment");
    }
    for pattern in &config.scan.ignore {
        if let Err(err) = glob::Pattern::new(pattern) {
            report.error(format!("scan.ignore pattern '{pattern}' is not a valid glob: {err}"));
        }
    }

    report.merge(validate_deploy(config));
    report.merge(validate_probes(config));

    let lifecycle = &config.lifecycle;
    if lifecycle.ttl_secs == 0 {
        report.error("lifecycle.ttl_secs must be greater than zero");
    }
    if lifecycle.destroy_attempts == 0 {
        report.error("lifecycle.destroy_attempts must be at least 1");
    }

    report
}

fn validate_command(field: &str, command: &ToolCommand) -> ValidationReport {
    let mut report = ValidationReport::default();
    if command.program.trim().is_empty() {
        report.error(format!("{field}.program cannot be empty"));
    }
    report
}

fn validate_deploy(config: &PipelineConfig) -> ValidationReport {
    let mut report = ValidationReport::default();
    let deploy = &config.deploy;

    if deploy.project.trim().is_empty() {
        report.error("deploy.project cannot be empty");
    }
    if deploy.region.trim().is_empty() {
        report.error("deploy.region cannot be empty");
    }
    // The suffix adds 9 characters; the service name limit is 49.
    let max_service_len = if deploy.unique_suffix { 40 } else { 49 };
    if !is_resource_name(&deploy.service, max_service_len) {
        report.error(format!(
            "deploy.service '{}' must be lowercase letters, digits and hyphens, start with a letter and be at most {max_service_len} characters",
            deploy.service
        ));
    }
    // Account ids are limited to 30 characters, suffix included.
    let max_identity_len = if deploy.unique_suffix { 21 } else { 30 };
    if !is_resource_name(&deploy.identity, max_identity_len) || deploy.identity.len() < 6 {
        report.error(format!(
            "deploy.identity '{}' must be 6-{max_identity_len} lowercase letters, digits and hyphens starting with a letter",
            deploy.identity
        ));
    }
    if deploy.port == 0 {
        report.error("deploy.port must be a valid TCP port");
    }
    if deploy.max_instances == 0 {
        report.error("deploy.max_instances must be at least 1");
    }
    if deploy.min_instances > deploy.max_instances {
        report.error(format!(
            "deploy.min_instances ({}) exceeds deploy.max_instances ({})",
            deploy.min_instances, deploy.max_instances
        ));
    }
    if deploy.concurrency == 0 || deploy.concurrency > 1000 {
        report.error("deploy.concurrency must be between 1 and 1000");
    }
    if deploy.request_timeout_secs == 0 || deploy.request_timeout_secs > 3600 {
        report.error("deploy.request_timeout_secs must be between 1 and 3600");
    }
    if deploy.backend == BackendKind::Simulated {
        report.warning("deploy.backend is 'simulated'; nothing will be deployed");
    }
    report
}

fn validate_probes(config: &PipelineConfig) -> ValidationReport {
    let mut report = ValidationReport::default();
    let probe = &config.probe;
    if !probe.health_path.starts_with('/') {
        report.error(format!(
            "probe.health_path '{}' must start with '/'",
            probe.health_path
        ));
    }
    for (name, timing) in [("probe.startup", &probe.startup), ("probe.liveness", &probe.liveness)] {
        report.merge(validate_timing(name, timing));
    }
    if !probe.enabled {
        report.warning(format!(
            "probes disabled; the environment is held for {}s of grace plus its TTL without confirmation",
            config.lifecycle.unconfirmed_grace_secs
        ));
    }
    report
}

fn validate_timing(name: &str, timing: &ProbeTiming) -> ValidationReport {
    let mut report = ValidationReport::default();
    if timing.period_secs == 0 {
        report.error(format!("{name}.period_secs must be greater than zero"));
    }
    if timing.failure_threshold == 0 {
        report.error(format!("{name}.failure_threshold must be at least 1"));
    }
    if timing.timeout_secs == 0 {
        report.error(format!("{name}.timeout_secs must be greater than zero"));
    } else if timing.timeout_secs > timing.period_secs.max(1) {
        report.error(format!(
            "{name}.timeout_secs ({}) cannot exceed period_secs ({})",
            timing.timeout_secs, timing.period_secs
        ));
    }
    report
}

/// Run ids name directories and seed resource suffixes, so they are kept to a portable charset.
pub fn check_run_id(run_id: &str) -> anyhow::Result<()> {
    anyhow::ensure!(
        !run_id.is_empty()
            && run_id.len() <= 64
            && run_id.chars().any(|c| c.is_ascii_alphanumeric())
            && run_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')),
        "Run id '{run_id}' must be 1-64 letters, digits, '-', '_' or '.' with at least one letter or digit"
    );
    Ok(())
}

fn is_resource_name(name: &str, max_len: usize) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    name.len() <= max_len
        && first.is_ascii_lowercase()
        && !name.ends_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}
