use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Values substituted into `{name}` placeholders of a [`ToolCommand`].
pub type Vars = BTreeMap<&'static str, String>;

/// An external program invoked by a stage, with `{placeholder}` arguments.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ToolCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub workdir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: BTreeMap::new(),
            workdir: None,
        }
    }

    /// Arguments with placeholders expanded. Unknown placeholders are left verbatim.
    pub fn render_args(&self, vars: &Vars) -> Vec<String> {
        self.args.iter().map(|arg| render(arg, vars)).collect()
    }

    /// Run to completion and return the captured output whatever the exit status.
    pub fn execute(&self, vars: &Vars) -> Result<ToolOutput> {
        let args = self.render_args(vars);
        let mut command = Command::new(&self.program);
        command.args(&args);
        for (key, value) in &self.env {
            command.env(key, render(value, vars));
        }
        if let Some(dir) = &self.workdir {
            command.current_dir(dir);
        }

        debug!(program = %self.program, ?args, "Invoking external tool");
        let started = Instant::now();
        let output = command
            .output()
            .with_context(|| format!("Failed to execute '{}'", self.program))?;
        debug!(
            program = %self.program,
            status = ?output.status.code(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "External tool exited"
        );

        Ok(ToolOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Run to completion, failing on a non-zero exit status.
    pub fn run(&self, vars: &Vars) -> Result<ToolOutput> {
        let output = self.execute(vars)?;
        if !output.success {
            let code = output
                .code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            bail!(
                "'{}' exited with status {}: {}",
                self.program,
                code,
                tail(&output.stderr, 20)
            );
        }
        info!(program = %self.program, "External tool finished");
        Ok(output)
    }
}

fn render(template: &str, vars: &Vars) -> String {
    let mut rendered = template.to_string();
    for (key, value) in vars {
        rendered = rendered.replace(&format!("{{{key}}}"), value);
    }
    rendered
}

/// Last `lines` lines of `text`, for error messages.
pub fn tail(text: &str, lines: usize) -> String {
    let collected: Vec<&str> = text.trim_end().lines().collect();
    let start = collected.len().saturating_sub(lines);
    collected[start..].join("\n")
}
