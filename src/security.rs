use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use glob::Pattern;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Unknown,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn parse(raw: &str) -> Severity {
        match raw.trim().to_ascii_uppercase().as_str() {
            "LOW" => Severity::Low,
            "MEDIUM" => Severity::Medium,
            "HIGH" => Severity::High,
            "CRITICAL" => Severity::Critical,
            _ => Severity::Unknown,
        }
    }
}

/// Scanner report in the Trivy JSON layout.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ScanReport {
    #[serde(default)]
    pub results: Vec<ScanTarget>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ScanTarget {
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub vulnerabilities: Option<Vec<Vulnerability>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Vulnerability {
    #[serde(rename = "VulnerabilityID")]
    pub id: String,
    #[serde(rename = "PkgName", default)]
    pub package: String,
    #[serde(rename = "Severity", default)]
    pub severity: String,
}

impl ScanReport {
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            bail!("Scanner produced no report");
        }
        serde_json::from_str(raw).context("Failed to parse scanner JSON report")
    }

    pub fn vulnerabilities(&self) -> impl Iterator<Item = &Vulnerability> {
        self.results
            .iter()
            .filter_map(|target| target.vulnerabilities.as_ref())
            .flatten()
    }
}

/// Decides which findings block a deployment.
#[derive(Debug, Clone)]
pub struct ScanPolicy {
    severities: Vec<Severity>,
    ignore: Vec<Pattern>,
}

impl ScanPolicy {
    pub fn new(severities: &[Severity], ignore: &[String]) -> Result<Self> {
        let ignore = ignore
            .iter()
            .map(|raw| {
                Pattern::new(raw).map_err(|err| anyhow!("Invalid ignore pattern '{raw}': {err}"))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            severities: severities.to_vec(),
            ignore,
        })
    }

    pub fn is_ignored(&self, id: &str) -> bool {
        self.ignore.iter().any(|pattern| pattern.matches(id))
    }

    /// Findings with a disallowed severity that are not on the ignore list.
    pub fn blocking<'a>(&self, report: &'a ScanReport) -> Vec<&'a Vulnerability> {
        let mut blocking: Vec<&Vulnerability> = report
            .vulnerabilities()
            .filter(|vuln| self.severities.contains(&Severity::parse(&vuln.severity)))
            .filter(|vuln| !self.is_ignored(&vuln.id))
            .collect();
        blocking.sort_by(|a, b| a.id.cmp(&b.id));
        blocking.dedup_by(|a, b| a.id == b.id);
        blocking
    }
}

/// Hex sha256 of an in-memory payload.
pub fn sha256_bytes(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Compute the SHA256 digest of the file at `path` and return it as a hex string.
pub fn compute_sha256(path: &Path) -> Result<String> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open file for hashing: {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Write `<digest>  <path>` for `path` into `output`, sha256sum style.
pub fn write_sha256(path: &Path, output: &Path) -> Result<String> {
    let digest = compute_sha256(path)?;
    if let Some(parent) = output.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create digest directory: {}", parent.display()))?;
    }
    let mut file = File::create(output)
        .with_context(|| format!("Failed to create digest file: {}", output.display()))?;
    writeln!(file, "{}  {}", digest, path.display())
        .with_context(|| format!("Failed to write digest into '{}'", output.display()))?;
    Ok(digest)
}
