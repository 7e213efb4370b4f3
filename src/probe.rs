use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use reqwest::blocking::Client;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::config::ProbeTiming;
use crate::error::{StageError, StageResult};
use crate::lifecycle::{CancelToken, Sleeper, Wake};

/// HTTP surface of the deployed service.
pub trait HealthProbe: Send + Sync {
    /// `Ok(true)` on a success status, `Ok(false)` on any other status.
    fn check(&self, url: &str, timeout: Duration) -> Result<bool>;
    /// `POST /generate`, returning the `response` field.
    fn generate(&self, base_url: &str, prompt: &str, timeout: Duration) -> Result<String>;
}

pub struct HttpProbe {
    client: Client,
}

impl HttpProbe {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("ttl-deploy/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }
}

impl HealthProbe for HttpProbe {
    fn check(&self, url: &str, timeout: Duration) -> Result<bool> {
        let response = self.client.get(url).timeout(timeout).send()?;
        debug!(%url, status = response.status().as_u16(), "Health probe response");
        Ok(response.status().is_success())
    }

    fn generate(&self, base_url: &str, prompt: &str, timeout: Duration) -> Result<String> {
        let url = join_url(base_url, "/generate");
        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(&json!({ "prompt": prompt }))
            .send()
            .with_context(|| format!("POST {url} failed"))?;
        let status = response.status();
        if !status.is_success() {
            bail!("POST {url} returned {status}");
        }
        let body: Value = response
            .json()
            .with_context(|| format!("POST {url} returned a non-JSON body"))?;
        generation_response(&body)
    }
}

/// Stand-in for backends whose services have no reachable URL.
#[derive(Debug, Default, Clone, Copy)]
pub struct AssumeHealthy;

impl HealthProbe for AssumeHealthy {
    fn check(&self, _url: &str, _timeout: Duration) -> Result<bool> {
        Ok(true)
    }

    fn generate(&self, _base_url: &str, prompt: &str, _timeout: Duration) -> Result<String> {
        Ok(format!("{prompt} ..."))
    }
}

fn generation_response(body: &Value) -> Result<String> {
    match body.get("response") {
        Some(Value::String(text)) => Ok(text.clone()),
        Some(other) => bail!("'response' must be a string, got {other}"),
        None => bail!("generation reply has no 'response' field"),
    }
}

pub fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub url: String,
    pub attempts: u32,
    pub healthy: bool,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smoke_response: Option<String>,
}

/// Poll `url` following the startup probe timing. Gives up after `failure_threshold` misses.
pub fn wait_until_healthy(
    probe: &dyn HealthProbe,
    url: &str,
    timing: &ProbeTiming,
    sleeper: &dyn Sleeper,
    cancel: &CancelToken,
) -> StageResult<ProbeReport> {
    let started = Instant::now();
    let timeout = Duration::from_secs(timing.timeout_secs.max(1));

    if !timing.initial_delay().is_zero() && sleeper.sleep(timing.initial_delay(), cancel) == Wake::Cancelled {
        return Err(StageError::Cancelled);
    }

    for attempt in 1..=timing.failure_threshold {
        match probe.check(url, timeout) {
            Ok(true) => {
                info!(%url, attempt, "Service reported healthy");
                return Ok(ProbeReport {
                    url: url.to_string(),
                    attempts: attempt,
                    healthy: true,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    smoke_response: None,
                });
            }
            Ok(false) => warn!(%url, attempt, "Health probe returned a failure status"),
            Err(err) => warn!(%url, attempt, error = %format!("{err:#}"), "Health probe request failed"),
        }
        if sleeper.sleep(timing.period(), cancel) == Wake::Cancelled {
            return Err(StageError::Cancelled);
        }
    }

    Err(StageError::HealthCheck(format!(
        "{url} not healthy after {} attempts ({}s budget)",
        timing.failure_threshold,
        timing.budget().as_secs()
    )))
}
