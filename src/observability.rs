use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

#[cfg(feature = "metrics-server")]
pub mod server;

#[derive(Debug, Default, Serialize, Clone)]
pub struct MetricsSnapshot {
    pub stages: BTreeMap<String, StageMetrics>,
    pub total_duration_ms: f64,
    pub gate_admits: u64,
    pub gate_rejects: u64,
    pub teardowns: u64,
    pub teardown_failures: u64,
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct StageMetrics {
    pub calls: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
}

/// Shared, cheaply clonable metrics sink for one executor.
#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> MutexGuard<'_, MetricsSnapshot> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn start_stage(&self, stage_name: &str) -> StageTimer {
        StageTimer {
            stage: stage_name.to_string(),
            started_at: Instant::now(),
            collector: self.inner.clone(),
        }
    }

    pub fn record_total_duration(&self, duration: Duration) {
        self.guard().total_duration_ms = duration.as_secs_f64() * 1_000.0;
    }

    pub fn record_gate_admit(&self) {
        self.guard().gate_admits += 1;
    }

    pub fn record_gate_reject(&self) {
        self.guard().gate_rejects += 1;
    }

    pub fn record_teardown(&self) {
        self.guard().teardowns += 1;
    }

    pub fn record_teardown_failure(&self) {
        self.guard().teardown_failures += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.guard().clone()
    }
}

/// Records the stage duration when dropped.
pub struct StageTimer {
    stage: String,
    started_at: Instant,
    collector: Arc<Mutex<MetricsSnapshot>>,
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        let duration_ms = self.started_at.elapsed().as_secs_f64() * 1_000.0;
        let mut guard = self.collector.lock().unwrap_or_else(|p| p.into_inner());
        let metrics = guard.stages.entry(self.stage.clone()).or_default();
        metrics.calls += 1;
        metrics.total_duration_ms += duration_ms;
        metrics.max_duration_ms = metrics.max_duration_ms.max(duration_ms);
        debug!(stage = self.stage.as_str(), duration_ms, "Stage duration recorded");
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        total_duration_ms = snapshot.total_duration_ms,
        stage_count = snapshot.stages.len(),
        gate_admits = snapshot.gate_admits,
        gate_rejects = snapshot.gate_rejects,
        teardowns = snapshot.teardowns,
        teardown_failures = snapshot.teardown_failures,
        "Pipeline metrics summary"
    );
    for (stage, metrics) in &snapshot.stages {
        info!(
            stage = stage.as_str(),
            calls = metrics.calls,
            total_ms = metrics.total_duration_ms,
            max_ms = metrics.max_duration_ms,
            "Stage metrics"
        );
    }
}

fn counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {value}");
}

impl MetricsSnapshot {
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();
        counter(&mut out, "ttl_deploy_gate_admits_total", "Models admitted by the quality gate", self.gate_admits);
        counter(&mut out, "ttl_deploy_gate_rejects_total", "Models rejected by the quality gate", self.gate_rejects);
        counter(&mut out, "ttl_deploy_teardowns_total", "Environments torn down", self.teardowns);
        counter(
            &mut out,
            "ttl_deploy_teardown_failures_total",
            "Teardowns that left resources behind",
            self.teardown_failures,
        );

        out.push_str("# HELP ttl_deploy_stage_calls_total Stage executions\n");
        out.push_str("# TYPE ttl_deploy_stage_calls_total counter\n");
        out.push_str("# HELP ttl_deploy_stage_duration_seconds_total Accumulated stage duration\n");
        out.push_str("# TYPE ttl_deploy_stage_duration_seconds_total counter\n");
        out.push_str("# HELP ttl_deploy_stage_duration_seconds_max Longest stage execution\n");
        out.push_str("# TYPE ttl_deploy_stage_duration_seconds_max gauge\n");
        for (stage, metrics) in &self.stages {
            let _ = writeln!(out, "ttl_deploy_stage_calls_total{{stage=\"{stage}\"}} {}", metrics.calls);
            let _ = writeln!(
                out,
                "ttl_deploy_stage_duration_seconds_total{{stage=\"{stage}\"}} {:.6}",
                metrics.total_duration_ms / 1_000.0
            );
            let _ = writeln!(
                out,
                "ttl_deploy_stage_duration_seconds_max{{stage=\"{stage}\"}} {:.6}",
                metrics.max_duration_ms / 1_000.0
            );
        }

        out.push_str("# HELP ttl_deploy_run_duration_seconds Wall time of the last run\n");
        out.push_str("# TYPE ttl_deploy_run_duration_seconds gauge\n");
        let _ = writeln!(
            out,
            "ttl_deploy_run_duration_seconds {:.6}",
            self.total_duration_ms / 1_000.0
        );
        out
    }
}
