use thiserror::Error;

/// Reasons the quality gate refuses to admit a trained model.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GateError {
    #[error("no-data: validation set contains no samples")]
    NoData,
    #[error("perplexity {perplexity:.4} exceeds threshold {threshold}")]
    Rejected { perplexity: f64, threshold: f64 },
    #[error("invalid perplexity threshold {0}: must be a positive finite number")]
    InvalidThreshold(f64),
    #[error("scorer reported a non-finite loss for sequence {index}")]
    NonFiniteLoss { index: usize },
    #[error("evaluation failed: {0}")]
    Evaluation(String),
}

/// Failure taxonomy surfaced on a stage record.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("lint failed: {0}")]
    Lint(String),
    #[error("training failed: {0}")]
    Train(String),
    #[error("quality gate failed: {0}")]
    QualityGate(#[from] GateError),
    #[error("image build failed: {0}")]
    Build(String),
    #[error("vulnerability scan failed: {0}")]
    Scan(String),
    #[error("image push failed: {0}")]
    Push(String),
    #[error("deployment failed: {0}")]
    Deploy(String),
    #[error("health check failed: {0}")]
    HealthCheck(String),
    #[error("teardown failed: {0}")]
    Destroy(String),
    #[error("slot '{slot}' is held by run {holder}")]
    SlotBusy { slot: String, holder: String },
    #[error("artifact error: {0}")]
    Artifact(String),
    #[error("cancelled by operator")]
    Cancelled,
}

impl StageError {
    /// Stable identifier recorded in run records and logs.
    pub fn code(&self) -> &'static str {
        match self {
            StageError::Lint(_) => "LintFailure",
            StageError::Train(_) => "TrainFailure",
            StageError::QualityGate(_) => "QualityGateFailure",
            StageError::Build(_) => "BuildFailure",
            StageError::Scan(_) => "ScanFailure",
            StageError::Push(_) => "PushFailure",
            StageError::Deploy(_) => "DeployFailure",
            StageError::HealthCheck(_) => "HealthCheckFailure",
            StageError::Destroy(_) => "DestroyFailure",
            StageError::SlotBusy { .. } => "SlotBusy",
            StageError::Artifact(_) => "ArtifactFailure",
            StageError::Cancelled => "Cancelled",
        }
    }

    /// Flatten an `anyhow` chain into the message of a taxonomy variant.
    pub fn chain(err: &anyhow::Error) -> String {
        format!("{err:#}")
    }
}

pub type StageResult<T> = std::result::Result<T, StageError>;
