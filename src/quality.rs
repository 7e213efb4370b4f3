use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::GateError;

/// Cross-entropy loss of one validation sequence, averaged over its tokens.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct SequenceLoss {
    pub loss: f64,
    pub tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SampleGeneration {
    pub prompt: String,
    pub response: String,
}

/// What the scoring collaborator reports after an inference-only pass.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ScorerReport {
    #[serde(default)]
    pub sequences: Vec<SequenceLoss>,
    #[serde(default)]
    pub samples: Vec<SampleGeneration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Perplexity {
    pub mean_loss: f64,
    pub value: f64,
    pub token_count: u64,
    pub sequence_count: usize,
}

/// Token-weighted perplexity: `exp(Σ lossᵢ·tokensᵢ / Σ tokensᵢ)`.
pub fn perplexity(sequences: &[SequenceLoss]) -> Result<Perplexity, GateError> {
    let mut weighted = 0.0;
    let mut tokens = 0u64;
    for (index, seq) in sequences.iter().enumerate() {
        if !seq.loss.is_finite() {
            return Err(GateError::NonFiniteLoss { index });
        }
        weighted += seq.loss * seq.tokens as f64;
        tokens += seq.tokens;
    }
    if tokens == 0 {
        return Err(GateError::NoData);
    }
    let mean_loss = weighted / tokens as f64;
    Ok(Perplexity {
        mean_loss,
        value: mean_loss.exp(),
        token_count: tokens,
        sequence_count: sequences.len(),
    })
}

/// Number of non-blank lines in a validation file.
pub fn count_validation_samples(path: &Path) -> Result<usize> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read validation data: {}", path.display()))?;
    Ok(content.lines().filter(|line| !line.trim().is_empty()).count())
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityGate {
    threshold: f64,
}

impl QualityGate {
    pub fn new(threshold: f64) -> Result<Self, GateError> {
        if !threshold.is_finite() || threshold <= 0.0 {
            return Err(GateError::InvalidThreshold(threshold));
        }
        Ok(Self { threshold })
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn evaluate(&self, perplexity: f64) -> QualityGateResult {
        QualityGateResult {
            metric: perplexity,
            threshold: self.threshold,
            admit: perplexity <= self.threshold,
        }
    }
}

/// Outcome of a gate evaluation. Fields are read-only once computed.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct QualityGateResult {
    metric: f64,
    threshold: f64,
    admit: bool,
}

impl QualityGateResult {
    pub fn metric(&self) -> f64 {
        self.metric
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn admit(&self) -> bool {
        self.admit
    }

    /// Turn a reject into the error that fails the gate stage.
    pub fn into_decision(self) -> Result<Self, GateError> {
        if self.admit {
            Ok(self)
        } else {
            Err(GateError::Rejected {
                perplexity: self.metric,
                threshold: self.threshold,
            })
        }
    }
}

/// Human-readable evaluation summary stored as `evaluation.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub perplexity: f64,
    pub perplexity_threshold: f64,
    pub mean_loss: f64,
    pub token_count: u64,
    pub sequence_count: usize,
    pub sample_generations: Vec<SampleGeneration>,
    pub evaluation_passed: bool,
}

impl EvaluationReport {
    pub fn new(
        ppl: &Perplexity,
        result: &QualityGateResult,
        samples: Vec<SampleGeneration>,
    ) -> Self {
        Self {
            perplexity: ppl.value,
            perplexity_threshold: result.threshold(),
            mean_loss: ppl.mean_loss,
            token_count: ppl.token_count,
            sequence_count: ppl.sequence_count,
            sample_generations: samples,
            evaluation_passed: result.admit(),
        }
    }
}
