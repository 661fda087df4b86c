//! Autotune result selection.
//!
//! Picks the best algorithm candidate from a list of measured results.
//!
//! # Selection
//!
//! ```text
//! results ──► keep non-failures + WrongResult ──► deterministic? ──► first survivor
//!                                                     │
//!                                                     └──► sort by time
//!                                                          window [min, min + error]
//!                                                          least scratch bytes
//! ```
//!
//! `WrongResult` failures survive filtering because the reference used to
//! detect them may itself be wrong. Timings inside the measurement-error
//! window of the fastest candidate are treated as ties, and the tie is broken
//! by scratch memory.

use std::fmt;
use std::fmt::Write as _;
use std::time::Duration;

use crate::config::{require_determinism, RuntimeConfig};
use crate::error::{Result, RuntimeError};

/// Kind of failure observed while measuring a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Output differed from the reference.
    WrongResult,
    /// The kernel wrote outside its buffers.
    RedzoneModified,
    /// The candidate was disqualified before running.
    Disqualified,
    /// Any other failure.
    Unknown,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::WrongResult => write!(f, "wrong_result"),
            FailureKind::RedzoneModified => write!(f, "redzone_modified"),
            FailureKind::Disqualified => write!(f, "disqualified"),
            FailureKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// Failure recorded for a candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateFailure {
    /// Failure kind.
    pub kind: FailureKind,
    /// Human-readable message.
    pub message: String,
}

/// Identifier of the algorithm variant a candidate measured.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Algorithm {
    /// Library algorithm id (e.g. a GEMM or convolution algorithm).
    Id(i64),
    /// Named kernel or tiling configuration.
    Named(String),
}

/// One measured attempt at an algorithm variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateResult {
    /// Algorithm that was measured, if known.
    pub algorithm: Option<Algorithm>,
    /// Measured run time.
    pub run_time: Duration,
    /// Scratch memory the algorithm requires.
    pub scratch_bytes: u64,
    /// Failure, if the measurement failed.
    pub failure: Option<CandidateFailure>,
}

impl CandidateResult {
    /// Creates a successful result.
    pub fn success(run_time: Duration, scratch_bytes: u64) -> Self {
        Self {
            algorithm: None,
            run_time,
            scratch_bytes,
            failure: None,
        }
    }

    /// Creates a failed result.
    pub fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            algorithm: None,
            run_time: Duration::ZERO,
            scratch_bytes: 0,
            failure: Some(CandidateFailure {
                kind,
                message: message.into(),
            }),
        }
    }

    /// Attaches an algorithm identifier.
    #[must_use]
    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = Some(algorithm);
        self
    }

    /// Attaches a failure to a measured result.
    #[must_use]
    pub fn with_failure(mut self, kind: FailureKind, message: impl Into<String>) -> Self {
        self.failure = Some(CandidateFailure {
            kind,
            message: message.into(),
        });
        self
    }

    /// Returns true if the result survives failure filtering.
    pub fn is_viable(&self) -> bool {
        match &self.failure {
            None => true,
            Some(failure) => failure.kind == FailureKind::WrongResult,
        }
    }
}

/// Selects the best candidate among measured results.
#[derive(Debug, Clone)]
pub struct AutotuneSelector {
    deterministic: bool,
    measurement_error: Duration,
}

impl AutotuneSelector {
    /// Creates a selector from a runtime configuration. The determinism
    /// flag honors the process-wide override.
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            deterministic: require_determinism(config),
            measurement_error: config.measurement_error,
        }
    }

    /// Creates a selector with an explicit determinism flag.
    pub fn with_determinism(deterministic: bool) -> Self {
        Self {
            deterministic,
            measurement_error: RuntimeConfig::default().measurement_error,
        }
    }

    /// Returns whether this selector picks deterministically.
    pub fn is_deterministic(&self) -> bool {
        self.deterministic
    }

    /// Picks the best result. `label` names the operation in diagnostics.
    pub fn select(&self, results: &[CandidateResult], label: Option<&str>) -> Result<CandidateResult> {
        if results.is_empty() {
            return Err(no_candidates_error(label));
        }

        let viable: Vec<&CandidateResult> = results.iter().filter(|r| r.is_viable()).collect();
        if viable.is_empty() {
            tracing::warn!(
                label = label.unwrap_or("<unnamed>"),
                candidates = results.len(),
                "All autotune candidates failed"
            );
            return Err(all_failed_error(label, results));
        }

        if self.deterministic {
            return Ok(viable[0].clone());
        }

        let mut sorted = viable;
        sorted.sort_by_key(|r| r.run_time);

        let limit = sorted[0].run_time + self.measurement_error;
        let best = sorted
            .iter()
            .take_while(|r| r.run_time <= limit)
            .min_by_key(|r| r.scratch_bytes)
            .copied()
            .ok_or_else(|| RuntimeError::Internal("empty measurement window".to_string()))?;

        tracing::debug!(
            label = label.unwrap_or("<unnamed>"),
            run_time_us = best.run_time.as_micros() as u64,
            scratch_bytes = best.scratch_bytes,
            "Selected autotune candidate"
        );
        Ok(best.clone())
    }
}

/// Picks the best result using the given configuration.
pub fn pick_best_result(
    results: &[CandidateResult],
    label: Option<&str>,
    config: &RuntimeConfig,
) -> Result<CandidateResult> {
    AutotuneSelector::new(config).select(results, label)
}

fn no_candidates_error(label: Option<&str>) -> RuntimeError {
    let msg = match label {
        Some(label) => format!(
            "There are no algorithm candidates for computing:\n  {}\n\
             This likely means that the instruction shape is not supported by the target GPU library.",
            label
        ),
        None => "There are no algorithm candidates for computing the instruction.\n\
                 This likely means that the instruction shape is not supported by the target GPU library."
            .to_string(),
    };
    RuntimeError::NoCandidates(msg)
}

fn all_failed_error(label: Option<&str>, results: &[CandidateResult]) -> RuntimeError {
    let mut msg = match label {
        Some(label) => format!("All algorithms tried for {} failed. Per-algorithm errors:", label),
        None => "All algorithms failed. Per-algorithm errors:".to_string(),
    };
    for result in results {
        if let Some(failure) = &result.failure {
            let _ = write!(msg, "\n  {}", failure.message);
        }
    }
    RuntimeError::AllCandidatesFailed(msg)
}
