//! Error types for ABTRIAGE.
//!
//! One structured enum for the whole pipeline. Run-level failures
//! (calibration, configuration) abort the run; candidate-level failures are
//! isolated by the callers and degrade a single metric instead.

use thiserror::Error;

/// Unified error type for all triage operations.
#[derive(Error, Debug)]
pub enum TriageError {
    /// A known-positive control could not be scored, or thresholds could not
    /// be derived. Always fatal for the run: silently excluding a control
    /// would corrupt the "every known binder passes" guarantee.
    #[error("calibration failed for control '{control}': {message}")]
    FatalCalibration { control: String, message: String },

    /// Fewer candidates survived than requested, even after the maximum
    /// allowed threshold relaxation.
    #[error("insufficient candidates: needed {needed}, got {got} after relaxation")]
    InsufficientCandidates { needed: usize, got: usize },

    /// The epitope aligner produced an empty mapped epitope set.
    #[error("alignment failure for '{context}': {message}")]
    AlignmentFailure { context: String, message: String },

    /// An external collaborator call exceeded its deadline.
    #[error("collaborator call timed out: {0}")]
    Timeout(String),

    /// An external collaborator reported a prediction failure.
    #[error("prediction failed: {0}")]
    Prediction(String),

    /// Configuration validation errors.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O errors (input files, report writing).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic errors (fallback).
    #[error("internal error: {0}")]
    Internal(String),
}

impl TriageError {
    /// Creates a fatal calibration error.
    pub fn calibration(control: impl Into<String>, message: impl Into<String>) -> Self {
        TriageError::FatalCalibration {
            control: control.into(),
            message: message.into(),
        }
    }

    /// Creates an alignment failure.
    pub fn alignment(context: impl Into<String>, message: impl Into<String>) -> Self {
        TriageError::AlignmentFailure {
            context: context.into(),
            message: message.into(),
        }
    }

    /// Creates a timeout error.
    pub fn timeout(message: impl Into<String>) -> Self {
        TriageError::Timeout(message.into())
    }

    /// Creates a prediction error.
    pub fn prediction(message: impl Into<String>) -> Self {
        TriageError::Prediction(message.into())
    }

    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        TriageError::Config(message.into())
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        TriageError::Internal(message.into())
    }

    /// Checks if this error is worth retrying.
    ///
    /// Retriable errors consume one attempt of the caller's retry budget;
    /// everything else fails the call immediately.
    pub fn is_retriable(&self) -> bool {
        matches!(self, TriageError::Timeout(_) | TriageError::Prediction(_))
    }
}

/// Result type alias for triage operations.
pub type Result<T> = std::result::Result<T, TriageError>;
