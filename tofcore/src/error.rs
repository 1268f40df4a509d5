//! Error types shared by the decoding and calibration stages.

use std::io;
use thiserror::Error;

/// Result type for decoding and calibration operations
pub type TofResult<T> = Result<T, TofError>;

/// Errors that can occur while decoding events or calibrating spectra
#[derive(Error, Debug)]
pub enum TofError {
    /// Coincidence group larger than the acquisition allows, or a malformed raw record
    #[error("Malformed coincidence group: {hits} hits (maximum {max})")]
    InputFormat { hits: usize, max: usize },

    /// A raw record could not be parsed
    #[error("Malformed raw record: {0}")]
    RawRecord(String),

    /// Required signal roles were not all present for a detector
    #[error("Incomplete signal set for detector {detector}")]
    MissingSignal { detector: usize },

    /// Nonlinear fit did not converge
    #[error("Fit did not converge on [{}, {}]: {reason} (last parameters {parameters:?})", .interval.0, .interval.1)]
    FitConvergence {
        interval: (f64, f64),
        parameters: Vec<f64>,
        reason: String,
    },

    /// Linear calibration fit failed
    #[error("Linear fit failed: {0}")]
    LinearFit(String),

    /// Number of fitted centroids does not match the number of reference lines
    #[error("Calibration mismatch: {centroids} centroids vs {references} reference lines")]
    CalibrationMismatch { centroids: usize, references: usize },

    /// Histogram holds no usable content
    #[error("Histogram is empty")]
    EmptyHistogram,

    /// Configuration is inconsistent
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding or decoding of a persisted artifact failed
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl TofError {
    /// Builds a convergence failure for the given interval and parameter vector.
    pub fn convergence(interval: (f64, f64), parameters: &[f64], reason: impl Into<String>) -> Self {
        TofError::FitConvergence {
            interval,
            parameters: parameters.to_vec(),
            reason: reason.into(),
        }
    }
}
