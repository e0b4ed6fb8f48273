//! Error type shared by the sampler, its data layer and the checkpoint writers.

use thiserror::Error;

/// Errors that abort a run.
///
/// Per-iteration numerical trouble (a NaN likelihood for one candidate) is not an error: the
/// candidate is rejected and counted. Only systemic failures reach this type.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or inconsistent run configuration. Raised before any sampling happens.
    #[error("configuration error: {0}")]
    Config(String),
    /// Malformed or incomplete input data (pulsars, noise dictionary, distance priors, ...).
    #[error("data error: {0}")]
    Data(String),
    /// Non-finite values that cannot be handled by rejecting a single proposal.
    #[error("numerical error: {0}")]
    Numerical(String),
    /// A projection-mode evaluation was requested without a matching shape basis.
    #[error("likelihood cache is not valid for this evaluation: {0}")]
    CacheConsistency(String),
    /// Samples could not be persisted, even after retrying.
    #[error("checkpoint write failed: {0}")]
    Checkpoint(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Bincode(#[from] bincode::Error),
}

/// Convenience type for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;
