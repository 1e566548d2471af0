//! Error types for the strainscope core.
//!
//! The core raises four kinds of errors: malformed input data, invalid
//! configuration, missing data and failures surfaced by external
//! collaborators (sequence readers, persistence). The CLI wrapper maps these
//! to non-zero exit codes; the core itself never exits.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the strainscope core.
#[derive(Debug, Error)]
pub enum StrainError {
    /// Malformed k-mer set container, unexpected type tag or inconsistent
    /// parallel arrays.
    #[error("bad input: {0}")]
    BadInput(String),

    /// A configuration value outside its supported range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A requested strain, scaffold or attribute is not present.
    #[error("missing data: {0}")]
    MissingData(String),

    /// An external collaborator (sequence reader, pileup iterator,
    /// persistence) failed; surfaced unchanged with the source path attached.
    #[error("{}: {message}", path.display())]
    ExternalFailure { path: PathBuf, message: String },
}

impl StrainError {
    /// Wrap a collaborator failure with the path it occurred on.
    pub fn external(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        StrainError::ExternalFailure {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, StrainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_failure_carries_path() {
        let err = StrainError::external("/data/sample.kset", "unexpected EOF");
        let msg = err.to_string();
        assert!(msg.contains("/data/sample.kset"));
        assert!(msg.contains("unexpected EOF"));
    }

    #[test]
    fn test_bad_input_display() {
        let err = StrainError::BadInput("kmers and counts differ in length".into());
        assert_eq!(
            err.to_string(),
            "bad input: kmers and counts differ in length"
        );
    }
}
