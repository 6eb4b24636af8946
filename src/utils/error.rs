//! Error Handling Module
//!
//! Defines the error type for the grading pipeline.
//! Uses thiserror for ergonomic error definitions.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for joint grading operations
#[derive(Error, Debug)]
pub enum GradingError {
    /// An unrecognized stage tag was supplied to the label remapper
    #[error("Invalid stage '{0}': expected 'binary' or 'minor'")]
    InvalidStage(String),

    /// A majority-class sample reached the minor-stage remapper
    #[error("Label {label} is the majority class and cannot be remapped into the minor stage")]
    MajorityInMinorStage { label: usize, majority: usize },

    /// The stage trainer finished without a best-model snapshot
    #[error("No best model was selected after {epochs} epoch(s) (no finite validation loss)")]
    UnassignedBestModel { epochs: usize },

    /// A label group that cannot support two-stage training
    #[error("Degenerate group '{group}': {reason}")]
    DegenerateGroup { group: String, reason: String },

    /// Error loading or processing an image
    #[error("Failed to load image at '{0}': {1}")]
    ImageLoad(PathBuf, String),

    /// Error with dataset operations
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// Error with model operations
    #[error("Model error: {0}")]
    Model(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Path not found
    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),
}

impl From<serde_json::Error> for GradingError {
    fn from(err: serde_json::Error) -> Self {
        GradingError::Serialization(err.to_string())
    }
}

impl From<csv::Error> for GradingError {
    fn from(err: csv::Error) -> Self {
        GradingError::Serialization(err.to_string())
    }
}

/// Convenience Result type for grading operations
pub type Result<T> = std::result::Result<T, GradingError>;

/// Extension trait for adding context to errors
pub trait ResultExt<T> {
    /// Add context with a closure (lazy evaluation)
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: std::error::Error> ResultExt<T> for std::result::Result<T, E> {
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| GradingError::InvalidInput(format!("{}: {}", f(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GradingError::Dataset("test error".to_string());
        assert_eq!(format!("{}", err), "Dataset error: test error");
    }

    #[test]
    fn test_invalid_stage_names_tag() {
        let err = GradingError::InvalidStage("ternary".to_string());
        assert!(err.to_string().contains("ternary"));
    }

    #[test]
    fn test_degenerate_group_names_group() {
        let err = GradingError::DegenerateGroup {
            group: "LH_mcp2_erosion".to_string(),
            reason: "only one represented class".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("LH_mcp2_erosion"));
        assert!(msg.contains("only one represented class"));
    }

    #[test]
    fn test_result_context() {
        let result: std::result::Result<i32, std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"));

        let with_context = result.with_context(|| "Failed to read counts.csv".to_string());
        match with_context {
            Err(GradingError::InvalidInput(msg)) => {
                assert!(msg.starts_with("Failed to read counts.csv"));
                assert!(msg.contains("file not found"));
            }
            other => panic!("expected InvalidInput, got {:?}", other),
        }
    }
}
