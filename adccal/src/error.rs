use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;
use crate::container::ContainerError;
use crate::layout::LayoutError;

/// Errors that abort a unit of work (one column block or one correction run).
///
/// Per-pixel conditions such as an empty ROI or a degenerate fit never show
/// up here; they are encoded as `NaN` in the produced constants.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error("Failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Vin sweep has {vin} entries but {runs} frame counts")]
    RunCountMismatch { vin: usize, runs: usize },

    #[error("Expanded Vin has {expected} entries but the frame axis has {actual}")]
    FrameCountMismatch { expected: usize, actual: usize },

    #[error("Run '{prefix}' in '{path}' has shape {actual:?}, expected {expected:?}")]
    RunShapeMismatch {
        prefix: String,
        path: PathBuf,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Constants of shape {constants:?} do not match raw frames of shape {frames:?}")]
    ConstantsShapeMismatch {
        constants: Vec<usize>,
        frames: Vec<usize>,
    },

    #[error("Failed to build worker pool: {0}")]
    WorkerPool(String),

    #[error("Stage '{stage}' was asked to {action} before it was {requires}")]
    StageOrder {
        stage: &'static str,
        action: &'static str,
        requires: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_mismatch_message() {
        let err = Error::FrameCountMismatch {
            expected: 30,
            actual: 29,
        };
        let msg = err.to_string();
        assert!(msg.contains("30"));
        assert!(msg.contains("29"));
    }

    #[test]
    fn test_config_error_is_transparent() {
        let err: Error = ConfigError::MissingField("process.method".to_string()).into();
        assert!(err.to_string().contains("process.method"));
    }
}
