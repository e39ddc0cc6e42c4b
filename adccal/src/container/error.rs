use std::path::PathBuf;

use thiserror::Error;

use super::tensor::DType;

/// Errors raised while reading or writing a structured container file.
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("Failed to access container '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed container '{path}': {reason}")]
    Malformed { path: PathBuf, reason: String },

    #[error("Dataset '{dataset}' not found in '{path}'")]
    MissingDataset { path: PathBuf, dataset: String },

    #[error("Dataset '{dataset}' in '{path}' has type {actual}, expected {expected}")]
    DTypeMismatch {
        path: PathBuf,
        dataset: String,
        expected: DType,
        actual: DType,
    },

    #[error("Dataset '{dataset}' in '{path}' has shape {actual:?}, expected {expected}")]
    ShapeMismatch {
        path: PathBuf,
        dataset: String,
        expected: String,
        actual: Vec<usize>,
    },

    #[error("Dataset '{dataset}' appears more than once in the write plan for '{path}'")]
    DuplicateDataset { path: PathBuf, dataset: String },

    #[error(
        "Column range {start}..{end} out of bounds for dataset '{dataset}' in '{path}' with {len} columns"
    )]
    RangeOutOfBounds {
        path: PathBuf,
        dataset: String,
        start: usize,
        end: usize,
        len: usize,
    },

    #[error("Unsupported container format for '{path}': {reason}")]
    UnsupportedFormat { path: PathBuf, reason: String },

    #[error("HDF5 error in '{path}': {message}")]
    Hdf5 { path: PathBuf, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_dataset_message() {
        let err = ContainerError::MissingDataset {
            path: PathBuf::from("/data/col0-31_gathered.adc"),
            dataset: "sample/coarse".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("sample/coarse"));
        assert!(msg.contains("col0-31_gathered.adc"));
    }

    #[test]
    fn test_dtype_mismatch_message() {
        let err = ContainerError::DTypeMismatch {
            path: PathBuf::from("x.adc"),
            dataset: "vin".to_string(),
            expected: DType::F64,
            actual: DType::U8,
        };
        let msg = err.to_string();
        assert!(msg.contains("f64"));
        assert!(msg.contains("u8"));
    }
}
