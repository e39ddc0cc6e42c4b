//! Structured container files: one dataset per slash-separated path.
//!
//! Stages never touch the on-disk format directly. They build a [`WritePlan`]
//! and hand it to [`write_file`]; inputs are read through [`Container`].
//! The backend is chosen from the file extension:
//! - `.adc`: built-in memory-mapped format
//! - `.h5` / `.hdf5`: HDF5, with the `hdf5` cargo feature

mod error;
#[cfg(feature = "hdf5")]
mod hdf5;
mod native;
mod tensor;


use std::ops::Range;
use std::path::{Path, PathBuf};

use ndarray::ArrayD;

pub use error::ContainerError;
pub use tensor::{DType, Dataset, Element, Tensor, WritePlan};

/// Extension used for files this crate writes when none is configured.
#[cfg(feature = "hdf5")]
pub const DEFAULT_EXTENSION: &str = "h5";
#[cfg(not(feature = "hdf5"))]
pub const DEFAULT_EXTENSION: &str = "adc";

/// On-disk format of a container file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerFormat {
    Native,
    Hdf5,
}

impl ContainerFormat {
    pub fn from_path(path: &Path) -> Result<Self, ContainerError> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .ok_or_else(|| ContainerError::UnsupportedFormat {
                path: path.to_path_buf(),
                reason: "missing file extension".to_string(),
            })?;

        match extension.as_str() {
            "adc" => Ok(Self::Native),
            "h5" | "hdf5" => Ok(Self::Hdf5),
            other => Err(ContainerError::UnsupportedFormat {
                path: path.to_path_buf(),
                reason: format!("unknown extension '{other}'"),
            }),
        }
    }
}

#[cfg(not(feature = "hdf5"))]
fn hdf5_disabled(path: &Path) -> ContainerError {
    ContainerError::UnsupportedFormat {
        path: path.to_path_buf(),
        reason: "HDF5 support requires building with the `hdf5` feature".to_string(),
    }
}

/// Writes every dataset of `plan` to a new file at `path`, replacing any existing file.
pub fn write_file(path: &Path, plan: &WritePlan) -> Result<(), ContainerError> {
    if let Some(dataset) = plan.duplicate_path() {
        return Err(ContainerError::DuplicateDataset {
            path: path.to_path_buf(),
            dataset: dataset.to_string(),
        });
    }

    tracing::debug!(path = %path.display(), datasets = plan.len(), "Writing container");

    match ContainerFormat::from_path(path)? {
        ContainerFormat::Native => native::write(path, plan),
        #[cfg(feature = "hdf5")]
        ContainerFormat::Hdf5 => hdf5::write(path, plan),
        #[cfg(not(feature = "hdf5"))]
        ContainerFormat::Hdf5 => Err(hdf5_disabled(path)),
    }
}

#[derive(Debug)]
enum Backend {
    Native(native::NativeReader),
    #[cfg(feature = "hdf5")]
    Hdf5(hdf5::Hdf5Reader),
}

/// Read-only handle to a container file.
#[derive(Debug)]
pub struct Container {
    path: PathBuf,
    backend: Backend,
}

impl Container {
    pub fn open(path: &Path) -> Result<Self, ContainerError> {
        let backend = match ContainerFormat::from_path(path)? {
            ContainerFormat::Native => Backend::Native(native::NativeReader::open(path)?),
            #[cfg(feature = "hdf5")]
            ContainerFormat::Hdf5 => Backend::Hdf5(hdf5::Hdf5Reader::open(path)?),
            #[cfg(not(feature = "hdf5"))]
            ContainerFormat::Hdf5 => return Err(hdf5_disabled(path)),
        };
        Ok(Self {
            path: path.to_path_buf(),
            backend,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dataset_paths(&self) -> Result<Vec<String>, ContainerError> {
        match &self.backend {
            Backend::Native(r) => Ok(r.dataset_paths()),
            #[cfg(feature = "hdf5")]
            Backend::Hdf5(r) => r.dataset_paths(),
        }
    }

    pub fn contains(&self, dataset: &str) -> bool {
        match &self.backend {
            Backend::Native(r) => r.contains(dataset),
            #[cfg(feature = "hdf5")]
            Backend::Hdf5(r) => r.contains(dataset),
        }
    }

    pub fn shape(&self, dataset: &str) -> Result<Vec<usize>, ContainerError> {
        match &self.backend {
            Backend::Native(r) => r.shape(dataset),
            #[cfg(feature = "hdf5")]
            Backend::Hdf5(r) => r.shape(dataset),
        }
    }

    pub fn read(&self, dataset: &str) -> Result<Tensor, ContainerError> {
        match &self.backend {
            Backend::Native(r) => r.read(dataset),
            #[cfg(feature = "hdf5")]
            Backend::Hdf5(r) => r.read(dataset),
        }
    }

    /// Reads the `cols` range of the last axis of `dataset`.
    pub fn read_cols(&self, dataset: &str, cols: Range<usize>) -> Result<Tensor, ContainerError> {
        match &self.backend {
            Backend::Native(r) => r.read_cols(dataset, cols),
            #[cfg(feature = "hdf5")]
            Backend::Hdf5(r) => r.read_cols(dataset, cols),
        }
    }

    /// Reads a dataset that must be stored with element type `T`.
    pub fn read_as<T: Element>(&self, dataset: &str) -> Result<ArrayD<T>, ContainerError> {
        let tensor = self.read(dataset)?;
        self.expect_dtype(dataset, tensor)
    }

    /// Like [`Container::read_cols`], typed.
    pub fn read_cols_as<T: Element>(
        &self,
        dataset: &str,
        cols: Range<usize>,
    ) -> Result<ArrayD<T>, ContainerError> {
        let tensor = self.read_cols(dataset, cols)?;
        self.expect_dtype(dataset, tensor)
    }

    /// Reads any numeric dataset converted to `f64`.
    pub fn read_f64(&self, dataset: &str) -> Result<ArrayD<f64>, ContainerError> {
        let tensor = self.read(dataset)?;
        tensor.to_f64().ok_or_else(|| ContainerError::DTypeMismatch {
            path: self.path.clone(),
            dataset: dataset.to_string(),
            expected: DType::F64,
            actual: DType::Text,
        })
    }

    pub fn read_text(&self, dataset: &str) -> Result<String, ContainerError> {
        match self.read(dataset)? {
            Tensor::Text(s) => Ok(s),
            other => Err(ContainerError::DTypeMismatch {
                path: self.path.clone(),
                dataset: dataset.to_string(),
                expected: DType::Text,
                actual: other.dtype(),
            }),
        }
    }

    fn expect_dtype<T: Element>(
        &self,
        dataset: &str,
        tensor: Tensor,
    ) -> Result<ArrayD<T>, ContainerError> {
        let actual = tensor.dtype();
        T::unwrap(tensor).ok_or_else(|| ContainerError::DTypeMismatch {
            path: self.path.clone(),
            dataset: dataset.to_string(),
            expected: T::DTYPE,
            actual,
        })
    }
}
