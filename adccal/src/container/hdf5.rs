//! HDF5 backend, one HDF5 dataset per container path.

use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use hdf5::types::{FloatSize, IntSize, TypeDescriptor, VarLenAscii, VarLenUnicode};
use hdf5::{File, Group, H5Type};
use ndarray::{s, ArrayD, IxDyn};

use super::error::ContainerError;
use super::native::partial_path;
use super::tensor::{Tensor, WritePlan};

fn hdf5_error(path: &Path, err: hdf5::Error) -> ContainerError {
    ContainerError::Hdf5 {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

/// Opens or creates every group on the way to `dataset` and returns the
/// parent group with the leaf name.
fn parent_group<'a>(file: &File, dataset: &'a str) -> hdf5::Result<(Group, &'a str)> {
    let mut group: Group = (**file).clone();
    let mut parts: Vec<&str> = dataset.split('/').filter(|p| !p.is_empty()).collect();
    let leaf = parts.pop().unwrap_or(dataset);
    for part in parts {
        group = if group.link_exists(part) {
            group.group(part)?
        } else {
            group.create_group(part)?
        };
    }
    Ok((group, leaf))
}

fn create_numeric<T: H5Type>(group: &Group, leaf: &str, array: &ArrayD<T>) -> hdf5::Result<()> {
    let contiguous = array.as_standard_layout();
    group.new_dataset_builder().with_data(&contiguous).create(leaf).map(drop)
}

/// Writes `plan` to `path` through a sibling `.partial` file, like the native backend.
pub(super) fn write(path: &Path, plan: &WritePlan) -> Result<(), ContainerError> {
    let partial = partial_path(path);
    if let Err(e) = write_datasets(&partial, plan) {
        let _ = fs::remove_file(&partial);
        return Err(e);
    }
    fs::rename(&partial, path).map_err(|source| ContainerError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn write_datasets(path: &Path, plan: &WritePlan) -> Result<(), ContainerError> {
    let file = File::create(path).map_err(|e| hdf5_error(path, e))?;

    for dataset in plan {
        let (group, leaf) = parent_group(&file, &dataset.path).map_err(|e| hdf5_error(path, e))?;
        let result = match &dataset.tensor {
            Tensor::U8(a) => create_numeric(&group, leaf, a),
            Tensor::U16(a) => create_numeric(&group, leaf, a),
            Tensor::U32(a) => create_numeric(&group, leaf, a),
            Tensor::F32(a) => create_numeric(&group, leaf, a),
            Tensor::F64(a) => create_numeric(&group, leaf, a),
            Tensor::Text(s) => {
                let value = VarLenUnicode::from_str(s).map_err(|e| ContainerError::Hdf5 {
                    path: path.to_path_buf(),
                    message: format!("dataset '{}' is not storable as text: {e}", dataset.path),
                })?;
                group
                    .new_dataset::<VarLenUnicode>()
                    .create(leaf)
                    .and_then(|ds| ds.write_scalar(&value))
            }
        };
        result.map_err(|e| hdf5_error(path, e))?;
    }

    file.flush().map_err(|e| hdf5_error(path, e))
}

#[derive(Debug)]
pub(super) struct Hdf5Reader {
    path: PathBuf,
    file: File,
}

impl Hdf5Reader {
    pub(super) fn open(path: &Path) -> Result<Self, ContainerError> {
        let file = File::open(path).map_err(|e| hdf5_error(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub(super) fn dataset_paths(&self) -> Result<Vec<String>, ContainerError> {
        let mut out = Vec::new();
        collect_datasets(&self.file, &mut out).map_err(|e| hdf5_error(&self.path, e))?;
        out.sort();
        Ok(out)
    }

    pub(super) fn contains(&self, dataset: &str) -> bool {
        self.file.dataset(dataset).is_ok()
    }

    pub(super) fn shape(&self, dataset: &str) -> Result<Vec<usize>, ContainerError> {
        Ok(self.open_dataset(dataset)?.shape())
    }

    pub(super) fn read(&self, dataset: &str) -> Result<Tensor, ContainerError> {
        self.read_tensor(dataset, None)
    }

    /// Selects the `cols` range of the last axis in the file, so only that
    /// hyperslab is transferred.
    pub(super) fn read_cols(
        &self,
        dataset: &str,
        cols: Range<usize>,
    ) -> Result<Tensor, ContainerError> {
        let shape = self.shape(dataset)?;
        let len = shape.last().copied().unwrap_or(0);
        if shape.is_empty() || cols.start > cols.end || cols.end > len {
            return Err(ContainerError::RangeOutOfBounds {
                path: self.path.clone(),
                dataset: dataset.to_string(),
                start: cols.start,
                end: cols.end,
                len,
            });
        }
        self.read_tensor(dataset, Some(cols))
    }

    /// Signed 16-bit data is taken as raw pixel words and reinterpreted as
    /// `u16`. Other signed or 64-bit integers are widened to `f64`.
    fn read_tensor(
        &self,
        dataset: &str,
        cols: Option<Range<usize>>,
    ) -> Result<Tensor, ContainerError> {
        let ds = self.open_dataset(dataset)?;
        let err = |e| hdf5_error(&self.path, e);
        let descriptor = ds.dtype().and_then(|t| t.to_descriptor()).map_err(err)?;
        let whole = cols.is_none();

        Ok(match descriptor {
            TypeDescriptor::Unsigned(IntSize::U1) => Tensor::U8(self.read_array(&ds, cols)?),
            TypeDescriptor::Unsigned(IntSize::U2) => Tensor::U16(self.read_array(&ds, cols)?),
            TypeDescriptor::Unsigned(IntSize::U4) => Tensor::U32(self.read_array(&ds, cols)?),
            TypeDescriptor::Integer(IntSize::U2) => {
                let words: ArrayD<i16> = self.read_array(&ds, cols)?;
                Tensor::U16(words.mapv(|v| v as u16))
            }
            TypeDescriptor::Integer(_) | TypeDescriptor::Unsigned(IntSize::U8) => {
                let wide: ArrayD<i64> = self.read_array(&ds, cols)?;
                Tensor::F64(wide.mapv(|v| v as f64))
            }
            TypeDescriptor::Float(FloatSize::U4) => Tensor::F32(self.read_array(&ds, cols)?),
            TypeDescriptor::Float(_) => Tensor::F64(self.read_array(&ds, cols)?),
            TypeDescriptor::VarLenUnicode if whole => {
                let s: VarLenUnicode = ds.read_scalar().map_err(err)?;
                Tensor::Text(s.as_str().to_string())
            }
            TypeDescriptor::VarLenAscii if whole => {
                let s: VarLenAscii = ds.read_scalar().map_err(err)?;
                Tensor::Text(s.as_str().to_string())
            }
            other => {
                return Err(ContainerError::Hdf5 {
                    path: self.path.clone(),
                    message: format!("dataset '{dataset}' has unsupported type {other:?}"),
                })
            }
        })
    }

    fn read_array<T: H5Type>(
        &self,
        ds: &hdf5::Dataset,
        cols: Option<Range<usize>>,
    ) -> Result<ArrayD<T>, ContainerError> {
        let Some(cols) = cols else {
            return ds.read_dyn().map_err(|e| hdf5_error(&self.path, e));
        };
        let read = match ds.ndim() {
            1 => ds.read_slice::<T, _, IxDyn>(s![cols]),
            2 => ds.read_slice::<T, _, IxDyn>(s![.., cols]),
            3 => ds.read_slice::<T, _, IxDyn>(s![.., .., cols]),
            4 => ds.read_slice::<T, _, IxDyn>(s![.., .., .., cols]),
            n => {
                return Err(ContainerError::Hdf5 {
                    path: self.path.clone(),
                    message: format!(
                        "column reads support rank 1 to 4, dataset '{}' has rank {n}",
                        ds.name()
                    ),
                })
            }
        };
        read.map_err(|e| hdf5_error(&self.path, e))
    }

    fn open_dataset(&self, dataset: &str) -> Result<hdf5::Dataset, ContainerError> {
        self.file
            .dataset(dataset)
            .map_err(|_| ContainerError::MissingDataset {
                path: self.path.clone(),
                dataset: dataset.to_string(),
            })
    }
}

fn collect_datasets(group: &Group, out: &mut Vec<String>) -> hdf5::Result<()> {
    for ds in group.datasets()? {
        out.push(ds.name().trim_start_matches('/').to_string());
    }
    for child in group.groups()? {
        collect_datasets(&child, out)?;
    }
    Ok(())
}
