//! Self-describing binary container.
//!
//! File layout:
//! - 8 bytes magic `ADCCONT1`
//! - u64 little-endian header length
//! - JSON header listing every dataset (path, dtype, shape, payload offset, byte length)
//! - concatenated payloads, elements in row-major order, little-endian
//!
//! Readers memory-map the file so a column range of a large dataset can be
//! copied out without touching the rest.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::mem::size_of;
use std::ops::Range;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

use super::error::ContainerError;
use super::tensor::{DType, Element, Tensor, WritePlan};

const _: () = assert!(
    cfg!(target_endian = "little"),
    "the native container stores payloads in host byte order, which must be little-endian"
);

const MAGIC: &[u8; 8] = b"ADCCONT1";
const PREAMBLE_LEN: usize = MAGIC.len() + size_of::<u64>();

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    path: String,
    dtype: DType,
    shape: Vec<usize>,
    /// Byte offset relative to the start of the payload section.
    offset: usize,
    /// Payload length in bytes.
    len: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    datasets: Vec<Entry>,
}

fn io_error(path: &Path, source: std::io::Error) -> ContainerError {
    ContainerError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn payload_len(tensor: &Tensor) -> usize {
    match tensor {
        Tensor::Text(s) => s.len(),
        other => other.shape().iter().product::<usize>() * other.dtype().size(),
    }
}

fn write_elements<T: Element, W: Write>(writer: &mut W, array: &ArrayD<T>) -> std::io::Result<()> {
    match array.as_slice() {
        Some(slice) => writer.write_all(bytemuck::cast_slice(slice)),
        None => {
            let contiguous: Vec<T> = array.iter().copied().collect();
            writer.write_all(bytemuck::cast_slice(&contiguous))
        }
    }
}

/// Writes `plan` to `path`.
///
/// Data goes to a sibling `.partial` file first and is renamed into place,
/// so an interrupted writer never leaves a truncated output under `path`.
pub(super) fn write(path: &Path, plan: &WritePlan) -> Result<(), ContainerError> {
    let mut offset = 0;
    let datasets = plan
        .iter()
        .map(|dataset| {
            let len = payload_len(&dataset.tensor);
            let entry = Entry {
                path: dataset.path.clone(),
                dtype: dataset.tensor.dtype(),
                shape: dataset.tensor.shape(),
                offset,
                len,
            };
            offset += len;
            entry
        })
        .collect();
    let header = serde_json::to_vec(&Header { datasets }).map_err(|e| ContainerError::Malformed {
        path: path.to_path_buf(),
        reason: format!("header serialization failed: {e}"),
    })?;

    let partial = partial_path(path);
    let file = File::create(&partial).map_err(|e| io_error(&partial, e))?;
    let mut writer = BufWriter::new(file);

    let result = (|| -> std::io::Result<()> {
        writer.write_all(MAGIC)?;
        writer.write_all(&(header.len() as u64).to_le_bytes())?;
        writer.write_all(&header)?;
        for dataset in plan {
            match &dataset.tensor {
                Tensor::U8(a) => write_elements(&mut writer, a)?,
                Tensor::U16(a) => write_elements(&mut writer, a)?,
                Tensor::U32(a) => write_elements(&mut writer, a)?,
                Tensor::F32(a) => write_elements(&mut writer, a)?,
                Tensor::F64(a) => write_elements(&mut writer, a)?,
                Tensor::Text(s) => writer.write_all(s.as_bytes())?,
            }
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&partial);
        return Err(io_error(&partial, e));
    }
    drop(writer);

    fs::rename(&partial, path).map_err(|e| io_error(path, e))
}

pub(super) fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".partial");
    PathBuf::from(name)
}

/// Read access to a native container file.
#[derive(Debug)]
pub(super) struct NativeReader {
    path: PathBuf,
    mmap: Mmap,
    entries: Vec<Entry>,
    payload_start: usize,
}

impl NativeReader {
    pub(super) fn open(path: &Path) -> Result<Self, ContainerError> {
        let file = File::open(path).map_err(|e| io_error(path, e))?;
        let mmap = unsafe { Mmap::map(&file).map_err(|e| io_error(path, e))? };

        let malformed = |reason: String| ContainerError::Malformed {
            path: path.to_path_buf(),
            reason,
        };

        if mmap.len() < PREAMBLE_LEN || &mmap[..MAGIC.len()] != MAGIC {
            return Err(malformed("missing container magic".to_string()));
        }
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&mmap[MAGIC.len()..PREAMBLE_LEN]);
        let header_len = u64::from_le_bytes(len_bytes) as usize;
        let payload_start = PREAMBLE_LEN
            .checked_add(header_len)
            .filter(|&end| end <= mmap.len())
            .ok_or_else(|| malformed(format!("header length {header_len} exceeds file size")))?;

        let header: Header = serde_json::from_slice(&mmap[PREAMBLE_LEN..payload_start])
            .map_err(|e| malformed(format!("invalid header: {e}")))?;

        let payload_len = mmap.len() - payload_start;
        for entry in &header.datasets {
            let in_bounds =
                matches!(entry.offset.checked_add(entry.len), Some(end) if end <= payload_len);
            if !in_bounds {
                return Err(malformed(format!(
                    "dataset '{}' extends past end of file",
                    entry.path
                )));
            }
            if entry.dtype != DType::Text
                && entry.shape.iter().product::<usize>() * entry.dtype.size() != entry.len
            {
                return Err(malformed(format!(
                    "dataset '{}' length does not match its shape",
                    entry.path
                )));
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            mmap,
            entries: header.datasets,
            payload_start,
        })
    }

    pub(super) fn dataset_paths(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.path.clone()).collect()
    }

    pub(super) fn contains(&self, dataset: &str) -> bool {
        self.entries.iter().any(|e| e.path == dataset)
    }

    pub(super) fn shape(&self, dataset: &str) -> Result<Vec<usize>, ContainerError> {
        Ok(self.entry(dataset)?.shape.clone())
    }

    pub(super) fn read(&self, dataset: &str) -> Result<Tensor, ContainerError> {
        let entry = self.entry(dataset)?;
        let full = 0..entry.shape.last().copied().unwrap_or(0);
        match entry.dtype {
            DType::Text => {
                let text = String::from_utf8(self.bytes(entry).to_vec()).map_err(|e| {
                    ContainerError::Malformed {
                        path: self.path.clone(),
                        reason: format!("dataset '{dataset}' is not valid UTF-8: {e}"),
                    }
                })?;
                Ok(Tensor::Text(text))
            }
            _ if entry.shape.is_empty() => self.read_last_axis(entry, 0..0, true),
            _ => self.read_last_axis(entry, full, false),
        }
    }

    pub(super) fn read_cols(
        &self,
        dataset: &str,
        cols: Range<usize>,
    ) -> Result<Tensor, ContainerError> {
        let entry = self.entry(dataset)?;
        let len = entry.shape.last().copied().unwrap_or(0);
        if entry.dtype == DType::Text
            || entry.shape.is_empty()
            || cols.start > cols.end
            || cols.end > len
        {
            return Err(ContainerError::RangeOutOfBounds {
                path: self.path.clone(),
                dataset: dataset.to_string(),
                start: cols.start,
                end: cols.end,
                len,
            });
        }
        self.read_last_axis(entry, cols, false)
    }

    fn read_last_axis(
        &self,
        entry: &Entry,
        cols: Range<usize>,
        scalar: bool,
    ) -> Result<Tensor, ContainerError> {
        Ok(match entry.dtype {
            DType::U8 => Tensor::U8(self.copy_cols::<u8>(entry, cols, scalar)?),
            DType::U16 => Tensor::U16(self.copy_cols::<u16>(entry, cols, scalar)?),
            DType::U32 => Tensor::U32(self.copy_cols::<u32>(entry, cols, scalar)?),
            DType::F32 => Tensor::F32(self.copy_cols::<f32>(entry, cols, scalar)?),
            DType::F64 => Tensor::F64(self.copy_cols::<f64>(entry, cols, scalar)?),
            DType::Text => unreachable!("text datasets are handled by the caller"),
        })
    }

    /// Copies the `cols` slice of the last axis into a new array.
    fn copy_cols<T: Element>(
        &self,
        entry: &Entry,
        cols: Range<usize>,
        scalar: bool,
    ) -> Result<ArrayD<T>, ContainerError> {
        let bytes = self.bytes(entry);
        let size = size_of::<T>();

        let (shape, out) = if scalar {
            let mut out = vec![T::zeroed(); 1];
            bytemuck::cast_slice_mut::<T, u8>(&mut out).copy_from_slice(&bytes[..size]);
            (Vec::new(), out)
        } else {
            let last = *entry.shape.last().unwrap_or(&0);
            let outer: usize = entry.shape[..entry.shape.len() - 1].iter().product();
            let width = cols.len();
            let mut out = vec![T::zeroed(); outer * width];
            {
                let out_bytes = bytemuck::cast_slice_mut::<T, u8>(&mut out);
                let row_bytes = width * size;
                for o in 0..outer {
                    let src = (o * last + cols.start) * size;
                    let dst = o * row_bytes;
                    out_bytes[dst..dst + row_bytes].copy_from_slice(&bytes[src..src + row_bytes]);
                }
            }
            let mut shape = entry.shape.clone();
            if let Some(l) = shape.last_mut() {
                *l = width;
            }
            (shape, out)
        };

        ArrayD::from_shape_vec(IxDyn(&shape), out).map_err(|e| ContainerError::Malformed {
            path: self.path.clone(),
            reason: format!("dataset '{}' shape error: {e}", entry.path),
        })
    }

    fn entry(&self, dataset: &str) -> Result<&Entry, ContainerError> {
        self.entries
            .iter()
            .find(|e| e.path == dataset)
            .ok_or_else(|| ContainerError::MissingDataset {
                path: self.path.clone(),
                dataset: dataset.to_string(),
            })
    }

    fn bytes(&self, entry: &Entry) -> &[u8] {
        let start = self.payload_start + entry.offset;
        &self.mmap[start..start + entry.len]
    }
}
