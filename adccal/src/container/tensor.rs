//! Typed datasets and the write plan shared by every stage.

use ndarray::{ArrayD, Dimension};
use serde::{Deserialize, Serialize};
use strum_macros::Display;

/// Element type of a stored dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DType {
    U8,
    U16,
    U32,
    F32,
    F64,
    Text,
}

impl DType {
    /// Size of one element in bytes. Text is stored as raw UTF-8.
    pub fn size(self) -> usize {
        match self {
            DType::U8 | DType::Text => 1,
            DType::U16 => 2,
            DType::U32 | DType::F32 => 4,
            DType::F64 => 8,
        }
    }
}

/// A dense n-dimensional dataset or a text scalar.
#[derive(Debug, Clone, PartialEq)]
pub enum Tensor {
    U8(ArrayD<u8>),
    U16(ArrayD<u16>),
    U32(ArrayD<u32>),
    F32(ArrayD<f32>),
    F64(ArrayD<f64>),
    Text(String),
}

impl Tensor {
    pub fn dtype(&self) -> DType {
        match self {
            Tensor::U8(_) => DType::U8,
            Tensor::U16(_) => DType::U16,
            Tensor::U32(_) => DType::U32,
            Tensor::F32(_) => DType::F32,
            Tensor::F64(_) => DType::F64,
            Tensor::Text(_) => DType::Text,
        }
    }

    /// Shape of the dataset. Text scalars have an empty shape.
    pub fn shape(&self) -> Vec<usize> {
        match self {
            Tensor::U8(a) => a.shape().to_vec(),
            Tensor::U16(a) => a.shape().to_vec(),
            Tensor::U32(a) => a.shape().to_vec(),
            Tensor::F32(a) => a.shape().to_vec(),
            Tensor::F64(a) => a.shape().to_vec(),
            Tensor::Text(_) => Vec::new(),
        }
    }

    /// Converts any numeric dataset to `f64`. Returns `None` for text.
    pub fn to_f64(&self) -> Option<ArrayD<f64>> {
        match self {
            Tensor::U8(a) => Some(a.mapv(f64::from)),
            Tensor::U16(a) => Some(a.mapv(f64::from)),
            Tensor::U32(a) => Some(a.mapv(f64::from)),
            Tensor::F32(a) => Some(a.mapv(f64::from)),
            Tensor::F64(a) => Some(a.clone()),
            Tensor::Text(_) => None,
        }
    }
}

impl From<String> for Tensor {
    fn from(value: String) -> Self {
        Tensor::Text(value)
    }
}

impl From<&str> for Tensor {
    fn from(value: &str) -> Self {
        Tensor::Text(value.to_string())
    }
}

/// Numeric element types that can be stored in a container.
pub trait Element: bytemuck::Pod + Default + Send + Sync + 'static {
    const DTYPE: DType;

    fn wrap(array: ArrayD<Self>) -> Tensor;

    /// Returns the array if the tensor holds exactly this element type.
    fn unwrap(tensor: Tensor) -> Option<ArrayD<Self>>;
}

macro_rules! impl_element {
    ($ty:ty, $variant:ident) => {
        impl Element for $ty {
            const DTYPE: DType = DType::$variant;

            fn wrap(array: ArrayD<Self>) -> Tensor {
                Tensor::$variant(array)
            }

            fn unwrap(tensor: Tensor) -> Option<ArrayD<Self>> {
                match tensor {
                    Tensor::$variant(a) => Some(a),
                    _ => None,
                }
            }
        }

        impl<D: Dimension> From<ndarray::Array<$ty, D>> for Tensor {
            fn from(array: ndarray::Array<$ty, D>) -> Self {
                Tensor::$variant(array.into_dyn())
            }
        }
    };
}

impl_element!(u8, U8);
impl_element!(u16, U16);
impl_element!(u32, U32);
impl_element!(f32, F32);
impl_element!(f64, F64);

/// One named dataset of a write plan.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    /// Slash-separated hierarchical path, e.g. `sample/coarse/slope`.
    pub path: String,
    pub tensor: Tensor,
}

/// Ordered list of datasets a stage wants written to its output file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WritePlan {
    datasets: Vec<Dataset>,
}

impl WritePlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, path: impl Into<String>, tensor: impl Into<Tensor>) {
        self.datasets.push(Dataset {
            path: path.into(),
            tensor: tensor.into(),
        });
    }

    pub fn extend(&mut self, other: WritePlan) {
        self.datasets.extend(other.datasets);
    }

    pub fn get(&self, path: &str) -> Option<&Tensor> {
        self.datasets
            .iter()
            .find(|d| d.path == path)
            .map(|d| &d.tensor)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Dataset> {
        self.datasets.iter()
    }

    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }

    /// First path that appears more than once, if any.
    pub fn duplicate_path(&self) -> Option<&str> {
        self.datasets.iter().enumerate().find_map(|(i, d)| {
            self.datasets[..i]
                .iter()
                .any(|prev| prev.path == d.path)
                .then_some(d.path.as_str())
        })
    }
}

impl<'a> IntoIterator for &'a WritePlan {
    type Item = &'a Dataset;
    type IntoIter = std::slice::Iter<'a, Dataset>;

    fn into_iter(self) -> Self::IntoIter {
        self.datasets.iter()
    }
}
