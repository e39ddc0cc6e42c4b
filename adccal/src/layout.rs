//! Mapping between the physical sensor row and the acquisition `(adc, group)` pair.
//!
//! Rows are read out by `n_adc` ADCs in parallel, one row per ADC per group:
//! `row = group * n_adc + adc`. Gathered codes are kept as
//! `[adc, col, frame, group]` so that every pixel's frame series is one lane.

use ndarray::{Array2, Array3, Array4, ArrayBase, Data, Ix2, Ix3, Ix4};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LayoutError {
    #[error("ADC count must be positive")]
    ZeroAdc,

    #[error("{rows} rows cannot be split into groups of {n_adc} ADCs")]
    RowsNotDivisible { rows: usize, n_adc: usize },

    #[error("Expected a {expected}-dimensional tensor, got shape {actual:?}")]
    Rank { expected: usize, actual: Vec<usize> },
}

#[inline]
pub fn physical_row(adc: usize, group: usize, n_adc: usize) -> usize {
    group * n_adc + adc
}

/// Number of row groups for `rows` physical rows.
pub fn group_count(rows: usize, n_adc: usize) -> Result<usize, LayoutError> {
    if n_adc == 0 {
        return Err(LayoutError::ZeroAdc);
    }
    if rows % n_adc != 0 {
        return Err(LayoutError::RowsNotDivisible { rows, n_adc });
    }
    Ok(rows / n_adc)
}

/// `[frame, row, col]` to `[adc, col, frame, group]`.
pub fn to_acquisition_frames<S, T>(
    data: &ArrayBase<S, Ix3>,
    n_adc: usize,
) -> Result<Array4<T>, LayoutError>
where
    S: Data<Elem = T>,
    T: Clone,
{
    let (frames, rows, cols) = data.dim();
    let groups = group_count(rows, n_adc)?;
    Ok(Array4::from_shape_fn(
        (n_adc, cols, frames, groups),
        |(adc, col, frame, group)| data[[frame, physical_row(adc, group, n_adc), col]].clone(),
    ))
}

/// `[adc, col, frame, group]` to `[row, col, frame]`.
pub fn to_physical_frames<S, T>(data: &ArrayBase<S, Ix4>) -> Array3<T>
where
    S: Data<Elem = T>,
    T: Clone,
{
    let (n_adc, cols, frames, groups) = data.dim();
    Array3::from_shape_fn((groups * n_adc, cols, frames), |(row, col, frame)| {
        data[[row % n_adc, col, frame, row / n_adc]].clone()
    })
}

/// `[adc, col, group]` to `[row, col]`.
pub fn to_physical<S, T>(data: &ArrayBase<S, Ix3>) -> Array2<T>
where
    S: Data<Elem = T>,
    T: Clone,
{
    let (n_adc, cols, groups) = data.dim();
    Array2::from_shape_fn((groups * n_adc, cols), |(row, col)| {
        data[[row % n_adc, col, row / n_adc]].clone()
    })
}

/// `[row, col]` to `[adc, col, group]`.
pub fn to_acquisition<S, T>(
    data: &ArrayBase<S, Ix2>,
    n_adc: usize,
) -> Result<Array3<T>, LayoutError>
where
    S: Data<Elem = T>,
    T: Clone,
{
    let (rows, cols) = data.dim();
    let groups = group_count(rows, n_adc)?;
    Ok(Array3::from_shape_fn((n_adc, cols, groups), |(adc, col, group)| {
        data[[physical_row(adc, group, n_adc), col]].clone()
    }))
}

/// Converts a dynamic-rank array into a fixed rank, reporting the shape on failure.
pub fn fixed_rank<T, D>(array: ndarray::ArrayD<T>) -> Result<ndarray::Array<T, D>, LayoutError>
where
    D: ndarray::Dimension,
{
    let actual = array.shape().to_vec();
    array
        .into_dimensionality::<D>()
        .map_err(|_| LayoutError::Rank {
            expected: D::NDIM.unwrap_or(0),
            actual,
        })
}
