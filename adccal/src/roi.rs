//! Selection of the frames that take part in a fit.
//!
//! Both rules look at the coarse code series of a pixel. The coarse fit uses
//! the frames whose code lies inside an open band; the fine fit uses the
//! frames whose coarse code equals a single marker value.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Open interval of coarse codes, `low < code < high`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "[u16; 2]", into = "[u16; 2]")]
pub struct CoarseBand {
    low: u16,
    high: u16,
}

impl CoarseBand {
    pub fn new(low: u16, high: u16) -> Result<Self, String> {
        if low >= high {
            return Err(format!("coarse range lower bound {low} must be below upper bound {high}"));
        }
        Ok(Self { low, high })
    }

    pub fn low(&self) -> u16 {
        self.low
    }

    pub fn high(&self) -> u16 {
        self.high
    }

    #[inline]
    pub fn contains(&self, code: u8) -> bool {
        let code = u16::from(code);
        self.low < code && code < self.high
    }
}

impl TryFrom<[u16; 2]> for CoarseBand {
    type Error = String;

    fn try_from([low, high]: [u16; 2]) -> Result<Self, Self::Error> {
        Self::new(low, high)
    }
}

impl From<CoarseBand> for [u16; 2] {
    fn from(band: CoarseBand) -> Self {
        [band.low, band.high]
    }
}

/// How the fine-fit marker is chosen for a pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinePolicy {
    /// Frames whose coarse code equals this value.
    Fixed(u8),
    /// Frames whose coarse code equals the pixel's most frequent coarse code.
    Mode,
}

impl fmt::Display for FinePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinePolicy::Fixed(v) => write!(f, "{v}"),
            FinePolicy::Mode => f.write_str("mode"),
        }
    }
}

/// Frame selection rule for one ADC part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoiRule {
    Coarse(CoarseBand),
    Fine(FinePolicy),
}

/// Frames selected for one pixel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roi {
    /// Ascending frame indices.
    pub frames: Vec<usize>,
    /// Coarse value the fine selection matched against. `None` for band
    /// selection and for a mode lookup on an empty series.
    pub marker: Option<u8>,
}

/// Indices where `low < code < high`, ascending.
pub fn select_coarse<'a>(coarse: impl IntoIterator<Item = &'a u8>, band: CoarseBand) -> Vec<usize> {
    coarse
        .into_iter()
        .enumerate()
        .filter(|&(_, &code)| band.contains(code))
        .map(|(i, _)| i)
        .collect()
}

/// Most frequent coarse code. Ties go to the smallest value.
pub fn coarse_mode<'a>(coarse: impl IntoIterator<Item = &'a u8>) -> Option<u8> {
    let mut histogram = [0usize; 256];
    let mut any = false;
    for &code in coarse {
        histogram[code as usize] += 1;
        any = true;
    }
    if !any {
        return None;
    }
    let mut best = 0usize;
    for (value, &count) in histogram.iter().enumerate() {
        if count > histogram[best] {
            best = value;
        }
    }
    Some(best as u8)
}

/// Indices where the coarse code equals `marker`, ascending.
pub fn select_fine<'a>(coarse: impl IntoIterator<Item = &'a u8>, marker: u8) -> Vec<usize> {
    coarse
        .into_iter()
        .enumerate()
        .filter(|&(_, &code)| code == marker)
        .map(|(i, _)| i)
        .collect()
}

/// Applies `rule` to a coarse code series.
pub fn select(coarse: &[u8], rule: RoiRule) -> Roi {
    match rule {
        RoiRule::Coarse(band) => Roi {
            frames: select_coarse(coarse, band),
            marker: None,
        },
        RoiRule::Fine(policy) => {
            let marker = match policy {
                FinePolicy::Fixed(value) => Some(value),
                FinePolicy::Mode => coarse_mode(coarse),
            };
            Roi {
                frames: marker.map(|m| select_fine(coarse, m)).unwrap_or_default(),
                marker,
            }
        }
    }
}
