//! Input voltage sweep: the register file and per-frame Vin expansion.

use std::path::Path;

use crate::config::ConfigError;
use crate::error::{Error, Result};

/// One line of the register file: a Vin value and the prefix of its raw files.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterEntry {
    pub vin: f64,
    pub prefix: String,
}

/// Parses `<vin>\t<prefix>` lines, sorted by ascending Vin.
///
/// Blank lines and lines starting with `#` are skipped. Fields may be
/// separated by any whitespace.
pub fn parse_register(text: &str) -> std::result::Result<Vec<RegisterEntry>, ConfigError> {
    let mut entries = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let invalid = |reason: String| ConfigError::InvalidValue {
            key: format!("register file line {}", line_no + 1),
            reason,
        };
        let mut fields = line.split_whitespace();
        let (Some(vin), Some(prefix), None) = (fields.next(), fields.next(), fields.next()) else {
            return Err(invalid(format!("expected '<vin> <prefix>', got '{line}'")));
        };
        let vin: f64 = vin
            .parse()
            .map_err(|_| invalid(format!("'{vin}' is not a number")))?;
        if !vin.is_finite() {
            return Err(invalid(format!("Vin must be finite, got '{vin}'")));
        }
        entries.push(RegisterEntry {
            vin,
            prefix: prefix.to_string(),
        });
    }
    entries.sort_by(|a, b| a.vin.total_cmp(&b.vin).then_with(|| a.prefix.cmp(&b.prefix)));
    Ok(entries)
}

pub fn read_register(path: &Path) -> Result<Vec<RegisterEntry>> {
    let text = std::fs::read_to_string(path).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(parse_register(&text)?)
}

/// Vin values of a sweep together with the number of frames recorded per value.
#[derive(Debug, Clone, PartialEq)]
pub struct VinSweep {
    vin: Vec<f64>,
    frames_per_run: Vec<usize>,
}

impl VinSweep {
    pub fn new(vin: Vec<f64>, frames_per_run: Vec<usize>) -> Result<Self> {
        if vin.len() != frames_per_run.len() {
            return Err(Error::RunCountMismatch {
                vin: vin.len(),
                runs: frames_per_run.len(),
            });
        }
        Ok(Self {
            vin,
            frames_per_run,
        })
    }

    pub fn vin(&self) -> &[f64] {
        &self.vin
    }

    pub fn frames_per_run(&self) -> &[usize] {
        &self.frames_per_run
    }

    pub fn n_frames(&self) -> usize {
        self.frames_per_run.iter().sum()
    }

    /// Frame index at which each run starts.
    pub fn run_offsets(&self) -> Vec<usize> {
        self.frames_per_run
            .iter()
            .scan(0, |acc, &n| {
                let start = *acc;
                *acc += n;
                Some(start)
            })
            .collect()
    }

    /// One Vin per frame, each run's value repeated for its frame count.
    pub fn expand(&self) -> Vec<f64> {
        self.expand_repeated(1)
    }

    /// One Vin per `(frame, group)` pair in frame-major order.
    pub fn expand_repeated(&self, per_frame: usize) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.n_frames() * per_frame);
        for (&v, &n) in self.vin.iter().zip(&self.frames_per_run) {
            out.extend(std::iter::repeat(v).take(n * per_frame));
        }
        out
    }

    /// [`VinSweep::expand`] checked against the length of the frame axis.
    pub fn expand_for(&self, frame_axis_len: usize) -> Result<Vec<f64>> {
        let expected = self.n_frames();
        if expected != frame_axis_len {
            return Err(Error::FrameCountMismatch {
                expected,
                actual: frame_axis_len,
            });
        }
        Ok(self.expand())
    }
}
