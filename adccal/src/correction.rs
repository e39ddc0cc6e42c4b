//! Correction stage: applies fitted constants to a raw acquisition.
//!
//! For every pixel and frame
//!
//! ```text
//! coarse_lin = (coarse - coarse_offset) / coarse_slope * coarse_scale
//! fine_lin   = (fine   - fine_offset)   / fine_slope   * fine_scale
//! value      = coarse_lin - fine_lin + adu_max_offset
//! ```
//!
//! Non-finite values (zero or `NaN` slopes) are stored as `NaN`. The CDS
//! output is `sample[f + 1] - reset[f]`.

use std::path::Path;

use ndarray::{s, Array2, Array3, ArrayBase, Data, Ix2, Ix3, Zip};
use tracing::{info, warn};

use crate::codec::BitLayout;
use crate::config::{Channel, CorrectionConfig, Part};
use crate::container::{Container, ContainerError, WritePlan};
use crate::error::{Error, Result};
use crate::layout;
use crate::metadata::collection_path;
use crate::stage::Stage;

/// Scale constants of the linearization formula.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorrectionConstants {
    pub coarse_scale: f64,
    pub fine_scale: f64,
    pub adu_max_offset: f64,
}

impl CorrectionConstants {
    /// `-adu_max / 2`, `adu_max` and `adu_max`.
    pub fn from_adu_max(adu_max: f64) -> Self {
        Self {
            coarse_scale: -adu_max / 2.0,
            fine_scale: adu_max,
            adu_max_offset: adu_max,
        }
    }

    #[inline]
    pub fn linearize(&self, coarse: f64, fine: f64, pixel: &PixelConstants) -> f64 {
        let coarse_lin = (coarse - pixel.coarse_offset) / pixel.coarse_slope * self.coarse_scale;
        let fine_lin = (fine - pixel.fine_offset) / pixel.fine_slope * self.fine_scale;
        let value = coarse_lin - fine_lin + self.adu_max_offset;
        if value.is_finite() {
            value
        } else {
            f64::NAN
        }
    }
}

impl Default for CorrectionConstants {
    fn default() -> Self {
        Self::from_adu_max(4095.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelConstants {
    pub coarse_slope: f64,
    pub coarse_offset: f64,
    pub fine_slope: f64,
    pub fine_offset: f64,
}

/// Per-pixel constants of one channel in physical `[row, col]` layout.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelConstants {
    pub coarse_slope: Array2<f64>,
    pub coarse_offset: Array2<f64>,
    pub fine_slope: Array2<f64>,
    pub fine_offset: Array2<f64>,
}

impl ChannelConstants {
    pub fn contains(file: &Container, channel: Channel) -> bool {
        [Part::Coarse, Part::Fine].iter().all(|part| {
            file.contains(&format!("{channel}/{part}/slope"))
                && file.contains(&format!("{channel}/{part}/offset"))
        })
    }

    /// Reads constants stored either as `[row, col]` or as `[adc, col, group]`.
    pub fn read(file: &Container, channel: Channel, n_adc: usize) -> Result<Self> {
        let read = |part: Part, name: &str| -> Result<Array2<f64>> {
            let dataset = format!("{channel}/{part}/{name}");
            let data = file.read_f64(&dataset)?;
            match data.ndim() {
                2 => Ok(layout::fixed_rank::<f64, Ix2>(data)?),
                3 => {
                    let acquisition = layout::fixed_rank::<f64, Ix3>(data)?;
                    if acquisition.dim().0 != n_adc {
                        return Err(ContainerError::ShapeMismatch {
                            path: file.path().to_path_buf(),
                            dataset,
                            expected: format!("[{n_adc}, col, group]"),
                            actual: acquisition.shape().to_vec(),
                        }
                        .into());
                    }
                    Ok(layout::to_physical(&acquisition))
                }
                _ => Err(ContainerError::ShapeMismatch {
                    path: file.path().to_path_buf(),
                    dataset,
                    expected: "[row, col] or [adc, col, group]".to_string(),
                    actual: data.shape().to_vec(),
                }
                .into()),
            }
        };

        let constants = Self {
            coarse_slope: read(Part::Coarse, "slope")?,
            coarse_offset: read(Part::Coarse, "offset")?,
            fine_slope: read(Part::Fine, "slope")?,
            fine_offset: read(Part::Fine, "offset")?,
        };
        let dim = constants.coarse_slope.dim();
        for (name, array) in [
            ("coarse/offset", &constants.coarse_offset),
            ("fine/slope", &constants.fine_slope),
            ("fine/offset", &constants.fine_offset),
        ] {
            if array.dim() != dim {
                return Err(ContainerError::ShapeMismatch {
                    path: file.path().to_path_buf(),
                    dataset: format!("{channel}/{name}"),
                    expected: format!("{:?}", [dim.0, dim.1]),
                    actual: array.shape().to_vec(),
                }
                .into());
            }
        }
        Ok(constants)
    }

    pub fn dim(&self) -> (usize, usize) {
        self.coarse_slope.dim()
    }

    #[inline]
    pub fn pixel(&self, row: usize, col: usize) -> PixelConstants {
        PixelConstants {
            coarse_slope: self.coarse_slope[[row, col]],
            coarse_offset: self.coarse_offset[[row, col]],
            fine_slope: self.fine_slope[[row, col]],
            fine_offset: self.fine_offset[[row, col]],
        }
    }
}

/// Linearizes raw `[frame, row, col]` words of one channel.
pub fn correct_frames<S>(
    raw: &ArrayBase<S, Ix3>,
    bits: BitLayout,
    constants: &ChannelConstants,
    scale: &CorrectionConstants,
) -> Result<Array3<f32>>
where
    S: Data<Elem = u16>,
{
    let (frames, rows, cols) = raw.dim();
    if constants.dim() != (rows, cols) {
        let (c_rows, c_cols) = constants.dim();
        return Err(Error::ConstantsShapeMismatch {
            constants: vec![c_rows, c_cols],
            frames: vec![frames, rows, cols],
        });
    }

    let mut out = Array3::<f32>::zeros((frames, rows, cols));
    Zip::indexed(&mut out)
        .and(raw)
        .for_each(|(_, row, col), value, &word| {
            let code = bits.split(word);
            let pixel = constants.pixel(row, col);
            *value = scale.linearize(f64::from(code.coarse), f64::from(code.fine), &pixel) as f32;
        });
    Ok(out)
}

/// `sample[f + 1] - reset[f]` over `frames - 1` frames.
pub fn cds(sample: &Array3<f32>, reset: &Array3<f32>) -> Array3<f32> {
    let frames = sample.dim().0.min(reset.dim().0);
    if frames < 2 {
        let (_, rows, cols) = sample.dim();
        return Array3::zeros((0, rows, cols));
    }
    &sample.slice(s![1..frames, .., ..]) - &reset.slice(s![..frames - 1, .., ..])
}

fn count_nan(data: &Array3<f32>) -> usize {
    data.iter().filter(|v| v.is_nan()).count()
}

#[derive(Debug)]
struct Corrected {
    sample: Array3<f32>,
    reset: Array3<f32>,
    cds: Array3<f32>,
    gain: Array3<u8>,
    frames_per_run: Vec<u32>,
}

pub struct CorrectionStage {
    config: CorrectionConfig,
    raw_sample: Option<Array3<u16>>,
    raw_reset: Option<Array3<u16>>,
    sample_constants: Option<ChannelConstants>,
    reset_constants: Option<ChannelConstants>,
    frames_per_run: Vec<u32>,
    result: Option<Corrected>,
}

impl CorrectionStage {
    pub fn new(config: CorrectionConfig) -> Self {
        Self {
            config,
            raw_sample: None,
            raw_reset: None,
            sample_constants: None,
            reset_constants: None,
            frames_per_run: Vec::new(),
            result: None,
        }
    }

    fn read_raw(file: &Container, dataset: &str) -> Result<Array3<u16>> {
        let raw = file.read_as::<u16>(dataset)?;
        Ok(layout::fixed_rank::<u16, Ix3>(raw)?)
    }
}

impl Stage for CorrectionStage {
    fn name(&self) -> &'static str {
        "correction"
    }

    fn method(&self) -> String {
        self.config.method.to_string()
    }

    fn output_path(&self) -> &Path {
        &self.config.output_file
    }

    fn initiate(&mut self) -> Result<()> {
        info!(
            data = %self.config.data_file.display(),
            constants = %self.config.constants_file.display(),
            "Loading raw data and constants"
        );
        let data = Container::open(&self.config.data_file)?;
        let sample = Self::read_raw(&data, &self.config.sample_path)?;
        let reset = Self::read_raw(&data, &self.config.reset_path)?;

        let frames_path = collection_path("n_frames_per_run");
        self.frames_per_run = if data.contains(&frames_path) {
            data.read_f64(&frames_path)?.iter().map(|&n| n as u32).collect()
        } else {
            vec![sample.dim().0 as u32]
        };

        let constants_file = Container::open(&self.config.constants_file)?;
        let n_adc = self.config.detector.n_adc;
        let sample_constants = ChannelConstants::read(&constants_file, Channel::Sample, n_adc)?;
        let reset_constants = if ChannelConstants::contains(&constants_file, Channel::Reset) {
            ChannelConstants::read(&constants_file, Channel::Reset, n_adc)?
        } else {
            warn!("No reset constants found, correcting reset with sample constants");
            sample_constants.clone()
        };

        self.raw_sample = Some(sample);
        self.raw_reset = Some(reset);
        self.sample_constants = Some(sample_constants);
        self.reset_constants = Some(reset_constants);
        Ok(())
    }

    fn calculate(&mut self) -> Result<()> {
        let not_initiated = || Error::StageOrder {
            stage: "correction",
            action: "calculate",
            requires: "initiated",
        };
        let raw_sample = self.raw_sample.as_ref().ok_or_else(not_initiated)?;
        let raw_reset = self.raw_reset.as_ref().ok_or_else(not_initiated)?;
        let sample_constants = self.sample_constants.as_ref().ok_or_else(not_initiated)?;
        let reset_constants = self.reset_constants.as_ref().ok_or_else(not_initiated)?;

        let bits = self.config.detector.bits;
        let scale = &self.config.constants;
        let sample = correct_frames(raw_sample, bits, sample_constants, scale)?;
        let reset = correct_frames(raw_reset, bits, reset_constants, scale)?;
        for (channel, data) in [(Channel::Sample, &sample), (Channel::Reset, &reset)] {
            let nan = count_nan(data);
            if nan > 0 {
                let total = data.len();
                warn!(channel = %channel, nan, total, "Pixels without valid correction");
            }
        }

        let cds = cds(&sample, &reset);
        let gain = self.config.detector.bits.split_array(raw_sample).gain;
        info!(frames = sample.dim().0, cds_frames = cds.dim().0, "Correction done");

        self.result = Some(Corrected {
            sample,
            reset,
            cds,
            gain,
            frames_per_run: self.frames_per_run.clone(),
        });
        Ok(())
    }

    fn write_plan(&self) -> Result<WritePlan> {
        let corrected = self.result.as_ref().ok_or(Error::StageOrder {
            stage: "correction",
            action: "write",
            requires: "calculated",
        })?;

        let mut plan = WritePlan::new();
        plan.push("sample/adc_corrected", corrected.sample.clone());
        plan.push("reset/adc_corrected", corrected.reset.clone());
        plan.push("cds/cds", corrected.cds.clone());
        plan.push("gain/gain", corrected.gain.clone());
        plan.push(
            collection_path("n_frames_per_run"),
            ndarray::Array1::from(corrected.frames_per_run.clone()),
        );
        plan.push(
            collection_path("data_file"),
            self.config.data_file.display().to_string(),
        );
        plan.push(
            collection_path("constants_file"),
            self.config.constants_file.display().to_string(),
        );
        let scale = &self.config.constants;
        plan.push(
            collection_path("scale_constants"),
            ndarray::arr1(&[scale.coarse_scale, scale.fine_scale, scale.adu_max_offset]),
        );
        Ok(plan)
    }
}
