//! Process stage: per-pixel linear fits of coarse and fine codes against Vin.
//!
//! The gathered block is `[adc, col, frame, group]`. For every requested
//! channel and part the ROI rule picks frames from the coarse series, the
//! selected `(vin, code)` pairs are fitted and the constants are written as
//! `{channel}/{part}/{slope,offset,...}`. Pixels that cannot be fitted get
//! `NaN` constants.

use std::path::{Path, PathBuf};

use ndarray::{s, Array3, Array4, ArrayView2, Ix4};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::config::{Channel, OffsetReference, OutputLayout, Part, PartRule, ProcessConfig};
use crate::container::{Container, ContainerError, Tensor, WritePlan};
use crate::error::{Error, Result};
use crate::fit::{fit_linear, LinearFit};
use crate::layout;
use crate::metadata::collection_path;
use crate::roi::{self, RoiRule};
use crate::stage::{ProcessMethod, Stage};
use crate::sweep::VinSweep;

/// How many pixels share one fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitGranularity {
    /// Every `(adc, col, group)` pixel is fitted on its own.
    PerPixel,
    /// All groups of an `(adc, col)` pair are pooled into one fit and the
    /// result is broadcast to every group.
    PooledGroups,
}

/// Coarse and fine codes of one channel, `[adc, col, frame, group]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelCodes {
    pub coarse: Array4<u8>,
    pub fine: Array4<u8>,
}

impl ChannelCodes {
    fn values(&self, part: Part) -> &Array4<u8> {
        match part {
            Part::Coarse => &self.coarse,
            Part::Fine => &self.fine,
        }
    }
}

/// Fitted constants of one channel and part, `[adc, col, group]`.
#[derive(Debug, Clone, PartialEq)]
pub struct PartConstants {
    pub slope: Array3<f64>,
    pub offset: Array3<f64>,
    pub r_squared: Option<Array3<f64>>,
    /// Fine: coarse marker used, `NaN` if none. Coarse: number of ROI frames.
    pub roi: Array3<f64>,
}

impl PartConstants {
    pub fn n_fitted(&self) -> usize {
        self.slope.iter().filter(|v| v.is_finite()).count()
    }
}

#[derive(Debug, Clone, Copy)]
struct PixelFit {
    fit: LinearFit,
    roi: f64,
}

#[derive(Debug, Default)]
struct Scratch {
    coarse: Vec<u8>,
    values: Vec<u8>,
    x: Vec<f64>,
    y: Vec<f64>,
}

impl Scratch {
    fn load(&mut self, coarse: ArrayView2<'_, u8>, values: ArrayView2<'_, u8>) {
        self.coarse.clear();
        self.coarse.extend(coarse.iter().copied());
        self.values.clear();
        self.values.extend(values.iter().copied());
    }

    /// Selects the ROI from the loaded coarse series and fits the loaded values.
    fn fit(
        &mut self,
        vin: &[f64],
        rule: RoiRule,
        offset_reference: OffsetReference,
        with_r_squared: bool,
    ) -> PixelFit {
        let roi = roi::select(&self.coarse, rule);

        self.x.clear();
        self.y.clear();
        for &i in &roi.frames {
            self.x.push(vin[i]);
            self.y.push(f64::from(self.values[i]));
        }

        let mut fit = if roi.frames.is_empty() {
            LinearFit::unfit(with_r_squared)
        } else {
            fit_linear(&self.x, &self.y, with_r_squared)
                .unwrap_or_else(|_| LinearFit::unfit(with_r_squared))
        };

        if offset_reference == OffsetReference::RoiStart {
            if let Some(&x0) = self.x.first() {
                fit.offset = fit.eval(x0);
            }
        }

        let roi_value = match rule {
            RoiRule::Coarse(_) => roi.frames.len() as f64,
            RoiRule::Fine(_) => roi.marker.map(f64::from).unwrap_or(f64::NAN),
        };
        PixelFit { fit, roi: roi_value }
    }
}

/// Fits one part of one channel over every pixel of a block.
///
/// `vin` holds one value per frame for [`FitGranularity::PerPixel`] and one
/// value per `(frame, group)` pair, frame-major, for
/// [`FitGranularity::PooledGroups`].
pub fn fit_part(
    codes: &ChannelCodes,
    vin: &[f64],
    rule: PartRule,
    granularity: FitGranularity,
    offset_reference: OffsetReference,
    with_r_squared: bool,
) -> PartConstants {
    let (n_adc, n_cols, _, n_groups) = codes.coarse.dim();
    let values = codes.values(rule.part);

    let cells: Vec<Vec<PixelFit>> = (0..n_adc * n_cols)
        .into_par_iter()
        .map_init(Scratch::default, |scratch, cell| {
            let (adc, col) = (cell / n_cols, cell % n_cols);
            match granularity {
                FitGranularity::PerPixel => (0..n_groups)
                    .map(|group| {
                        scratch.load(
                            codes.coarse.slice(s![adc, col, .., group..group + 1]),
                            values.slice(s![adc, col, .., group..group + 1]),
                        );
                        scratch.fit(vin, rule.rule, offset_reference, with_r_squared)
                    })
                    .collect(),
                FitGranularity::PooledGroups => {
                    scratch.load(
                        codes.coarse.slice(s![adc, col, .., ..]),
                        values.slice(s![adc, col, .., ..]),
                    );
                    let pixel = scratch.fit(vin, rule.rule, offset_reference, with_r_squared);
                    vec![pixel; n_groups]
                }
            }
        })
        .collect();

    let shape = (n_adc, n_cols, n_groups);
    let mut out = PartConstants {
        slope: Array3::from_elem(shape, f64::NAN),
        offset: Array3::from_elem(shape, f64::NAN),
        r_squared: with_r_squared.then(|| Array3::from_elem(shape, f64::NAN)),
        roi: Array3::from_elem(shape, f64::NAN),
    };
    for (cell, pixels) in cells.into_iter().enumerate() {
        let (adc, col) = (cell / n_cols, cell % n_cols);
        for (group, pixel) in pixels.into_iter().enumerate() {
            let idx = [adc, col, group];
            out.slope[idx] = pixel.fit.slope;
            out.offset[idx] = pixel.fit.offset;
            if let (Some(r2), Some(value)) = (out.r_squared.as_mut(), pixel.fit.r_squared) {
                r2[idx] = value;
            }
            out.roi[idx] = pixel.roi;
        }
    }
    out
}

/// A gathered block as read back from disk.
#[derive(Debug)]
pub struct GatheredBlock {
    pub channels: Vec<(Channel, ChannelCodes)>,
    pub sweep: VinSweep,
    pub columns_used: Option<[u32; 2]>,
}

impl GatheredBlock {
    pub fn read(path: &Path, channels: &[Channel]) -> Result<Self> {
        let file = Container::open(path)?;

        let vin = file.read_f64("vin")?;
        let frames_per_run = file.read_f64(&collection_path("n_frames_per_run"))?;
        let sweep = VinSweep::new(
            vin.iter().copied().collect(),
            frames_per_run.iter().map(|&n| n as usize).collect(),
        )?;

        let mut loaded = Vec::with_capacity(channels.len());
        for &channel in channels {
            let coarse = read_codes(&file, &format!("{channel}/coarse"))?;
            let fine = read_codes(&file, &format!("{channel}/fine"))?;
            if coarse.dim() != fine.dim() {
                return Err(ContainerError::ShapeMismatch {
                    path: path.to_path_buf(),
                    dataset: format!("{channel}/fine"),
                    expected: format!("{:?}", coarse.shape()),
                    actual: fine.shape().to_vec(),
                }
                .into());
            }
            loaded.push((channel, ChannelCodes { coarse, fine }));
        }

        let columns_path = collection_path("columns_used");
        let columns_used = if file.contains(&columns_path) {
            let cols = file.read_f64(&columns_path)?;
            match cols.as_slice() {
                Some(&[start, end]) => Some([start as u32, end as u32]),
                _ => None,
            }
        } else {
            None
        };

        Ok(Self {
            channels: loaded,
            sweep,
            columns_used,
        })
    }
}

fn read_codes(file: &Container, dataset: &str) -> Result<Array4<u8>> {
    let codes = file.read_as::<u8>(dataset)?;
    Ok(layout::fixed_rank::<u8, Ix4>(codes)?)
}

#[derive(Debug)]
struct Fitted {
    channel: Channel,
    part: Part,
    constants: PartConstants,
}

pub struct ProcessStage {
    config: ProcessConfig,
    method: ProcessMethod,
    input: PathBuf,
    output: PathBuf,
    gathered: Option<GatheredBlock>,
    fitted: Vec<Fitted>,
}

impl ProcessStage {
    pub fn new(
        config: ProcessConfig,
        method: ProcessMethod,
        input: PathBuf,
        output: PathBuf,
    ) -> Self {
        Self {
            config,
            method,
            input,
            output,
            gathered: None,
            fitted: Vec::new(),
        }
    }

    pub fn granularity(&self) -> FitGranularity {
        self.method.granularity()
    }

    fn shaped(&self, data: &Array3<f64>) -> Tensor {
        match self.config.fit.output_layout {
            OutputLayout::Physical => layout::to_physical(data).into(),
            OutputLayout::Acquisition => data.clone().into(),
        }
    }
}

impl Stage for ProcessStage {
    fn name(&self) -> &'static str {
        "process"
    }

    fn method(&self) -> String {
        self.method.to_string()
    }

    fn output_path(&self) -> &Path {
        &self.output
    }

    fn initiate(&mut self) -> Result<()> {
        info!(input = %self.input.display(), "Loading gathered block");
        let gathered = GatheredBlock::read(&self.input, &self.config.fit.channels)?;
        debug!(
            runs = gathered.sweep.vin().len(),
            frames = gathered.sweep.n_frames(),
            "Gathered block loaded"
        );
        self.gathered = Some(gathered);
        Ok(())
    }

    fn calculate(&mut self) -> Result<()> {
        let gathered = self.gathered.as_ref().ok_or(Error::StageOrder {
            stage: "process",
            action: "calculate",
            requires: "initiated",
        })?;
        let settings = &self.config.fit;
        let granularity = self.granularity();

        let mut fitted = Vec::new();
        for (channel, codes) in &gathered.channels {
            let (_, _, n_frames, n_groups) = codes.coarse.dim();
            let per_frame = gathered.sweep.expand_for(n_frames)?;
            let vin = match granularity {
                FitGranularity::PerPixel => per_frame,
                FitGranularity::PooledGroups => gathered.sweep.expand_repeated(n_groups),
            };

            for &rule in &settings.parts {
                let constants = fit_part(
                    codes,
                    &vin,
                    rule,
                    granularity,
                    settings.offset_reference,
                    settings.enable_r_squared,
                );
                let total = constants.slope.len();
                let n_fitted = constants.n_fitted();
                info!(
                    channel = %channel,
                    part = %rule.part,
                    fitted = n_fitted,
                    unfit = total - n_fitted,
                    "Fit done"
                );
                if n_fitted == 0 && total > 0 {
                    warn!(channel = %channel, part = %rule.part, "No pixel could be fitted");
                }
                fitted.push(Fitted {
                    channel: *channel,
                    part: rule.part,
                    constants,
                });
            }
        }
        self.fitted = fitted;
        Ok(())
    }

    fn write_plan(&self) -> Result<WritePlan> {
        let gathered = self.gathered.as_ref().ok_or(Error::StageOrder {
            stage: "process",
            action: "write",
            requires: "initiated",
        })?;
        if self.fitted.is_empty() {
            return Err(Error::StageOrder {
                stage: "process",
                action: "write",
                requires: "calculated",
            });
        }
        let settings = &self.config.fit;

        let mut plan = WritePlan::new();
        for entry in &self.fitted {
            let base = format!("{}/{}", entry.channel, entry.part);
            let constants = &entry.constants;
            plan.push(format!("{base}/slope"), self.shaped(&constants.slope));
            plan.push(format!("{base}/offset"), self.shaped(&constants.offset));
            if let Some(r2) = &constants.r_squared {
                plan.push(format!("{base}/r_squared"), self.shaped(r2));
            }
            let roi_name = match entry.part {
                Part::Coarse => "roi_points",
                Part::Fine => "roi",
            };
            plan.push(format!("{base}/{roi_name}"), self.shaped(&constants.roi));
        }

        if let Some(band) = settings.coarse_band() {
            plan.push(
                collection_path("roi_coarse"),
                ndarray::arr1(&[u32::from(band.low()), u32::from(band.high())]),
            );
        }
        if let Some(policy) = settings.fine_policy() {
            plan.push(collection_path("roi_fine"), policy.to_string());
        }
        let input_dir = self
            .input
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        for part in settings.fit_adc_part.parts() {
            plan.push(
                collection_path(&format!("gathered_directory_{part}")),
                input_dir.as_str(),
            );
        }
        plan.push(
            collection_path("gathered_file"),
            self.input.display().to_string(),
        );
        plan.push(collection_path("run_id"), self.config.run_id.as_str());
        plan.push(
            collection_path("fit_adc_part"),
            settings.fit_adc_part.to_string(),
        );
        plan.push(
            collection_path("offset_reference"),
            settings.offset_reference.to_string(),
        );
        plan.push(
            collection_path("output_layout"),
            settings.output_layout.to_string(),
        );
        plan.push(
            collection_path("n_frames_per_run"),
            gathered
                .sweep
                .frames_per_run()
                .iter()
                .map(|&n| n as u32)
                .collect::<ndarray::Array1<u32>>(),
        );
        if let Some(cols) = gathered.columns_used {
            plan.push(collection_path("columns_used"), ndarray::arr1(&cols));
        }
        Ok(plan)
    }
}

#[cfg(test)]
mod tests;
