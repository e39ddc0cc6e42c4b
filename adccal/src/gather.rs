//! Gather stage: assembles one column block of every Vin run into one file.
//!
//! Runs are listed in the register file. For each run the raw sample and
//! reset words of the block's columns are split into coarse, fine and gain
//! codes and placed at the run's frame offset. The assembled codes are then
//! reordered to `[adc, col, frame, group]`.

use std::path::{Path, PathBuf};

use ndarray::{s, Array3, Ix3, Ix4};
use tracing::{debug, info};

use crate::codec::SplitCodes;
use crate::config::{Channel, ConfigError, GatherConfig};
use crate::container::{Container, ContainerError, WritePlan};
use crate::error::{Error, Result};
use crate::layout;
use crate::metadata::collection_path;
use crate::orchestrator::ColumnBlock;
use crate::stage::Stage;
use crate::sweep::{self, RegisterEntry, VinSweep};

#[derive(Debug)]
struct Gathered {
    sample: SplitCodes<Ix4>,
    reset: SplitCodes<Ix4>,
    sweep: VinSweep,
}

pub struct GatherStage {
    config: GatherConfig,
    block: ColumnBlock,
    output: PathBuf,
    register: Vec<RegisterEntry>,
    frames_per_run: Vec<usize>,
    result: Option<Gathered>,
}

impl GatherStage {
    pub fn new(config: GatherConfig, block: ColumnBlock, output: PathBuf) -> Self {
        Self {
            config,
            block,
            output,
            register: Vec::new(),
            frames_per_run: Vec::new(),
            result: None,
        }
    }

    fn dataset_path(&self, channel: Channel) -> &str {
        match channel {
            Channel::Sample => &self.config.sample_path,
            Channel::Reset => &self.config.reset_path,
        }
    }

    /// Reads the block's columns of one run and writes its codes into `target`
    /// starting at frame `offset`.
    fn load_run(
        &self,
        file: &Container,
        entry: &RegisterEntry,
        channel: Channel,
        n_frames: usize,
        offset: usize,
        target: &mut SplitCodes<Ix3>,
    ) -> Result<()> {
        let dataset = self.dataset_path(channel);
        let raw = file.read_cols_as::<u16>(dataset, self.block.cols())?;
        let raw: Array3<u16> = layout::fixed_rank(raw)?;

        let expected = (n_frames, self.config.detector.n_rows, self.block.len());
        if raw.dim() != expected {
            return Err(Error::RunShapeMismatch {
                prefix: entry.prefix.clone(),
                path: file.path().to_path_buf(),
                expected: vec![expected.0, expected.1, expected.2],
                actual: raw.shape().to_vec(),
            });
        }

        let codes = self.config.detector.bits.split_array(&raw);
        let end = offset + n_frames;
        target.coarse.slice_mut(s![offset..end, .., ..]).assign(&codes.coarse);
        target.fine.slice_mut(s![offset..end, .., ..]).assign(&codes.fine);
        target.gain.slice_mut(s![offset..end, .., ..]).assign(&codes.gain);
        Ok(())
    }

    fn to_acquisition(&self, codes: SplitCodes<Ix3>) -> Result<SplitCodes<Ix4>> {
        let n_adc = self.config.detector.n_adc;
        Ok(SplitCodes {
            coarse: layout::to_acquisition_frames(&codes.coarse, n_adc)?,
            fine: layout::to_acquisition_frames(&codes.fine, n_adc)?,
            gain: layout::to_acquisition_frames(&codes.gain, n_adc)?,
        })
    }
}

fn empty_codes(shape: (usize, usize, usize)) -> SplitCodes<Ix3> {
    SplitCodes {
        coarse: Array3::zeros(shape),
        fine: Array3::zeros(shape),
        gain: Array3::zeros(shape),
    }
}

fn frame_count(file: &Container, dataset: &str) -> std::result::Result<usize, ContainerError> {
    let shape = file.shape(dataset)?;
    if let &[frames, _, _] = shape.as_slice() {
        return Ok(frames);
    }
    Err(ContainerError::ShapeMismatch {
        path: file.path().to_path_buf(),
        dataset: dataset.to_string(),
        expected: "[frame, row, col]".to_string(),
        actual: shape,
    })
}

impl Stage for GatherStage {
    fn name(&self) -> &'static str {
        "gather"
    }

    fn method(&self) -> String {
        self.config.method.to_string()
    }

    fn output_path(&self) -> &Path {
        &self.output
    }

    fn initiate(&mut self) -> Result<()> {
        let register = sweep::read_register(&self.config.register_file)?;
        if register.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: self.config.register_file.display().to_string(),
                reason: "register file lists no runs".to_string(),
            }
            .into());
        }

        let mut frames_per_run = Vec::with_capacity(register.len());
        for entry in &register {
            let path = self.config.raw_file(&entry.prefix);
            let file = Container::open(&path)?;
            let sample_frames = frame_count(&file, &self.config.sample_path)?;
            let reset_frames = frame_count(&file, &self.config.reset_path)?;
            if sample_frames != reset_frames {
                return Err(Error::RunShapeMismatch {
                    prefix: entry.prefix.clone(),
                    path,
                    expected: vec![sample_frames],
                    actual: vec![reset_frames],
                });
            }
            debug!(prefix = %entry.prefix, vin = entry.vin, frames = sample_frames, "Found run");
            frames_per_run.push(sample_frames);
        }

        info!(
            block = %self.block,
            runs = register.len(),
            frames = frames_per_run.iter().sum::<usize>(),
            "Register loaded"
        );
        self.register = register;
        self.frames_per_run = frames_per_run;
        Ok(())
    }

    fn calculate(&mut self) -> Result<()> {
        if self.register.is_empty() {
            return Err(Error::StageOrder {
                stage: "gather",
                action: "calculate",
                requires: "initiated",
            });
        }

        let sweep = VinSweep::new(
            self.register.iter().map(|e| e.vin).collect(),
            self.frames_per_run.clone(),
        )?;
        let total = sweep.n_frames();
        let shape = (total, self.config.detector.n_rows, self.block.len());
        let mut sample = empty_codes(shape);
        let mut reset = empty_codes(shape);

        for ((entry, &n_frames), offset) in self
            .register
            .iter()
            .zip(sweep.frames_per_run())
            .zip(sweep.run_offsets())
        {
            info!(
                block = %self.block,
                prefix = %entry.prefix,
                "Getting frames {} to {} of {}",
                offset,
                offset + n_frames,
                total
            );
            let file = Container::open(&self.config.raw_file(&entry.prefix))?;
            self.load_run(&file, entry, Channel::Sample, n_frames, offset, &mut sample)?;
            self.load_run(&file, entry, Channel::Reset, n_frames, offset, &mut reset)?;
        }

        self.result = Some(Gathered {
            sample: self.to_acquisition(sample)?,
            reset: self.to_acquisition(reset)?,
            sweep,
        });
        Ok(())
    }

    fn write_plan(&self) -> Result<WritePlan> {
        let gathered = self.result.as_ref().ok_or(Error::StageOrder {
            stage: "gather",
            action: "write",
            requires: "calculated",
        })?;

        let mut plan = WritePlan::new();
        for (channel, codes) in [
            (Channel::Sample, &gathered.sample),
            (Channel::Reset, &gathered.reset),
        ] {
            plan.push(format!("{channel}/coarse"), codes.coarse.clone());
            plan.push(format!("{channel}/fine"), codes.fine.clone());
            plan.push(format!("{channel}/gain"), codes.gain.clone());
        }

        let sweep = &gathered.sweep;
        plan.push("vin", ndarray::Array1::from(sweep.vin().to_vec()));
        plan.push(
            collection_path("n_frames_per_run"),
            sweep
                .frames_per_run()
                .iter()
                .map(|&n| n as u32)
                .collect::<ndarray::Array1<u32>>(),
        );
        plan.push(collection_path("n_frames"), ndarray::arr0(sweep.n_frames() as u32));
        plan.push(collection_path("n_runs"), ndarray::arr0(sweep.vin().len() as u32));
        plan.push(
            collection_path("n_adc"),
            ndarray::arr0(self.config.detector.n_adc as u32),
        );
        plan.push(
            collection_path("columns_used"),
            ndarray::arr1(&[self.block.start as u32, self.block.end as u32]),
        );
        plan.push(collection_path("run_id"), self.config.run_id.as_str());
        plan.push(
            collection_path("input_directory"),
            self.config.input_dir.display().to_string(),
        );
        Ok(plan)
    }
}
