//! The stage interface and the static registry of named methods.

use std::path::{Path, PathBuf};
use std::time::Instant;

use strum_macros::{Display, EnumIter, EnumString};
use tracing::info;

use crate::config::{CorrectionConfig, GatherConfig, ProcessConfig};
use crate::container::{self, WritePlan};
use crate::correction::CorrectionStage;
use crate::error::{Error, Result};
use crate::gather::GatherStage;
use crate::metadata;
use crate::orchestrator::ColumnBlock;
use crate::process::{FitGranularity, ProcessStage};

/// Which pipeline stage an invocation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display)]
#[strum(serialize_all = "snake_case")]
pub enum RunType {
    Gather,
    Process,
    Correction,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, EnumString, EnumIter, Display)]
#[strum(serialize_all = "snake_case")]
pub enum GatherMethod {
    #[default]
    FilePerVinAndRegisterFile,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, EnumString, EnumIter, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ProcessMethod {
    /// One fit per pixel.
    #[default]
    ProcessPixelCalibration,
    /// One fit per `(adc, col)` over all row groups, broadcast to every group.
    ProcessAdccalDefault,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, EnumString, EnumIter, Display)]
#[strum(serialize_all = "snake_case")]
pub enum CorrectionMethod {
    #[default]
    CorrectionAdccalDefault,
}

/// One unit of pipeline work that produces exactly one output file.
///
/// `initiate` loads inputs, `calculate` does the numeric work and
/// `write_plan` describes the stage's datasets. [`Stage::run`] drives the
/// three in order and appends the `collection/*` metadata.
pub trait Stage: Send {
    fn name(&self) -> &'static str;

    /// Registry name written to `collection/method`.
    fn method(&self) -> String;

    fn output_path(&self) -> &Path;

    fn initiate(&mut self) -> Result<()>;

    fn calculate(&mut self) -> Result<()>;

    fn write_plan(&self) -> Result<WritePlan>;

    fn run(&mut self) -> Result<()> {
        let start = Instant::now();
        info!(
            stage = self.name(),
            method = %self.method(),
            output = %self.output_path().display(),
            "Starting"
        );

        self.initiate()?;
        self.calculate()?;

        let mut plan = self.write_plan()?;
        plan.extend(metadata::standard(&self.method()));

        let output = self.output_path().to_path_buf();
        common::file_utils::ensure_parent_dir(&output).map_err(|source| Error::Io {
            path: output.clone(),
            source,
        })?;
        container::write_file(&output, &plan)?;

        info!(
            stage = self.name(),
            output = %output.display(),
            datasets = plan.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Finished"
        );
        Ok(())
    }
}

impl GatherMethod {
    pub fn create(
        self,
        config: &GatherConfig,
        block: ColumnBlock,
        output: PathBuf,
    ) -> Box<dyn Stage> {
        match self {
            GatherMethod::FilePerVinAndRegisterFile => {
                Box::new(GatherStage::new(config.clone(), block, output))
            }
        }
    }
}

impl ProcessMethod {
    pub fn granularity(self) -> FitGranularity {
        match self {
            ProcessMethod::ProcessPixelCalibration => FitGranularity::PerPixel,
            ProcessMethod::ProcessAdccalDefault => FitGranularity::PooledGroups,
        }
    }

    pub fn create(self, config: &ProcessConfig, input: PathBuf, output: PathBuf) -> Box<dyn Stage> {
        Box::new(ProcessStage::new(config.clone(), self, input, output))
    }
}

impl CorrectionMethod {
    pub fn create(self, config: &CorrectionConfig) -> Box<dyn Stage> {
        match self {
            CorrectionMethod::CorrectionAdccalDefault => {
                Box::new(CorrectionStage::new(config.clone()))
            }
        }
    }
}
