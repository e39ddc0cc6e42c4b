//! Pipeline configuration.
//!
//! A YAML profile is deserialized into loosely typed `Raw*` structs, merged
//! with command line overrides and validated once into the typed per-stage
//! configs that the stages and the orchestrator consume. Method specific
//! options live under `<stage>.<method name>`:
//!
//! ```yaml
//! process:
//!   method: process_pixel_calibration
//!   process_pixel_calibration:
//!     fit_adc_part: both
//!     coarse_fitting_range: [1, 30]
//!     fine_fitting_range: mode
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use thiserror::Error;

use crate::codec::BitLayout;
use crate::correction::CorrectionConstants;
use crate::roi::{CoarseBand, FinePolicy, RoiRule};
use crate::stage::{CorrectionMethod, GatherMethod, ProcessMethod, RunType};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yml::Error,
    },

    #[error("Missing required configuration key '{0}'")]
    MissingField(String),

    #[error("Unknown {kind} method '{name}'")]
    UnknownMethod { kind: &'static str, name: String },

    #[error("Unknown run type '{0}', expected gather, process or correction")]
    UnknownRunType(String),

    #[error("Invalid value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("{total_cols} columns cannot be split evenly into blocks of {block_size}")]
    UnevenPartition { total_cols: usize, block_size: usize },
}

fn invalid(key: impl Into<String>, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.into(),
        reason: reason.into(),
    }
}

// ============================================================================
// Raw YAML
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawConfig {
    pub general: RawGeneral,
    pub detector: RawDetector,
    pub all: RawPaths,
    pub gather: RawStage,
    pub process: RawStage,
    pub correction: RawCorrection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawGeneral {
    pub run: Option<String>,
    pub run_type: Option<String>,
    /// Columns per block.
    pub n_cols: Option<usize>,
    pub n_processes: Option<usize>,
    pub skip_existing: Option<bool>,
    pub extension: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawDetector {
    pub n_rows: Option<usize>,
    pub n_cols: Option<usize>,
    pub n_adc: Option<usize>,
    pub adu_max: Option<f64>,
    pub bits: Option<BitLayout>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawPaths {
    pub input: Option<PathBuf>,
    pub output: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawStage {
    pub input: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub method: Option<String>,
    /// Per-method option blocks keyed by method name.
    #[serde(flatten)]
    pub methods: BTreeMap<String, serde_yml::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawCorrection {
    /// Raw acquisition file to correct.
    pub input: Option<PathBuf>,
    /// Merged constants file produced by the process stage.
    pub constants: Option<PathBuf>,
    /// Output file.
    pub output: Option<PathBuf>,
    pub method: Option<String>,
    #[serde(flatten)]
    pub methods: BTreeMap<String, serde_yml::Value>,
}

/// Values given on the command line. They take priority over the profile.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub input: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub run_id: Option<String>,
    pub method: Option<String>,
    pub run_type: Option<String>,
    pub n_cols: Option<usize>,
}

// ============================================================================
// Typed settings
// ============================================================================

/// Detector geometry and ADC word format.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorConfig {
    pub n_rows: usize,
    pub n_cols: usize,
    pub n_adc: usize,
    pub adu_max: f64,
    pub bits: BitLayout,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            n_rows: 1484,
            n_cols: 1440,
            n_adc: 7,
            adu_max: 4095.0,
            bits: BitLayout::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub total_cols: usize,
    pub block_size: usize,
    pub n_processes: usize,
    pub skip_existing: bool,
    /// Extension of the per-block output files.
    pub extension: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Channel {
    Sample,
    Reset,
}

/// One sub-code of the ADC reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Part {
    Coarse,
    Fine,
}

/// Which parts the process stage fits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FitAdcPart {
    Coarse,
    Fine,
    #[default]
    Both,
}

impl FitAdcPart {
    pub fn parts(self) -> &'static [Part] {
        match self {
            FitAdcPart::Coarse => &[Part::Coarse],
            FitAdcPart::Fine => &[Part::Fine],
            FitAdcPart::Both => &[Part::Coarse, Part::Fine],
        }
    }
}

/// Where the stored offset is evaluated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OffsetReference {
    /// Offset at Vin = 0.
    #[default]
    Intercept,
    /// Offset at the first Vin of the pixel's ROI.
    RoiStart,
}

/// Axis order of written constants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OutputLayout {
    /// `[row, col]`
    #[default]
    Physical,
    /// `[adc, col, group]`
    Acquisition,
}

/// A fitted part together with its frame selection rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartRule {
    pub part: Part,
    pub rule: RoiRule,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FitSettings {
    pub fit_adc_part: FitAdcPart,
    pub parts: Vec<PartRule>,
    pub channels: Vec<Channel>,
    pub enable_r_squared: bool,
    pub offset_reference: OffsetReference,
    pub output_layout: OutputLayout,
}

impl FitSettings {
    pub fn coarse_band(&self) -> Option<CoarseBand> {
        self.parts.iter().find_map(|p| match p.rule {
            RoiRule::Coarse(band) => Some(band),
            RoiRule::Fine(_) => None,
        })
    }

    pub fn fine_policy(&self) -> Option<FinePolicy> {
        self.parts.iter().find_map(|p| match p.rule {
            RoiRule::Fine(policy) => Some(policy),
            RoiRule::Coarse(_) => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatherConfig {
    pub run_id: String,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub method: GatherMethod,
    pub register_file: PathBuf,
    /// Raw file name with `{prefix}` and `{run}` placeholders.
    pub raw_file_template: String,
    pub sample_path: String,
    pub reset_path: String,
    pub detector: DetectorConfig,
}

impl GatherConfig {
    pub fn raw_file(&self, prefix: &str) -> PathBuf {
        let name = self
            .raw_file_template
            .replace("{prefix}", prefix)
            .replace("{run}", &self.run_id);
        self.input_dir.join(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessConfig {
    pub run_id: String,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub method: ProcessMethod,
    pub fit: FitSettings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CorrectionConfig {
    pub data_file: PathBuf,
    pub constants_file: PathBuf,
    pub output_file: PathBuf,
    pub method: CorrectionMethod,
    pub constants: CorrectionConstants,
    pub sample_path: String,
    pub reset_path: String,
    pub detector: DetectorConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StageConfig {
    Gather(GatherConfig),
    Process(ProcessConfig),
    Correction(CorrectionConfig),
}

/// Fully validated configuration of one invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub run_type: RunType,
    pub detector: DetectorConfig,
    /// Present for the column-partitioned stages.
    pub orchestrator: Option<OrchestratorConfig>,
    pub stage: StageConfig,
}

// ============================================================================
// Method options
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct GatherOptions {
    register_file: String,
    raw_file_template: String,
    sample_path: String,
    reset_path: String,
}

impl Default for GatherOptions {
    fn default() -> Self {
        Self {
            register_file: "file.dat".to_string(),
            raw_file_template: "{prefix}_{run}.h5".to_string(),
            sample_path: "data".to_string(),
            reset_path: "reset".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum FineRange {
    Value(u8),
    Policy(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct ProcessOptions {
    fit_adc_part: FitAdcPart,
    channels: Vec<Channel>,
    coarse_fitting_range: Option<CoarseBand>,
    fine_fitting_range: Option<FineRange>,
    enable_r_squared: bool,
    offset_reference: OffsetReference,
    output_layout: OutputLayout,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            fit_adc_part: FitAdcPart::default(),
            channels: vec![Channel::Sample, Channel::Reset],
            coarse_fitting_range: None,
            fine_fitting_range: None,
            enable_r_squared: false,
            offset_reference: OffsetReference::default(),
            output_layout: OutputLayout::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct CorrectionOptions {
    coarse_scale: Option<f64>,
    fine_scale: Option<f64>,
    adu_max_offset: Option<f64>,
    sample_path: String,
    reset_path: String,
}

impl Default for CorrectionOptions {
    fn default() -> Self {
        Self {
            coarse_scale: None,
            fine_scale: None,
            adu_max_offset: None,
            sample_path: "data".to_string(),
            reset_path: "reset".to_string(),
        }
    }
}

/// Deserializes the `<section>.<method>` block, or the defaults if it is absent.
fn method_options<T>(
    section: &str,
    method: &str,
    methods: &BTreeMap<String, serde_yml::Value>,
) -> Result<T, ConfigError>
where
    T: DeserializeOwned + Default + 'static,
{
    match methods.get(method) {
        None | Some(serde_yml::Value::Null) => Ok(T::default()),
        Some(value) => serde_yml::from_value(value.clone())
            .map_err(|e| invalid(format!("{section}.{method}"), e.to_string())),
    }
}

// ============================================================================
// Validation
// ============================================================================

impl PipelineConfig {
    /// Reads a YAML profile from disk and validates it together with `overrides`.
    pub fn load(path: &Path, overrides: &Overrides) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let raw: RawConfig = serde_yml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_raw(raw, overrides)
    }

    pub fn from_yaml_str(text: &str, overrides: &Overrides) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_yml::from_str(text).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        Self::from_raw(raw, overrides)
    }

    pub fn from_raw(raw: RawConfig, overrides: &Overrides) -> Result<Self, ConfigError> {
        let run_type_name = overrides
            .run_type
            .clone()
            .or_else(|| raw.general.run_type.clone())
            .ok_or_else(|| ConfigError::MissingField("general.run_type".to_string()))?;
        let run_type = RunType::from_str(&run_type_name)
            .map_err(|_| ConfigError::UnknownRunType(run_type_name.clone()))?;

        let detector = validate_detector(&raw.detector)?;

        let (orchestrator, stage) = match run_type {
            RunType::Gather => {
                let orchestrator = validate_orchestrator(&raw.general, &detector, overrides)?;
                let gather = validate_gather(&raw, &detector, overrides)?;
                (Some(orchestrator), StageConfig::Gather(gather))
            }
            RunType::Process => {
                let orchestrator = validate_orchestrator(&raw.general, &detector, overrides)?;
                let process = validate_process(&raw, overrides)?;
                (Some(orchestrator), StageConfig::Process(process))
            }
            RunType::Correction => (
                None,
                StageConfig::Correction(validate_correction(&raw, &detector, overrides)?),
            ),
        };

        Ok(Self {
            run_type,
            detector,
            orchestrator,
            stage,
        })
    }
}

fn validate_detector(raw: &RawDetector) -> Result<DetectorConfig, ConfigError> {
    let defaults = DetectorConfig::default();
    let detector = DetectorConfig {
        n_rows: raw.n_rows.unwrap_or(defaults.n_rows),
        n_cols: raw.n_cols.unwrap_or(defaults.n_cols),
        n_adc: raw.n_adc.unwrap_or(defaults.n_adc),
        adu_max: raw.adu_max.unwrap_or(defaults.adu_max),
        bits: raw.bits.unwrap_or(defaults.bits),
    };

    if detector.n_adc == 0 {
        return Err(invalid("detector.n_adc", "must be positive"));
    }
    if detector.n_rows % detector.n_adc != 0 {
        return Err(invalid(
            "detector.n_rows",
            format!(
                "{} rows are not a multiple of {} ADCs",
                detector.n_rows, detector.n_adc
            ),
        ));
    }
    if !(detector.adu_max.is_finite() && detector.adu_max > 0.0) {
        return Err(invalid("detector.adu_max", "must be a positive number"));
    }
    detector
        .bits
        .validate()
        .map_err(|reason| invalid("detector.bits", reason))?;
    Ok(detector)
}

fn validate_orchestrator(
    general: &RawGeneral,
    detector: &DetectorConfig,
    overrides: &Overrides,
) -> Result<OrchestratorConfig, ConfigError> {
    let block_size = overrides
        .n_cols
        .or(general.n_cols)
        .ok_or_else(|| ConfigError::MissingField("general.n_cols".to_string()))?;
    if block_size == 0 {
        return Err(invalid("general.n_cols", "must be positive"));
    }
    let total_cols = detector.n_cols;
    if total_cols % block_size != 0 {
        return Err(ConfigError::UnevenPartition {
            total_cols,
            block_size,
        });
    }

    let n_processes = general.n_processes.unwrap_or(1);
    if n_processes == 0 {
        return Err(invalid("general.n_processes", "must be positive"));
    }

    let extension = general
        .extension
        .clone()
        .unwrap_or_else(|| crate::container::DEFAULT_EXTENSION.to_string());

    Ok(OrchestratorConfig {
        total_cols,
        block_size,
        n_processes,
        skip_existing: general.skip_existing.unwrap_or(false),
        extension,
    })
}

fn require_run_id(raw: &RawConfig, overrides: &Overrides) -> Result<String, ConfigError> {
    overrides
        .run_id
        .clone()
        .or_else(|| raw.general.run.clone())
        .ok_or_else(|| ConfigError::MissingField("general.run".to_string()))
}

/// Command line first, then the stage section, then `all`.
fn resolve_dir(
    cli: &Option<PathBuf>,
    stage: &Option<PathBuf>,
    all: &Option<PathBuf>,
    key: &str,
) -> Result<PathBuf, ConfigError> {
    cli.clone()
        .or_else(|| stage.clone())
        .or_else(|| all.clone())
        .ok_or_else(|| ConfigError::MissingField(key.to_string()))
}

fn resolve_method(
    overrides: &Overrides,
    stage: &Option<String>,
    key: &str,
) -> Result<String, ConfigError> {
    overrides
        .method
        .clone()
        .or_else(|| stage.clone())
        .ok_or_else(|| ConfigError::MissingField(key.to_string()))
}

fn validate_gather(
    raw: &RawConfig,
    detector: &DetectorConfig,
    overrides: &Overrides,
) -> Result<GatherConfig, ConfigError> {
    let run_id = require_run_id(raw, overrides)?;
    let input_dir =
        resolve_dir(&overrides.input, &raw.gather.input, &raw.all.input, "gather.input")?;
    let output_dir =
        resolve_dir(&overrides.output, &raw.gather.output, &raw.all.output, "gather.output")?;

    let method_name = resolve_method(overrides, &raw.gather.method, "gather.method")?;
    let method = GatherMethod::from_str(&method_name).map_err(|_| ConfigError::UnknownMethod {
        kind: "gather",
        name: method_name.clone(),
    })?;
    let options: GatherOptions = method_options("gather", &method_name, &raw.gather.methods)?;

    if !options.raw_file_template.contains("{prefix}") {
        return Err(invalid(
            format!("gather.{method_name}.raw_file_template"),
            "must contain '{prefix}'",
        ));
    }

    Ok(GatherConfig {
        run_id,
        register_file: input_dir.join(&options.register_file),
        input_dir,
        output_dir,
        method,
        raw_file_template: options.raw_file_template,
        sample_path: options.sample_path,
        reset_path: options.reset_path,
        detector: detector.clone(),
    })
}

fn validate_process(raw: &RawConfig, overrides: &Overrides) -> Result<ProcessConfig, ConfigError> {
    let run_id = require_run_id(raw, overrides)?;
    let input_dir =
        resolve_dir(&overrides.input, &raw.process.input, &raw.all.input, "process.input")?;
    let output_dir =
        resolve_dir(&overrides.output, &raw.process.output, &raw.all.output, "process.output")?;

    let method_name = resolve_method(overrides, &raw.process.method, "process.method")?;
    let method = ProcessMethod::from_str(&method_name).map_err(|_| ConfigError::UnknownMethod {
        kind: "process",
        name: method_name.clone(),
    })?;
    let options: ProcessOptions = method_options("process", &method_name, &raw.process.methods)?;
    let key = |field: &str| format!("process.{method_name}.{field}");

    if options.channels.is_empty() {
        return Err(invalid(key("channels"), "at least one channel is required"));
    }

    let mut parts = Vec::new();
    for &part in options.fit_adc_part.parts() {
        let rule = match part {
            Part::Coarse => RoiRule::Coarse(
                options
                    .coarse_fitting_range
                    .ok_or_else(|| ConfigError::MissingField(key("coarse_fitting_range")))?,
            ),
            Part::Fine => {
                let policy = match &options.fine_fitting_range {
                    None => return Err(ConfigError::MissingField(key("fine_fitting_range"))),
                    Some(FineRange::Value(v)) => FinePolicy::Fixed(*v),
                    Some(FineRange::Policy(p)) if p == "mode" => FinePolicy::Mode,
                    Some(FineRange::Policy(p)) => {
                        return Err(invalid(
                            key("fine_fitting_range"),
                            format!("expected a coarse value or 'mode', got '{p}'"),
                        ))
                    }
                };
                RoiRule::Fine(policy)
            }
        };
        parts.push(PartRule { part, rule });
    }

    Ok(ProcessConfig {
        run_id,
        input_dir,
        output_dir,
        method,
        fit: FitSettings {
            fit_adc_part: options.fit_adc_part,
            parts,
            channels: options.channels,
            enable_r_squared: options.enable_r_squared,
            offset_reference: options.offset_reference,
            output_layout: options.output_layout,
        },
    })
}

fn validate_correction(
    raw: &RawConfig,
    detector: &DetectorConfig,
    overrides: &Overrides,
) -> Result<CorrectionConfig, ConfigError> {
    let section = &raw.correction;
    let data_file = overrides
        .input
        .clone()
        .or_else(|| section.input.clone())
        .ok_or_else(|| ConfigError::MissingField("correction.input".to_string()))?;
    let constants_file = section
        .constants
        .clone()
        .ok_or_else(|| ConfigError::MissingField("correction.constants".to_string()))?;
    let output_file = overrides
        .output
        .clone()
        .or_else(|| section.output.clone())
        .ok_or_else(|| ConfigError::MissingField("correction.output".to_string()))?;

    let method_name = overrides
        .method
        .clone()
        .or_else(|| section.method.clone())
        .unwrap_or_else(|| CorrectionMethod::default().to_string());
    let method =
        CorrectionMethod::from_str(&method_name).map_err(|_| ConfigError::UnknownMethod {
            kind: "correction",
            name: method_name.clone(),
        })?;
    let options: CorrectionOptions = method_options("correction", &method_name, &section.methods)?;

    let defaults = CorrectionConstants::from_adu_max(detector.adu_max);
    let constants = CorrectionConstants {
        coarse_scale: options.coarse_scale.unwrap_or(defaults.coarse_scale),
        fine_scale: options.fine_scale.unwrap_or(defaults.fine_scale),
        adu_max_offset: options.adu_max_offset.unwrap_or(defaults.adu_max_offset),
    };

    Ok(CorrectionConfig {
        data_file,
        constants_file,
        output_file,
        method,
        constants,
        sample_path: options.sample_path,
        reset_path: options.reset_path,
        detector: detector.clone(),
    })
}

#[cfg(test)]
mod tests;
