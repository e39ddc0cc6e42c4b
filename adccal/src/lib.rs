//! Per-pixel calibration of a multi-ADC detector readout.
//!
//! The pipeline has three stages, each run as its own invocation:
//!
//! 1. **gather** collects one column block of every Vin run of a sweep into
//!    a single file of split coarse/fine/gain codes.
//! 2. **process** fits coarse and fine codes against Vin for every pixel and
//!    writes slope/offset constants.
//! 3. **correction** linearizes raw frames with those constants.
//!
//! Gather and process run per column block on a bounded worker pool, see
//! [`orchestrator`].

// ============================================================================
// Data model
// ============================================================================

pub mod codec;
pub mod layout;
pub mod sweep;

// ============================================================================
// Numerics
// ============================================================================

pub mod fit;
pub mod roi;

// ============================================================================
// Files and configuration
// ============================================================================

pub mod config;
pub mod container;
pub mod error;
pub mod metadata;

// ============================================================================
// Stages
// ============================================================================

pub mod correction;
pub mod gather;
pub mod orchestrator;
pub mod process;
pub mod stage;

pub use codec::{AdcCode, BitField, BitLayout, SplitCodes};
pub use config::{ConfigError, Overrides, PipelineConfig, StageConfig};
pub use error::{Error, Result};
pub use orchestrator::{BlockStatus, ColumnBlock, Orchestrator, RunReport};
pub use stage::{CorrectionMethod, GatherMethod, ProcessMethod, RunType, Stage};
