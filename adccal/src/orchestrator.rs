//! Column partitioning and wave-by-wave execution of per-block stages.
//!
//! The detector's columns are split into equal, contiguous blocks. Blocks are
//! run in waves of at most `n_processes` on a dedicated thread pool; a wave
//! starts only after the previous one has fully finished. Each block reads
//! shared inputs and writes its own output file, so blocks never interact.

use std::fmt;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{error, info, warn};

use crate::config::{ConfigError, GatherConfig, OrchestratorConfig, ProcessConfig};
use crate::error::{Error, Result};

/// A contiguous range of detector columns processed as one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnBlock {
    pub index: usize,
    pub start: usize,
    /// Exclusive.
    pub end: usize,
}

impl ColumnBlock {
    pub fn cols(&self) -> Range<usize> {
        self.start..self.end
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Last column of the block, inclusive.
    pub fn stop(&self) -> usize {
        self.end.saturating_sub(1)
    }

    /// `col{start}-{stop}_{suffix}.{extension}`
    pub fn file_name(&self, suffix: &str, extension: &str) -> String {
        format!("col{}-{}_{}.{}", self.start, self.stop(), suffix, extension)
    }
}

impl fmt::Display for ColumnBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "col{}-{}", self.start, self.stop())
    }
}

/// Splits `total_cols` into blocks of `block_size`. The split must be exact.
pub fn partition(
    total_cols: usize,
    block_size: usize,
) -> std::result::Result<Vec<ColumnBlock>, ConfigError> {
    if block_size == 0 || total_cols % block_size != 0 {
        return Err(ConfigError::UnevenPartition {
            total_cols,
            block_size,
        });
    }
    Ok((0..total_cols / block_size)
        .map(|index| ColumnBlock {
            index,
            start: index * block_size,
            end: (index + 1) * block_size,
        })
        .collect())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockStatus {
    Written(PathBuf),
    Skipped(PathBuf),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockOutcome {
    pub block: ColumnBlock,
    pub status: BlockStatus,
}

/// Per-block outcomes of one orchestrated run, in block order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub outcomes: Vec<BlockOutcome>,
}

impl RunReport {
    pub fn failed(&self) -> impl Iterator<Item = &BlockOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, BlockStatus::Failed(_)))
    }

    pub fn n_written(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, BlockStatus::Written(_)))
            .count()
    }

    pub fn n_skipped(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, BlockStatus::Skipped(_)))
            .count()
    }

    pub fn is_success(&self) -> bool {
        self.failed().next().is_none()
    }
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    blocks: Vec<ColumnBlock>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Result<Self> {
        let blocks = partition(config.total_cols, config.block_size)?;
        if config.n_processes == 0 {
            return Err(ConfigError::InvalidValue {
                key: "general.n_processes".to_string(),
                reason: "must be positive".to_string(),
            }
            .into());
        }
        Ok(Self { config, blocks })
    }

    pub fn blocks(&self) -> &[ColumnBlock] {
        &self.blocks
    }

    pub fn waves(&self) -> std::slice::Chunks<'_, ColumnBlock> {
        common::parallel::waves(&self.blocks, self.config.n_processes)
    }

    /// Runs `job` for every block whose output does not need skipping.
    ///
    /// `output_for` names the block's output file. A job that returns an
    /// error or panics fails only its own block.
    pub fn run<O, F>(&self, output_for: O, job: F) -> Result<RunReport>
    where
        O: Fn(&ColumnBlock) -> PathBuf + Sync,
        F: Fn(&ColumnBlock, &Path) -> Result<()> + Sync,
    {
        let start = Instant::now();
        let n_waves = self.waves().len();
        info!(
            blocks = self.blocks.len(),
            waves = n_waves,
            n_processes = self.config.n_processes,
            "Starting column blocks"
        );

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.n_processes)
            .thread_name(|i| format!("adccal-block-{i}"))
            .build()
            .map_err(|e| Error::WorkerPool(e.to_string()))?;

        let results = pool.install(|| {
            common::parallel::par_map_waves_isolated(
                &self.blocks,
                self.config.n_processes,
                |wave, len| info!(wave = wave + 1, of = n_waves, blocks = len, "Starting wave"),
                |block| {
                    let output = output_for(block);
                    if self.config.skip_existing && output.exists() {
                        info!(
                            block = %block,
                            output = %output.display(),
                            "Output exists, skipping"
                        );
                        return Ok(BlockStatus::Skipped(output));
                    }
                    job(block, &output).map(|()| BlockStatus::Written(output))
                },
            )
        });

        let outcomes: Vec<BlockOutcome> = self
            .blocks
            .iter()
            .zip(results)
            .map(|(block, result)| {
                let status = match result {
                    Ok(Ok(status)) => status,
                    Ok(Err(err)) => {
                        error!(block = %block, error = %err, "Block failed");
                        BlockStatus::Failed(err.to_string())
                    }
                    Err(panic) => {
                        error!(block = %block, panic = %panic, "Block worker panicked");
                        BlockStatus::Failed(format!("worker panicked: {panic}"))
                    }
                };
                BlockOutcome {
                    block: *block,
                    status,
                }
            })
            .collect();

        let report = RunReport { outcomes };
        let n_failed = report.failed().count();
        if n_failed > 0 {
            warn!(failed = n_failed, total = self.blocks.len(), "Some blocks failed");
        }
        info!(
            written = report.n_written(),
            skipped = report.n_skipped(),
            failed = n_failed,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Column blocks done"
        );
        Ok(report)
    }

    pub fn gathered_path(&self, dir: &Path, block: &ColumnBlock) -> PathBuf {
        dir.join(block.file_name("gathered", &self.config.extension))
    }

    pub fn processed_path(&self, dir: &Path, block: &ColumnBlock) -> PathBuf {
        dir.join(block.file_name("processed", &self.config.extension))
    }

    pub fn run_gather(&self, config: &GatherConfig) -> Result<RunReport> {
        self.run(
            |block| self.gathered_path(&config.output_dir, block),
            |block, output| {
                config
                    .method
                    .create(config, *block, output.to_path_buf())
                    .run()
            },
        )
    }

    pub fn run_process(&self, config: &ProcessConfig) -> Result<RunReport> {
        self.run(
            |block| self.processed_path(&config.output_dir, block),
            |block, output| {
                let input = self.gathered_path(&config.input_dir, block);
                config
                    .method
                    .create(config, input, output.to_path_buf())
                    .run()
            },
        )
    }
}
