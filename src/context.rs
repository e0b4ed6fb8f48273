//! Run-level counters, owned and advanced by the tempering controller's block loop.

use serde::{Deserialize, Serialize};

use crate::config::RunSchedule;
use crate::error::{Error, Result};

/// Progress of a run. Created once per run (or restored from a snapshot) and mutated only at
/// block boundaries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunContext {
    /// Iterations completed.
    pub iteration: u64,
    /// Blocks completed.
    pub block: u64,
    pub n_blocks: u64,
    pub status_every: u64,
    /// Shape refreshes, counted per chain.
    pub shape_updates: u64,
    /// Projection-only iterations, counted once for the whole ladder.
    pub projection_iterations: u64,
    pub flushes: u64,
}

impl RunContext {
    pub fn new(schedule: &RunSchedule) -> Self {
        Self {
            n_blocks: schedule.n_blocks,
            status_every: schedule.status_every,
            ..Self::default()
        }
    }

    /// Continues a restored context under a (possibly longer) schedule.
    pub fn resume(self, schedule: &RunSchedule) -> Result<Self> {
        if self.iteration % schedule.n_int_block != 0 || self.iteration > schedule.n_iterations {
            return Err(Error::Config(format!(
                "snapshot at iteration {} cannot continue a run of {} iterations in blocks of {}",
                self.iteration, schedule.n_iterations, schedule.n_int_block
            )));
        }
        Ok(Self {
            block: self.iteration / schedule.n_int_block,
            n_blocks: schedule.n_blocks,
            status_every: schedule.status_every,
            ..self
        })
    }

    pub fn is_finished(&self) -> bool {
        self.block >= self.n_blocks
    }

    /// Marks a block of `n_int_block` iterations on `n_chain` chains as done.
    pub fn complete_block(&mut self, n_chain: usize, n_int_block: u64) {
        self.block += 1;
        self.iteration += n_int_block;
        self.shape_updates += n_chain as u64;
        self.projection_iterations += n_int_block - 1;
    }

    pub fn status_due(&self) -> bool {
        self.block % self.status_every == 0
    }

    pub fn flush_due(&self, save_every_n: u64) -> bool {
        self.iteration % save_every_n == 0
    }
}
