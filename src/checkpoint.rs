/*!
# Checkpoints

The controller hands three things to a [`CheckpointWriter`] at every flush:

- the thinned samples of the saved (coldest) rungs recorded since the previous flush, ordered by
  iteration and rank,
- a [`RunSummary`] with acceptance and swap statistics of every rung,
- a [`Snapshot`] from which the run can be resumed.

[`CsvCheckpoint`](crate::io::csv::CsvCheckpoint) persists them to disk; [`MemoryCheckpoint`]
keeps them in memory.
*/

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use crate::chain::Rung;
use crate::context::RunContext;
use crate::error::{Error, Result};
use crate::fisher::FisherSet;
use crate::stats::{RunSummary, RunningMoments, SwapStats};

/// One saved state of a rung.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRow {
    pub rank: usize,
    pub iteration: u64,
    pub log_likelihood: f64,
    pub log_prior: f64,
    pub params: Vec<f64>,
}

/// Resumable state of one chain. The likelihood cache is rebuilt by the first shape iteration
/// after resuming; Fisher directions are kept, since full-matrix groups are not refreshed every
/// block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainSnapshot {
    pub id: usize,
    pub params: Vec<f64>,
    pub log_likelihood: f64,
    pub log_prior: f64,
    pub rung: Rung,
    pub rng_seed: u64,
    pub fisher: FisherSet,
}

/// Everything needed to continue a run from a flush point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub param_names: Vec<String>,
    pub context: RunContext,
    pub chains: Vec<ChainSnapshot>,
    pub swap_seed: u64,
    pub swaps: SwapStats,
    pub cold_moments: RunningMoments,
}

impl Snapshot {
    /// Encodes the snapshot with bincode into `writer`, flushing it before returning.
    pub fn write_to<W: Write>(&self, writer: W) -> Result<()> {
        let mut writer = BufWriter::new(writer);
        bincode::serialize_into(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }

    /// Writes the snapshot through a temporary file that is synced and then renamed into place.
    /// On failure the previous snapshot at `path` is left untouched.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let file = File::create(&tmp)?;
        let written = self
            .write_to(&file)
            .and_then(|_| file.sync_all().map_err(Error::from));
        if let Err(e) = written {
            let _ = std::fs::remove_file(&tmp);
            return Err(e);
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            Error::Config(format!("cannot open snapshot {}: {e}", path.display()))
        })?;
        Ok(bincode::deserialize_from(BufReader::new(file))?)
    }
}

/// Destination of flushed samples, summaries and snapshots.
pub trait CheckpointWriter {
    /// Appends rows. Must either persist all of them or fail.
    fn write_samples(&mut self, rows: &[SampleRow]) -> Result<()>;

    fn write_summary(&mut self, summary: &RunSummary) -> Result<()>;

    fn write_snapshot(&mut self, _snapshot: &Snapshot) -> Result<()> {
        Ok(())
    }

    /// Drops persisted rows with `iteration >= iteration` before a resume from a snapshot taken
    /// at `iteration`. Such rows exist when a flush wrote its samples but not its snapshot.
    /// Returns the number of rows dropped.
    fn rewind(&mut self, _iteration: u64) -> Result<usize> {
        Ok(0)
    }
}

impl<W: CheckpointWriter + ?Sized> CheckpointWriter for &mut W {
    fn write_samples(&mut self, rows: &[SampleRow]) -> Result<()> {
        (**self).write_samples(rows)
    }

    fn write_summary(&mut self, summary: &RunSummary) -> Result<()> {
        (**self).write_summary(summary)
    }

    fn write_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        (**self).write_snapshot(snapshot)
    }

    fn rewind(&mut self, iteration: u64) -> Result<usize> {
        (**self).rewind(iteration)
    }
}

/// Keeps every flush in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpoint {
    pub rows: Vec<SampleRow>,
    pub summaries: Vec<RunSummary>,
    pub snapshots: Vec<Snapshot>,
    /// Number of `write_samples` calls.
    pub flushes: usize,
}

impl CheckpointWriter for MemoryCheckpoint {
    fn write_samples(&mut self, rows: &[SampleRow]) -> Result<()> {
        self.rows.extend_from_slice(rows);
        self.flushes += 1;
        Ok(())
    }

    fn write_summary(&mut self, summary: &RunSummary) -> Result<()> {
        self.summaries.push(summary.clone());
        Ok(())
    }

    fn write_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        self.snapshots.push(snapshot.clone());
        Ok(())
    }

    fn rewind(&mut self, iteration: u64) -> Result<usize> {
        let before = self.rows.len();
        self.rows.retain(|r| r.iteration < iteration);
        Ok(before - self.rows.len())
    }
}
