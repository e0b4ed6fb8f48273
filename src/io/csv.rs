/*!
# CSV Sample Table

[`CsvCheckpoint`] writes the thinned samples of a run to an append-only CSV file with the header

```text
rank,iteration,log_likelihood,log_prior,<parameter names...>
```

next to it `<file>.summary.json` (rewritten at every flush) and `<file>.state`, the resume
snapshot. Each flush is encoded in memory first and appended with a single write; a failed write
is rolled back to the previous file length and retried before the run is aborted.

Samples are written before the snapshot of the same flush. If the snapshot write fails, the table
holds rows the last good snapshot does not know about; [`CheckpointWriter::rewind`] cuts them off
before a resumed run appends again.
*/

use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::checkpoint::{CheckpointWriter, SampleRow, Snapshot};
use crate::error::{Error, Result};
use crate::stats::RunSummary;

const FIXED_COLUMNS: [&str; 4] = ["rank", "iteration", "log_likelihood", "log_prior"];

/// Header of a sample table over `param_names`.
pub fn header(param_names: &[String]) -> Vec<String> {
    FIXED_COLUMNS
        .iter()
        .map(|s| s.to_string())
        .chain(param_names.iter().cloned())
        .collect()
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

#[derive(Debug, Clone)]
pub struct CsvCheckpoint {
    path: PathBuf,
    summary_path: PathBuf,
    state_path: PathBuf,
    n_params: usize,
    retries: u32,
}

impl CsvCheckpoint {
    fn with_paths(path: &Path, n_params: usize, retries: u32) -> Self {
        Self {
            path: path.to_path_buf(),
            summary_path: sibling(path, ".summary.json"),
            state_path: sibling(path, ".state"),
            n_params,
            retries,
        }
    }

    /// Starts a new table at `path`, replacing any existing file.
    pub fn create<P: AsRef<Path>>(path: P, param_names: &[String], retries: u32) -> Result<Self> {
        let path = path.as_ref();
        let mut wtr = WriterBuilder::new().from_path(path)?;
        wtr.write_record(header(param_names))?;
        wtr.flush()?;
        Ok(Self::with_paths(path, param_names.len(), retries))
    }

    /// Reopens an existing table for appending.
    ///
    /// # Errors
    ///
    /// [`Error::Checkpoint`] when the file does not exist or its header does not match
    /// `param_names`.
    pub fn resume<P: AsRef<Path>>(path: P, param_names: &[String], retries: u32) -> Result<Self> {
        let path = path.as_ref();
        let mut reader = ReaderBuilder::new().from_path(path).map_err(|e| {
            Error::Checkpoint(format!("cannot reopen {}: {e}", path.display()))
        })?;
        let found: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        if found != header(param_names) {
            return Err(Error::Checkpoint(format!(
                "{} was written for different parameters",
                path.display()
            )));
        }
        Ok(Self::with_paths(path, param_names.len(), retries))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn summary_path(&self) -> &Path {
        &self.summary_path
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    fn encode(&self, rows: &[SampleRow]) -> Result<Vec<u8>> {
        let mut wtr = WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());
        for row in rows {
            if row.params.len() != self.n_params {
                return Err(Error::Checkpoint(format!(
                    "row with {} parameters for a table of {}",
                    row.params.len(),
                    self.n_params
                )));
            }
            let mut record = vec![
                row.rank.to_string(),
                row.iteration.to_string(),
                row.log_likelihood.to_string(),
                row.log_prior.to_string(),
            ];
            record.extend(row.params.iter().map(|v| v.to_string()));
            wtr.write_record(&record)?;
        }
        wtr.into_inner()
            .map_err(|e| Error::Checkpoint(format!("cannot encode samples: {e}")))
    }

    fn append(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        let len = file.metadata()?.len();
        let written = file.write_all(bytes).and_then(|_| file.sync_data());
        if written.is_err() {
            // drop a partially written flush so that a retry does not duplicate rows
            let _ = file.set_len(len);
        }
        written
    }
}

impl CheckpointWriter for CsvCheckpoint {
    fn write_samples(&mut self, rows: &[SampleRow]) -> Result<()> {
        let bytes = self.encode(rows)?;
        let mut attempt = 0;
        loop {
            match self.append(&bytes) {
                Ok(()) => {
                    debug!(rows = rows.len(), path = %self.path.display(), "appended samples");
                    return Ok(());
                }
                Err(e) if attempt < self.retries => {
                    attempt += 1;
                    warn!(attempt, error = %e, "sample write failed, retrying");
                }
                Err(e) => {
                    return Err(Error::Checkpoint(format!(
                        "cannot append to {} after {} attempts: {e}",
                        self.path.display(),
                        attempt + 1
                    )))
                }
            }
        }
    }

    fn write_summary(&mut self, summary: &RunSummary) -> Result<()> {
        let tmp = sibling(&self.summary_path, ".tmp");
        let mut writer = BufWriter::new(File::create(&tmp)?);
        serde_json::to_writer_pretty(&mut writer, summary)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        std::fs::rename(&tmp, &self.summary_path)?;
        Ok(())
    }

    fn write_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        snapshot.save(&self.state_path)
    }

    fn rewind(&mut self, iteration: u64) -> Result<usize> {
        let mut reader = ReaderBuilder::new().from_path(&self.path)?;
        reader.headers()?;
        let mut record = StringRecord::new();
        let mut cut = None;
        let mut dropped = 0;
        loop {
            let start = reader.position().byte();
            if !reader.read_record(&mut record)? {
                break;
            }
            if cut.is_none() {
                let found: u64 = record
                    .get(1)
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| Error::Data(format!("malformed iteration in {record:?}")))?;
                if found >= iteration {
                    cut = Some(start);
                }
            }
            if cut.is_some() {
                dropped += 1;
            }
        }
        if let Some(len) = cut {
            let file = OpenOptions::new().write(true).open(&self.path)?;
            file.set_len(len)?;
            file.sync_all()?;
            debug!(dropped, len, path = %self.path.display(), "truncated sample table");
        }
        Ok(dropped)
    }
}

/// Reads a sample table back: parameter names and rows.
pub fn read_samples<P: AsRef<Path>>(path: P) -> Result<(Vec<String>, Vec<SampleRow>)> {
    let mut reader = ReaderBuilder::new().from_path(path.as_ref())?;
    let names: Vec<String> = reader
        .headers()?
        .iter()
        .skip(FIXED_COLUMNS.len())
        .map(str::to_string)
        .collect();

    let parse = |field: Option<&str>| -> Result<f64> {
        field
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::Data(format!("malformed sample field {field:?}")))
    };
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(SampleRow {
            rank: parse(record.get(0))? as usize,
            iteration: parse(record.get(1))? as u64,
            log_likelihood: parse(record.get(2))?,
            log_prior: parse(record.get(3))?,
            params: (FIXED_COLUMNS.len()..record.len())
                .map(|i| parse(record.get(i)))
                .collect::<Result<_>>()?,
        });
    }
    Ok((names, rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn names() -> Vec<String> {
        vec!["log10_h".to_string(), "phase0".to_string()]
    }

    fn row(iteration: u64) -> SampleRow {
        SampleRow {
            rank: 0,
            iteration,
            log_likelihood: -12.25,
            log_prior: 0.1 + iteration as f64,
            params: vec![-14.5, 1.0 / 3.0],
        }
    }

    #[test]
    fn rows_round_trip_exactly() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chain.csv");
        let mut checkpoint = CsvCheckpoint::create(&path, &names(), 0).unwrap();
        checkpoint.write_samples(&[row(0), row(10)]).unwrap();
        checkpoint.write_samples(&[row(20)]).unwrap();

        let (found, rows) = read_samples(&path).unwrap();
        assert_eq!(found, names());
        assert_eq!(rows, vec![row(0), row(10), row(20)]);
    }

    #[test]
    fn resume_appends_after_header_check() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chain.csv");
        CsvCheckpoint::create(&path, &names(), 0)
            .unwrap()
            .write_samples(&[row(0)])
            .unwrap();

        let mut resumed = CsvCheckpoint::resume(&path, &names(), 0).unwrap();
        resumed.write_samples(&[row(10)]).unwrap();
        assert_eq!(read_samples(&path).unwrap().1.len(), 2);

        let other = vec!["x".to_string()];
        assert!(matches!(
            CsvCheckpoint::resume(&path, &other, 0),
            Err(Error::Checkpoint(_))
        ));
    }

    #[test]
    fn rewind_cuts_rows_past_the_snapshot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chain.csv");
        let mut checkpoint = CsvCheckpoint::create(&path, &names(), 0).unwrap();
        checkpoint.write_samples(&[row(0), row(10)]).unwrap();
        checkpoint.write_samples(&[row(20), row(30)]).unwrap();

        let mut resumed = CsvCheckpoint::resume(&path, &names(), 0).unwrap();
        assert_eq!(resumed.rewind(10).unwrap(), 3);
        assert_eq!(read_samples(&path).unwrap().1, vec![row(0)]);
        assert_eq!(resumed.rewind(10).unwrap(), 0);

        resumed.write_samples(&[row(10)]).unwrap();
        assert_eq!(read_samples(&path).unwrap().1, vec![row(0), row(10)]);
    }

    #[test]
    fn rewind_of_an_empty_table_keeps_the_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chain.csv");
        let mut checkpoint = CsvCheckpoint::create(&path, &names(), 0).unwrap();
        checkpoint.write_samples(&[row(0)]).unwrap();
        assert_eq!(checkpoint.rewind(0).unwrap(), 1);
        let (found, rows) = read_samples(&path).unwrap();
        assert_eq!(found, names());
        assert!(rows.is_empty());
    }

    #[test]
    fn vanished_file_fails_loudly() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chain.csv");
        let mut checkpoint = CsvCheckpoint::create(&path, &names(), 2).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(
            checkpoint.write_samples(&[row(0)]),
            Err(Error::Checkpoint(_))
        ));
    }

    #[test]
    fn summary_lands_next_to_table() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chain.csv");
        let checkpoint = CsvCheckpoint::create(&path, &names(), 0).unwrap();
        assert_eq!(
            checkpoint.summary_path(),
            dir.path().join("chain.csv.summary.json")
        );
        assert_eq!(checkpoint.state_path(), dir.path().join("chain.csv.state"));
    }
}
