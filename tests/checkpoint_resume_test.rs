//! Tests of the on-disk checkpoint: CSV sample table, summary, snapshot and resuming a run.

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    use pta_cw_sampler::checkpoint::{CheckpointWriter, SampleRow, Snapshot};
    use pta_cw_sampler::config::SamplerConfig;
    use pta_cw_sampler::empirical::EmpiricalSet;
    use pta_cw_sampler::error::{Error, Result};
    use pta_cw_sampler::io::csv::{read_samples, CsvCheckpoint};
    use pta_cw_sampler::proposal::ProposalEngine;
    use pta_cw_sampler::stats::RunSummary;
    use pta_cw_sampler::synthetic::{CwInjection, SyntheticPta};
    use pta_cw_sampler::tempering::ParallelTempering;

    const SEED: u64 = 17;

    fn pta() -> SyntheticPta {
        SyntheticPta::builder()
            .n_pulsars(2)
            .n_toas(40)
            .inject(CwInjection::default())
            .build(SEED)
            .unwrap()
    }

    fn config(pta: &SyntheticPta, n_iterations: u64) -> SamplerConfig {
        SamplerConfig {
            n_iterations,
            n_int_block: 100,
            save_every_n: 200,
            n_save: 2,
            ..pta.config()
        }
    }

    /// Runs from scratch into `path`.
    fn fresh_run(pta: &SyntheticPta, config: &SamplerConfig, path: &Path) -> RunSummary {
        let space = pta.space(config).unwrap();
        let likelihood = pta.likelihood(&space, config).unwrap();
        let engine = ProposalEngine::new(config, EmpiricalSet::empty(&space));
        let writer = CsvCheckpoint::create(path, space.names(), 0).unwrap();
        ParallelTempering::new(&likelihood, &space, &engine, config, writer)
            .unwrap()
            .run()
            .unwrap()
    }

    #[test]
    fn resumed_run_matches_uninterrupted_run() {
        let dir = tempdir().unwrap();
        let pta = pta();
        let full = config(&pta, 400);
        let half = config(&pta, 200);

        let straight = dir.path().join("straight.csv");
        fresh_run(&pta, &full, &straight);

        let split = dir.path().join("split.csv");
        fresh_run(&pta, &half, &split);
        let space = pta.space(&full).unwrap();
        let likelihood = pta.likelihood(&space, &full).unwrap();
        let engine = ProposalEngine::new(&full, EmpiricalSet::empty(&space));
        let writer = CsvCheckpoint::resume(&split, space.names(), 0).unwrap();
        let snapshot = Snapshot::load(writer.state_path()).unwrap();
        assert_eq!(snapshot.context.iteration, 200);
        let summary = ParallelTempering::resume(&likelihood, &space, &engine, &full, writer, snapshot)
            .unwrap()
            .run()
            .unwrap();
        assert_eq!(summary.iteration, 400);
        assert_eq!(summary.flushes, 2);

        assert_eq!(
            fs::read_to_string(&straight).unwrap(),
            fs::read_to_string(&split).unwrap()
        );
    }

    /// Writes through to a CSV checkpoint but fails the `fail_at`-th snapshot.
    struct SnapshotFailure {
        inner: CsvCheckpoint,
        snapshots: usize,
        fail_at: usize,
    }

    impl CheckpointWriter for SnapshotFailure {
        fn write_samples(&mut self, rows: &[SampleRow]) -> Result<()> {
            self.inner.write_samples(rows)
        }

        fn write_summary(&mut self, summary: &RunSummary) -> Result<()> {
            self.inner.write_summary(summary)
        }

        fn write_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
            self.snapshots += 1;
            if self.snapshots == self.fail_at {
                return Err(Error::Checkpoint("no space left on device".to_string()));
            }
            self.inner.write_snapshot(snapshot)
        }
    }

    #[test]
    fn resume_after_failed_snapshot_does_not_duplicate_rows() {
        let dir = tempdir().unwrap();
        let pta = pta();
        let config = config(&pta, 600);
        let space = pta.space(&config).unwrap();
        let likelihood = pta.likelihood(&space, &config).unwrap();
        let engine = ProposalEngine::new(&config, EmpiricalSet::empty(&space));

        let straight = dir.path().join("straight.csv");
        fresh_run(&pta, &config, &straight);

        let broken = dir.path().join("broken.csv");
        let writer = SnapshotFailure {
            inner: CsvCheckpoint::create(&broken, space.names(), 0).unwrap(),
            snapshots: 0,
            fail_at: 2,
        };
        let result = ParallelTempering::new(&likelihood, &space, &engine, &config, writer)
            .unwrap()
            .run();
        assert!(matches!(result, Err(Error::Checkpoint(_))));
        // samples of the second flush reached the table, its snapshot did not
        assert_eq!(read_samples(&broken).unwrap().1.len(), 2 * 40);

        let writer = CsvCheckpoint::resume(&broken, space.names(), 0).unwrap();
        let snapshot = Snapshot::load(writer.state_path()).unwrap();
        assert_eq!(snapshot.context.iteration, 200);
        let summary = ParallelTempering::resume(&likelihood, &space, &engine, &config, writer, snapshot)
            .unwrap()
            .run()
            .unwrap();
        assert_eq!(summary.iteration, 600);

        let (_, rows) = read_samples(&broken).unwrap();
        assert_eq!(rows.len(), 2 * 60);
        assert!(rows.windows(2).all(|w| (w[0].iteration, w[0].rank) < (w[1].iteration, w[1].rank)));
        assert_eq!(
            fs::read_to_string(&straight).unwrap(),
            fs::read_to_string(&broken).unwrap()
        );
    }

    #[test]
    fn table_summary_and_snapshot_are_written() {
        let dir = tempdir().unwrap();
        let pta = pta();
        let config = config(&pta, 400);
        let path = dir.path().join("chain.csv");
        let summary = fresh_run(&pta, &config, &path);

        let (names, rows) = read_samples(&path).unwrap();
        assert_eq!(names, pta.space(&config).unwrap().names());
        // two saved rungs, every tenth iteration
        assert_eq!(rows.len(), 2 * 40);
        assert!(rows.windows(2).all(|w| (w[0].iteration, w[0].rank) < (w[1].iteration, w[1].rank)));
        assert!(rows.iter().all(|r| r.rank < 2));

        let text = fs::read_to_string(dir.path().join("chain.csv.summary.json")).unwrap();
        let written: RunSummary = serde_json::from_str(&text).unwrap();
        assert_eq!(written.iteration, summary.iteration);
        assert_eq!(written.rungs.len(), config.n_chain);

        let snapshot = Snapshot::load(dir.path().join("chain.csv.state")).unwrap();
        assert_eq!(snapshot.context.iteration, 400);
        assert_eq!(snapshot.chains.len(), config.n_chain);
    }

    #[test]
    fn resume_rejects_a_different_parameter_space() {
        let dir = tempdir().unwrap();
        let pta = pta();
        let config = config(&pta, 200);
        let path = dir.path().join("chain.csv");
        fresh_run(&pta, &config, &path);

        let other = SyntheticPta::builder().n_pulsars(3).n_toas(40).build(SEED).unwrap();
        let space = other.space(&config).unwrap();
        assert!(matches!(
            CsvCheckpoint::resume(&path, space.names(), 0),
            Err(Error::Checkpoint(_))
        ));

        let likelihood = other.likelihood(&space, &config).unwrap();
        let engine = ProposalEngine::new(&config, EmpiricalSet::empty(&space));
        let fresh_table = dir.path().join("other.csv");
        let writer = CsvCheckpoint::create(&fresh_table, space.names(), 0).unwrap();
        let snapshot = Snapshot::load(dir.path().join("chain.csv.state")).unwrap();
        let result = ParallelTempering::resume(&likelihood, &space, &engine, &config, writer, snapshot);
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
