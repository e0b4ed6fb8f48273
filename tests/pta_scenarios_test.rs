//! End-to-end runs of the CW search on synthetic pulsar timing arrays.

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    use pta_cw_sampler::cache::FastLikelihoodCache;
    use pta_cw_sampler::checkpoint::{CheckpointWriter, MemoryCheckpoint, SampleRow};
    use pta_cw_sampler::config::SamplerConfig;
    use pta_cw_sampler::empirical::EmpiricalSet;
    use pta_cw_sampler::error::{Error, Result};
    use pta_cw_sampler::likelihood::cw::CwLikelihood;
    use pta_cw_sampler::likelihood::FastLikelihood;
    use pta_cw_sampler::params::{
        JumpTarget, ParameterSpace, UpdateKind, GWB_GAMMA, GWB_LOG10_A, ZERO_NOISE,
    };
    use pta_cw_sampler::proposal::{ProposalEngine, Strategy};
    use pta_cw_sampler::stats::RunSummary;
    use pta_cw_sampler::synthetic::{CwInjection, SyntheticPta};
    use pta_cw_sampler::tempering::{temperature_ladder, ParallelTempering};

    struct Fixture {
        config: SamplerConfig,
        space: ParameterSpace,
        likelihood: CwLikelihood,
        engine: ProposalEngine,
    }

    impl Fixture {
        fn new(seed: u64, tweak: impl FnOnce(SamplerConfig) -> SamplerConfig) -> Self {
            let pta = SyntheticPta::builder()
                .n_pulsars(2)
                .n_toas(40)
                .inject(CwInjection::default())
                .build(seed)
                .unwrap();
            let config = tweak(pta.config());
            let space = pta.space(&config).unwrap();
            let likelihood = pta.likelihood(&space, &config).unwrap();
            let engine = ProposalEngine::new(&config, EmpiricalSet::empty(&space));
            Self {
                config,
                space,
                likelihood,
                engine,
            }
        }

        fn sampler<W: CheckpointWriter>(
            &self,
            writer: W,
        ) -> Result<ParallelTempering<'_, CwLikelihood, W>> {
            ParallelTempering::new(
                &self.likelihood,
                &self.space,
                &self.engine,
                &self.config,
                writer,
            )
        }

        fn run(&self) -> (RunSummary, MemoryCheckpoint) {
            let mut sampler = self.sampler(MemoryCheckpoint::default()).unwrap();
            let summary = sampler.run().unwrap();
            (summary, sampler.into_writer())
        }
    }

    /// Fails every write.
    struct BrokenDisk;

    impl CheckpointWriter for BrokenDisk {
        fn write_samples(&mut self, _rows: &[SampleRow]) -> Result<()> {
            Err(Error::Checkpoint("disk full".to_string()))
        }

        fn write_summary(&mut self, _summary: &RunSummary) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn fast_likelihood_matches_dense_reference() {
        let fixture = Fixture::new(1, |c| c);
        let space = &fixture.space;
        let mut rng = SmallRng::seed_from_u64(3);
        for _ in 0..5 {
            let mut x = space.draw_initial(&mut rng);
            // moderate noise keeps the dense covariance well conditioned
            for (name, value) in space.names().iter().zip(x.iter_mut()) {
                if name.ends_with("log10_A") {
                    *value = -14.5;
                } else if name.ends_with("gamma") {
                    *value = 13.0 / 3.0;
                }
            }
            assert_relative_eq!(
                fixture.likelihood.log_likelihood(&x),
                fixture.likelihood.dense_log_likelihood(&x),
                max_relative = 1e-7
            );
        }
    }

    #[test]
    fn projection_scores_agree_with_full_evaluation() {
        let fixture = Fixture::new(2, |c| c);
        let (space, lik) = (&fixture.space, &fixture.likelihood);
        let mut rng = SmallRng::seed_from_u64(8);
        let x = space.draw_initial(&mut rng);
        let mut cache = FastLikelihoodCache::new();
        let base = cache.refresh(lik, &x);
        assert_relative_eq!(base, lik.log_likelihood(&x), max_relative = 1e-12);

        for _ in 0..10 {
            let mut y = x.clone();
            for g in space.free_groups(JumpTarget::All, UpdateKind::Projection) {
                for &i in &space.group(g).indices {
                    y[i] = space.prior(i).sample(&mut rng);
                }
            }
            let scored = cache.score_projection(lik, &y).unwrap();
            assert_relative_eq!(
                scored.log_likelihood,
                lik.log_likelihood(&y),
                max_relative = 1e-8
            );
        }
    }

    #[test]
    fn single_block_run_counts() {
        let fixture = Fixture::new(3, |c| SamplerConfig {
            n_chain: 4,
            n_iterations: 10_000,
            n_int_block: 10_000,
            save_every_n: 10_000,
            thin: 100,
            ..c
        });
        let (summary, writer) = fixture.run();
        assert_eq!(summary.shape_updates, 4);
        assert_eq!(summary.projection_iterations, 9_999);
        assert_eq!(summary.flushes, 1);
        assert_eq!(writer.flushes, 1);
        assert_eq!(writer.rows.len(), 100);
    }

    #[test]
    fn zeroed_gwb_stays_pinned_without_empirical_jumps() {
        let fixture = Fixture::new(4, |c| SamplerConfig {
            zero_gwb: true,
            n_save: 3,
            ..c
        });
        let gamma = fixture.space.require(GWB_GAMMA).unwrap();
        let log10_a = fixture.space.require(GWB_LOG10_A).unwrap();

        let mut sampler = fixture.sampler(MemoryCheckpoint::default()).unwrap();
        sampler.run().unwrap();
        for chain in sampler.chains() {
            assert_eq!(chain.rung().stats.get(Strategy::Empirical).proposed, 0);
        }
        let rows = sampler.into_writer().rows;
        assert!(!rows.is_empty());
        for row in &rows {
            assert_eq!(row.params[gamma], ZERO_NOISE[0]);
            assert_eq!(row.params[log10_a], ZERO_NOISE[1]);
        }
    }

    #[test]
    fn indivisible_run_length_fails_before_sampling() {
        let fixture = Fixture::new(5, |c| c);
        let config = SamplerConfig {
            n_iterations: 100,
            n_int_block: 10_000,
            save_every_n: 10_000,
            ..fixture.config.clone()
        };
        let result = ParallelTempering::new(
            &fixture.likelihood,
            &fixture.space,
            &fixture.engine,
            &config,
            MemoryCheckpoint::default(),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn same_seed_same_samples_on_any_thread_count() {
        let fixture = Fixture::new(6, |c| c);
        let (_, first) = fixture.run();
        let (_, second) = fixture.run();
        assert_eq!(first.rows, second.rows);

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(1)
            .build()
            .unwrap();
        let (_, serial) = pool.install(|| fixture.run());
        assert_eq!(first.rows, serial.rows);
    }

    #[test]
    fn ladder_survives_swaps_and_caches_stay_fresh() {
        let fixture = Fixture::new(7, |c| SamplerConfig {
            n_chain: 5,
            t_max: 20.0,
            swap_every: 2,
            ..c
        });
        let mut sampler = fixture.sampler(MemoryCheckpoint::default()).unwrap();
        sampler.run().unwrap();

        let mut temperatures = sampler.temperatures();
        temperatures.sort_by(f64::total_cmp);
        for (t, expected) in temperatures.iter().zip(temperature_ladder(20.0, 5)) {
            assert_relative_eq!(*t, expected, max_relative = 1e-12);
        }
        let mut ranks: Vec<usize> = sampler.chains().iter().map(|c| c.rung().rank).collect();
        ranks.sort_unstable();
        assert_eq!(ranks, vec![0, 1, 2, 3, 4]);

        for chain in sampler.chains() {
            assert!(chain.cache().matches(&fixture.likelihood, chain.params()));
            assert_relative_eq!(
                chain.log_likelihood(),
                fixture.likelihood.log_likelihood(chain.params()),
                max_relative = 1e-8
            );
            assert_relative_eq!(
                chain.log_prior(),
                fixture.space.log_prior(chain.params()),
                max_relative = 1e-12
            );
        }
    }

    #[test]
    fn failed_checkpoint_aborts_the_run() {
        let fixture = Fixture::new(8, |c| c);
        let mut sampler = fixture.sampler(BrokenDisk).unwrap();
        assert!(matches!(sampler.run(), Err(Error::Checkpoint(_))));
        assert_eq!(sampler.context().flushes, 1);
    }
}
