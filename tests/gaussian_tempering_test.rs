//! Tests of the sampling engine on analytic targets, independent of the pulsar-timing model.
//!
//! A Gaussian likelihood split into one shape parameter and two projection parameters is sampled
//! with the full ladder; the cold samples must reproduce its mean and variance.

#[cfg(test)]
mod tests {
    use pta_cw_sampler::checkpoint::MemoryCheckpoint;
    use pta_cw_sampler::config::SamplerConfig;
    use pta_cw_sampler::empirical::EmpiricalSet;
    use pta_cw_sampler::likelihood::{FastLikelihood, Projection};
    use pta_cw_sampler::params::{GroupSpec, JumpTarget, ParameterSpace, Prior, UpdateKind};
    use pta_cw_sampler::proposal::ProposalEngine;
    use pta_cw_sampler::stats::RunningMoments;
    use pta_cw_sampler::tempering::ParallelTempering;

    const MEAN: [f64; 3] = [1.0, -2.0, 0.5];
    const SIGMA: [f64; 3] = [1.0, 0.5, 2.0];
    const SEED: u64 = 42;

    /// Independent Gaussian; the first coordinate is the shape parameter.
    #[derive(Debug)]
    struct SplitGaussian {
        shape: Vec<usize>,
        flat: bool,
    }

    impl SplitGaussian {
        fn term(&self, i: usize, x: f64) -> f64 {
            if self.flat {
                0.0
            } else {
                -0.5 * ((x - MEAN[i]) / SIGMA[i]).powi(2)
            }
        }
    }

    impl FastLikelihood for SplitGaussian {
        type Basis = f64;
        type Delta = ();

        fn shape_indices(&self) -> &[usize] {
            &self.shape
        }

        fn compute_basis(&self, params: &[f64]) -> f64 {
            self.term(0, params[0])
        }

        fn project(&self, basis: &f64, params: &[f64]) -> Projection<()> {
            Projection {
                log_likelihood: basis + self.term(1, params[1]) + self.term(2, params[2]),
                delta: (),
            }
        }

        fn apply(&self, _basis: &mut f64, _delta: ()) {}
    }

    fn space() -> ParameterSpace {
        let wide = Prior::Uniform {
            min: -10.0,
            max: 10.0,
        };
        ParameterSpace::new(vec![
            GroupSpec::new("shape", UpdateKind::Shape, JumpTarget::Common).param("x0", wide),
            GroupSpec::new("projection", UpdateKind::Projection, JumpTarget::Common)
                .param("x1", wide)
                .param("x2", wide),
        ])
        .unwrap()
    }

    fn config() -> SamplerConfig {
        SamplerConfig {
            n_chain: 4,
            t_max: 3.0,
            n_iterations: 20_000,
            n_int_block: 10,
            save_every_n: 10_000,
            n_status_update: 1,
            thin: 5,
            seed: Some(SEED),
            de_history_len: 500,
            ..SamplerConfig::default()
        }
    }

    /// Checks that the cold samples match the mean and variance of the target.
    #[test]
    fn test_split_gaussian_moments() {
        let space = space();
        let config = config();
        let likelihood = SplitGaussian {
            shape: vec![0],
            flat: false,
        };
        let engine = ProposalEngine::new(&config, EmpiricalSet::empty(&space));
        let mut sampler = ParallelTempering::new(
            &likelihood,
            &space,
            &engine,
            &config,
            MemoryCheckpoint::default(),
        )
        .unwrap();
        sampler.run().unwrap();
        let rows = sampler.into_writer().rows;

        // Discard the first quarter as burn-in.
        let mut moments = RunningMoments::new(3);
        for row in rows.iter().filter(|r| r.iteration >= 5_000) {
            assert_eq!(row.rank, 0);
            moments.update(&row.params);
        }
        let variance = moments.variance();
        for i in 0..3 {
            let mean_diff = (moments.mean()[i] - MEAN[i]).abs();
            assert!(
                mean_diff < 0.4 * SIGMA[i],
                "mean of x{i} off by {mean_diff}"
            );
            let ratio = variance[i] / SIGMA[i].powi(2);
            assert!(
                (0.6..1.5).contains(&ratio),
                "variance of x{i} off by a factor {ratio}"
            );
        }
    }

    /// With a flat likelihood and uniform priors every candidate inside the support is accepted.
    #[test]
    fn test_flat_target_accepts_everything_in_support() {
        let space = space();
        let config = SamplerConfig {
            n_iterations: 2_000,
            save_every_n: 2_000,
            ..config()
        };
        let likelihood = SplitGaussian {
            shape: vec![0],
            flat: true,
        };
        let engine = ProposalEngine::new(&config, EmpiricalSet::empty(&space));
        let mut sampler = ParallelTempering::new(
            &likelihood,
            &space,
            &engine,
            &config,
            MemoryCheckpoint::default(),
        )
        .unwrap();
        sampler.run().unwrap();

        for chain in sampler.chains() {
            let stats = chain.rung().stats;
            let total = stats.total();
            assert!(total.proposed > 0);
            assert_eq!(stats.numerical_rejections, 0);
            assert_eq!(total.accepted, total.proposed - stats.prior_rejections);
        }
        // equal energies everywhere: every swap is accepted
        for pair in &sampler.swaps().pairs {
            assert_eq!(pair.accepted, pair.proposed);
        }
    }
}
