/*!
# Sampler Configuration

[`SamplerConfig`] collects every tunable of a run: the temperature ladder, block and checkpoint
cadence, proposal weights and the switches that pin noise processes. [`SamplerConfig::schedule`]
validates the configuration and derives the [`RunSchedule`] that the controller follows. All
configuration errors surface there, before any chain is initialised.

```rust
use pta_cw_sampler::config::SamplerConfig;

let config = SamplerConfig {
    n_iterations: 20_000,
    n_int_block: 10_000,
    save_every_n: 10_000,
    ..SamplerConfig::default()
};
let schedule = config.schedule().unwrap();
assert_eq!(schedule.n_blocks, 2);
```
*/

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Prior used for the CW strain amplitude.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AmplitudePrior {
    /// Uniform in `log10_h`.
    #[default]
    Detection,
    /// Uniform in `h`, i.e. linear-exponential in `log10_h`.
    UpperLimit,
}

/// Which density the inverse temperature multiplies in the accept and swap rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TemperedDensity {
    /// `beta * (log L + log prior)`.
    #[default]
    Posterior,
    /// `beta * log L + log prior`.
    Likelihood,
}

/// Relative weights of the proposal strategies.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StrategyWeights {
    pub prior_draw: f64,
    pub differential_evolution: f64,
    pub fisher: f64,
    /// Only used when empirical distributions were supplied.
    pub empirical: f64,
}

impl Default for StrategyWeights {
    fn default() -> Self {
        Self {
            prior_draw: 0.2,
            differential_evolution: 0.6,
            fisher: 0.3,
            empirical: 0.2,
        }
    }
}

/// Relative weights of the parameter groups a proposal perturbs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetWeights {
    pub dist: f64,
    pub red_noise: f64,
    pub gwb: f64,
    pub common: f64,
    pub all: f64,
}

impl Default for TargetWeights {
    fn default() -> Self {
        Self {
            dist: 0.2,
            red_noise: 0.3,
            gwb: 0.1,
            common: 0.2,
            all: 0.2,
        }
    }
}

/// Full configuration of a parallel-tempered run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerConfig {
    /// Highest temperature of the geometric ladder.
    pub t_max: f64,
    pub n_chain: usize,
    /// Total number of iterations of the run.
    pub n_iterations: u64,
    /// Iterations per block: one shape update followed by projection updates.
    pub n_int_block: u64,
    /// Iterations between checkpoint flushes.
    pub save_every_n: u64,
    /// Number of status reports over the whole run.
    pub n_status_update: u64,
    /// Record the state of every saved rung each `thin` iterations.
    pub thin: u64,
    /// Number of coolest rungs written to the sample table.
    pub n_save: usize,
    pub seed: Option<u64>,
    /// Lower bound of the GW frequency prior in Hz. `None` means `1 / T_span`.
    pub freq_min: Option<f64>,
    pub freq_max: f64,
    /// Upper bound of the log10 chirp mass prior (solar masses).
    pub m_max: f64,
    pub amplitude_prior: AmplitudePrior,
    /// Fourier components of the per-pulsar red noise.
    pub rn_comps: usize,
    /// Fourier components of the common (GWB) process.
    pub gwb_comps: usize,
    pub strategy_weights: StrategyWeights,
    pub target_weights: TargetWeights,
    /// Keep red noise at the noise-dictionary values.
    pub fix_rn: bool,
    /// Pin red noise to the zero sentinel.
    pub zero_rn: bool,
    /// Keep the GWB at the noise-dictionary values.
    pub fix_gwb: bool,
    /// Pin the GWB to the zero sentinel.
    pub zero_gwb: bool,
    pub include_cw: bool,
    /// Iterations between temperature swap phases.
    pub swap_every: u64,
    pub de_history_len: usize,
    pub tempered_density: TemperedDensity,
    /// Finite-difference step for Fisher matrices, relative to the prior width.
    pub fisher_step: f64,
    /// Consecutive Fisher failures on one chain and group before the run aborts.
    pub max_fisher_failures: u32,
    /// Full-matrix Fisher groups are recomputed every this many blocks; diagonal groups every block.
    pub fisher_eig_downsample: u64,
    pub checkpoint_retries: u32,
    pub show_progress: bool,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            t_max: 3.0,
            n_chain: 4,
            n_iterations: 5_000_000,
            n_int_block: 10_000,
            save_every_n: 100_000,
            n_status_update: 100,
            thin: 100,
            n_save: 1,
            seed: None,
            freq_min: None,
            freq_max: 2.5e-8,
            m_max: 10.0,
            amplitude_prior: AmplitudePrior::Detection,
            rn_comps: 30,
            gwb_comps: 16,
            strategy_weights: StrategyWeights::default(),
            target_weights: TargetWeights::default(),
            fix_rn: false,
            zero_rn: false,
            fix_gwb: false,
            zero_gwb: false,
            include_cw: true,
            swap_every: 10,
            de_history_len: 1000,
            tempered_density: TemperedDensity::Posterior,
            fisher_step: 1e-4,
            max_fisher_failures: 10,
            fisher_eig_downsample: 1,
            checkpoint_retries: 3,
            show_progress: false,
        }
    }
}

/// Derived, validated cadence of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSchedule {
    pub n_iterations: u64,
    pub n_int_block: u64,
    pub n_blocks: u64,
    pub save_every_n: u64,
    /// Blocks between status reports.
    pub status_every: u64,
}

impl SamplerConfig {
    /// Validates the configuration and derives the block schedule.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the block length does not divide the run length or the
    /// checkpoint interval, when the checkpoint interval does not divide the run length, when the
    /// status cadence does not divide the block count, or when any other setting is out of range.
    pub fn schedule(&self) -> Result<RunSchedule> {
        if self.n_chain == 0 {
            return Err(Error::Config("n_chain must be at least 1".to_string()));
        }
        if self.n_save == 0 || self.n_save > self.n_chain {
            return Err(Error::Config(format!(
                "n_save ({}) must be between 1 and n_chain ({})",
                self.n_save, self.n_chain
            )));
        }
        if !(self.t_max.is_finite() && self.t_max >= 1.0) {
            return Err(Error::Config(format!(
                "t_max must be a finite value >= 1, got {}",
                self.t_max
            )));
        }
        if self.n_iterations == 0 || self.n_int_block == 0 {
            return Err(Error::Config(
                "n_iterations and n_int_block must be positive".to_string(),
            ));
        }
        if self.thin == 0 || self.swap_every == 0 || self.save_every_n == 0 {
            return Err(Error::Config(
                "thin, swap_every and save_every_n must be positive".to_string(),
            ));
        }
        if self.n_iterations % self.n_int_block != 0 {
            return Err(Error::Config(format!(
                "n_iterations ({}) is not a multiple of the block length ({})",
                self.n_iterations, self.n_int_block
            )));
        }
        if self.save_every_n % self.n_int_block != 0 {
            return Err(Error::Config(format!(
                "save_every_n ({}) is not a multiple of the block length ({})",
                self.save_every_n, self.n_int_block
            )));
        }
        if self.n_iterations % self.save_every_n != 0 {
            return Err(Error::Config(format!(
                "n_iterations ({}) is not a multiple of save_every_n ({})",
                self.n_iterations, self.save_every_n
            )));
        }
        if self.n_status_update == 0 {
            return Err(Error::Config("n_status_update must be positive".to_string()));
        }
        let n_blocks = self.n_iterations / self.n_int_block;
        let status_every = (n_blocks / self.n_status_update).max(1);
        if n_blocks % status_every != 0 {
            return Err(Error::Config(format!(
                "status cadence of {status_every} blocks does not divide the {n_blocks} blocks of the run"
            )));
        }
        if self.fix_rn && self.zero_rn {
            return Err(Error::Config(
                "fix_rn and zero_rn are mutually exclusive".to_string(),
            ));
        }
        if self.fix_gwb && self.zero_gwb {
            return Err(Error::Config(
                "fix_gwb and zero_gwb are mutually exclusive".to_string(),
            ));
        }
        if let Some(fmin) = self.freq_min {
            if !(fmin > 0.0 && fmin < self.freq_max) {
                return Err(Error::Config(format!(
                    "frequency bounds [{fmin}, {}] are empty or non-positive",
                    self.freq_max
                )));
            }
        }
        if !(self.freq_max > 0.0 && self.freq_max.is_finite()) {
            return Err(Error::Config(format!(
                "freq_max must be positive, got {}",
                self.freq_max
            )));
        }
        if !(self.m_max > 7.0) {
            return Err(Error::Config(format!(
                "m_max must exceed the lower chirp-mass bound of 7, got {}",
                self.m_max
            )));
        }
        if self.rn_comps == 0 && self.gwb_comps == 0 {
            return Err(Error::Config(
                "at least one of rn_comps and gwb_comps must be positive".to_string(),
            ));
        }
        if !(self.fisher_step > 0.0 && self.fisher_step < 1.0) {
            return Err(Error::Config(format!(
                "fisher_step must lie in (0, 1), got {}",
                self.fisher_step
            )));
        }
        if self.fisher_eig_downsample == 0 {
            return Err(Error::Config(
                "fisher_eig_downsample must be positive".to_string(),
            ));
        }
        if self.de_history_len < 2 {
            return Err(Error::Config("de_history_len must be at least 2".to_string()));
        }
        check_weights(
            "strategy",
            &[
                self.strategy_weights.prior_draw,
                self.strategy_weights.differential_evolution,
                self.strategy_weights.fisher,
                self.strategy_weights.empirical,
            ],
        )?;
        check_weights(
            "target",
            &[
                self.target_weights.dist,
                self.target_weights.red_noise,
                self.target_weights.gwb,
                self.target_weights.common,
                self.target_weights.all,
            ],
        )?;

        Ok(RunSchedule {
            n_iterations: self.n_iterations,
            n_int_block: self.n_int_block,
            n_blocks,
            save_every_n: self.save_every_n,
            status_every,
        })
    }

    /// Seed of the run; a random one is drawn when none was configured.
    pub fn resolved_seed(&self) -> u64 {
        self.seed.unwrap_or_else(rand::random)
    }
}

fn check_weights(kind: &str, weights: &[f64]) -> Result<()> {
    if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
        return Err(Error::Config(format!(
            "{kind} weights must be finite and non-negative, got {weights:?}"
        )));
    }
    if weights.iter().sum::<f64>() <= 0.0 {
        return Err(Error::Config(format!("{kind} weights are all zero")));
    }
    Ok(())
}
