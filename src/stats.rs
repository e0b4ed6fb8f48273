//! Acceptance and swap bookkeeping, running moments of the cold chain and the run summary that is
//! logged at every status report and written at every flush.

use core::fmt;
use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::proposal::Strategy;

/// Proposed and accepted counts of one kind of move.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JumpCounter {
    pub proposed: u64,
    pub accepted: u64,
}

impl JumpCounter {
    pub fn record(&mut self, accepted: bool) {
        self.proposed += 1;
        self.accepted += accepted as u64;
    }

    /// Fraction of accepted moves, 0 when nothing was proposed.
    pub fn rate(&self) -> f64 {
        if self.proposed == 0 {
            0.0
        } else {
            self.accepted as f64 / self.proposed as f64
        }
    }
}

/// Acceptance statistics of one temperature rung.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptanceStats {
    pub by_strategy: [JumpCounter; 4],
    /// Candidates outside the prior support, rejected without evaluating the likelihood.
    pub prior_rejections: u64,
    /// Candidates whose likelihood was not finite.
    pub numerical_rejections: u64,
}

impl AcceptanceStats {
    pub fn record(&mut self, strategy: Strategy, accepted: bool) {
        self.by_strategy[strategy.index()].record(accepted);
    }

    pub fn get(&self, strategy: Strategy) -> JumpCounter {
        self.by_strategy[strategy.index()]
    }

    pub fn total(&self) -> JumpCounter {
        self.by_strategy
            .iter()
            .fold(JumpCounter::default(), |acc, c| JumpCounter {
                proposed: acc.proposed + c.proposed,
                accepted: acc.accepted + c.accepted,
            })
    }
}

/// Swap statistics of adjacent rung pairs; entry `r` covers ranks `r` and `r + 1`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapStats {
    pub pairs: Vec<JumpCounter>,
}

impl SwapStats {
    pub fn new(n_chain: usize) -> Self {
        Self {
            pairs: vec![JumpCounter::default(); n_chain.saturating_sub(1)],
        }
    }

    pub fn record(&mut self, pair: usize, accepted: bool) {
        self.pairs[pair].record(accepted);
    }

    pub fn rates(&self) -> Vec<f64> {
        self.pairs.iter().map(JumpCounter::rate).collect()
    }
}

/// Running mean and variance (Welford) of a sequence of parameter vectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningMoments {
    n: u64,
    mean: Array1<f64>,
    m2: Array1<f64>,
}

impl RunningMoments {
    pub fn new(n_params: usize) -> Self {
        Self {
            n: 0,
            mean: Array1::zeros(n_params),
            m2: Array1::zeros(n_params),
        }
    }

    pub fn update(&mut self, x: &[f64]) {
        self.n += 1;
        let n = self.n as f64;
        let x = Array1::from(x.to_vec());
        let delta = &x - &self.mean;
        self.mean = &self.mean + &(&delta / n);
        self.m2 = &self.m2 + &(&delta * &(&x - &self.mean));
    }

    pub fn count(&self) -> u64 {
        self.n
    }

    pub fn mean(&self) -> &Array1<f64> {
        &self.mean
    }

    /// Sample variance; zero until two values were seen.
    pub fn variance(&self) -> Array1<f64> {
        if self.n < 2 {
            Array1::zeros(self.mean.len())
        } else {
            &self.m2 / (self.n - 1) as f64
        }
    }
}

/// State of one rung in a [`RunSummary`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RungSummary {
    pub rank: usize,
    pub temperature: f64,
    pub log_likelihood: f64,
    pub acceptance: AcceptanceStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub iteration: u64,
    pub n_iterations: u64,
    pub shape_updates: u64,
    pub projection_iterations: u64,
    pub flushes: u64,
    /// Ordered by rank, coldest first.
    pub rungs: Vec<RungSummary>,
    pub swap_rates: Vec<f64>,
    /// Running means of the common parameters of the cold chain, over its saved samples.
    pub cold_means: Vec<(String, f64)>,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "iteration {}/{} ({} shape updates, {} flushes)",
            self.iteration, self.n_iterations, self.shape_updates, self.flushes
        )?;
        for rung in &self.rungs {
            write!(
                f,
                "  T={:<7.3} logL={:<12.3}",
                rung.temperature, rung.log_likelihood
            )?;
            for s in Strategy::ALL {
                let c = rung.acceptance.get(s);
                if c.proposed > 0 {
                    write!(f, " {s}: {:.2}", c.rate())?;
                }
            }
            if rung.acceptance.numerical_rejections > 0 {
                write!(f, " nan: {}", rung.acceptance.numerical_rejections)?;
            }
            writeln!(f)?;
        }
        let swaps: Vec<String> = self.swap_rates.iter().map(|r| format!("{r:.2}")).collect();
        write!(f, "  swap rates: [{}]", swaps.join(", "))?;
        if !self.cold_means.is_empty() {
            let means: Vec<String> = self
                .cold_means
                .iter()
                .map(|(name, m)| format!("{name}={m:.4}"))
                .collect();
            write!(f, "\n  cold means: {}", means.join(" "))?;
        }
        Ok(())
    }
}
