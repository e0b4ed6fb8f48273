/*!
# Chain State

A [`ChainState`] is one replica of the parallel-tempering ladder. It owns

- its current parameter vector with log-likelihood and log-prior,
- its likelihood cache and Fisher eigendirections, both valid for the current vector,
- its random number generator,
- a [`Rung`]: the temperature it currently runs at together with the temperature-bound state
  (differential-evolution history and acceptance counters).

Temperature swaps exchange rungs between chains, so the trajectory of a chain is continuous while
the history of a temperature stays with that temperature.

Every iteration goes through propose, score, accept or reject. Candidates that change a shape
parameter are scored in shape mode, all others against the cached basis. Only accepted candidates
write back to the cache.
*/

use ndarray::{Array2, ArrayView1};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::ops::Range;

use crate::cache::FastLikelihoodCache;
use crate::checkpoint::{ChainSnapshot, SampleRow};
use crate::config::{SamplerConfig, TemperedDensity};
use crate::error::{Error, Result};
use crate::fisher::{group_directions, FisherSet};
use crate::likelihood::FastLikelihood;
use crate::params::{JumpTarget, ParameterSpace, UpdateKind};
use crate::proposal::{ChainView, ProposalEngine};
use crate::stats::AcceptanceStats;

/// Prior draws tried before giving up on finding a finite starting point.
const MAX_INITIAL_DRAWS: usize = 100;

/// Ring buffer of accepted states, the pool of differential-evolution jumps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeHistory {
    rows: Array2<f64>,
    len: usize,
    next: usize,
}

impl DeHistory {
    pub fn new(capacity: usize, n_params: usize) -> Self {
        Self {
            rows: Array2::zeros((capacity, n_params)),
            len: 0,
            next: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push(&mut self, x: &[f64]) {
        self.rows
            .row_mut(self.next)
            .assign(&ArrayView1::from(x));
        self.next = (self.next + 1) % self.rows.nrows();
        self.len = (self.len + 1).min(self.rows.nrows());
    }

    /// Two distinct stored states. Requires at least two entries.
    pub fn pick_pair<R: Rng + ?Sized>(&self, rng: &mut R) -> (ArrayView1<'_, f64>, ArrayView1<'_, f64>) {
        let a = rng.random_range(0..self.len);
        let mut b = rng.random_range(0..self.len - 1);
        if b >= a {
            b += 1;
        }
        (self.rows.row(a), self.rows.row(b))
    }
}

/// Temperature-bound part of a chain, exchanged by swaps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rung {
    /// Position on the ladder, 0 is the coldest.
    pub rank: usize,
    pub beta: f64,
    pub history: DeHistory,
    pub stats: AcceptanceStats,
}

impl Rung {
    pub fn new(rank: usize, temperature: f64, history_len: usize, n_params: usize) -> Self {
        Self {
            rank,
            beta: 1.0 / temperature,
            history: DeHistory::new(history_len, n_params),
            stats: AcceptanceStats::default(),
        }
    }

    pub fn temperature(&self) -> f64 {
        1.0 / self.beta
    }
}

/// Shared, read-only inputs of a chain update.
#[derive(Debug)]
pub struct StepContext<'a, L: FastLikelihood> {
    pub likelihood: &'a L,
    pub space: &'a ParameterSpace,
    pub engine: &'a ProposalEngine,
    pub config: &'a SamplerConfig,
}

impl<'a, L: FastLikelihood> StepContext<'a, L> {
    pub fn new(
        likelihood: &'a L,
        space: &'a ParameterSpace,
        engine: &'a ProposalEngine,
        config: &'a SamplerConfig,
    ) -> Self {
        Self {
            likelihood,
            space,
            engine,
            config,
        }
    }
}

#[derive(Debug)]
pub struct ChainState<L: FastLikelihood> {
    id: usize,
    params: Vec<f64>,
    log_likelihood: f64,
    log_prior: f64,
    pub(crate) rung: Rung,
    cache: FastLikelihoodCache<L>,
    fisher: FisherSet,
    rng: SmallRng,
    rows: Vec<SampleRow>,
}

impl<L: FastLikelihood> ChainState<L> {
    /// Starts a chain at a prior draw with a finite likelihood.
    ///
    /// # Errors
    ///
    /// [`Error::Numerical`] when no finite starting point was found.
    pub fn new(id: usize, rung: Rung, ctx: &StepContext<'_, L>, mut rng: SmallRng) -> Result<Self> {
        let mut cache = FastLikelihoodCache::new();
        for _ in 0..MAX_INITIAL_DRAWS {
            let params = ctx.space.draw_initial(&mut rng);
            let log_prior = ctx.space.log_prior(&params);
            let log_likelihood = cache.refresh(ctx.likelihood, &params);
            if log_prior.is_finite() && log_likelihood.is_finite() {
                return Ok(Self {
                    id,
                    params,
                    log_likelihood,
                    log_prior,
                    rung,
                    cache,
                    fisher: FisherSet::new(ctx.space.groups().len()),
                    rng,
                    rows: Vec::new(),
                });
            }
        }
        Err(Error::Numerical(format!(
            "chain {id}: no finite likelihood in {MAX_INITIAL_DRAWS} prior draws"
        )))
    }

    /// Rebuilds a chain from a snapshot. The cache stays dirty until the next shape iteration.
    pub fn from_snapshot(snapshot: ChainSnapshot, ctx: &StepContext<'_, L>) -> Result<Self> {
        if snapshot.params.len() != ctx.space.len()
            || snapshot.fisher.len() != ctx.space.groups().len()
        {
            return Err(Error::Config(format!(
                "snapshot of chain {} does not match the parameter space",
                snapshot.id
            )));
        }
        Ok(Self {
            id: snapshot.id,
            params: snapshot.params,
            log_likelihood: snapshot.log_likelihood,
            log_prior: snapshot.log_prior,
            rung: snapshot.rung,
            cache: FastLikelihoodCache::new(),
            fisher: snapshot.fisher,
            rng: SmallRng::seed_from_u64(snapshot.rng_seed),
            rows: Vec::new(),
        })
    }

    /// Reseeds the generator from its own stream and captures the chain.
    ///
    /// The stored seed is the one now in use, so a chain rebuilt from the snapshot continues
    /// exactly like this one.
    pub fn snapshot(&mut self) -> ChainSnapshot {
        let rng_seed: u64 = self.rng.random();
        self.rng = SmallRng::seed_from_u64(rng_seed);
        ChainSnapshot {
            id: self.id,
            params: self.params.clone(),
            log_likelihood: self.log_likelihood,
            log_prior: self.log_prior,
            rung: self.rung.clone(),
            rng_seed,
            fisher: self.fisher.clone(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn params(&self) -> &[f64] {
        &self.params
    }

    pub fn log_likelihood(&self) -> f64 {
        self.log_likelihood
    }

    pub fn log_prior(&self) -> f64 {
        self.log_prior
    }

    pub fn rung(&self) -> &Rung {
        &self.rung
    }

    pub fn cache(&self) -> &FastLikelihoodCache<L> {
        &self.cache
    }

    pub fn fisher(&self) -> &FisherSet {
        &self.fisher
    }

    /// The log density the inverse temperature multiplies, as used by the swap criterion.
    pub fn tempered_energy(&self, density: TemperedDensity) -> f64 {
        match density {
            TemperedDensity::Posterior => self.log_likelihood + self.log_prior,
            TemperedDensity::Likelihood => self.log_likelihood,
        }
    }

    /// Takes the rows recorded since the last call.
    pub fn drain_rows(&mut self) -> Vec<SampleRow> {
        std::mem::take(&mut self.rows)
    }

    /// First iteration of a block: full recompute, Fisher refresh of the due groups and one shape
    /// move.
    ///
    /// # Errors
    ///
    /// [`Error::Numerical`] when the current state has no finite likelihood or a Fisher matrix
    /// keeps failing.
    pub fn shape_iteration(&mut self, ctx: &StepContext<'_, L>, iteration: u64) -> Result<()> {
        let log_likelihood = self.cache.refresh(ctx.likelihood, &self.params);
        if !log_likelihood.is_finite() {
            return Err(Error::Numerical(format!(
                "chain {} has a non-finite likelihood ({log_likelihood}) at iteration {iteration}",
                self.id
            )));
        }
        self.log_likelihood = log_likelihood;
        let block = iteration / ctx.config.n_int_block;
        self.refresh_fisher(ctx, UpdateKind::Shape, block)?;
        self.step(ctx, UpdateKind::Shape)?;
        self.refresh_fisher(ctx, UpdateKind::Projection, block)?;
        self.record(ctx, iteration);
        Ok(())
    }

    /// Projection-only iterations over `iterations`.
    pub fn projection_iterations(
        &mut self,
        ctx: &StepContext<'_, L>,
        iterations: Range<u64>,
    ) -> Result<()> {
        for iteration in iterations {
            self.step(ctx, UpdateKind::Projection)?;
            self.record(ctx, iteration);
        }
        Ok(())
    }

    fn refresh_fisher(
        &mut self,
        ctx: &StepContext<'_, L>,
        kind: UpdateKind,
        block: u64,
    ) -> Result<()> {
        for g in ctx.space.free_groups(JumpTarget::All, kind) {
            if !self
                .fisher
                .refresh_due(ctx.space, g, block, ctx.config.fisher_eig_downsample)
            {
                continue;
            }
            let dirs = match kind {
                UpdateKind::Shape => {
                    group_directions(ctx.space, g, &self.params, ctx.config.fisher_step, |y| {
                        ctx.likelihood.log_likelihood(y)
                    })
                }
                UpdateKind::Projection => {
                    let cache = &self.cache;
                    group_directions(ctx.space, g, &self.params, ctx.config.fisher_step, |y| {
                        cache
                            .score_projection(ctx.likelihood, y)
                            .map_or(f64::NAN, |s| s.log_likelihood)
                    })
                }
            };
            self.fisher
                .update(ctx.space, g, dirs, ctx.config.max_fisher_failures)?;
        }
        Ok(())
    }

    /// One Metropolis-Hastings update at the chain's temperature.
    pub fn step(&mut self, ctx: &StepContext<'_, L>, kind: UpdateKind) -> Result<()> {
        let view = ChainView {
            params: &self.params,
            temperature: self.rung.temperature(),
            history: &self.rung.history,
            fisher: &self.fisher,
        };
        let Some(proposal) = ctx.engine.propose(ctx.space, &view, kind, &mut self.rng) else {
            return Ok(());
        };

        let log_prior = ctx.space.log_prior(&proposal.params);
        if log_prior == f64::NEG_INFINITY {
            self.rung.stats.prior_rejections += 1;
            self.rung.stats.record(proposal.strategy, false);
            return Ok(());
        }

        let scored = match proposal.kind {
            UpdateKind::Shape => self.cache.score_shape(ctx.likelihood, &proposal.params),
            UpdateKind::Projection => {
                self.cache.score_projection(ctx.likelihood, &proposal.params)?
            }
        };
        if !scored.log_likelihood.is_finite() {
            self.rung.stats.numerical_rejections += 1;
            self.rung.stats.record(proposal.strategy, false);
            return Ok(());
        }

        let beta = self.rung.beta;
        let d_ll = scored.log_likelihood - self.log_likelihood;
        let d_lp = log_prior - self.log_prior;
        let log_alpha = match ctx.config.tempered_density {
            TemperedDensity::Posterior => beta * (d_ll + d_lp),
            TemperedDensity::Likelihood => beta * d_ll + d_lp,
        } + proposal.ratio.log_value();

        let u: f64 = self.rng.random();
        let accepted = u.ln() < log_alpha;
        self.rung.stats.record(proposal.strategy, accepted);
        if accepted {
            self.cache.commit(ctx.likelihood, scored.pending)?;
            self.params = proposal.params;
            self.log_likelihood = scored.log_likelihood;
            self.log_prior = log_prior;
            self.rung.history.push(&self.params);
        }
        Ok(())
    }

    fn record(&mut self, ctx: &StepContext<'_, L>, iteration: u64) {
        if iteration % ctx.config.thin == 0 && self.rung.rank < ctx.config.n_save {
            self.rows.push(SampleRow {
                rank: self.rung.rank,
                iteration,
                log_likelihood: self.log_likelihood,
                log_prior: self.log_prior,
                params: self.params.clone(),
            });
        }
    }
}
