/*!
# Parallel Tempering

[`ParallelTempering`] drives a ladder of [`ChainState`]s through the block schedule of a run.

Every block of `n_int_block` iterations starts with a shape iteration on each chain (cache
refresh, Fisher refresh, one move of the shape parameters) followed by projection-only
iterations. Between iterations `i` and `i + 1` with `(i + 1) % swap_every == 0` the controller
proposes temperature swaps between adjacent rungs, hottest pair first. Chains advance in
parallel between swap points; all randomness of a chain comes from its own generator and the
swap decisions come from a separate one, so a run is reproducible for a fixed seed regardless of
the thread count.

At the end of every `save_every_n` iterations the recorded rows are handed to the
[`CheckpointWriter`] together with a summary and a resumable [`Snapshot`].

```rust,no_run
use pta_cw_sampler::checkpoint::MemoryCheckpoint;
use pta_cw_sampler::empirical::EmpiricalSet;
use pta_cw_sampler::proposal::ProposalEngine;
use pta_cw_sampler::synthetic::SyntheticPta;
use pta_cw_sampler::tempering::ParallelTempering;

let pta = SyntheticPta::builder().n_pulsars(3).build(7)?;
let config = pta.config();
let space = pta.space(&config)?;
let likelihood = pta.likelihood(&space, &config)?;
let engine = ProposalEngine::new(&config, EmpiricalSet::empty(&space));

let mut sampler =
    ParallelTempering::new(&likelihood, &space, &engine, &config, MemoryCheckpoint::default())?;
let summary = sampler.run()?;
println!("{summary}");
# Ok::<(), pta_cw_sampler::error::Error>(())
```
*/

use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::ops::Range;
use tracing::{debug, info, warn};

use crate::chain::{ChainState, Rung, StepContext};
use crate::checkpoint::{CheckpointWriter, SampleRow, Snapshot};
use crate::config::{RunSchedule, SamplerConfig};
use crate::context::RunContext;
use crate::dev_tools::Timer;
use crate::error::{Error, Result};
use crate::likelihood::FastLikelihood;
use crate::params::{JumpTarget, ParameterSpace, UpdateKind};
use crate::proposal::ProposalEngine;
use crate::stats::{RunSummary, RungSummary, RunningMoments, SwapStats};

/// Mixed into the run seed to derive the swap generator's seed.
const SWAP_SEED_MIX: u64 = 0x9E37_79B9_7F4A_7C15;

/// Geometric temperature ladder from 1 to `t_max`.
pub fn temperature_ladder(t_max: f64, n_chain: usize) -> Vec<f64> {
    if n_chain <= 1 {
        return vec![1.0; n_chain];
    }
    (0..n_chain)
        .map(|i| t_max.powf(i as f64 / (n_chain - 1) as f64))
        .collect()
}

fn pair_mut<T>(items: &mut [T], a: usize, b: usize) -> (&mut T, &mut T) {
    if a < b {
        let (lo, hi) = items.split_at_mut(b);
        (&mut lo[a], &mut hi[0])
    } else {
        let (lo, hi) = items.split_at_mut(a);
        (&mut hi[0], &mut lo[b])
    }
}

pub struct ParallelTempering<'a, L: FastLikelihood, W: CheckpointWriter> {
    likelihood: &'a L,
    space: &'a ParameterSpace,
    engine: &'a ProposalEngine,
    config: &'a SamplerConfig,
    schedule: RunSchedule,
    chains: Vec<ChainState<L>>,
    swap_rng: SmallRng,
    swaps: SwapStats,
    context: RunContext,
    writer: W,
    /// Rows recorded since the last flush.
    buffer: Vec<SampleRow>,
    cold_moments: RunningMoments,
}

impl<'a, L: FastLikelihood, W: CheckpointWriter> ParallelTempering<'a, L, W> {
    /// Validates the configuration and starts every chain at a prior draw.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for an invalid configuration, [`Error::Numerical`] when a chain finds
    /// no finite starting point.
    pub fn new(
        likelihood: &'a L,
        space: &'a ParameterSpace,
        engine: &'a ProposalEngine,
        config: &'a SamplerConfig,
        writer: W,
    ) -> Result<Self> {
        let schedule = config.schedule()?;
        let seed = config.resolved_seed();
        info!(
            seed,
            n_chain = config.n_chain,
            n_params = space.len(),
            n_blocks = schedule.n_blocks,
            "starting parallel tempering"
        );

        let temperatures = temperature_ladder(config.t_max, config.n_chain);
        let ctx = StepContext::new(likelihood, space, engine, config);
        let chains = temperatures
            .par_iter()
            .enumerate()
            .map(|(i, &temperature)| {
                let rung = Rung::new(i, temperature, config.de_history_len, space.len());
                let rng = SmallRng::seed_from_u64(seed.wrapping_add(1 + i as u64));
                ChainState::new(i, rung, &ctx, rng)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            likelihood,
            space,
            engine,
            config,
            schedule,
            chains,
            swap_rng: SmallRng::seed_from_u64(seed ^ SWAP_SEED_MIX),
            swaps: SwapStats::new(config.n_chain),
            context: RunContext::new(&schedule),
            writer,
            buffer: Vec::new(),
            cold_moments: RunningMoments::new(space.len()),
        })
    }

    /// Continues a run from a snapshot taken at a flush.
    ///
    /// The configuration may extend `n_iterations`; the ladder, parameter space and block length
    /// must match the snapshot.
    pub fn resume(
        likelihood: &'a L,
        space: &'a ParameterSpace,
        engine: &'a ProposalEngine,
        config: &'a SamplerConfig,
        mut writer: W,
        snapshot: Snapshot,
    ) -> Result<Self> {
        let schedule = config.schedule()?;
        if snapshot.param_names != space.names() {
            return Err(Error::Config(
                "snapshot was taken for a different parameter space".to_string(),
            ));
        }
        if snapshot.chains.len() != config.n_chain {
            return Err(Error::Config(format!(
                "snapshot holds {} chains, configuration asks for {}",
                snapshot.chains.len(),
                config.n_chain
            )));
        }
        let mut ranks: Vec<usize> = snapshot.chains.iter().map(|c| c.rung.rank).collect();
        ranks.sort_unstable();
        if ranks.iter().enumerate().any(|(i, &r)| i != r) {
            return Err(Error::Checkpoint(format!(
                "snapshot rungs {ranks:?} are not a permutation of the ladder"
            )));
        }
        let context = snapshot.context.resume(&schedule)?;
        let dropped = writer.rewind(context.iteration)?;
        if dropped > 0 {
            warn!(
                dropped,
                iteration = context.iteration,
                "samples past the snapshot were discarded"
            );
        }
        info!(
            iteration = context.iteration,
            n_iterations = schedule.n_iterations,
            "resuming parallel tempering"
        );

        let ctx = StepContext::new(likelihood, space, engine, config);
        let chains = snapshot
            .chains
            .into_iter()
            .map(|c| ChainState::from_snapshot(c, &ctx))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            likelihood,
            space,
            engine,
            config,
            schedule,
            chains,
            swap_rng: SmallRng::seed_from_u64(snapshot.swap_seed),
            swaps: snapshot.swaps,
            context,
            writer,
            buffer: Vec::new(),
            cold_moments: snapshot.cold_moments,
        })
    }

    pub fn chains(&self) -> &[ChainState<L>] {
        &self.chains
    }

    pub fn context(&self) -> &RunContext {
        &self.context
    }

    pub fn swaps(&self) -> &SwapStats {
        &self.swaps
    }

    pub fn cold_moments(&self) -> &RunningMoments {
        &self.cold_moments
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }

    pub fn into_writer(self) -> W {
        self.writer
    }

    /// Temperatures by chain id.
    pub fn temperatures(&self) -> Vec<f64> {
        self.chains.iter().map(|c| c.rung().temperature()).collect()
    }

    /// Runs the remaining blocks of the schedule.
    ///
    /// # Errors
    ///
    /// Any numerical, cache or checkpoint error aborts the run. Rows of completed flushes stay
    /// on disk.
    pub fn run(&mut self) -> Result<RunSummary> {
        let progress = self.config.show_progress.then(|| {
            let pb = ProgressBar::new(self.schedule.n_iterations);
            if let Ok(style) = ProgressStyle::default_bar()
                .template("{prefix:8} {bar:40.cyan/blue} {pos}/{len} ({eta}) | {msg}")
            {
                pb.set_style(style.progress_chars("=>-"));
            }
            pb.set_prefix("PT");
            pb.set_position(self.context.iteration);
            pb
        });

        while !self.context.is_finished() {
            let mut timer = Timer::new();
            self.run_block()?;
            timer.log(format!("block {}", self.context.block));

            if self.context.status_due() {
                info!("{}", self.summary());
            }
            if self.context.flush_due(self.schedule.save_every_n) {
                self.flush()?;
                timer.log("flush");
            }
            if let Some(pb) = &progress {
                pb.set_position(self.context.iteration);
                let cold = self.chains.iter().find(|c| c.rung().rank == 0);
                if let Some(cold) = cold {
                    pb.set_message(format!(
                        "logL≈{:.2} p(accept)≈{:.2}",
                        cold.log_likelihood(),
                        cold.rung().stats.total().rate()
                    ));
                }
            }
        }
        if let Some(pb) = progress {
            pb.finish();
        }
        Ok(self.summary())
    }

    /// Advances every chain by one block.
    fn run_block(&mut self) -> Result<()> {
        let start = self.context.iteration;
        let end = start + self.schedule.n_int_block;
        let swap_every = self.config.swap_every;
        let ctx = StepContext::new(self.likelihood, self.space, self.engine, self.config);

        self.chains
            .par_iter_mut()
            .try_for_each(|chain| chain.shape_iteration(&ctx, start))?;

        // first iteration i >= start with (i + 1) % swap_every == 0
        let first_swap = (start / swap_every + 1) * swap_every - 1;
        let mut next = start + 1;
        for i in (first_swap..end).step_by(swap_every as usize) {
            Self::advance(&mut self.chains, &ctx, next..i + 1)?;
            self.swap_phase();
            next = i + 1;
        }
        Self::advance(&mut self.chains, &ctx, next..end)?;

        let mut rows = Vec::new();
        for chain in &mut self.chains {
            rows.extend(chain.drain_rows());
        }
        rows.sort_by_key(|r| (r.iteration, r.rank));
        for row in rows.iter().filter(|r| r.rank == 0) {
            self.cold_moments.update(&row.params);
        }
        self.buffer.extend(rows);

        self.context
            .complete_block(self.chains.len(), self.schedule.n_int_block);
        Ok(())
    }

    fn advance(
        chains: &mut [ChainState<L>],
        ctx: &StepContext<'_, L>,
        iterations: Range<u64>,
    ) -> Result<()> {
        if iterations.is_empty() {
            return Ok(());
        }
        chains
            .par_iter_mut()
            .try_for_each(|chain| chain.projection_iterations(ctx, iterations.clone()))
    }

    /// Proposes swaps of adjacent rungs, from the hottest pair down to the coldest.
    fn swap_phase(&mut self) {
        let n = self.chains.len();
        if n < 2 {
            return;
        }
        let density = self.config.tempered_density;
        // chain index holding each rank
        let mut by_rank = vec![0; n];
        for (i, chain) in self.chains.iter().enumerate() {
            by_rank[chain.rung().rank] = i;
        }

        for r in (0..n - 1).rev() {
            let (cold, hot) = (by_rank[r], by_rank[r + 1]);
            let (c, h) = (&self.chains[cold], &self.chains[hot]);
            let log_alpha = (c.rung().beta - h.rung().beta)
                * (h.tempered_energy(density) - c.tempered_energy(density));
            let u: f64 = self.swap_rng.random();
            let accepted = u.ln() < log_alpha;
            self.swaps.record(r, accepted);
            if accepted {
                let (c, h) = pair_mut(&mut self.chains, cold, hot);
                std::mem::swap(&mut c.rung, &mut h.rung);
                by_rank.swap(r, r + 1);
            }
        }
    }

    /// Writes the buffered rows, a summary and a snapshot.
    fn flush(&mut self) -> Result<()> {
        let rows = std::mem::take(&mut self.buffer);
        self.context.flushes += 1;
        self.writer.write_samples(&rows)?;
        let summary = self.summary();
        self.writer.write_summary(&summary)?;
        let snapshot = self.snapshot();
        self.writer.write_snapshot(&snapshot)?;
        debug!(
            iteration = self.context.iteration,
            rows = rows.len(),
            "checkpoint written"
        );
        Ok(())
    }

    /// Captures the run and reseeds every generator from its own stream.
    pub fn snapshot(&mut self) -> Snapshot {
        let swap_seed: u64 = self.swap_rng.random();
        self.swap_rng = SmallRng::seed_from_u64(swap_seed);
        Snapshot {
            param_names: self.space.names().to_vec(),
            context: self.context,
            chains: self.chains.iter_mut().map(ChainState::snapshot).collect(),
            swap_seed,
            swaps: self.swaps.clone(),
            cold_moments: self.cold_moments.clone(),
        }
    }

    pub fn summary(&self) -> RunSummary {
        let mut rungs: Vec<RungSummary> = self
            .chains
            .iter()
            .map(|c| RungSummary {
                rank: c.rung().rank,
                temperature: c.rung().temperature(),
                log_likelihood: c.log_likelihood(),
                acceptance: c.rung().stats,
            })
            .collect();
        rungs.sort_by_key(|r| r.rank);

        let cold_means = if self.cold_moments.count() == 0 {
            Vec::new()
        } else {
            let mean = self.cold_moments.mean();
            self.space
                .free_groups(JumpTarget::Common, UpdateKind::Shape)
                .into_iter()
                .chain(self.space.free_groups(JumpTarget::Common, UpdateKind::Projection))
                .flat_map(|g| self.space.group(g).indices.clone())
                .map(|i| (self.space.names()[i].clone(), mean[i]))
                .collect()
        };

        RunSummary {
            iteration: self.context.iteration,
            n_iterations: self.schedule.n_iterations,
            shape_updates: self.context.shape_updates,
            projection_iterations: self.context.projection_iterations,
            flushes: self.context.flushes,
            rungs,
            swap_rates: self.swaps.rates(),
            cold_means,
        }
    }
}
