/*!
# Proposal Engine

Produces candidate parameter vectors for one chain. Each call makes two weighted draws:

1. a [`JumpTarget`] (`dist`, `rn`, `gwb`, `common` or `all`), which fixes the groups that move;
2. a [`Strategy`] (prior draw, differential evolution, Fisher jump, empirical draw), which fixes
   how they move.

Only targets with free groups of the requested [`UpdateKind`] and strategies that can act on the
chosen groups keep their configured weight; the others are set to zero and the remaining weights
are renormalised. The returned [`Proposal`] reports the update kind of the groups it perturbed so
that the caller can pick the matching likelihood cache mode.
*/

use rand::distr::weighted::WeightedIndex;
use rand::distr::Distribution;
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::chain::DeHistory;
use crate::config::SamplerConfig;
use crate::empirical::EmpiricalSet;
use crate::fisher::FisherSet;
use crate::params::{JumpTarget, ParameterSpace, UpdateKind};

/// Probability of a differential-evolution jump with unit scale (mode hopping).
const DE_BIG_JUMP: f64 = 0.1;
/// Jitter of differential-evolution jumps relative to the default step.
const DE_JITTER: f64 = 1e-5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Strategy {
    PriorDraw,
    DifferentialEvolution,
    Fisher,
    Empirical,
}

impl Strategy {
    pub const ALL: [Strategy; 4] = [
        Strategy::PriorDraw,
        Strategy::DifferentialEvolution,
        Strategy::Fisher,
        Strategy::Empirical,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Strategy::PriorDraw => "prior",
            Strategy::DifferentialEvolution => "DE",
            Strategy::Fisher => "Fisher",
            Strategy::Empirical => "empirical",
        };
        f.write_str(name)
    }
}

/// Log of `q(x | x') / q(x' | x)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProposalRatio {
    Symmetric,
    Asymmetric(f64),
}

impl ProposalRatio {
    pub fn log_value(self) -> f64 {
        match self {
            ProposalRatio::Symmetric => 0.0,
            ProposalRatio::Asymmetric(r) => r,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Proposal {
    pub params: Vec<f64>,
    pub ratio: ProposalRatio,
    pub strategy: Strategy,
    pub target: JumpTarget,
    pub groups: Vec<usize>,
    pub kind: UpdateKind,
}

/// What a proposal may look at of the chain it is drawn for.
#[derive(Debug, Clone, Copy)]
pub struct ChainView<'a> {
    pub params: &'a [f64],
    pub temperature: f64,
    pub history: &'a DeHistory,
    pub fisher: &'a FisherSet,
}

#[derive(Debug, Clone)]
pub struct ProposalEngine {
    strategy_weights: [f64; 4],
    target_weights: [f64; 5],
    empirical: EmpiricalSet,
}

fn pick<R: Rng + ?Sized>(weights: &[f64], rng: &mut R) -> Option<usize> {
    WeightedIndex::new(weights).ok().map(|w| w.sample(rng))
}

impl ProposalEngine {
    pub fn new(config: &SamplerConfig, empirical: EmpiricalSet) -> Self {
        let s = &config.strategy_weights;
        let t = &config.target_weights;
        Self {
            strategy_weights: [s.prior_draw, s.differential_evolution, s.fisher, s.empirical],
            target_weights: [t.dist, t.red_noise, t.gwb, t.common, t.all],
            empirical,
        }
    }

    pub fn empirical(&self) -> &EmpiricalSet {
        &self.empirical
    }

    /// Target weights for an iteration of `kind`; targets without free groups get zero.
    pub fn target_weights(&self, space: &ParameterSpace, kind: UpdateKind) -> [f64; 5] {
        let mut weights = self.target_weights;
        for (w, target) in weights.iter_mut().zip(JumpTarget::ALL) {
            if space.free_groups(target, kind).is_empty() {
                *w = 0.0;
            }
        }
        weights
    }

    /// Strategy weights for a move of `groups`; strategies that cannot act get zero.
    pub fn strategy_weights(&self, groups: &[usize], view: &ChainView<'_>) -> [f64; 4] {
        let mut weights = self.strategy_weights;
        if view.history.len() < 2 {
            weights[Strategy::DifferentialEvolution.index()] = 0.0;
        }
        let fisher_ready = groups
            .iter()
            .all(|&g| view.fisher.get(g).is_some_and(|d| !d.is_empty()));
        if !fisher_ready {
            weights[Strategy::Fisher.index()] = 0.0;
        }
        if !groups.iter().all(|&g| self.empirical.covers(g)) {
            weights[Strategy::Empirical.index()] = 0.0;
        }
        weights
    }

    /// Draws a candidate for an iteration of `kind`.
    ///
    /// Returns `None` when no target has a free group of that kind.
    pub fn propose<R: Rng + ?Sized>(
        &self,
        space: &ParameterSpace,
        view: &ChainView<'_>,
        kind: UpdateKind,
        rng: &mut R,
    ) -> Option<Proposal> {
        let target = JumpTarget::ALL[pick(&self.target_weights(space, kind), rng)?];
        let mut groups = space.free_groups(target, kind);
        if target != JumpTarget::All {
            let g = groups[rng.random_range(0..groups.len())];
            groups = vec![g];
        }
        let strategy = Strategy::ALL[pick(&self.strategy_weights(&groups, view), rng)?];

        let mut params = view.params.to_vec();
        let ratio = match strategy {
            Strategy::PriorDraw => self.prior_draw(space, &groups, &mut params, rng),
            Strategy::DifferentialEvolution => {
                self.differential_evolution(space, &groups, view, &mut params, rng)
            }
            Strategy::Fisher => self.fisher_jump(space, &groups, view, &mut params, rng),
            Strategy::Empirical => self.empirical_draw(&groups, &mut params, rng),
        };
        space.wrap(&mut params);

        let kind = groups
            .iter()
            .map(|&g| space.group(g).kind)
            .reduce(UpdateKind::combine)
            .unwrap_or(kind);
        Some(Proposal {
            params,
            ratio,
            strategy,
            target,
            groups,
            kind,
        })
    }

    fn prior_draw<R: Rng + ?Sized>(
        &self,
        space: &ParameterSpace,
        groups: &[usize],
        params: &mut [f64],
        rng: &mut R,
    ) -> ProposalRatio {
        let mut log_ratio = 0.0;
        for &g in groups {
            for &i in &space.group(g).indices {
                let prior = space.prior(i);
                let new = prior.sample(rng);
                log_ratio += prior.log_pdf(params[i]) - prior.log_pdf(new);
                params[i] = new;
            }
        }
        ProposalRatio::Asymmetric(log_ratio)
    }

    fn differential_evolution<R: Rng + ?Sized>(
        &self,
        space: &ParameterSpace,
        groups: &[usize],
        view: &ChainView<'_>,
        params: &mut [f64],
        rng: &mut R,
    ) -> ProposalRatio {
        let (a, b) = view.history.pick_pair(rng);
        let dim: usize = groups.iter().map(|&g| space.group(g).len()).sum();
        let scale = if rng.random::<f64>() < DE_BIG_JUMP {
            1.0
        } else {
            2.38 / (2.0 * dim as f64).sqrt()
        };
        for &g in groups {
            for &i in &space.group(g).indices {
                let z: f64 = rng.sample(StandardNormal);
                params[i] += scale * (a[i] - b[i]) + DE_JITTER * space.default_step(i) * z;
            }
        }
        ProposalRatio::Symmetric
    }

    fn fisher_jump<R: Rng + ?Sized>(
        &self,
        space: &ParameterSpace,
        groups: &[usize],
        view: &ChainView<'_>,
        params: &mut [f64],
        rng: &mut R,
    ) -> ProposalRatio {
        let spread = view.temperature.sqrt() / (groups.len() as f64).sqrt();
        for &g in groups {
            let Some(dirs) = view.fisher.get(g) else {
                continue;
            };
            let k = rng.random_range(0..dirs.len());
            let z: f64 = rng.sample(StandardNormal);
            let step = z * dirs.scales[k] * spread;
            for (&i, v) in space.group(g).indices.iter().zip(&dirs.directions[k]) {
                params[i] += step * v;
            }
        }
        ProposalRatio::Symmetric
    }

    fn empirical_draw<R: Rng + ?Sized>(
        &self,
        groups: &[usize],
        params: &mut [f64],
        rng: &mut R,
    ) -> ProposalRatio {
        let mut log_ratio = 0.0;
        for &g in groups {
            let Some((table, [ia, ib])) = self.empirical.for_group(g) else {
                continue;
            };
            let (x, y) = table.sample(rng);
            log_ratio += table.log_pdf(params[ia], params[ib]) - table.log_pdf(x, y);
            params[ia] = x;
            params[ib] = y;
        }
        ProposalRatio::Asymmetric(log_ratio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{StrategyWeights, TargetWeights};
    use crate::empirical::Histogram2D;
    use crate::fisher::{group_directions, FisherSet};
    use crate::params::{GroupSpec, Prior};
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn space() -> ParameterSpace {
        ParameterSpace::new(vec![
            GroupSpec::new("intrinsic", UpdateKind::Shape, JumpTarget::Common)
                .param("f", Prior::Uniform { min: 0.0, max: 1.0 }),
            GroupSpec::new("extrinsic", UpdateKind::Projection, JumpTarget::Common)
                .param("phase", Prior::Periodic { min: 0.0, max: 1.0 })
                .param("amp", Prior::Uniform { min: -2.0, max: 2.0 }),
            GroupSpec::new("rn_a", UpdateKind::Projection, JumpTarget::RedNoise)
                .param("a_gamma", Prior::Uniform { min: 0.0, max: 7.0 })
                .param("a_log10_A", Prior::Uniform { min: -20.0, max: -11.0 }),
            GroupSpec::new("gwb", UpdateKind::Projection, JumpTarget::Gwb)
                .param("gwb_gamma", Prior::Uniform { min: 0.0, max: 7.0 })
                .param("gwb_log10_A", Prior::Uniform { min: -20.0, max: -11.0 })
                .pinned(vec![0.0, -20.0]),
        ])
        .unwrap()
    }

    fn engine(empirical: EmpiricalSet) -> ProposalEngine {
        ProposalEngine::new(&SamplerConfig::default(), empirical)
    }

    #[test]
    fn shape_iterations_only_move_shape_groups() {
        let space = space();
        let engine = engine(EmpiricalSet::empty(&space));
        let history = DeHistory::new(10, space.len());
        let fisher = FisherSet::new(space.groups().len());
        let x = vec![0.5, 0.5, 0.0, 3.0, -15.0, 0.0, -20.0];
        let view = ChainView {
            params: &x,
            temperature: 1.0,
            history: &history,
            fisher: &fisher,
        };
        let mut rng = SmallRng::seed_from_u64(11);
        for _ in 0..200 {
            let p = engine
                .propose(&space, &view, UpdateKind::Shape, &mut rng)
                .unwrap();
            assert_eq!(p.kind, UpdateKind::Shape);
            assert_eq!(p.groups, vec![0]);
            assert_eq!(&p.params[1..], &x[1..]);
        }
    }

    #[test]
    fn pinned_groups_and_missing_tables_are_never_used() {
        let space = space();
        let engine = engine(EmpiricalSet::empty(&space));
        let history = DeHistory::new(10, space.len());
        let fisher = FisherSet::new(space.groups().len());
        let x = vec![0.5, 0.5, 0.0, 3.0, -15.0, 0.0, -20.0];
        let view = ChainView {
            params: &x,
            temperature: 1.0,
            history: &history,
            fisher: &fisher,
        };
        let weights = engine.target_weights(&space, UpdateKind::Projection);
        assert_eq!(weights[2], 0.0);
        let mut rng = SmallRng::seed_from_u64(5);
        for _ in 0..500 {
            let p = engine
                .propose(&space, &view, UpdateKind::Projection, &mut rng)
                .unwrap();
            assert_ne!(p.strategy, Strategy::Empirical);
            // no history and no Fisher directions yet
            assert_eq!(p.strategy, Strategy::PriorDraw);
            assert_eq!(&p.params[5..], &[0.0, -20.0]);
            assert!((0.0..1.0).contains(&p.params[1]));
        }
    }

    #[test]
    fn empirical_strategy_needs_a_table() {
        let space = space();
        let hist = Histogram2D {
            param_names: ["a_gamma".to_string(), "a_log10_A".to_string()],
            x_edges: vec![0.0, 3.5, 7.0],
            y_edges: vec![-20.0, -11.0],
            density: vec![vec![1.0], vec![1.0]],
        };
        let empirical = EmpiricalSet::new(vec![hist], &space).unwrap();
        let engine = ProposalEngine::new(
            &SamplerConfig {
                strategy_weights: StrategyWeights {
                    prior_draw: 0.0,
                    differential_evolution: 0.0,
                    fisher: 0.0,
                    empirical: 1.0,
                },
                target_weights: TargetWeights {
                    dist: 0.0,
                    red_noise: 1.0,
                    gwb: 0.0,
                    common: 0.0,
                    all: 0.0,
                },
                ..SamplerConfig::default()
            },
            empirical,
        );
        let history = DeHistory::new(10, space.len());
        let fisher = FisherSet::new(space.groups().len());
        let x = vec![0.5, 0.5, 0.0, 3.0, -15.0, 0.0, -20.0];
        let view = ChainView {
            params: &x,
            temperature: 1.0,
            history: &history,
            fisher: &fisher,
        };
        let mut rng = SmallRng::seed_from_u64(2);
        let p = engine
            .propose(&space, &view, UpdateKind::Projection, &mut rng)
            .unwrap();
        assert_eq!(p.strategy, Strategy::Empirical);
        assert!(matches!(p.ratio, ProposalRatio::Asymmetric(_)));
        // uniform table: the ratio vanishes
        assert!(p.ratio.log_value().abs() < 1e-12);
    }

    #[test]
    fn differential_evolution_and_fisher_become_available() {
        let space = space();
        let engine = engine(EmpiricalSet::empty(&space));
        let mut history = DeHistory::new(10, space.len());
        history.push(&[0.4, 0.1, 0.0, 3.0, -15.0, 0.0, -20.0]);
        history.push(&[0.6, 0.9, 1.0, 3.5, -14.0, 0.0, -20.0]);
        let mut fisher = FisherSet::new(space.groups().len());
        let x = vec![0.5, 0.5, 0.0, 3.0, -15.0, 0.0, -20.0];
        for g in 0..3 {
            let dirs = group_directions(&space, g, &x, 1e-4, |y| -y.iter().map(|v| v * v).sum::<f64>());
            fisher.update(&space, g, dirs, 10).unwrap();
        }
        let view = ChainView {
            params: &x,
            temperature: 2.0,
            history: &history,
            fisher: &fisher,
        };
        let weights = engine.strategy_weights(&[1], &view);
        assert!(weights[Strategy::DifferentialEvolution.index()] > 0.0);
        assert!(weights[Strategy::Fisher.index()] > 0.0);
        assert_eq!(weights[Strategy::Empirical.index()], 0.0);

        let mut rng = SmallRng::seed_from_u64(8);
        let mut seen = [false; 4];
        for _ in 0..300 {
            let p = engine
                .propose(&space, &view, UpdateKind::Projection, &mut rng)
                .unwrap();
            seen[p.strategy.index()] = true;
            if p.strategy != Strategy::PriorDraw {
                assert_eq!(p.ratio, ProposalRatio::Symmetric);
            }
        }
        assert_eq!(seen, [true, true, true, false]);
    }
}
