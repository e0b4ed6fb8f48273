/*!
# Parameter Space

Static description of the sampled parameters: their names, priors and the disjoint groups they
belong to. Every group carries

- an [`UpdateKind`]: whether changing it invalidates the cached shape basis of the likelihood
  ([`UpdateKind::Shape`]) or can be scored against it ([`UpdateKind::Projection`]),
- a [`JumpTarget`]: the group-selection bucket (`dist`, `rn`, `gwb`, `common`) that proposals draw
  from,
- a [`FisherShape`]: whether its Fisher matrix is computed in full or only on the diagonal.

Groups may be pinned to fixed values. Pinned parameters stay in the vector (and in the saved
samples) but are never proposed and do not contribute to the log-prior.

The space is immutable once built. [`ParameterSpace::for_pta`] builds the layout of the CW search;
[`ParameterSpace::new`] accepts any list of [`GroupSpec`]s.
*/

use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::f64::consts::{LN_10, PI, TAU};

use crate::config::{AmplitudePrior, SamplerConfig};
use crate::data::{NoiseDictionary, Pulsar};
use crate::error::{Error, Result};

pub const COS_GWTHETA: &str = "cos_gwtheta";
pub const COS_INC: &str = "cos_inc";
pub const GWPHI: &str = "gwphi";
pub const LOG10_FGW: &str = "log10_fgw";
pub const LOG10_H: &str = "log10_h";
pub const LOG10_MC: &str = "log10_mc";
pub const PHASE0: &str = "phase0";
pub const PSI: &str = "psi";
pub const GWB_GAMMA: &str = "gwb_gamma";
pub const GWB_LOG10_A: &str = "gwb_log10_A";

/// Spectral index and log10 amplitude of a noise process that is effectively switched off.
pub const ZERO_NOISE: [f64; 2] = [0.0, -20.0];

const LOG10_MC_MIN: f64 = 7.0;
const LOG10_H_RANGE: (f64, f64) = (-18.0, -11.0);
const GAMMA_RANGE: (f64, f64) = (0.0, 7.0);
const LOG10_A_RANGE: (f64, f64) = (-20.0, -11.0);
/// Fraction of the prior width used as step when no Fisher information is available.
const DEFAULT_STEP_FRACTION: f64 = 0.05;

pub fn p_dist_name(psr: &str) -> String {
    format!("{psr}_cw0_p_dist")
}

pub fn p_phase_name(psr: &str) -> String {
    format!("{psr}_cw0_p_phase")
}

pub fn rn_gamma_name(psr: &str) -> String {
    format!("{psr}_red_noise_gamma")
}

pub fn rn_log10_a_name(psr: &str) -> String {
    format!("{psr}_red_noise_log10_A")
}

/// Prior of a single parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Prior {
    Uniform { min: f64, max: f64 },
    /// Uniform on a circle; values are wrapped back into `[min, max)` after every jump.
    Periodic { min: f64, max: f64 },
    Normal { mean: f64, sigma: f64 },
    /// Density proportional to `10^x` on `[min, max]` (uniform in `10^x`).
    LinearExp { min: f64, max: f64 },
}

impl Prior {
    pub fn log_pdf(&self, x: f64) -> f64 {
        match *self {
            Prior::Uniform { min, max } | Prior::Periodic { min, max } => {
                if (min..=max).contains(&x) {
                    -(max - min).ln()
                } else {
                    f64::NEG_INFINITY
                }
            }
            Prior::Normal { mean, sigma } => {
                let z = (x - mean) / sigma;
                -0.5 * z * z - (sigma * TAU.sqrt()).ln()
            }
            Prior::LinearExp { min, max } => {
                if (min..=max).contains(&x) {
                    LN_10.ln() + x * LN_10 - (10f64.powf(max) - 10f64.powf(min)).ln()
                } else {
                    f64::NEG_INFINITY
                }
            }
        }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match *self {
            Prior::Uniform { min, max } | Prior::Periodic { min, max } => {
                min + (max - min) * rng.random::<f64>()
            }
            Prior::Normal { mean, sigma } => {
                let z: f64 = rng.sample(StandardNormal);
                mean + sigma * z
            }
            Prior::LinearExp { min, max } => {
                let (lo, hi) = (10f64.powf(min), 10f64.powf(max));
                (lo + (hi - lo) * rng.random::<f64>()).log10()
            }
        }
    }

    /// Characteristic scale of the prior: the range for bounded priors, sigma for normals.
    pub fn width(&self) -> f64 {
        match *self {
            Prior::Uniform { min, max }
            | Prior::Periodic { min, max }
            | Prior::LinearExp { min, max } => max - min,
            Prior::Normal { sigma, .. } => sigma,
        }
    }

    /// Maps periodic values back into range; other priors are left untouched.
    pub fn wrap(&self, x: f64) -> f64 {
        match *self {
            Prior::Periodic { min, max } => min + (x - min).rem_euclid(max - min),
            _ => x,
        }
    }
}

/// Which likelihood cache mode a change of a group requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum UpdateKind {
    Projection,
    Shape,
}

impl UpdateKind {
    /// The mode required when both kinds of change happen in one move.
    pub fn combine(self, other: UpdateKind) -> UpdateKind {
        self.max(other)
    }
}

/// Group-selection bucket of a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JumpTarget {
    Dist,
    RedNoise,
    Gwb,
    Common,
    /// Every free group of the current update kind at once.
    All,
}

impl JumpTarget {
    pub const ALL: [JumpTarget; 5] = [
        JumpTarget::Dist,
        JumpTarget::RedNoise,
        JumpTarget::Gwb,
        JumpTarget::Common,
        JumpTarget::All,
    ];
}

/// How much of the Fisher matrix of a group is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FisherShape {
    Full,
    /// Parameters of the group are treated as independent (e.g. one per pulsar).
    Diagonal,
}

/// Declarative description of a group, consumed by [`ParameterSpace::new`].
#[derive(Debug, Clone, PartialEq)]
pub struct GroupSpec {
    pub name: String,
    pub kind: UpdateKind,
    pub target: JumpTarget,
    pub fisher: FisherShape,
    pub params: Vec<(String, Prior)>,
    pub pinned: Option<Vec<f64>>,
}

impl GroupSpec {
    pub fn new(name: impl Into<String>, kind: UpdateKind, target: JumpTarget) -> Self {
        Self {
            name: name.into(),
            kind,
            target,
            fisher: FisherShape::Full,
            params: Vec::new(),
            pinned: None,
        }
    }

    pub fn diagonal(mut self) -> Self {
        self.fisher = FisherShape::Diagonal;
        self
    }

    pub fn param(mut self, name: impl Into<String>, prior: Prior) -> Self {
        self.params.push((name.into(), prior));
        self
    }

    /// Pins the group to `values` (one per parameter, in declaration order).
    pub fn pinned(mut self, values: Vec<f64>) -> Self {
        self.pinned = Some(values);
        self
    }
}

/// A group as stored in the [`ParameterSpace`].
#[derive(Debug, Clone, PartialEq)]
pub struct ParamGroup {
    pub name: String,
    pub kind: UpdateKind,
    pub target: JumpTarget,
    pub fisher: FisherShape,
    /// Positions of the group's parameters in the parameter vector.
    pub indices: Vec<usize>,
    pub pinned: Option<Vec<f64>>,
}

impl ParamGroup {
    pub fn is_fixed(&self) -> bool {
        self.pinned.is_some()
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Names, priors and groups of all sampled parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSpace {
    names: Vec<String>,
    priors: Vec<Prior>,
    groups: Vec<ParamGroup>,
    group_of: Vec<usize>,
    shape_indices: Vec<usize>,
    lookup: HashMap<String, usize>,
}

impl ParameterSpace {
    /// Builds a space from group specifications; parameters are laid out in declaration order.
    pub fn new(specs: Vec<GroupSpec>) -> Result<Self> {
        let mut names = Vec::new();
        let mut priors = Vec::new();
        let mut groups = Vec::with_capacity(specs.len());
        let mut group_of = Vec::new();
        let mut lookup = HashMap::new();

        for (g, spec) in specs.into_iter().enumerate() {
            if spec.params.is_empty() {
                return Err(Error::Config(format!("parameter group {} is empty", spec.name)));
            }
            if let Some(values) = &spec.pinned {
                if values.len() != spec.params.len() || values.iter().any(|v| !v.is_finite()) {
                    return Err(Error::Config(format!(
                        "group {} is pinned to {:?}, which does not match its {} parameters",
                        spec.name,
                        values,
                        spec.params.len()
                    )));
                }
            }
            let mut indices = Vec::with_capacity(spec.params.len());
            for (name, prior) in spec.params {
                if lookup.insert(name.clone(), names.len()).is_some() {
                    return Err(Error::Config(format!("duplicate parameter name {name}")));
                }
                indices.push(names.len());
                names.push(name);
                priors.push(prior);
                group_of.push(g);
            }
            groups.push(ParamGroup {
                name: spec.name,
                kind: spec.kind,
                target: spec.target,
                fisher: spec.fisher,
                indices,
                pinned: spec.pinned,
            });
        }
        if names.is_empty() {
            return Err(Error::Config("parameter space is empty".to_string()));
        }

        let shape_indices = (0..names.len())
            .filter(|&i| groups[group_of[i]].kind == UpdateKind::Shape)
            .collect();

        Ok(Self {
            names,
            priors,
            groups,
            group_of,
            shape_indices,
            lookup,
        })
    }

    /// Layout of the CW search over `pulsars`.
    ///
    /// `t_span` sets the default lower frequency bound. Pinned red-noise and GWB values are read
    /// from `noise` when the corresponding `fix_*` switch is set.
    pub fn for_pta(
        pulsars: &[Pulsar],
        noise: &NoiseDictionary,
        config: &SamplerConfig,
        t_span: f64,
    ) -> Result<Self> {
        let freq_min = config.freq_min.unwrap_or(1.0 / t_span);
        if !(freq_min > 0.0 && freq_min < config.freq_max) {
            return Err(Error::Config(format!(
                "frequency prior [{freq_min}, {}] is empty",
                config.freq_max
            )));
        }
        let log10_h = match config.amplitude_prior {
            AmplitudePrior::Detection => Prior::Uniform {
                min: LOG10_H_RANGE.0,
                max: LOG10_H_RANGE.1,
            },
            AmplitudePrior::UpperLimit => Prior::LinearExp {
                min: LOG10_H_RANGE.0,
                max: LOG10_H_RANGE.1,
            },
        };
        let cos = Prior::Uniform { min: -1.0, max: 1.0 };
        let gamma = Prior::Uniform {
            min: GAMMA_RANGE.0,
            max: GAMMA_RANGE.1,
        };
        let log10_a = Prior::Uniform {
            min: LOG10_A_RANGE.0,
            max: LOG10_A_RANGE.1,
        };

        let mut specs = vec![
            GroupSpec::new("cw_intrinsic", UpdateKind::Shape, JumpTarget::Common)
                .param(COS_GWTHETA, cos)
                .param(GWPHI, Prior::Periodic { min: 0.0, max: TAU })
                .param(
                    LOG10_FGW,
                    Prior::Uniform {
                        min: freq_min.log10(),
                        max: config.freq_max.log10(),
                    },
                )
                .param(
                    LOG10_MC,
                    Prior::Uniform {
                        min: LOG10_MC_MIN,
                        max: config.m_max,
                    },
                ),
            GroupSpec::new("cw_extrinsic", UpdateKind::Projection, JumpTarget::Common)
                .param(COS_INC, cos)
                .param(LOG10_H, log10_h)
                .param(PHASE0, Prior::Periodic { min: 0.0, max: TAU })
                .param(PSI, Prior::Periodic { min: 0.0, max: PI }),
        ];

        let mut distances = GroupSpec::new("psr_distances", UpdateKind::Shape, JumpTarget::Dist)
            .diagonal();
        let mut phases = GroupSpec::new("psr_phases", UpdateKind::Projection, JumpTarget::Dist)
            .diagonal();
        for psr in pulsars {
            distances = distances.param(
                p_dist_name(&psr.name),
                Prior::Normal {
                    mean: 0.0,
                    sigma: 1.0,
                },
            );
            phases = phases.param(p_phase_name(&psr.name), Prior::Periodic { min: 0.0, max: TAU });
        }
        specs.push(distances);
        specs.push(phases);

        for psr in pulsars {
            let mut rn = GroupSpec::new(
                format!("red_noise_{}", psr.name),
                UpdateKind::Projection,
                JumpTarget::RedNoise,
            )
            .param(rn_gamma_name(&psr.name), gamma)
            .param(rn_log10_a_name(&psr.name), log10_a);
            if config.zero_rn {
                rn = rn.pinned(ZERO_NOISE.to_vec());
            } else if config.fix_rn {
                rn = rn.pinned(vec![
                    noise.get(&rn_gamma_name(&psr.name))?,
                    noise.get(&rn_log10_a_name(&psr.name))?,
                ]);
            }
            specs.push(rn);
        }

        let mut gwb = GroupSpec::new("gwb", UpdateKind::Projection, JumpTarget::Gwb)
            .param(GWB_GAMMA, gamma)
            .param(GWB_LOG10_A, log10_a);
        if config.zero_gwb {
            gwb = gwb.pinned(ZERO_NOISE.to_vec());
        } else if config.fix_gwb {
            gwb = gwb.pinned(vec![noise.get(GWB_GAMMA)?, noise.get(GWB_LOG10_A)?]);
        }
        specs.push(gwb);

        Self::new(specs)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.lookup.get(name).copied()
    }

    /// Like [`ParameterSpace::index_of`] but fails with a configuration error.
    pub fn require(&self, name: &str) -> Result<usize> {
        self.index_of(name)
            .ok_or_else(|| Error::Config(format!("parameter space has no parameter {name}")))
    }

    pub fn prior(&self, index: usize) -> &Prior {
        &self.priors[index]
    }

    pub fn groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    pub fn group(&self, g: usize) -> &ParamGroup {
        &self.groups[g]
    }

    pub fn group_of(&self, index: usize) -> usize {
        self.group_of[index]
    }

    /// Indices of all parameters whose change requires a shape recompute.
    pub fn shape_indices(&self) -> &[usize] {
        &self.shape_indices
    }

    /// Free groups of `kind` in the `target` bucket; `All` returns every free group of `kind`.
    pub fn free_groups(&self, target: JumpTarget, kind: UpdateKind) -> Vec<usize> {
        self.groups
            .iter()
            .enumerate()
            .filter(|(_, g)| {
                !g.is_fixed() && g.kind == kind && (target == JumpTarget::All || g.target == target)
            })
            .map(|(i, _)| i)
            .collect()
    }

    /// Sum of the log prior densities of the free parameters.
    pub fn log_prior(&self, x: &[f64]) -> f64 {
        let mut lp = 0.0;
        for group in self.groups.iter().filter(|g| !g.is_fixed()) {
            for &i in &group.indices {
                lp += self.priors[i].log_pdf(x[i]);
                if lp == f64::NEG_INFINITY {
                    return lp;
                }
            }
        }
        lp
    }

    /// Draws free parameters from their priors and sets pinned ones to their values.
    pub fn draw_initial<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<f64> {
        let mut x = vec![0.0; self.len()];
        for group in &self.groups {
            match &group.pinned {
                Some(values) => {
                    for (&i, &v) in group.indices.iter().zip(values) {
                        x[i] = v;
                    }
                }
                None => {
                    for &i in &group.indices {
                        x[i] = self.priors[i].sample(rng);
                    }
                }
            }
        }
        x
    }

    /// Wraps the periodic parameters of `x` back into range.
    pub fn wrap(&self, x: &mut [f64]) {
        for (xi, prior) in x.iter_mut().zip(&self.priors) {
            *xi = prior.wrap(*xi);
        }
    }

    /// Step size used along a parameter axis when no Fisher information is available.
    pub fn default_step(&self, index: usize) -> f64 {
        DEFAULT_STEP_FRACTION * self.priors[index].width()
    }

    /// True when `x` and `y` agree on every shape parameter.
    pub fn same_shape(&self, x: &[f64], y: &[f64]) -> bool {
        self.shape_indices.iter().all(|&i| x[i] == y[i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn toy_space() -> ParameterSpace {
        ParameterSpace::new(vec![
            GroupSpec::new("shape", UpdateKind::Shape, JumpTarget::Common)
                .param("a", Prior::Uniform { min: 0.0, max: 2.0 }),
            GroupSpec::new("proj", UpdateKind::Projection, JumpTarget::Common)
                .param("b", Prior::Periodic { min: 0.0, max: TAU })
                .param(
                    "c",
                    Prior::Normal {
                        mean: 0.0,
                        sigma: 1.0,
                    },
                ),
            GroupSpec::new("noise", UpdateKind::Projection, JumpTarget::RedNoise)
                .param("d", Prior::Uniform { min: -20.0, max: -11.0 })
                .pinned(vec![-20.0]),
        ])
        .unwrap()
    }

    #[test]
    fn layout_and_lookup() {
        let space = toy_space();
        assert_eq!(space.len(), 4);
        assert_eq!(space.index_of("c"), Some(2));
        assert_eq!(space.shape_indices(), &[0]);
        assert_eq!(space.group_of(3), 2);
        assert!(space.require("missing").is_err());
    }

    #[test]
    fn pinned_groups_are_not_free() {
        let space = toy_space();
        assert!(space
            .free_groups(JumpTarget::RedNoise, UpdateKind::Projection)
            .is_empty());
        assert_eq!(
            space.free_groups(JumpTarget::All, UpdateKind::Projection),
            vec![1]
        );
    }

    #[test]
    fn initial_draw_respects_pins_and_support() {
        let space = toy_space();
        let mut rng = SmallRng::seed_from_u64(7);
        for _ in 0..100 {
            let x = space.draw_initial(&mut rng);
            assert_eq!(x[3], -20.0);
            assert!(space.log_prior(&x).is_finite());
        }
    }

    #[test]
    fn pinned_values_do_not_enter_the_prior() {
        let space = toy_space();
        let a = space.log_prior(&[1.0, 1.0, 0.0, -20.0]);
        let b = space.log_prior(&[1.0, 1.0, 0.0, 5.0]);
        assert_eq!(a, b);
        assert_eq!(
            space.log_prior(&[3.0, 1.0, 0.0, -20.0]),
            f64::NEG_INFINITY
        );
    }

    #[test]
    fn periodic_wrap() {
        let prior = Prior::Periodic { min: 0.0, max: PI };
        assert_abs_diff_eq!(prior.wrap(PI + 0.5), 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(prior.wrap(-0.5), PI - 0.5, epsilon = 1e-12);
    }

    #[test]
    fn linear_exp_is_normalised() {
        let prior = Prior::LinearExp {
            min: -18.0,
            max: -11.0,
        };
        let n = 20_000;
        let dx = 7.0 / n as f64;
        let integral: f64 = (0..n)
            .map(|i| prior.log_pdf(-18.0 + (i as f64 + 0.5) * dx).exp() * dx)
            .sum();
        assert_abs_diff_eq!(integral, 1.0, epsilon = 1e-3);
    }

    #[test]
    fn duplicate_names_rejected() {
        let result = ParameterSpace::new(vec![
            GroupSpec::new("g1", UpdateKind::Shape, JumpTarget::Common)
                .param("a", Prior::Uniform { min: 0.0, max: 1.0 }),
            GroupSpec::new("g2", UpdateKind::Projection, JumpTarget::Common)
                .param("a", Prior::Uniform { min: 0.0, max: 1.0 }),
        ]);
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
