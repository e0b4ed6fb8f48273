/*!
# Fisher Eigendirections

Jump directions for the Fisher strategy. For every free group the Fisher matrix
`F_ij = -d^2 log L / dx_i dx_j` is estimated by central finite differences around the chain's
current state and decomposed with [`SymmetricEigen`]. Each eigenvector becomes a jump direction
with step scale `1 / sqrt(lambda)`. Groups with [`FisherShape::Diagonal`] only get the diagonal
entries, i.e. one axis-aligned direction per parameter.

Diagonal groups are refreshed once per block. Full-matrix groups (the CW parameters, red noise
and the common process) need the eigendecomposition and are refreshed every
`fisher_eig_downsample`-th block only; see [`FisherSet::refresh_due`]. Directions are stale in
between.
*/

use nalgebra::{DMatrix, SymmetricEigen};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::params::{FisherShape, ParameterSpace};

const MIN_SCALE: f64 = 1e-10;
const EIGEN_MAX_ITER: usize = 1000;
const EIGEN_FLOOR: f64 = 1e-12;

/// Orthonormal jump directions of one group, in the coordinates of the group's parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EigenDirections {
    pub directions: Vec<Vec<f64>>,
    pub scales: Vec<f64>,
    /// The Fisher matrix was not usable and unit directions with default steps were substituted.
    pub fallback: bool,
}

impl EigenDirections {
    /// Axis-aligned directions with the default step of each parameter.
    pub fn unit(space: &ParameterSpace, indices: &[usize]) -> Self {
        let d = indices.len();
        Self {
            directions: (0..d)
                .map(|k| (0..d).map(|i| if i == k { 1.0 } else { 0.0 }).collect())
                .collect(),
            scales: indices.iter().map(|&i| space.default_step(i)).collect(),
            fallback: true,
        }
    }

    pub fn len(&self) -> usize {
        self.directions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.directions.is_empty()
    }
}

/// Length of a direction measured with per-parameter scales.
fn projected(direction: &[f64], per_param: &[f64]) -> f64 {
    direction
        .iter()
        .zip(per_param)
        .map(|(v, s)| (v * s).powi(2))
        .sum::<f64>()
        .sqrt()
}

/// Estimates the Fisher matrix of group `group` at `x` and returns its eigendirections.
///
/// `log_likelihood` is evaluated at `x` with one or two coordinates of the group shifted by
/// `fisher_step` times the prior width of the parameter.
pub fn group_directions<F>(
    space: &ParameterSpace,
    group: usize,
    x: &[f64],
    fisher_step: f64,
    mut log_likelihood: F,
) -> EigenDirections
where
    F: FnMut(&[f64]) -> f64,
{
    let g = space.group(group);
    let indices = &g.indices;
    let d = indices.len();
    let widths: Vec<f64> = indices.iter().map(|&i| space.prior(i).width()).collect();
    let defaults: Vec<f64> = indices.iter().map(|&i| space.default_step(i)).collect();
    let h: Vec<f64> = widths.iter().map(|w| fisher_step * w).collect();

    let mut y = x.to_vec();
    let mut shifted = |shifts: &[(usize, f64)]| {
        for &(k, s) in shifts {
            y[indices[k]] = x[indices[k]] + s;
        }
        let value = log_likelihood(&y);
        for &(k, _) in shifts {
            y[indices[k]] = x[indices[k]];
        }
        value
    };

    let f0 = shifted(&[]);
    let mut fisher = DMatrix::<f64>::zeros(d, d);
    for k in 0..d {
        let plus = shifted(&[(k, h[k])]);
        let minus = shifted(&[(k, -h[k])]);
        fisher[(k, k)] = -(plus - 2.0 * f0 + minus) / (h[k] * h[k]);
    }
    if g.fisher == FisherShape::Full {
        for k in 0..d {
            for l in (k + 1)..d {
                let pp = shifted(&[(k, h[k]), (l, h[l])]);
                let pm = shifted(&[(k, h[k]), (l, -h[l])]);
                let mp = shifted(&[(k, -h[k]), (l, h[l])]);
                let mm = shifted(&[(k, -h[k]), (l, -h[l])]);
                let v = -(pp - pm - mp + mm) / (4.0 * h[k] * h[l]);
                fisher[(k, l)] = v;
                fisher[(l, k)] = v;
            }
        }
    }

    if !f0.is_finite() || fisher.iter().any(|v| !v.is_finite()) {
        return EigenDirections::unit(space, indices);
    }

    // eigenvalues this far below the largest one are numerically flat
    let floor = EIGEN_FLOOR * fisher.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
    let scale_of = |lambda: f64, direction: &[f64]| {
        let upper = projected(direction, &widths);
        if lambda > floor && lambda.is_finite() {
            (1.0 / lambda.sqrt()).clamp(MIN_SCALE, upper.max(MIN_SCALE))
        } else {
            projected(direction, &defaults)
        }
    };

    match g.fisher {
        FisherShape::Diagonal => {
            let mut dirs = EigenDirections::unit(space, indices);
            for k in 0..d {
                dirs.scales[k] = scale_of(fisher[(k, k)], &dirs.directions[k]);
            }
            dirs.fallback = false;
            dirs
        }
        FisherShape::Full => {
            let Some(eigen) = SymmetricEigen::try_new(fisher, f64::EPSILON, EIGEN_MAX_ITER) else {
                return EigenDirections::unit(space, indices);
            };
            let directions: Vec<Vec<f64>> = eigen
                .eigenvectors
                .column_iter()
                .map(|c| c.iter().copied().collect())
                .collect();
            let scales = eigen
                .eigenvalues
                .iter()
                .zip(&directions)
                .map(|(&lambda, dir)| scale_of(lambda, dir))
                .collect();
            EigenDirections {
                directions,
                scales,
                fallback: false,
            }
        }
    }
}

/// Eigendirections of every group of one chain, with consecutive-failure counters.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FisherSet {
    groups: Vec<Option<EigenDirections>>,
    failures: Vec<u32>,
}

impl FisherSet {
    pub fn new(n_groups: usize) -> Self {
        Self {
            groups: vec![None; n_groups],
            failures: vec![0; n_groups],
        }
    }

    /// Number of groups covered.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Whether the directions of `group` are recomputed in block `block`.
    ///
    /// Diagonal groups are due every block, full-matrix groups every `eig_downsample`-th block
    /// and whenever they hold no directions yet.
    pub fn refresh_due(
        &self,
        space: &ParameterSpace,
        group: usize,
        block: u64,
        eig_downsample: u64,
    ) -> bool {
        space.group(group).fisher == FisherShape::Diagonal
            || block % eig_downsample == 0
            || self.get(group).is_none()
    }

    pub fn get(&self, group: usize) -> Option<&EigenDirections> {
        self.groups.get(group)?.as_ref()
    }

    pub fn failures(&self) -> &[u32] {
        &self.failures
    }

    /// Stores fresh directions for `group`.
    ///
    /// # Errors
    ///
    /// [`Error::Numerical`] once `max_failures` consecutive refreshes of the group fell back to
    /// unit directions.
    pub fn update(
        &mut self,
        space: &ParameterSpace,
        group: usize,
        dirs: EigenDirections,
        max_failures: u32,
    ) -> Result<()> {
        if dirs.fallback {
            self.failures[group] += 1;
            warn!(
                group = %space.group(group).name,
                consecutive = self.failures[group],
                "Fisher matrix not finite, using default steps"
            );
            if self.failures[group] >= max_failures {
                return Err(Error::Numerical(format!(
                    "Fisher matrix of group {} failed {} times in a row",
                    space.group(group).name,
                    self.failures[group]
                )));
            }
        } else {
            self.failures[group] = 0;
        }
        self.groups[group] = Some(dirs);
        Ok(())
    }
}
