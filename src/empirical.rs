/*!
# Empirical Distributions

Two-dimensional density tables (typically the posterior of a pulsar's red-noise spectral index and
amplitude from a single-pulsar analysis) used as an informed proposal. A table is read from JSON:

```json
[{ "param_names": ["J0030+0451_red_noise_gamma", "J0030+0451_red_noise_log10_A"],
   "x_edges": [0.0, 3.5, 7.0], "y_edges": [-20.0, -15.5, -11.0],
   "density": [[0.1, 0.2], [0.3, 0.4]] }]
```

A draw picks a bin with probability proportional to its mass and a uniform point inside it.
Outside the table (or in empty bins) the density is floored so that proposal ratios stay finite.
*/

use rand::distr::weighted::WeightedIndex;
use rand::distr::Distribution;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::warn;

use crate::error::{Error, Result};
use crate::params::ParameterSpace;

/// Density floor relative to the smallest non-empty bin.
const FLOOR_FRACTION: f64 = 1e-2;

/// Raw histogram as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram2D {
    pub param_names: [String; 2],
    pub x_edges: Vec<f64>,
    pub y_edges: Vec<f64>,
    /// `density[i][j]` covers `x_edges[i]..x_edges[i+1]` and `y_edges[j]..y_edges[j+1]`.
    pub density: Vec<Vec<f64>>,
}

/// Normalised, sampleable version of a [`Histogram2D`].
#[derive(Debug, Clone)]
pub struct EmpiricalDistribution {
    param_names: [String; 2],
    x_edges: Vec<f64>,
    y_edges: Vec<f64>,
    pdf: Vec<f64>,
    log_floor: f64,
    bins: WeightedIndex<f64>,
}

fn check_edges(name: &str, edges: &[f64]) -> Result<()> {
    if edges.len() < 2 || edges.windows(2).any(|w| !(w[1] > w[0])) {
        return Err(Error::Data(format!(
            "empirical distribution over {name}: bin edges must be strictly increasing"
        )));
    }
    Ok(())
}

impl EmpiricalDistribution {
    pub fn new(hist: Histogram2D) -> Result<Self> {
        let label = format!("{}/{}", hist.param_names[0], hist.param_names[1]);
        check_edges(&label, &hist.x_edges)?;
        check_edges(&label, &hist.y_edges)?;
        let (nx, ny) = (hist.x_edges.len() - 1, hist.y_edges.len() - 1);
        if hist.density.len() != nx || hist.density.iter().any(|row| row.len() != ny) {
            return Err(Error::Data(format!(
                "empirical distribution over {label}: density is not {nx} x {ny}"
            )));
        }

        let mut masses = Vec::with_capacity(nx * ny);
        for (i, row) in hist.density.iter().enumerate() {
            let dx = hist.x_edges[i + 1] - hist.x_edges[i];
            for (j, &d) in row.iter().enumerate() {
                if !(d.is_finite() && d >= 0.0) {
                    return Err(Error::Data(format!(
                        "empirical distribution over {label}: invalid density {d}"
                    )));
                }
                masses.push(d * dx * (hist.y_edges[j + 1] - hist.y_edges[j]));
            }
        }
        let total: f64 = masses.iter().sum();
        if total <= 0.0 {
            return Err(Error::Data(format!(
                "empirical distribution over {label} has no mass"
            )));
        }
        let pdf: Vec<f64> = hist
            .density
            .iter()
            .flat_map(|row| row.iter().map(|d| d / total))
            .collect();
        let min_positive = pdf
            .iter()
            .copied()
            .filter(|p| *p > 0.0)
            .fold(f64::INFINITY, f64::min);
        let bins = WeightedIndex::new(&masses)
            .map_err(|e| Error::Data(format!("empirical distribution over {label}: {e}")))?;

        Ok(Self {
            param_names: hist.param_names,
            x_edges: hist.x_edges,
            y_edges: hist.y_edges,
            pdf,
            log_floor: (FLOOR_FRACTION * min_positive).ln(),
            bins,
        })
    }

    pub fn param_names(&self) -> &[String; 2] {
        &self.param_names
    }

    /// Log density at `(x, y)`, floored outside the support.
    pub fn log_pdf(&self, x: f64, y: f64) -> f64 {
        match (bin_of(&self.x_edges, x), bin_of(&self.y_edges, y)) {
            (Some(i), Some(j)) => {
                let p = self.pdf[i * (self.y_edges.len() - 1) + j];
                if p > 0.0 {
                    p.ln().max(self.log_floor)
                } else {
                    self.log_floor
                }
            }
            _ => self.log_floor,
        }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> (f64, f64) {
        let k = self.bins.sample(rng);
        let ny = self.y_edges.len() - 1;
        let (i, j) = (k / ny, k % ny);
        let x = self.x_edges[i] + (self.x_edges[i + 1] - self.x_edges[i]) * rng.random::<f64>();
        let y = self.y_edges[j] + (self.y_edges[j + 1] - self.y_edges[j]) * rng.random::<f64>();
        (x, y)
    }
}

fn bin_of(edges: &[f64], v: f64) -> Option<usize> {
    let last = edges.len() - 1;
    if !(v >= edges[0] && v <= edges[last]) {
        return None;
    }
    // partition_point gives the first edge strictly greater than v
    let k = edges.partition_point(|e| *e <= v);
    Some(k.saturating_sub(1).min(last - 1))
}

/// Tables bound to the parameter groups they describe.
#[derive(Debug, Clone, Default)]
pub struct EmpiricalSet {
    tables: Vec<(EmpiricalDistribution, [usize; 2])>,
    by_group: Vec<Option<usize>>,
}

impl EmpiricalSet {
    /// Reads histograms from a JSON file.
    pub fn load_histograms<P: AsRef<Path>>(path: P) -> Result<Vec<Histogram2D>> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            Error::Config(format!(
                "cannot open empirical distribution file {}: {e}",
                path.display()
            ))
        })?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    /// An empty set; the empirical strategy is then never applicable.
    pub fn empty(space: &ParameterSpace) -> Self {
        Self {
            tables: Vec::new(),
            by_group: vec![None; space.groups().len()],
        }
    }

    /// Binds histograms to `space`. Tables over unknown parameters or spanning two groups are
    /// skipped with a warning, as are tables over pinned groups.
    pub fn new(histograms: Vec<Histogram2D>, space: &ParameterSpace) -> Result<Self> {
        let mut set = Self::empty(space);
        for hist in histograms {
            let [a, b] = &hist.param_names;
            let (Some(ia), Some(ib)) = (space.index_of(a), space.index_of(b)) else {
                warn!(x = %a, y = %b, "empirical distribution over unknown parameters, skipped");
                continue;
            };
            let g = space.group_of(ia);
            if space.group_of(ib) != g || ia == ib {
                warn!(x = %a, y = %b, "empirical distribution spans two groups, skipped");
                continue;
            }
            if space.group(g).is_fixed() {
                continue;
            }
            if set.by_group[g].is_some() {
                return Err(Error::Data(format!(
                    "two empirical distributions for group {}",
                    space.group(g).name
                )));
            }
            set.by_group[g] = Some(set.tables.len());
            set.tables.push((EmpiricalDistribution::new(hist)?, [ia, ib]));
        }
        Ok(set)
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn covers(&self, group: usize) -> bool {
        matches!(self.by_group.get(group), Some(Some(_)))
    }

    /// Table of `group` and the parameter indices it describes.
    pub fn for_group(&self, group: usize) -> Option<(&EmpiricalDistribution, [usize; 2])> {
        let t = (*self.by_group.get(group)?)?;
        let (table, idx) = &self.tables[t];
        Some((table, *idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{GroupSpec, JumpTarget, Prior, UpdateKind};
    use approx::assert_abs_diff_eq;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn hist() -> Histogram2D {
        Histogram2D {
            param_names: ["g".to_string(), "a".to_string()],
            x_edges: vec![0.0, 1.0, 2.0],
            y_edges: vec![0.0, 2.0],
            density: vec![vec![3.0], vec![1.0]],
        }
    }

    #[test]
    fn density_is_normalised() {
        let dist = EmpiricalDistribution::new(hist()).unwrap();
        // masses 6 and 2, total 8
        assert_abs_diff_eq!(dist.log_pdf(0.5, 1.0).exp(), 3.0 / 8.0, epsilon = 1e-12);
        assert_abs_diff_eq!(dist.log_pdf(1.5, 1.0).exp(), 1.0 / 8.0, epsilon = 1e-12);
        assert!(dist.log_pdf(5.0, 1.0) < dist.log_pdf(1.5, 1.0));
        assert!(dist.log_pdf(5.0, 1.0).is_finite());
    }

    #[test]
    fn draws_follow_bin_masses() {
        let dist = EmpiricalDistribution::new(hist()).unwrap();
        let mut rng = SmallRng::seed_from_u64(3);
        let n = 20_000;
        let left = (0..n).filter(|_| dist.sample(&mut rng).0 < 1.0).count();
        assert_abs_diff_eq!(left as f64 / n as f64, 0.75, epsilon = 0.02);
    }

    #[test]
    fn rejects_ragged_density() {
        let mut h = hist();
        h.density[1].push(1.0);
        assert!(matches!(
            EmpiricalDistribution::new(h),
            Err(Error::Data(_))
        ));
    }

    #[test]
    fn binds_to_group() {
        let space = ParameterSpace::new(vec![
            GroupSpec::new("cw", UpdateKind::Shape, JumpTarget::Common)
                .param("f", Prior::Uniform { min: 0.0, max: 1.0 }),
            GroupSpec::new("rn", UpdateKind::Projection, JumpTarget::RedNoise)
                .param("g", Prior::Uniform { min: 0.0, max: 2.0 })
                .param("a", Prior::Uniform { min: 0.0, max: 2.0 }),
        ])
        .unwrap();
        let mut stray = hist();
        stray.param_names = ["x".to_string(), "y".to_string()];
        let set = EmpiricalSet::new(vec![hist(), stray], &space).unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.covers(1));
        assert!(!set.covers(0));
        assert_eq!(set.for_group(1).unwrap().1, [1, 2]);
    }
}
