/*!
# Likelihood Cache

Per-chain cache of the shape basis of a [`FastLikelihood`]. The cache is always in one of two
states, tracked by [`CacheState`]:

- `Dirty`: there is no usable basis. Only shape-mode evaluations are possible.
- `Valid`: the basis was built from a vector whose shape parameters equal the stored key.

Scoring a candidate never mutates the cache. The returned [`Scored`] value carries what must be
written back if the candidate is accepted; [`FastLikelihoodCache::commit`] does so. A rejected
candidate is simply dropped, which leaves the cache consistent with the unchanged chain state.
*/

use crate::error::{Error, Result};
use crate::likelihood::FastLikelihood;

/// Validity of the cached basis.
#[derive(Debug, Clone)]
pub enum CacheState<B> {
    Dirty,
    Valid {
        basis: B,
        /// Values of the shape parameters the basis was built from.
        shape_key: Vec<f64>,
    },
}

/// What an accepted candidate writes back into the cache.
#[derive(Debug)]
pub enum Pending<L: FastLikelihood> {
    /// A freshly built basis replacing the current one.
    Shape { basis: L::Basis, shape_key: Vec<f64> },
    /// Projection intermediates applied to the current basis.
    Projection(L::Delta),
}

/// A scored candidate.
#[derive(Debug)]
pub struct Scored<L: FastLikelihood> {
    pub log_likelihood: f64,
    pub pending: Pending<L>,
}

#[derive(Debug)]
pub struct FastLikelihoodCache<L: FastLikelihood> {
    state: CacheState<L::Basis>,
}

impl<L: FastLikelihood> Default for FastLikelihoodCache<L> {
    fn default() -> Self {
        Self::new()
    }
}

fn shape_key<L: FastLikelihood>(likelihood: &L, params: &[f64]) -> Vec<f64> {
    likelihood
        .shape_indices()
        .iter()
        .map(|&i| params[i])
        .collect()
}

impl<L: FastLikelihood> FastLikelihoodCache<L> {
    pub fn new() -> Self {
        Self {
            state: CacheState::Dirty,
        }
    }

    pub fn state(&self) -> &CacheState<L::Basis> {
        &self.state
    }

    pub fn is_valid(&self) -> bool {
        matches!(self.state, CacheState::Valid { .. })
    }

    pub fn invalidate(&mut self) {
        self.state = CacheState::Dirty;
    }

    /// True when a projection-mode evaluation of `params` is allowed.
    pub fn matches(&self, likelihood: &L, params: &[f64]) -> bool {
        match &self.state {
            CacheState::Dirty => false,
            CacheState::Valid { shape_key, .. } => likelihood
                .shape_indices()
                .iter()
                .zip(shape_key)
                .all(|(&i, &v)| params[i] == v),
        }
    }

    /// Shape-mode recompute for the chain's current state. The cache becomes valid for `params`.
    pub fn refresh(&mut self, likelihood: &L, params: &[f64]) -> f64 {
        let basis = likelihood.compute_basis(params);
        let log_likelihood = likelihood.project(&basis, params).log_likelihood;
        self.state = CacheState::Valid {
            basis,
            shape_key: shape_key(likelihood, params),
        };
        log_likelihood
    }

    /// Scores a candidate in shape mode without touching the cache.
    pub fn score_shape(&self, likelihood: &L, params: &[f64]) -> Scored<L> {
        let basis = likelihood.compute_basis(params);
        // a fresh basis already holds every intermediate of `params`, the delta is empty
        let log_likelihood = likelihood.project(&basis, params).log_likelihood;
        Scored {
            log_likelihood,
            pending: Pending::Shape {
                basis,
                shape_key: shape_key(likelihood, params),
            },
        }
    }

    /// Scores a candidate against the cached basis.
    ///
    /// # Errors
    ///
    /// [`Error::CacheConsistency`] when the cache is dirty or the candidate differs from the basis
    /// in a shape parameter.
    pub fn score_projection(&self, likelihood: &L, params: &[f64]) -> Result<Scored<L>> {
        let CacheState::Valid { basis, shape_key } = &self.state else {
            return Err(Error::CacheConsistency(
                "projection requested on a dirty cache".to_string(),
            ));
        };
        if let Some((&i, &v)) = likelihood
            .shape_indices()
            .iter()
            .zip(shape_key)
            .find(|&(&i, &v)| params[i] != v)
        {
            return Err(Error::CacheConsistency(format!(
                "shape parameter {i} is {} but the basis was built at {v}",
                params[i]
            )));
        }
        let projection = likelihood.project(basis, params);
        Ok(Scored {
            log_likelihood: projection.log_likelihood,
            pending: Pending::Projection(projection.delta),
        })
    }

    /// Writes back the intermediates of an accepted candidate.
    ///
    /// # Errors
    ///
    /// [`Error::CacheConsistency`] when a projection delta arrives on a dirty cache.
    pub fn commit(&mut self, likelihood: &L, pending: Pending<L>) -> Result<()> {
        match pending {
            Pending::Shape { basis, shape_key } => {
                self.state = CacheState::Valid { basis, shape_key };
            }
            Pending::Projection(delta) => match &mut self.state {
                CacheState::Valid { basis, .. } => likelihood.apply(basis, delta),
                CacheState::Dirty => {
                    return Err(Error::CacheConsistency(
                        "projection result committed to a dirty cache".to_string(),
                    ))
                }
            },
        }
        Ok(())
    }
}
