/*!
# Fast Likelihoods

A [`FastLikelihood`] splits evaluation into two stages:

1. [`FastLikelihood::compute_basis`] (shape mode) builds everything that depends on the shape
   parameters. This is the expensive part.
2. [`FastLikelihood::project`] (projection mode) scores a parameter vector against a basis. It is
   only valid when the vector agrees with the one the basis was built from on every index in
   [`FastLikelihood::shape_indices`]. Intermediate results that depend on projection parameters
   are returned as a delta instead of being written into the basis, so a rejected candidate leaves
   the basis untouched. [`FastLikelihood::apply`] commits the delta of an accepted candidate.

Bookkeeping of which basis is valid for which vector lives in
[`FastLikelihoodCache`](crate::cache::FastLikelihoodCache).

[`cw::CwLikelihood`] is the pulsar-timing implementation.
*/

pub mod cw;
pub mod noise;

/// Result of a projection-mode evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Projection<D> {
    pub log_likelihood: f64,
    /// Recomputed intermediates, to be applied to the basis if the candidate is accepted.
    pub delta: D,
}

/// A likelihood with a cacheable shape stage and a cheap projection stage.
pub trait FastLikelihood: Send + Sync {
    type Basis: Clone + Send + Sync + std::fmt::Debug;
    type Delta: Send + std::fmt::Debug;

    /// Parameters the basis depends on.
    fn shape_indices(&self) -> &[usize];

    fn compute_basis(&self, params: &[f64]) -> Self::Basis;

    fn project(&self, basis: &Self::Basis, params: &[f64]) -> Projection<Self::Delta>;

    fn apply(&self, basis: &mut Self::Basis, delta: Self::Delta);

    /// Full evaluation from scratch.
    fn log_likelihood(&self, params: &[f64]) -> f64 {
        let basis = self.compute_basis(params);
        self.project(&basis, params).log_likelihood
    }
}
