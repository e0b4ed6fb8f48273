/*!
# Continuous-Wave Likelihood

Gaussian likelihood of a pulsar timing array with a single continuous gravitational wave, per
pulsar red noise and an uncorrelated common red process.

The CW residual of a pulsar is a combination of four basis functions,

```text
b1 = sin(w t) / w              b3 = a_p sin(w_p t) / w_p
b2 = cos(w t) / w              b4 = a_p cos(w_p t) / w_p
```

with `w = 2 pi f_gw`, `w_p` the frequency of the pulsar term and `a_p = (w_p / w)^(2/3)`. The
basis only depends on sky position, frequency, chirp mass and pulsar distance (the shape
parameters); amplitude, inclination, polarisation and phases (the projection parameters) enter
through the four coefficients `c`, and the noise parameters through the Woodbury terms of
[`noise`](super::noise). Projection evaluations reuse the noise terms of every pulsar whose noise
parameters did not change.
*/

use nalgebra::{DMatrix, DVector, Vector4};
use tracing::debug;

use super::noise::{BasisProducts, NoiseKey, NoiseTerms, PulsarNoiseModel};
use super::{FastLikelihood, Projection};
use crate::config::SamplerConfig;
use crate::data::{time_span, validate_pulsars, NoiseDictionary, Pulsar};
use crate::error::{Error, Result};
use crate::params::{self, ParameterSpace};

/// Solar mass in seconds.
pub const T_SUN: f64 = 4.925490947e-6;
/// One kiloparsec in light seconds.
pub const KPC: f64 = 1.0292712503e11;

/// Positions of the CW and noise parameters in the parameter vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CwLayout {
    pub cos_gwtheta: usize,
    pub gwphi: usize,
    pub log10_fgw: usize,
    pub log10_mc: usize,
    pub cos_inc: usize,
    pub log10_h: usize,
    pub phase0: usize,
    pub psi: usize,
    pub p_dist: Vec<usize>,
    pub p_phase: Vec<usize>,
    /// `[gamma, log10_A]` per pulsar.
    pub red_noise: Vec<[usize; 2]>,
    pub gwb: [usize; 2],
}

impl CwLayout {
    pub fn new(space: &ParameterSpace, pulsars: &[Pulsar]) -> Result<Self> {
        let mut layout = Self {
            cos_gwtheta: space.require(params::COS_GWTHETA)?,
            gwphi: space.require(params::GWPHI)?,
            log10_fgw: space.require(params::LOG10_FGW)?,
            log10_mc: space.require(params::LOG10_MC)?,
            cos_inc: space.require(params::COS_INC)?,
            log10_h: space.require(params::LOG10_H)?,
            phase0: space.require(params::PHASE0)?,
            psi: space.require(params::PSI)?,
            p_dist: Vec::with_capacity(pulsars.len()),
            p_phase: Vec::with_capacity(pulsars.len()),
            red_noise: Vec::with_capacity(pulsars.len()),
            gwb: [
                space.require(params::GWB_GAMMA)?,
                space.require(params::GWB_LOG10_A)?,
            ],
        };
        for psr in pulsars {
            layout.p_dist.push(space.require(&params::p_dist_name(&psr.name))?);
            layout.p_phase.push(space.require(&params::p_phase_name(&psr.name))?);
            layout.red_noise.push([
                space.require(&params::rn_gamma_name(&psr.name))?,
                space.require(&params::rn_log10_a_name(&psr.name))?,
            ]);
        }
        Ok(layout)
    }

    /// Indices the signal basis depends on.
    pub fn shape_indices(&self) -> Vec<usize> {
        let mut indices = vec![self.cos_gwtheta, self.gwphi, self.log10_fgw, self.log10_mc];
        indices.extend(&self.p_dist);
        indices.sort_unstable();
        indices
    }
}

/// Antenna patterns `(F+, Fx, cos mu)` of a pulsar at `pos` for a source at `(theta, phi)`.
pub fn antenna_pattern(pos: &[f64; 3], cos_theta: f64, phi: f64) -> (f64, f64, f64) {
    let sin_theta = (1.0 - cos_theta * cos_theta).max(0.0).sqrt();
    let (sin_phi, cos_phi) = phi.sin_cos();
    let m = [sin_phi, -cos_phi, 0.0];
    let n = [-cos_theta * cos_phi, -cos_theta * sin_phi, sin_theta];
    let omhat = [-sin_theta * cos_phi, -sin_theta * sin_phi, -cos_theta];
    let dot = |a: &[f64; 3]| a[0] * pos[0] + a[1] * pos[1] + a[2] * pos[2];
    let (mp, np, op) = (dot(&m), dot(&n), dot(&omhat));
    let fplus = 0.5 * (mp * mp - np * np) / (1.0 + op);
    let fcross = mp * np / (1.0 + op);
    (fplus, fcross, -op)
}

#[derive(Debug, Clone)]
struct PulsarTerms {
    model: PulsarNoiseModel,
    pos: [f64; 3],
    pdist: [f64; 2],
}

/// Shape-dependent state of one pulsar.
#[derive(Debug, Clone)]
pub struct PulsarBasis {
    pub fplus: f64,
    pub fcross: f64,
    pub products: BasisProducts,
    pub noise_key: NoiseKey,
    pub noise: NoiseTerms,
}

#[derive(Debug, Clone)]
pub struct CwBasis {
    pub pulsars: Vec<PulsarBasis>,
}

/// Noise terms recomputed during a projection, keyed by pulsar.
#[derive(Debug, Default)]
pub struct NoiseDelta {
    pub updates: Vec<(usize, NoiseKey, NoiseTerms)>,
}

#[derive(Debug, Clone)]
pub struct CwLikelihood {
    layout: CwLayout,
    pulsars: Vec<PulsarTerms>,
    shape_indices: Vec<usize>,
    include_cw: bool,
}

impl CwLikelihood {
    /// Precomputes the data products of every pulsar.
    ///
    /// # Errors
    ///
    /// [`Error::Data`] for invalid pulsars or missing white-noise entries, [`Error::Config`] when
    /// `space` lacks a CW or noise parameter of one of the pulsars.
    pub fn new(
        pulsars: &[Pulsar],
        noise: &NoiseDictionary,
        space: &ParameterSpace,
        config: &SamplerConfig,
    ) -> Result<Self> {
        validate_pulsars(pulsars)?;
        let layout = CwLayout::new(space, pulsars)?;
        let (t_ref, t_span) = time_span(pulsars);
        if !(t_span > 0.0) {
            return Err(Error::Data("pulsar data spans no time".to_string()));
        }

        let mut terms = Vec::with_capacity(pulsars.len());
        for psr in pulsars {
            let model = PulsarNoiseModel::new(
                psr,
                noise.white_variance(psr)?,
                t_ref,
                t_span,
                config.rn_comps,
                config.gwb_comps,
            )?;
            terms.push(PulsarTerms {
                model,
                pos: psr.pos,
                pdist: psr.pdist,
            });
        }
        debug!(
            n_pulsars = terms.len(),
            t_span_years = t_span / (365.25 * 86400.0),
            "precomputed pulsar noise models"
        );

        Ok(Self {
            shape_indices: layout.shape_indices(),
            layout,
            pulsars: terms,
            include_cw: config.include_cw,
        })
    }

    pub fn layout(&self) -> &CwLayout {
        &self.layout
    }

    pub fn n_pulsars(&self) -> usize {
        self.pulsars.len()
    }

    fn noise_key(&self, x: &[f64], p: usize) -> NoiseKey {
        let [rg, ra] = self.layout.red_noise[p];
        let [gg, ga] = self.layout.gwb;
        [x[rg], x[ra], x[gg], x[ga]]
    }

    /// Signal basis (`n x 4`) and antenna patterns of pulsar `p`.
    fn signal_basis(&self, x: &[f64], p: usize) -> (DMatrix<f64>, f64, f64) {
        let l = &self.layout;
        let psr = &self.pulsars[p];
        let (fplus, fcross, cos_mu) = antenna_pattern(&psr.pos, x[l.cos_gwtheta], x[l.gwphi]);

        let w0 = std::f64::consts::PI * 10f64.powf(x[l.log10_fgw]);
        let mc = 10f64.powf(x[l.log10_mc]) * T_SUN;
        let distance = (psr.pdist[0] + psr.pdist[1] * x[l.p_dist[p]]) * KPC;
        let tau = distance * (1.0 - cos_mu);
        let wp = w0 * (1.0 + 256.0 / 5.0 * mc.powf(5.0 / 3.0) * w0.powf(8.0 / 3.0) * tau).powf(-3.0 / 8.0);

        let (omega, omega_p) = (2.0 * w0, 2.0 * wp);
        let a_p = (omega_p / omega).powf(2.0 / 3.0);
        let t = &psr.model.t;
        let basis = DMatrix::from_fn(t.len(), 4, |i, j| match j {
            0 => (omega * t[i]).sin() / omega,
            1 => (omega * t[i]).cos() / omega,
            2 => a_p * (omega_p * t[i]).sin() / omega_p,
            _ => a_p * (omega_p * t[i]).cos() / omega_p,
        });
        (basis, fplus, fcross)
    }

    /// Weights of the four basis functions of pulsar `p`.
    fn coefficients(&self, x: &[f64], p: usize, fplus: f64, fcross: f64) -> Vector4<f64> {
        if !self.include_cw {
            return Vector4::zeros();
        }
        let l = &self.layout;
        let h = 10f64.powf(x[l.log10_h]);
        let cos_inc = x[l.cos_inc];
        let (sin_2psi, cos_2psi) = (2.0 * x[l.psi]).sin_cos();
        let plus = (1.0 + cos_inc * cos_inc) * (fplus * cos_2psi - fcross * sin_2psi);
        let cross = 2.0 * cos_inc * (fplus * sin_2psi + fcross * cos_2psi);

        let (sin_e, cos_e) = (2.0 * x[l.phase0]).sin_cos();
        let (sin_p, cos_p) = (2.0 * x[l.phase0] + x[l.p_phase[p]]).sin_cos();
        Vector4::new(
            -h * (plus * cos_e - cross * sin_e),
            -h * (plus * sin_e + cross * cos_e),
            h * (plus * cos_p - cross * sin_p),
            h * (plus * sin_p + cross * cos_p),
        )
    }

    /// CW residuals of every pulsar at `x`.
    pub fn residual_model(&self, x: &[f64]) -> Vec<DVector<f64>> {
        (0..self.pulsars.len())
            .map(|p| {
                let (basis, fplus, fcross) = self.signal_basis(x, p);
                basis * self.coefficients(x, p, fplus, fcross)
            })
            .collect()
    }

    /// Reference evaluation with dense `n x n` covariances. Slow; meant for validation.
    pub fn dense_log_likelihood(&self, x: &[f64]) -> f64 {
        let signals = self.residual_model(x);
        let mut ll = 0.0;
        for (p, (psr, s)) in self.pulsars.iter().zip(&signals).enumerate() {
            let cov = psr.model.covariance(&self.noise_key(x, p));
            let Some(chol) = cov.cholesky() else {
                return f64::NAN;
            };
            let r = &psr.model.residuals - s;
            let logdet: f64 = 2.0 * chol.l_dirty().diagonal().iter().map(|v| v.ln()).sum::<f64>();
            let n = psr.model.n_toas() as f64;
            ll -= 0.5 * (r.dot(&chol.solve(&r)) + logdet + n * std::f64::consts::TAU.ln());
        }
        ll
    }
}

impl FastLikelihood for CwLikelihood {
    type Basis = CwBasis;
    type Delta = NoiseDelta;

    fn shape_indices(&self) -> &[usize] {
        &self.shape_indices
    }

    fn compute_basis(&self, x: &[f64]) -> CwBasis {
        let pulsars = self
            .pulsars
            .iter()
            .enumerate()
            .map(|(p, psr)| {
                let (basis, fplus, fcross) = self.signal_basis(x, p);
                let products = psr.model.products(&basis);
                let noise_key = self.noise_key(x, p);
                let noise = psr.model.noise_terms(&noise_key, &products);
                PulsarBasis {
                    fplus,
                    fcross,
                    products,
                    noise_key,
                    noise,
                }
            })
            .collect();
        CwBasis { pulsars }
    }

    fn project(&self, basis: &CwBasis, x: &[f64]) -> Projection<NoiseDelta> {
        let mut delta = NoiseDelta::default();
        let mut log_likelihood = 0.0;
        for (p, (psr, b)) in self.pulsars.iter().zip(&basis.pulsars).enumerate() {
            let c = self.coefficients(x, p, b.fplus, b.fcross);
            let key = self.noise_key(x, p);
            if key == b.noise_key {
                log_likelihood += b.noise.log_likelihood(&c);
            } else {
                let terms = psr.model.noise_terms(&key, &b.products);
                log_likelihood += terms.log_likelihood(&c);
                delta.updates.push((p, key, terms));
            }
        }
        Projection {
            log_likelihood,
            delta,
        }
    }

    fn apply(&self, basis: &mut CwBasis, delta: NoiseDelta) {
        for (p, key, terms) in delta.updates {
            let b = &mut basis.pulsars[p];
            b.noise_key = key;
            b.noise = terms;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{CwInjection, SyntheticPta};
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn antenna_pattern_power_identity() {
        let pos = [0.3_f64, -0.5, 0.8];
        let norm = pos.iter().map(|v| v * v).sum::<f64>().sqrt();
        let pos = [pos[0] / norm, pos[1] / norm, pos[2] / norm];
        for (cos_theta, phi) in [(0.2, 1.0), (-0.7, 4.0), (0.9, 2.5)] {
            let (fp, fc, cos_mu) = antenna_pattern(&pos, cos_theta, phi);
            assert_abs_diff_eq!(
                fp * fp + fc * fc,
                0.25 * (1.0 + cos_mu).powi(2),
                epsilon = 1e-12
            );
        }
    }

    #[test]
    fn shape_indices_cover_intrinsic_and_distances() {
        let pta = SyntheticPta::builder().n_pulsars(3).n_toas(50).build(1).unwrap();
        let space = pta.space(&pta.config()).unwrap();
        let lik = pta.likelihood(&space, &pta.config()).unwrap();
        assert_eq!(lik.shape_indices().len(), 4 + 3);
        assert_eq!(lik.shape_indices(), space.shape_indices());
    }

    #[test]
    fn projection_after_noise_change_matches_fresh_basis() {
        let pta = SyntheticPta::builder()
            .n_pulsars(2)
            .n_toas(60)
            .inject(CwInjection::default())
            .build(5)
            .unwrap();
        let config = pta.config();
        let space = pta.space(&config).unwrap();
        let lik = pta.likelihood(&space, &config).unwrap();
        let mut rng = SmallRng::seed_from_u64(9);
        let x = space.draw_initial(&mut rng);
        let basis = lik.compute_basis(&x);

        let mut y = x.clone();
        let [gamma, log10_a] = lik.layout().red_noise[1];
        y[gamma] = 2.5;
        y[log10_a] = -13.8;
        let projected = lik.project(&basis, &y);
        assert_eq!(projected.delta.updates.len(), 1);
        assert_relative_eq!(
            projected.log_likelihood,
            lik.log_likelihood(&y),
            max_relative = 1e-10
        );
    }

    #[test]
    fn excluded_signal_ignores_cw_parameters() {
        let pta = SyntheticPta::builder().n_pulsars(2).n_toas(40).build(2).unwrap();
        let config = SamplerConfig {
            include_cw: false,
            ..pta.config()
        };
        let space = pta.space(&config).unwrap();
        let lik = pta.likelihood(&space, &config).unwrap();
        let mut rng = SmallRng::seed_from_u64(4);
        let x = space.draw_initial(&mut rng);
        let mut y = x.clone();
        y[lik.layout().log10_h] = -11.5;
        y[lik.layout().cos_inc] = 0.3;
        assert_eq!(lik.log_likelihood(&x), lik.log_likelihood(&y));
    }
}
