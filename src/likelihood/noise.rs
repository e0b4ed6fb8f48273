//! Per-pulsar Gaussian noise model: white noise plus a Fourier-basis red process.
//!
//! The covariance of a pulsar is `C = N + F phi F^T` with `N` diagonal. Inner products under
//! `C^-1` are evaluated with the Woodbury identity, so that only the `2k x 2k` matrix
//! `Sigma = phi^-1 + F^T N^-1 F` has to be factorised when the noise parameters change.

use nalgebra::{DMatrix, DVector, Matrix4, Vector4};
use std::f64::consts::{PI, TAU};

use crate::data::Pulsar;
use crate::error::{Error, Result};

/// One year in seconds, inverted.
pub const FYR: f64 = 1.0 / (365.25 * 86400.0);

/// Red-noise and common-process parameters of one pulsar:
/// `[rn_gamma, rn_log10_A, gwb_gamma, gwb_log10_A]`.
pub type NoiseKey = [f64; 4];

/// Power-law spectrum `A^2 / (12 pi^2) fyr^(gamma - 3) f^-gamma`, integrated over a bin `df`.
pub fn powerlaw(f: f64, log10_a: f64, gamma: f64, df: f64) -> f64 {
    let a = 10f64.powf(log10_a);
    a * a / (12.0 * PI * PI) * FYR.powf(gamma - 3.0) * f.powf(-gamma) * df
}

/// Fourier design matrix with columns `sin(2 pi f_i t), cos(2 pi f_i t)` for `f_i = i / t_span`.
pub fn fourier_design(t: &[f64], n_freqs: usize, t_span: f64) -> (DMatrix<f64>, Vec<f64>) {
    let freqs: Vec<f64> = (1..=n_freqs).map(|i| i as f64 / t_span).collect();
    let f = DMatrix::from_fn(t.len(), 2 * n_freqs, |row, col| {
        let arg = TAU * freqs[col / 2] * t[row];
        if col % 2 == 0 {
            arg.sin()
        } else {
            arg.cos()
        }
    });
    (f, freqs)
}

/// Products of the signal basis (4 columns) with the data under the white-noise metric.
#[derive(Debug, Clone, PartialEq)]
pub struct BasisProducts {
    /// `r^T N^-1 b`
    pub rnb: Vector4<f64>,
    /// `b^T N^-1 b`
    pub bnb: Matrix4<f64>,
    /// `F^T N^-1 b`, `2k x 4`
    pub fnb: DMatrix<f64>,
}

/// Inner products under the full covariance, for one set of noise parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct NoiseTerms {
    /// `r^T C^-1 r`
    pub rr: f64,
    /// `b^T C^-1 r`
    pub rb: Vector4<f64>,
    /// `b^T C^-1 b`
    pub bb: Matrix4<f64>,
    /// `log det C + n log 2 pi`
    pub norm: f64,
}

impl NoiseTerms {
    /// Terms of a covariance that could not be factorised; any likelihood built from them is NaN.
    pub fn invalid() -> Self {
        Self {
            rr: f64::NAN,
            rb: Vector4::repeat(f64::NAN),
            bb: Matrix4::repeat(f64::NAN),
            norm: f64::NAN,
        }
    }

    /// Log-likelihood of the residuals minus `sum_j c_j b_j`.
    pub fn log_likelihood(&self, c: &Vector4<f64>) -> f64 {
        let chi2 = self.rr - 2.0 * c.dot(&self.rb) + c.dot(&(self.bb * c));
        -0.5 * (chi2 + self.norm)
    }
}

/// Data-dependent quantities of one pulsar that never change during a run.
#[derive(Debug, Clone)]
pub struct PulsarNoiseModel {
    /// TOAs relative to the reference epoch of the array.
    pub t: Vec<f64>,
    pub residuals: DVector<f64>,
    /// White-noise variance per TOA.
    pub white: DVector<f64>,
    pub fourier: DMatrix<f64>,
    pub freqs: Vec<f64>,
    rn_comps: usize,
    gwb_comps: usize,
    df: f64,
    r_over_n: DVector<f64>,
    rnr: f64,
    fnr: DVector<f64>,
    fnf: DMatrix<f64>,
    logdet_n: f64,
}

impl PulsarNoiseModel {
    pub fn new(
        psr: &Pulsar,
        white: Vec<f64>,
        t_ref: f64,
        t_span: f64,
        rn_comps: usize,
        gwb_comps: usize,
    ) -> Result<Self> {
        if white.len() != psr.n_toas() || white.iter().any(|v| !(*v > 0.0 && v.is_finite())) {
            return Err(Error::Data(format!(
                "white-noise variance of {} is invalid",
                psr.name
            )));
        }
        let t: Vec<f64> = psr.toas.iter().map(|toa| toa - t_ref).collect();
        let (fourier, freqs) = fourier_design(&t, rn_comps.max(gwb_comps), t_span);
        let white = DVector::from_vec(white);
        let residuals = DVector::from_column_slice(&psr.residuals);
        let r_over_n = residuals.component_div(&white);

        let mut n_inv_f = fourier.clone();
        for (mut row, w) in n_inv_f.row_iter_mut().zip(white.iter()) {
            row /= *w;
        }

        Ok(Self {
            rnr: residuals.dot(&r_over_n),
            fnr: fourier.tr_mul(&r_over_n),
            fnf: fourier.tr_mul(&n_inv_f),
            logdet_n: white.iter().map(|w| w.ln()).sum(),
            t,
            residuals,
            white,
            fourier,
            freqs,
            rn_comps,
            gwb_comps,
            df: 1.0 / t_span,
            r_over_n,
        })
    }

    pub fn n_toas(&self) -> usize {
        self.t.len()
    }

    /// Prior variances of the Fourier coefficients (sin and cos share a frequency).
    pub fn phi(&self, key: &NoiseKey) -> DVector<f64> {
        let [rn_gamma, rn_log10_a, gwb_gamma, gwb_log10_a] = *key;
        DVector::from_fn(2 * self.freqs.len(), |col, _| {
            let i = col / 2;
            let f = self.freqs[i];
            let mut phi = 0.0;
            if i < self.rn_comps {
                phi += powerlaw(f, rn_log10_a, rn_gamma, self.df);
            }
            if i < self.gwb_comps {
                phi += powerlaw(f, gwb_log10_a, gwb_gamma, self.df);
            }
            phi
        })
    }

    /// Products of a signal basis (`n x 4`) with the data and the Fourier design.
    pub fn products(&self, basis: &DMatrix<f64>) -> BasisProducts {
        let mut n_inv_b = basis.clone();
        for (mut row, w) in n_inv_b.row_iter_mut().zip(self.white.iter()) {
            row /= *w;
        }
        let rnb = basis.tr_mul(&self.r_over_n);
        let bnb = basis.tr_mul(&n_inv_b);
        BasisProducts {
            rnb: Vector4::from_column_slice(rnb.as_slice()),
            bnb: Matrix4::from_column_slice(bnb.as_slice()),
            fnb: self.fourier.tr_mul(&n_inv_b),
        }
    }

    /// Woodbury-reduced inner products for the noise parameters `key`.
    ///
    /// `Sigma` is factorised after a symmetric Jacobi scaling, which keeps the Cholesky stable
    /// when `1 / phi` spans many orders of magnitude (switched-off processes).
    pub fn noise_terms(&self, key: &NoiseKey, products: &BasisProducts) -> NoiseTerms {
        let phi = self.phi(key);
        if phi.iter().any(|p| !(*p > 0.0 && p.is_finite())) {
            return NoiseTerms::invalid();
        }
        let mut sigma = self.fnf.clone();
        for (i, p) in phi.iter().enumerate() {
            sigma[(i, i)] += 1.0 / p;
        }
        let d = sigma.diagonal().map(|s| 1.0 / s.sqrt());
        let scaled = sigma.component_mul(&(&d * d.transpose()));
        let Some(chol) = scaled.cholesky() else {
            return NoiseTerms::invalid();
        };

        // Sigma^-1 v = D S^-1 D v
        let y = chol.solve(&self.fnr.component_mul(&d)).component_mul(&d);
        let mut fnb_scaled = products.fnb.clone();
        for mut col in fnb_scaled.column_iter_mut() {
            col.component_mul_assign(&d);
        }
        let mut z = chol.solve(&fnb_scaled);
        for mut col in z.column_iter_mut() {
            col.component_mul_assign(&d);
        }

        let rb = products.rnb - Vector4::from_column_slice(products.fnb.tr_mul(&y).as_slice());
        let bb = products.bnb - Matrix4::from_column_slice(products.fnb.tr_mul(&z).as_slice());

        let logdet_scaled: f64 = 2.0 * chol.l_dirty().diagonal().iter().map(|l| l.ln()).sum::<f64>();
        let logdet_sigma = logdet_scaled - 2.0 * d.iter().map(|x| x.ln()).sum::<f64>();
        let logdet_phi: f64 = phi.iter().map(|p| p.ln()).sum();
        let n = self.n_toas() as f64;

        NoiseTerms {
            rr: self.rnr - self.fnr.dot(&y),
            rb,
            bb,
            norm: self.logdet_n + logdet_phi + logdet_sigma + n * TAU.ln(),
        }
    }

    /// Dense covariance `N + F phi F^T`, used by the reference likelihood.
    pub fn covariance(&self, key: &NoiseKey) -> DMatrix<f64> {
        let phi = self.phi(key);
        let mut f_phi = self.fourier.clone();
        for (mut col, p) in f_phi.column_iter_mut().zip(phi.iter()) {
            col *= *p;
        }
        let mut c = &f_phi * self.fourier.transpose();
        for (i, w) in self.white.iter().enumerate() {
            c[(i, i)] += *w;
        }
        c
    }
}
