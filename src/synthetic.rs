/*!
# Synthetic Pulsar Timing Arrays

Small, self-contained PTA data sets for tests, examples and smoke runs: evenly sampled TOAs over
ten years with white residuals, random sky positions and a matching noise dictionary. A CW signal
can be injected on top of the noise.

```rust
use pta_cw_sampler::synthetic::{CwInjection, SyntheticPta};

let pta = SyntheticPta::builder()
    .n_pulsars(4)
    .n_toas(80)
    .inject(CwInjection::default())
    .build(42)?;
let config = pta.config();
let space = pta.space(&config)?;
assert_eq!(space.names().len(), 8 + 4 * 4 + 2);
# Ok::<(), pta_cw_sampler::error::Error>(())
```
*/

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use crate::config::SamplerConfig;
use crate::data::{time_span, NoiseDictionary, Pulsar};
use crate::error::Result;
use crate::likelihood::cw::CwLikelihood;
use crate::params::{
    self, p_dist_name, p_phase_name, rn_gamma_name, rn_log10_a_name, ParameterSpace, GWB_GAMMA,
    GWB_LOG10_A,
};

const DAY: f64 = 86_400.0;
const YEAR: f64 = 365.25 * DAY;
const T_START: f64 = 53_000.0 * DAY;
const TOA_ERROR: f64 = 1e-7;
const LOG10_EQUAD: f64 = -8.0;

/// CW source parameters of an injection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CwInjection {
    pub cos_gwtheta: f64,
    pub gwphi: f64,
    pub log10_fgw: f64,
    pub log10_mc: f64,
    pub cos_inc: f64,
    pub log10_h: f64,
    pub phase0: f64,
    pub psi: f64,
}

impl Default for CwInjection {
    fn default() -> Self {
        Self {
            cos_gwtheta: 0.3,
            gwphi: 1.2,
            log10_fgw: -8.0,
            log10_mc: 9.0,
            cos_inc: 0.5,
            log10_h: -14.0,
            phase0: 0.8,
            psi: 1.1,
        }
    }
}

impl CwInjection {
    fn entries(&self) -> [(&'static str, f64); 8] {
        [
            (params::COS_GWTHETA, self.cos_gwtheta),
            (params::GWPHI, self.gwphi),
            (params::LOG10_FGW, self.log10_fgw),
            (params::LOG10_MC, self.log10_mc),
            (params::COS_INC, self.cos_inc),
            (params::LOG10_H, self.log10_h),
            (params::PHASE0, self.phase0),
            (params::PSI, self.psi),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct SyntheticPtaBuilder {
    n_pulsars: usize,
    n_toas: usize,
    span_years: f64,
    injection: Option<CwInjection>,
}

impl Default for SyntheticPtaBuilder {
    fn default() -> Self {
        Self {
            n_pulsars: 3,
            n_toas: 100,
            span_years: 10.0,
            injection: None,
        }
    }
}

impl SyntheticPtaBuilder {
    pub fn n_pulsars(mut self, n: usize) -> Self {
        self.n_pulsars = n;
        self
    }

    pub fn n_toas(mut self, n: usize) -> Self {
        self.n_toas = n;
        self
    }

    pub fn span_years(mut self, years: f64) -> Self {
        self.span_years = years;
        self
    }

    pub fn inject(mut self, injection: CwInjection) -> Self {
        self.injection = Some(injection);
        self
    }

    /// Draws the data set. Identical seeds give identical data.
    pub fn build(self, seed: u64) -> Result<SyntheticPta> {
        let mut rng = SmallRng::seed_from_u64(seed);
        let span = self.span_years * YEAR;
        let cadence = span / (self.n_toas.max(2) - 1) as f64;

        let mut noise = NoiseDictionary::default();
        let mut pulsars = Vec::with_capacity(self.n_pulsars);
        for p in 0..self.n_pulsars {
            let name = format!("J{:04}+{:04}", 100 * p, 37 * p);
            let pos = random_direction(&mut rng);
            let toas: Vec<f64> = (0..self.n_toas)
                .map(|i| {
                    let jitter = if i == 0 || i + 1 == self.n_toas {
                        0.0
                    } else {
                        rng.random_range(-0.5..0.5) * DAY
                    };
                    T_START + i as f64 * cadence + jitter
                })
                .collect();
            let sigma = (TOA_ERROR.powi(2) + 10f64.powf(2.0 * LOG10_EQUAD)).sqrt();
            let residuals = (0..self.n_toas)
                .map(|_| sigma * rng.sample::<f64, _>(StandardNormal))
                .collect();

            noise.insert(format!("{name}_efac"), 1.0);
            noise.insert(format!("{name}_log10_t2equad"), LOG10_EQUAD);
            noise.insert(rn_gamma_name(&name), 13.0 / 3.0);
            noise.insert(rn_log10_a_name(&name), -15.0);
            pulsars.push(Pulsar {
                name,
                toas,
                residuals,
                toaerrs: vec![TOA_ERROR; self.n_toas],
                pos,
                pdist: [1.0 + 0.25 * p as f64, 0.2],
            });
        }
        noise.insert(GWB_GAMMA, 13.0 / 3.0);
        noise.insert(GWB_LOG10_A, -15.5);

        let mut pta = SyntheticPta {
            pulsars,
            noise,
            injection: self.injection,
        };
        if let Some(injection) = self.injection {
            pta.add_signal(&injection)?;
        }
        Ok(pta)
    }
}

fn random_direction<R: Rng + ?Sized>(rng: &mut R) -> [f64; 3] {
    let cos_theta: f64 = rng.random_range(-1.0..1.0);
    let phi: f64 = rng.random_range(0.0..std::f64::consts::TAU);
    let sin_theta = (1.0 - cos_theta * cos_theta).sqrt();
    [sin_theta * phi.cos(), sin_theta * phi.sin(), cos_theta]
}

/// A generated data set with its noise dictionary.
#[derive(Debug, Clone)]
pub struct SyntheticPta {
    pub pulsars: Vec<Pulsar>,
    pub noise: NoiseDictionary,
    pub injection: Option<CwInjection>,
}

impl SyntheticPta {
    pub fn builder() -> SyntheticPtaBuilder {
        SyntheticPtaBuilder::default()
    }

    /// A short run suited to the size of the synthetic data.
    pub fn config(&self) -> SamplerConfig {
        SamplerConfig {
            n_chain: 3,
            t_max: 4.0,
            n_iterations: 200,
            n_int_block: 100,
            save_every_n: 100,
            n_status_update: 1,
            thin: 10,
            seed: Some(1),
            rn_comps: 5,
            gwb_comps: 3,
            de_history_len: 100,
            ..SamplerConfig::default()
        }
    }

    pub fn space(&self, config: &SamplerConfig) -> Result<ParameterSpace> {
        let (_, span) = time_span(&self.pulsars);
        ParameterSpace::for_pta(&self.pulsars, &self.noise, config, span)
    }

    pub fn likelihood(&self, space: &ParameterSpace, config: &SamplerConfig) -> Result<CwLikelihood> {
        CwLikelihood::new(&self.pulsars, &self.noise, space, config)
    }

    /// Parameter vector of the injection: CW values as injected, pulsar terms at their means and
    /// noise switched off.
    pub fn injected_params(&self, space: &ParameterSpace) -> Result<Option<Vec<f64>>> {
        let Some(injection) = &self.injection else {
            return Ok(None);
        };
        let mut x = vec![0.0; space.len()];
        for (name, value) in injection.entries() {
            x[space.require(name)?] = value;
        }
        for psr in &self.pulsars {
            x[space.require(&p_dist_name(&psr.name))?] = 0.0;
            x[space.require(&p_phase_name(&psr.name))?] = 0.0;
            x[space.require(&rn_gamma_name(&psr.name))?] = params::ZERO_NOISE[0];
            x[space.require(&rn_log10_a_name(&psr.name))?] = params::ZERO_NOISE[1];
        }
        x[space.require(GWB_GAMMA)?] = params::ZERO_NOISE[0];
        x[space.require(GWB_LOG10_A)?] = params::ZERO_NOISE[1];
        Ok(Some(x))
    }

    fn add_signal(&mut self, injection: &CwInjection) -> Result<()> {
        let config = SamplerConfig {
            freq_min: Some(10f64.powf(injection.log10_fgw) / 2.0),
            ..self.config()
        };
        let space = self.space(&config)?;
        let likelihood = self.likelihood(&space, &config)?;
        let Some(x) = self.injected_params(&space)? else {
            return Ok(());
        };
        for (psr, signal) in self.pulsars.iter_mut().zip(likelihood.residual_model(&x)) {
            for (r, s) in psr.residuals.iter_mut().zip(signal.iter()) {
                *r += s;
            }
        }
        Ok(())
    }

    /// Writes `pulsars.json` and `noise.json` into `dir`.
    pub fn save<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        serde_json::to_writer(
            BufWriter::new(File::create(dir.join("pulsars.json"))?),
            &self.pulsars,
        )?;
        serde_json::to_writer_pretty(
            BufWriter::new(File::create(dir.join("noise.json"))?),
            &self.noise,
        )?;
        Ok(())
    }
}
