/*!
# Pulsar Timing Inputs

Loading and validation of the inputs consumed by the likelihood layer:

- [`Pulsar`]: timing residuals, TOA errors, sky position and distance estimate of one pulsar,
  read as a JSON array by [`load_pulsars`].
- [`NoiseDictionary`]: flat `name -> value` map of white-noise (and optionally fixed red-noise or
  GWB) parameters.
- [`DistancePriors`]: optional per-pulsar distance priors that replace the distances stored with
  the pulsars.
*/

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::error::{Error, Result};

/// One pulsar's timing data. Times are in seconds, distances in kpc.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pulsar {
    pub name: String,
    pub toas: Vec<f64>,
    pub residuals: Vec<f64>,
    pub toaerrs: Vec<f64>,
    /// Unit vector pointing at the pulsar.
    pub pos: [f64; 3],
    /// Distance mean and standard deviation in kpc.
    pub pdist: [f64; 2],
}

impl Pulsar {
    pub fn n_toas(&self) -> usize {
        self.toas.len()
    }

    /// Checks lengths, finiteness, positivity of the errors and the norm of the position.
    pub fn validate(&self) -> Result<()> {
        let n = self.toas.len();
        if n < 2 {
            return Err(Error::Data(format!(
                "pulsar {} has {n} TOAs, at least 2 are needed",
                self.name
            )));
        }
        if self.residuals.len() != n || self.toaerrs.len() != n {
            return Err(Error::Data(format!(
                "pulsar {}: toas, residuals and toaerrs differ in length ({}, {}, {})",
                self.name,
                n,
                self.residuals.len(),
                self.toaerrs.len()
            )));
        }
        let all_finite = self
            .toas
            .iter()
            .chain(&self.residuals)
            .chain(&self.toaerrs)
            .all(|x| x.is_finite());
        if !all_finite {
            return Err(Error::Data(format!(
                "pulsar {} contains non-finite timing data",
                self.name
            )));
        }
        if self.toaerrs.iter().any(|e| *e <= 0.0) {
            return Err(Error::Data(format!(
                "pulsar {} has non-positive TOA errors",
                self.name
            )));
        }
        let norm = self.pos.iter().map(|x| x * x).sum::<f64>().sqrt();
        if (norm - 1.0).abs() > 1e-6 {
            return Err(Error::Data(format!(
                "pulsar {} position is not a unit vector (norm {norm})",
                self.name
            )));
        }
        if !(self.pdist[0].is_finite() && self.pdist[1].is_finite() && self.pdist[1] > 0.0) {
            return Err(Error::Data(format!(
                "pulsar {} has an invalid distance estimate {:?}",
                self.name, self.pdist
            )));
        }
        Ok(())
    }
}

/// Reads a JSON array of pulsars and validates each of them.
pub fn load_pulsars<P: AsRef<Path>>(path: P) -> Result<Vec<Pulsar>> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| {
        Error::Config(format!("cannot open pulsar data {}: {e}", path.display()))
    })?;
    let pulsars: Vec<Pulsar> = serde_json::from_reader(BufReader::new(file))?;
    validate_pulsars(&pulsars)?;
    Ok(pulsars)
}

/// Validates a pulsar collection: each pulsar on its own, and names unique.
pub fn validate_pulsars(pulsars: &[Pulsar]) -> Result<()> {
    if pulsars.is_empty() {
        return Err(Error::Data("no pulsars in the data set".to_string()));
    }
    let mut names = HashSet::new();
    for psr in pulsars {
        psr.validate()?;
        if !names.insert(psr.name.as_str()) {
            return Err(Error::Data(format!("duplicate pulsar name {}", psr.name)));
        }
    }
    Ok(())
}

/// Earliest TOA and total time span over all pulsars, in seconds.
pub fn time_span(pulsars: &[Pulsar]) -> (f64, f64) {
    let (tmin, tmax) = pulsars
        .iter()
        .flat_map(|p| p.toas.iter().copied())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), t| {
            (lo.min(t), hi.max(t))
        });
    (tmin, tmax - tmin)
}

/// Flat map of noise parameters, e.g. `J0030+0451_efac -> 1.02`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NoiseDictionary(BTreeMap<String, f64>);

impl NoiseDictionary {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            Error::Config(format!("cannot open noise file {}: {e}", path.display()))
        })?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: f64) {
        self.0.insert(name.into(), value);
    }

    /// Looks up a required entry.
    pub fn get(&self, name: &str) -> Result<f64> {
        match self.0.get(name) {
            Some(v) if v.is_finite() => Ok(*v),
            Some(v) => Err(Error::Data(format!("noise entry {name} is not finite ({v})"))),
            None => Err(Error::Data(format!("noise dictionary has no entry {name}"))),
        }
    }

    /// Per-TOA white-noise variance `(efac * err)^2 + 10^(2 * log10_t2equad)`.
    pub fn white_variance(&self, psr: &Pulsar) -> Result<Vec<f64>> {
        let efac = self.get(&format!("{}_efac", psr.name))?;
        let equad = self.get(&format!("{}_log10_t2equad", psr.name))?;
        let equad_sq = 10f64.powf(2.0 * equad);
        Ok(psr
            .toaerrs
            .iter()
            .map(|err| (efac * err).powi(2) + equad_sq)
            .collect())
    }
}

/// Distance priors (mean, sigma in kpc) keyed by pulsar name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DistancePriors(BTreeMap<String, [f64; 2]>);

impl DistancePriors {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            Error::Config(format!(
                "cannot open pulsar distance file {}: {e}",
                path.display()
            ))
        })?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    /// Replaces the distance estimates stored with the pulsars.
    ///
    /// Pulsars must carry the placeholder estimate `[0, 1]` when external priors are used;
    /// anything else means two incompatible distance models were mixed.
    pub fn apply(&self, pulsars: &mut [Pulsar]) -> Result<()> {
        for psr in pulsars.iter_mut() {
            if psr.pdist != [0.0, 1.0] {
                return Err(Error::Data(format!(
                    "pulsar {} carries distance {:?}, expected the placeholder [0, 1] when a distance prior file is used",
                    psr.name, psr.pdist
                )));
            }
            let prior = self.0.get(&psr.name).ok_or_else(|| {
                Error::Data(format!("distance prior file has no entry for {}", psr.name))
            })?;
            if !(prior[0] > 0.0 && prior[1] > 0.0) {
                return Err(Error::Data(format!(
                    "invalid distance prior {:?} for {}",
                    prior, psr.name
                )));
            }
            psr.pdist = *prior;
        }
        Ok(())
    }
}
