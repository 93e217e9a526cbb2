//! Bootstrap particle filter.
//!
//! Each observation propagates the particles through the model with process
//! noise, weights them by the Gaussian likelihood of the observed outputs and
//! resamples systematically, so the reported belief is always an unweighted
//! sample cloud.

use std::collections::BTreeSet;
use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::config::{parse_params, ComponentConfig};
use crate::error::{ConfigurationError, ExecutionError, ProgResult, ValidationError};
use crate::model::{perturb, NoiseSpec, PrognosticsModel};
use crate::state::{sample_mean, NamedVector, StateDistribution};

const NAME: &str = "ParticleFilter";

/// Floor for measurement standard deviation so exact models keep finite likelihoods.
const MIN_MEASUREMENT_STD: f64 = 1e-3;

/// Parameters for [`ParticleFilter`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ParticleFilterParams {
    /// Number of particles.
    pub num_particles: usize,
    /// Standard deviation used to spread a point initial state.
    pub x0_uncertainty: NoiseSpec,
    /// Overrides the model's measurement noise when set.
    pub measurement_noise: Option<NoiseSpec>,
    /// Seed for reproducible runs.
    pub seed: Option<u64>,
}

impl Default for ParticleFilterParams {
    fn default() -> Self {
        Self {
            num_particles: 100,
            x0_uncertainty: NoiseSpec::Uniform(0.5),
            measurement_noise: None,
            seed: None,
        }
    }
}

/// Particle filter state estimator.
#[derive(Debug)]
pub struct ParticleFilter {
    model: Arc<dyn PrognosticsModel>,
    particles: Vec<NamedVector>,
    weights: Vec<f64>,
    process_noise: NamedVector,
    measurement_std: NamedVector,
    t: f64,
    rng: SmallRng,
}

impl ParticleFilter {
    /// Builds a filter around `x0` at time `t0`.
    pub fn new(
        model: Arc<dyn PrognosticsModel>,
        x0: &StateDistribution,
        t0: f64,
        params: ParticleFilterParams,
    ) -> ProgResult<Self> {
        if params.num_particles == 0 {
            return Err(ConfigurationError::invalid(NAME, "num_particles must be positive").into());
        }
        if !t0.is_finite() {
            return Err(ValidationError::NonFiniteValue {
                field: "t0".to_string(),
                value: t0,
            }
            .into());
        }
        x0.validate()?;

        let states = model.states().to_vec();
        let provided = x0.key_set();
        let expected: BTreeSet<String> = states.iter().cloned().collect();
        if provided != expected {
            return Err(ValidationError::StateKeyMismatch {
                provided: provided.into_iter().collect(),
                expected: states,
            }
            .into());
        }

        let uncertainty = params.x0_uncertainty.resolve(NAME, "x0_uncertainty", &states)?;
        let measurement_std = match &params.measurement_noise {
            Some(spec) => spec.resolve(NAME, "measurement_noise", model.outputs())?,
            None => model.measurement_noise(),
        };

        let mut rng = match params.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };

        let n = params.num_particles;
        let mut particles = x0.sample(n, &mut rng);
        if x0.is_point() {
            for p in &mut particles {
                perturb(p, &uncertainty, 1.0, &mut rng);
            }
        }
        recenter(&mut particles, &x0.mean());

        Ok(Self {
            process_noise: model.process_noise(),
            model,
            particles,
            weights: vec![1.0 / n as f64; n],
            measurement_std,
            t: t0,
            rng,
        })
    }

    /// Builds a filter from JSON parameters.
    pub fn from_config(
        model: Arc<dyn PrognosticsModel>,
        x0: &StateDistribution,
        t0: f64,
        cfg: &ComponentConfig,
    ) -> ProgResult<Self> {
        Self::new(model, x0, t0, parse_params(NAME, cfg)?)
    }

    /// Particles moved forward by `dt`. The filter itself is left as is.
    fn propagate(&mut self, inputs: &NamedVector, dt: f64) -> Vec<NamedVector> {
        let sqrt_dt = dt.sqrt();
        let model = &self.model;
        let noise = &self.process_noise;
        let rng = &mut self.rng;
        self.particles
            .iter()
            .map(|p| {
                let mut next = model.next_state(p, inputs, dt);
                perturb(&mut next, noise, sqrt_dt, &mut *rng);
                next
            })
            .collect()
    }

    /// Posterior weights of `particles` given `outputs`.
    fn weight(&self, particles: &[NamedVector], outputs: &NamedVector) -> Vec<f64> {
        let log_liks: Vec<f64> = particles
            .iter()
            .map(|p| {
                let predicted = self.model.output(p);
                outputs
                    .iter()
                    .map(|(k, z)| {
                        let std = self
                            .measurement_std
                            .get(k)
                            .copied()
                            .unwrap_or(0.0)
                            .max(MIN_MEASUREMENT_STD);
                        let r = z - predicted.get(k).copied().unwrap_or(f64::NAN);
                        -0.5 * (r * r) / (std * std)
                    })
                    .sum::<f64>()
            })
            .collect();

        let mut weights = self.weights.clone();
        // Normalize in log space for numerical stability.
        let max = log_liks
            .iter()
            .copied()
            .filter(|l| l.is_finite())
            .fold(f64::NEG_INFINITY, f64::max);
        if max.is_finite() {
            for (w, l) in weights.iter_mut().zip(&log_liks) {
                *w *= if l.is_finite() { (l - max).exp() } else { 0.0 };
            }
        }

        let sum: f64 = weights.iter().sum();
        let n = particles.len() as f64;
        if sum > 0.0 && sum.is_finite() {
            for w in &mut weights {
                *w /= sum;
            }
        } else {
            // Reset to uniform if weights collapsed.
            weights.fill(1.0 / n);
        }
        weights
    }
}

/// Systematic resampling (low variance).
fn systematic_resample<R: Rng + ?Sized>(particles: &[NamedVector], weights: &[f64], rng: &mut R) -> Vec<NamedVector> {
    let n = particles.len();
    if n == 0 {
        return Vec::new();
    }

    let mut cumsum = vec![0.0; n + 1];
    for i in 0..n {
        cumsum[i + 1] = cumsum[i] + weights[i];
    }

    let u0: f64 = rng.gen::<f64>() / n as f64;
    let mut resampled = Vec::with_capacity(n);
    let mut j = 0;
    for i in 0..n {
        let u = u0 + i as f64 / n as f64;
        while j < n && cumsum[j + 1] < u {
            j += 1;
        }
        resampled.push(particles[j.min(n - 1)].clone());
    }
    resampled
}

impl super::StateEstimator for ParticleFilter {
    fn estimate(&mut self, time: f64, inputs: &NamedVector, outputs: &NamedVector) -> ProgResult<()> {
        if time < self.t {
            return Err(ValidationError::OutOfOrderObservation {
                time,
                current: self.t,
            }
            .into());
        }

        let dt = time - self.t;
        let moved = if dt > 0.0 {
            self.propagate(inputs, dt)
        } else {
            self.particles.clone()
        };
        let weights = self.weight(&moved, outputs);
        let resampled = systematic_resample(&moved, &weights, &mut self.rng);

        // Nothing is committed unless the whole update is finite.
        if resampled.iter().any(|p| p.values().any(|v| !v.is_finite())) {
            return Err(ExecutionError::Numerical {
                context: NAME.to_string(),
                reason: format!("non-finite particle after update at t={time}"),
            }
            .into());
        }
        let n = resampled.len();
        self.particles = resampled;
        self.weights = vec![1.0 / n as f64; n];
        self.t = time;
        Ok(())
    }

    fn time(&self) -> f64 {
        self.t
    }

    fn state(&self) -> StateDistribution {
        StateDistribution::Samples {
            samples: self.particles.clone(),
        }
    }
}

/// Shifts every particle so the cloud's mean equals `target`.
fn recenter(particles: &mut [NamedVector], target: &NamedVector) {
    let current = sample_mean(particles);
    for p in particles.iter_mut() {
        for (k, v) in p.iter_mut() {
            if let (Some(t), Some(c)) = (target.get(k), current.get(k)) {
                *v += t - c;
            }
        }
    }
}
