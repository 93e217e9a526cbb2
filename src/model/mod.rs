//! Physical-system model capability.
//!
//! Models are supplied by the embedding application (or the built-in
//! reference set) and treated as opaque simulators: the session core only
//! relies on the named variable sets and the step/observe functions below.

mod thrown_object;

use std::collections::BTreeMap;
use std::fmt;

use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigurationError, ProgResult};
use crate::state::NamedVector;

pub use thrown_object::{ThrownObject, ThrownObjectParams};

/// A prognostics model: a discrete-time simulator of a physical system with
/// named inputs, states, outputs and events.
///
/// Implementations must be immutable after construction; a single instance is
/// shared between a session's estimator and predictor.
pub trait PrognosticsModel: Send + Sync + fmt::Debug {
    /// Input (load) variable names.
    fn inputs(&self) -> &[String];

    /// State variable names.
    fn states(&self) -> &[String];

    /// Output (measurement) variable names.
    fn outputs(&self) -> &[String];

    /// Event (failure mode) names.
    fn events(&self) -> &[String];

    /// Produces a starting state, optionally from a first observation.
    ///
    /// Returns an error when the model needs data it was not given.
    fn initialize(&self, inputs: Option<&NamedVector>, outputs: Option<&NamedVector>) -> ProgResult<NamedVector>;

    /// Advances the state by `dt` under input `u`, without process noise.
    fn next_state(&self, x: &NamedVector, u: &NamedVector, dt: f64) -> NamedVector;

    /// Expected measurement for state `x`.
    fn output(&self, x: &NamedVector) -> NamedVector;

    /// Progress toward each event, 1.0 healthy and 0.0 at the event.
    fn event_state(&self, x: &NamedVector) -> NamedVector;

    /// Whether each event has occurred at state `x`.
    fn threshold_met(&self, x: &NamedVector) -> BTreeMap<String, bool> {
        self.event_state(x)
            .into_iter()
            .map(|(k, es)| (k, es <= 0.0))
            .collect()
    }

    /// Derived performance metrics for state `x`. Most models have none.
    fn performance_metrics(&self, _x: &NamedVector) -> NamedVector {
        NamedVector::new()
    }

    /// Per-state process noise standard deviation. Missing keys mean zero.
    fn process_noise(&self) -> NamedVector {
        NamedVector::new()
    }

    /// Per-output measurement noise standard deviation. Missing keys mean zero.
    fn measurement_noise(&self) -> NamedVector {
        NamedVector::new()
    }

    /// Effective parameters, for session descriptions.
    fn parameters(&self) -> serde_json::Value;
}

/// Noise configuration: either one standard deviation for every variable or
/// one per variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NoiseSpec {
    /// Same standard deviation for every variable.
    Uniform(f64),
    /// Per-variable standard deviation.
    PerKey(NamedVector),
}

impl Default for NoiseSpec {
    fn default() -> Self {
        Self::Uniform(0.0)
    }
}

impl NoiseSpec {
    /// Expands to a per-variable map, rejecting unknown or negative entries.
    pub fn resolve(&self, component: &str, field: &str, keys: &[String]) -> ProgResult<NamedVector> {
        let out: NamedVector = match self {
            Self::Uniform(std) => keys.iter().map(|k| (k.clone(), *std)).collect(),
            Self::PerKey(map) => {
                if let Some(unknown) = map.keys().find(|k| !keys.contains(k)) {
                    return Err(ConfigurationError::invalid(
                        component,
                        format!("{field} has unknown key '{unknown}'"),
                    )
                    .into());
                }
                keys.iter()
                    .map(|k| (k.clone(), map.get(k).copied().unwrap_or(0.0)))
                    .collect()
            }
        };
        if let Some((k, v)) = out.iter().find(|(_, v)| !v.is_finite() || **v < 0.0) {
            return Err(ConfigurationError::invalid(
                component,
                format!("{field} for '{k}' must be a non-negative number, got {v}"),
            )
            .into());
        }
        Ok(out)
    }
}

/// Adds zero-mean Gaussian noise with standard deviation `std[k] * scale` to each entry.
pub(crate) fn perturb<R: Rng + ?Sized>(x: &mut NamedVector, std: &NamedVector, scale: f64, rng: &mut R) {
    for (k, v) in x.iter_mut() {
        let s = std.get(k).copied().unwrap_or(0.0) * scale;
        if s > 0.0 {
            let z: f64 = rng.sample(StandardNormal);
            *v += s * z;
        }
    }
}
