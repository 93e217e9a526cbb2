//! State estimation capability.

mod particle_filter;

use std::fmt;

use crate::error::ProgResult;
use crate::state::{NamedVector, StateDistribution};

pub use particle_filter::{ParticleFilter, ParticleFilterParams};

/// Maintains a belief over a model's state from a stream of observations.
///
/// Estimators are constructed from `(model, initial state, t0, parameters)`
/// through the component catalog and are owned by exactly one session, which
/// serializes every call behind its estimate lock.
pub trait StateEstimator: Send + fmt::Debug {
    /// Incorporates the observation `(time, inputs, outputs)` into the belief.
    ///
    /// `time` is never earlier than [`StateEstimator::time`].
    fn estimate(&mut self, time: f64, inputs: &NamedVector, outputs: &NamedVector) -> ProgResult<()>;

    /// Timestamp of the observation that produced the current belief.
    fn time(&self) -> f64;

    /// An owned copy of the current belief.
    fn state(&self) -> StateDistribution;
}
