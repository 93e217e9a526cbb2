//! Prediction capability and prediction result types.

mod monte_carlo;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ProgResult;
use crate::load::LoadForecast;
use crate::state::{empirical_metrics, DistributionMetrics, NamedVector, StateDistribution};

pub use monte_carlo::{MonteCarlo, MonteCarloParams};

/// Simulates a model forward from a belief to produce future trajectories and
/// a time-of-event distribution.
///
/// Predictors are constructed from `(model, parameters)` through the component
/// catalog. A session serializes calls behind its execution lock; a single call
/// may run for a long time and always happens on a worker thread.
pub trait Predictor: Send + fmt::Debug {
    /// Predicts from `state` at basis time `t0`, drawing future inputs from `load`.
    ///
    /// The integration step is a predictor parameter.
    fn predict(&self, state: &StateDistribution, load: &mut dyn LoadForecast, t0: f64) -> ProgResult<Prediction>;
}

/// A sequence of beliefs at increasing times.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    /// Save times.
    pub times: Vec<f64>,
    /// Belief at each save time.
    pub snapshots: Vec<StateDistribution>,
}

impl Trajectory {
    /// Number of saved points.
    #[must_use]
    pub fn len(&self) -> usize {
        self.times.len()
    }

    /// True when nothing was saved.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// Belief at save index `i`.
    #[must_use]
    pub fn snapshot(&self, i: usize) -> Option<&StateDistribution> {
        self.snapshots.get(i)
    }

    /// `(time, mean)` for every saved point.
    #[must_use]
    pub fn means(&self) -> Vec<(f64, NamedVector)> {
        self.times
            .iter()
            .copied()
            .zip(self.snapshots.iter().map(StateDistribution::mean))
            .collect()
    }
}

/// Time-of-event distribution: one entry per simulated trajectory, `None`
/// where the event was not reached within the horizon.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventTimes {
    /// Per-trajectory event times.
    pub samples: Vec<BTreeMap<String, Option<f64>>>,
}

impl EventTimes {
    /// Event names.
    #[must_use]
    pub fn events(&self) -> Vec<String> {
        self.samples
            .first()
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn reached(&self, event: &str) -> Vec<f64> {
        self.samples
            .iter()
            .filter_map(|s| s.get(event).copied().flatten())
            .collect()
    }

    /// Mean event time over trajectories that reached each event.
    #[must_use]
    pub fn mean(&self) -> BTreeMap<String, Option<f64>> {
        self.events()
            .into_iter()
            .map(|e| {
                let hits = self.reached(&e);
                let mean = (!hits.is_empty()).then(|| hits.iter().sum::<f64>() / hits.len() as f64);
                (e, mean)
            })
            .collect()
    }

    /// Fraction of trajectories that reached `event`.
    #[must_use]
    pub fn probability(&self, event: &str) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.reached(event).len() as f64 / self.samples.len() as f64
    }

    /// Summary statistics over trajectories that reached each event.
    #[must_use]
    pub fn metrics(&self) -> BTreeMap<String, DistributionMetrics> {
        self.events()
            .into_iter()
            .map(|e| {
                let hits = self.reached(&e);
                (e, empirical_metrics(hits))
            })
            .collect()
    }
}

/// Output of one predictor run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// Predicted states.
    pub states: Trajectory,
    /// Predicted outputs.
    pub outputs: Trajectory,
    /// Predicted event states.
    pub event_states: Trajectory,
    /// Predicted performance metrics. Empty snapshots for models without metrics.
    pub performance_metrics: Trajectory,
    /// Predicted time of each event.
    pub time_of_event: EventTimes,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toe(pairs: &[(&str, Option<f64>)]) -> BTreeMap<String, Option<f64>> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), *v)).collect()
    }

    #[test]
    fn event_times_ignore_unreached_trajectories() {
        let times = EventTimes {
            samples: vec![
                toe(&[("impact", Some(8.0))]),
                toe(&[("impact", Some(10.0))]),
                toe(&[("impact", None)]),
                toe(&[("impact", None)]),
            ],
        };
        assert_eq!(times.mean()["impact"], Some(9.0));
        assert!((times.probability("impact") - 0.5).abs() < 1e-12);
        assert!((times.metrics()["impact"].median - 9.0).abs() < 1e-12);
    }

    #[test]
    fn event_times_never_reached() {
        let times = EventTimes {
            samples: vec![toe(&[("impact", None)])],
        };
        assert_eq!(times.mean()["impact"], None);
        assert_eq!(times.probability("impact"), 0.0);
        assert_eq!(EventTimes::default().probability("impact"), 0.0);
    }

    #[test]
    fn trajectory_means() {
        let x: NamedVector = [("x".to_string(), 1.0)].into_iter().collect();
        let traj = Trajectory {
            times: vec![0.0],
            snapshots: vec![StateDistribution::scalar(x)],
        };
        assert_eq!(traj.len(), 1);
        assert_eq!(traj.means()[0].1["x"], 1.0);
        assert!(traj.snapshot(1).is_none());
    }
}
