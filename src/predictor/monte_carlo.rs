//! Monte Carlo predictor: forward simulation of sampled initial states.

use std::collections::BTreeMap;
use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::config::{parse_params, ComponentConfig};
use crate::error::{ConfigurationError, ProgResult};
use crate::load::LoadForecast;
use crate::model::{perturb, PrognosticsModel};
use crate::state::{NamedVector, StateDistribution};

use super::{EventTimes, Prediction, Predictor, Trajectory};

const NAME: &str = "MonteCarlo";

/// Upper bound on integration steps per sample.
const MAX_STEPS: f64 = 1e7;

/// Tolerance when comparing accumulated time against save points.
const TIME_EPSILON: f64 = 1e-9;

/// Parameters for [`MonteCarlo`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonteCarloParams {
    /// Number of trajectories simulated.
    pub n_samples: usize,
    /// Integration step in seconds.
    pub dt: f64,
    /// Interval between saved trajectory points.
    pub save_freq: f64,
    /// Maximum simulated time after the basis time.
    pub horizon: f64,
    /// Events to predict; all model events when unset.
    pub events: Option<Vec<String>>,
    /// Seed for reproducible runs.
    pub seed: Option<u64>,
}

impl Default for MonteCarloParams {
    fn default() -> Self {
        Self {
            n_samples: 100,
            dt: 0.1,
            save_freq: 1.0,
            horizon: 1000.0,
            events: None,
            seed: None,
        }
    }
}

/// Monte Carlo predictor.
#[derive(Debug)]
pub struct MonteCarlo {
    model: Arc<dyn PrognosticsModel>,
    params: MonteCarloParams,
    events: Vec<String>,
}

impl MonteCarlo {
    /// Builds the predictor, validating parameters against the model.
    pub fn new(model: Arc<dyn PrognosticsModel>, params: MonteCarloParams) -> ProgResult<Self> {
        if params.n_samples == 0 {
            return Err(ConfigurationError::invalid(NAME, "n_samples must be positive").into());
        }
        for (field, value) in [("dt", params.dt), ("save_freq", params.save_freq), ("horizon", params.horizon)] {
            if !(value > 0.0) || !value.is_finite() {
                return Err(ConfigurationError::invalid(NAME, format!("{field} must be a positive number")).into());
            }
        }
        if params.horizon / params.dt > MAX_STEPS {
            return Err(ConfigurationError::invalid(NAME, "horizon / dt exceeds the step limit").into());
        }

        let events = match &params.events {
            Some(requested) => {
                if let Some(unknown) = requested.iter().find(|e| !model.events().contains(e)) {
                    return Err(ConfigurationError::invalid(NAME, format!("unknown event '{unknown}'")).into());
                }
                requested.clone()
            }
            None => model.events().to_vec(),
        };

        Ok(Self { model, params, events })
    }

    /// Builds the predictor from JSON parameters.
    pub fn from_config(model: Arc<dyn PrognosticsModel>, cfg: &ComponentConfig) -> ProgResult<Self> {
        Self::new(model, parse_params(NAME, cfg)?)
    }

    /// Simulates one trajectory, returning its saved states and event times.
    fn simulate(
        &self,
        mut x: NamedVector,
        load: &mut dyn LoadForecast,
        t0: f64,
        rng: &mut SmallRng,
    ) -> (Vec<(f64, NamedVector)>, BTreeMap<String, Option<f64>>) {
        let p = &self.params;
        let process_noise = self.model.process_noise();
        let sqrt_dt = p.dt.sqrt();
        let max_steps = (p.horizon / p.dt).ceil() as u64;

        let mut toe: BTreeMap<String, Option<f64>> = self.events.iter().map(|e| (e.clone(), None)).collect();
        let mut saved = vec![(t0, x.clone())];
        let mut next_save = t0 + p.save_freq;

        let met = self.model.threshold_met(&x);
        for (event, at) in &mut toe {
            if met.get(event).copied().unwrap_or(false) {
                *at = Some(t0);
            }
        }

        for step in 1..=max_steps {
            if !toe.is_empty() && toe.values().all(Option::is_some) {
                break;
            }
            let t_prev = t0 + (step - 1) as f64 * p.dt;
            let t = t0 + step as f64 * p.dt;

            let u = load.forecast(t_prev);
            x = self.model.next_state(&x, &u, p.dt);
            perturb(&mut x, &process_noise, sqrt_dt, rng);

            let met = self.model.threshold_met(&x);
            for (event, at) in &mut toe {
                if at.is_none() && met.get(event).copied().unwrap_or(false) {
                    *at = Some(t);
                }
            }

            if t + TIME_EPSILON >= next_save {
                saved.push((t, x.clone()));
                while next_save <= t + TIME_EPSILON {
                    next_save += p.save_freq;
                }
            }
        }

        (saved, toe)
    }
}

impl Predictor for MonteCarlo {
    fn predict(&self, state: &StateDistribution, load: &mut dyn LoadForecast, t0: f64) -> ProgResult<Prediction> {
        state.validate()?;
        let mut rng = match self.params.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };

        let runs: Vec<_> = state
            .sample(self.params.n_samples, &mut rng)
            .into_iter()
            .map(|x0| self.simulate(x0, &mut *load, t0, &mut rng))
            .collect();

        // Save schedules are identical across runs, so index i is the same time everywhere.
        let longest = runs.iter().map(|(saved, _)| saved.len()).max().unwrap_or(0);
        let mut states = Trajectory::default();
        let mut outputs = Trajectory::default();
        let mut event_states = Trajectory::default();
        let mut performance_metrics = Trajectory::default();
        for i in 0..longest {
            let at_i: Vec<&(f64, NamedVector)> = runs.iter().filter_map(|(saved, _)| saved.get(i)).collect();
            let Some(&&(t, _)) = at_i.first() else {
                break;
            };
            let xs: Vec<NamedVector> = at_i.iter().map(|(_, x)| x.clone()).collect();

            outputs.times.push(t);
            outputs.snapshots.push(StateDistribution::Samples {
                samples: xs.iter().map(|x| self.model.output(x)).collect(),
            });
            event_states.times.push(t);
            event_states.snapshots.push(StateDistribution::Samples {
                samples: xs.iter().map(|x| self.model.event_state(x)).collect(),
            });
            performance_metrics.times.push(t);
            performance_metrics.snapshots.push(StateDistribution::Samples {
                samples: xs.iter().map(|x| self.model.performance_metrics(x)).collect(),
            });
            states.times.push(t);
            states.snapshots.push(StateDistribution::Samples { samples: xs });
        }

        Ok(Prediction {
            states,
            outputs,
            event_states,
            performance_metrics,
            time_of_event: EventTimes {
                samples: runs.into_iter().map(|(_, toe)| toe).collect(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    use crate::model::ThrownObject;

    fn predictor(cfg: serde_json::Value) -> MonteCarlo {
        MonteCarlo::from_config(Arc::new(ThrownObject::default()), cfg.as_object().unwrap()).unwrap()
    }

    fn no_load() -> impl FnMut(f64) -> NamedVector {
        |_t| NamedVector::new()
    }

    #[test]
    fn deterministic_thrown_object_events() {
        let mc = predictor(json!({"n_samples": 4, "dt": 0.01, "save_freq": 0.5, "seed": 1}));
        let x0 = ThrownObject::default().initialize(None, None).unwrap();
        let mut load = no_load();
        let pred = mc.predict(&StateDistribution::scalar(x0), &mut load, 0.0).unwrap();

        // v = 40 - 9.81 t crosses zero at ~4.08 s.
        let falling = pred.time_of_event.mean()["falling"].unwrap();
        assert!((falling - 40.0 / 9.81).abs() < 0.02, "falling at {falling}");
        // x = 1.83 + 40 t - 4.905 t^2 reaches zero at ~8.2 s.
        let impact = pred.time_of_event.mean()["impact"].unwrap();
        assert!((impact - 8.2).abs() < 0.1, "impact at {impact}");
        assert_eq!(pred.time_of_event.probability("impact"), 1.0);

        assert_eq!(pred.states.times[0], 0.0);
        assert!((pred.states.times[1] - 0.5).abs() < 1e-9);
        assert_eq!(pred.states.len(), pred.event_states.len());
        assert_eq!(pred.states.len(), pred.outputs.len());
        assert_eq!(pred.states.times, pred.performance_metrics.times);
        assert!(pred.performance_metrics.means().iter().all(|(_, m)| m.is_empty()));
        let last = pred.states.times.last().copied().unwrap();
        assert!(last <= impact + 1e-9);
    }

    #[test]
    fn smaller_dt_saves_more_points() {
        let fine = predictor(json!({"n_samples": 1, "dt": 0.1, "save_freq": 0.1}));
        let coarse = predictor(json!({"n_samples": 1, "dt": 1.0, "save_freq": 0.1}));
        let x0 = ThrownObject::default().initialize(None, None).unwrap();
        let state = StateDistribution::scalar(x0);
        let fine_pred = fine.predict(&state, &mut no_load(), 0.0).unwrap();
        let coarse_pred = coarse.predict(&state, &mut no_load(), 0.0).unwrap();
        assert!(fine_pred.event_states.len() > 5 * coarse_pred.event_states.len());
    }

    #[test]
    fn horizon_bounds_simulation() {
        let mc = predictor(json!({"n_samples": 2, "dt": 0.1, "horizon": 1.0}));
        let x0 = ThrownObject::default().initialize(None, None).unwrap();
        let pred = mc.predict(&StateDistribution::scalar(x0), &mut no_load(), 5.0).unwrap();
        assert_eq!(pred.time_of_event.mean()["impact"], None);
        assert!(pred.states.times.iter().all(|t| *t <= 6.0 + 1e-9));
        assert_eq!(pred.states.times[0], 5.0);
    }

    #[test]
    fn rejects_bad_parameters() {
        let model: Arc<dyn PrognosticsModel> = Arc::new(ThrownObject::default());
        for bad in [
            json!({"dt": 0}),
            json!({"n_samples": 0}),
            json!({"save_freq": -1.0}),
            json!({"events": ["explode"]}),
            json!({"dt": 1e-9}),
            json!({"bogus": true}),
        ] {
            let err = MonteCarlo::from_config(Arc::clone(&model), bad.as_object().unwrap()).unwrap_err();
            assert!(err.is_configuration(), "expected configuration error for {bad}");
        }
    }

    #[test]
    fn restricted_events_stop_early() {
        let mc = predictor(json!({"n_samples": 1, "dt": 0.1, "events": ["falling"]}));
        let x0 = ThrownObject::default().initialize(None, None).unwrap();
        let pred = mc.predict(&StateDistribution::scalar(x0), &mut no_load(), 0.0).unwrap();
        assert_eq!(pred.time_of_event.events(), vec!["falling".to_string()]);
        assert!(pred.states.times.last().copied().unwrap() < 5.0);
    }
}
