//! Load estimation: forecasting future model inputs.
//!
//! Predictors simulate forward without real sensor data, so they ask a
//! `LoadForecast` for the input at each future time. A session's load profile
//! owns the configured strategy plus a sliding window of recently observed
//! inputs; a prediction job takes an owned snapshot of both.

use std::collections::{BTreeMap, VecDeque};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::config::{parse_params, ComponentConfig};
use crate::error::{ConfigurationError, ProgResult, ValidationError};
use crate::state::NamedVector;

/// Default moving-average window capacity.
pub const DEFAULT_WINDOW_SIZE: usize = 10;

/// Source of future inputs for a forward simulation.
pub trait LoadForecast {
    /// Input vector to apply at time `t`.
    fn forecast(&mut self, t: f64) -> NamedVector;
}

impl<F: FnMut(f64) -> NamedVector> LoadForecast for F {
    fn forecast(&mut self, t: f64) -> NamedVector {
        self(t)
    }
}

/// Parameters for the moving-average strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MovingAverageParams {
    /// Number of recent observations averaged per input.
    pub window_size: usize,
    /// Standard deviation at `t0`.
    pub base_std: f64,
    /// Growth of the standard deviation per second after `t0`.
    pub std_slope: f64,
    /// Reference time for the growth; the prediction basis time when unset.
    #[serde(alias = "t")]
    pub t0: Option<f64>,
}

impl Default for MovingAverageParams {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            base_std: 0.0,
            std_slope: 0.0,
            t0: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConstantParams {
    load: NamedVector,
}

/// Strategy producing forecast inputs.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadEstimator {
    /// The same input vector at every time.
    Constant {
        /// The input vector.
        load: NamedVector,
    },
    /// Step-wise input vectors, sorted by breakpoint time; the first breakpoint is 0.
    Piecewise {
        /// `(start time, input vector)` pairs.
        breakpoints: Vec<(f64, NamedVector)>,
    },
    /// Gaussian draws around recent observed means.
    MovingAverage(MovingAverageParams),
}

impl LoadEstimator {
    /// Builds a strategy by name, validating its configuration against the model inputs.
    ///
    /// Accepted names: `Constant` (`Const`), `Piecewise` (`Variable`), `MovingAverage`.
    pub fn build(name: &str, cfg: &ComponentConfig, inputs: &[String]) -> ProgResult<Self> {
        match name {
            "Constant" | "Const" => {
                let params: ConstantParams = parse_params(name, cfg)?;
                ensure_covers(name, &params.load, inputs)?;
                Ok(Self::Constant { load: params.load })
            }
            "Piecewise" | "Variable" => {
                let mut breakpoints = Vec::with_capacity(cfg.len());
                for (key, value) in cfg {
                    let t: f64 = key.trim().parse().map_err(|_| {
                        ConfigurationError::invalid(name, format!("breakpoint '{key}' is not a number"))
                    })?;
                    if !t.is_finite() {
                        return Err(ConfigurationError::invalid(name, format!("breakpoint '{key}' must be finite")).into());
                    }
                    let load: NamedVector = serde_json::from_value(value.clone()).map_err(|e| {
                        ConfigurationError::invalid(name, format!("breakpoint '{key}': {e}"))
                    })?;
                    ensure_covers(name, &load, inputs)?;
                    breakpoints.push((t, load));
                }
                breakpoints.sort_by(|a, b| a.0.total_cmp(&b.0));
                if breakpoints.windows(2).any(|w| w[0].0 == w[1].0) {
                    return Err(ConfigurationError::invalid(name, "duplicate breakpoint").into());
                }
                if breakpoints.first().map(|(t, _)| *t) != Some(0.0) {
                    return Err(ConfigurationError::invalid(name, "breakpoints must include 0").into());
                }
                Ok(Self::Piecewise { breakpoints })
            }
            "MovingAverage" => {
                let params: MovingAverageParams = parse_params(name, cfg)?;
                if params.window_size == 0 {
                    return Err(ConfigurationError::invalid(name, "window_size must be positive").into());
                }
                if !(params.base_std >= 0.0) || !params.std_slope.is_finite() {
                    return Err(ConfigurationError::invalid(name, "base_std must be non-negative and std_slope finite").into());
                }
                Ok(Self::MovingAverage(params))
            }
            other => Err(ConfigurationError::unknown("load estimator", other).into()),
        }
    }

    /// Window capacity this strategy wants, if it uses observed inputs.
    #[must_use]
    pub const fn window_size(&self) -> Option<usize> {
        match self {
            Self::MovingAverage(p) => Some(p.window_size),
            Self::Constant { .. } | Self::Piecewise { .. } => None,
        }
    }

    /// Forecast input at time `t`.
    ///
    /// `recent` holds the per-input means of the observation window and
    /// `basis_time` is the prediction start, used when no `t0` is configured.
    pub fn forecast<R: Rng + ?Sized>(&self, t: f64, basis_time: f64, recent: &NamedVector, rng: &mut R) -> NamedVector {
        match self {
            Self::Constant { load } => load.clone(),
            Self::Piecewise { breakpoints } => breakpoints
                .iter()
                .rev()
                .find(|(start, _)| *start <= t)
                .or_else(|| breakpoints.first())
                .map(|(_, load)| load.clone())
                .unwrap_or_default(),
            Self::MovingAverage(p) => {
                let t0 = p.t0.unwrap_or(basis_time);
                let std = (p.base_std + p.std_slope * (t - t0)).max(0.0);
                recent
                    .iter()
                    .map(|(k, &mean)| {
                        let v = match Normal::new(mean, std) {
                            Ok(dist) if std > 0.0 => dist.sample(rng),
                            _ => mean,
                        };
                        (k.clone(), v)
                    })
                    .collect()
            }
        }
    }
}

fn ensure_covers(component: &str, load: &NamedVector, inputs: &[String]) -> ProgResult<()> {
    let missing: Vec<&String> = inputs.iter().filter(|k| !load.contains_key(*k)).collect();
    if !missing.is_empty() {
        return Err(ConfigurationError::invalid(component, format!("load is missing inputs {missing:?}")).into());
    }
    if let Some((k, v)) = load.iter().find(|(_, v)| !v.is_finite()) {
        return Err(ConfigurationError::invalid(component, format!("load for '{k}' must be finite, got {v}")).into());
    }
    Ok(())
}

/// Sliding window of the most recent observed values per input channel.
#[derive(Debug, Clone, PartialEq)]
pub struct InputWindow {
    capacity: usize,
    values: BTreeMap<String, VecDeque<f64>>,
}

impl InputWindow {
    /// Creates an empty window for the given channels.
    #[must_use]
    pub fn new(inputs: &[String], capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            values: inputs.iter().map(|k| (k.clone(), VecDeque::with_capacity(capacity))).collect(),
        }
    }

    /// Capacity per channel.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Records one observation, evicting the oldest value when full.
    pub fn push(&mut self, u: &NamedVector) {
        for (k, buf) in &mut self.values {
            if let Some(&v) = u.get(k) {
                buf.push_back(v);
                while buf.len() > self.capacity {
                    buf.pop_front();
                }
            }
        }
    }

    /// Changes the capacity, keeping the most recent values.
    pub fn resize(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        for buf in self.values.values_mut() {
            while buf.len() > self.capacity {
                buf.pop_front();
            }
        }
    }

    /// Mean per channel; channels without observations are omitted.
    #[must_use]
    pub fn means(&self) -> NamedVector {
        self.values
            .iter()
            .filter(|(_, buf)| !buf.is_empty())
            .map(|(k, buf)| (k.clone(), buf.iter().sum::<f64>() / buf.len() as f64))
            .collect()
    }

    /// Channels that have no observations yet.
    #[must_use]
    pub fn empty_channels(&self) -> Vec<String> {
        self.values
            .iter()
            .filter(|(_, buf)| buf.is_empty())
            .map(|(k, _)| k.clone())
            .collect()
    }
}

/// A session's load-estimation state: the configured strategy plus the window it reads.
#[derive(Debug, Clone)]
pub struct LoadProfile {
    name: String,
    cfg: ComponentConfig,
    estimator: LoadEstimator,
    window: InputWindow,
}

impl LoadProfile {
    /// Builds a profile for a model with the given inputs.
    pub fn new(name: &str, cfg: ComponentConfig, inputs: &[String]) -> ProgResult<Self> {
        let estimator = LoadEstimator::build(name, &cfg, inputs)?;
        let window = InputWindow::new(inputs, estimator.window_size().unwrap_or(DEFAULT_WINDOW_SIZE));
        Ok(Self {
            name: name.to_string(),
            cfg,
            estimator,
            window,
        })
    }

    /// Replaces the strategy. The observation window is kept.
    pub fn set_estimator(&mut self, name: &str, cfg: ComponentConfig, inputs: &[String]) -> ProgResult<()> {
        let estimator = LoadEstimator::build(name, &cfg, inputs)?;
        if let Some(size) = estimator.window_size() {
            self.window.resize(size);
        }
        self.name = name.to_string();
        self.cfg = cfg;
        self.estimator = estimator;
        Ok(())
    }

    /// Strategy name as configured.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Strategy parameters as configured.
    #[must_use]
    pub const fn cfg(&self) -> &ComponentConfig {
        &self.cfg
    }

    /// Records observed inputs.
    pub fn observe(&mut self, inputs: &NamedVector) {
        self.window.push(inputs);
    }

    /// Owned forecast source for a prediction starting at `basis_time`.
    ///
    /// Fails for the moving-average strategy until every input has been observed.
    pub fn snapshot(&self, basis_time: f64, seed: Option<u64>) -> ProgResult<LoadSnapshot> {
        if matches!(self.estimator, LoadEstimator::MovingAverage(_)) {
            let empty = self.window.empty_channels();
            if !empty.is_empty() {
                return Err(ValidationError::InsufficientData {
                    reason: format!("no observed values for inputs {empty:?}"),
                }
                .into());
            }
        }
        Ok(LoadSnapshot {
            estimator: self.estimator.clone(),
            recent: self.window.means(),
            basis_time,
            rng: match seed {
                Some(seed) => SmallRng::seed_from_u64(seed),
                None => SmallRng::from_entropy(),
            },
        })
    }
}

/// Detached copy of a load profile used by a single prediction job.
#[derive(Debug, Clone)]
pub struct LoadSnapshot {
    estimator: LoadEstimator,
    recent: NamedVector,
    basis_time: f64,
    rng: SmallRng,
}

impl LoadForecast for LoadSnapshot {
    fn forecast(&mut self, t: f64) -> NamedVector {
        self.estimator.forecast(t, self.basis_time, &self.recent, &mut self.rng)
    }
}
