//! Configuration types.
//!
//! `ServiceConfig` sizes the process-wide machinery (worker pool, queue) and
//! names the default components. `SessionConfig` describes one session: which
//! model, state estimator, load estimator and predictor to build, with what
//! parameters, and optionally the initial state.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ConfigurationError, ProgResult};
use crate::state::StateDistribution;

/// Free-form parameters for a component, as a JSON object.
pub type ComponentConfig = Map<String, Value>;

/// Environment variable overriding `scheduler.prediction_workers`.
pub const ENV_PREDICTION_WORKERS: &str = "PROGNOS_PREDICTION_WORKERS";
/// Environment variable overriding `scheduler.queue_capacity`.
pub const ENV_QUEUE_CAPACITY: &str = "PROGNOS_QUEUE_CAPACITY";

/// Name and parameters of one session component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentSpec {
    /// Registered component name, e.g. `"ParticleFilter"`.
    #[serde(rename = "type")]
    pub name: String,
    /// Component parameters.
    #[serde(default)]
    pub cfg: ComponentConfig,
}

impl ComponentSpec {
    /// Creates a spec with empty parameters.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cfg: ComponentConfig::new(),
        }
    }

    /// Creates a spec from a JSON value. Non-object values are rejected.
    pub fn with_cfg(name: impl Into<String>, cfg: Value) -> ProgResult<Self> {
        let name = name.into();
        let cfg = into_object(&name, cfg)?;
        Ok(Self { name, cfg })
    }
}

/// Everything needed to build a session.
///
/// Unset components fall back to the service defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Physical-system model.
    pub model: ComponentSpec,
    /// State estimator; defaults to `ServiceConfig::defaults.state_estimator`.
    #[serde(default)]
    pub state_estimator: Option<ComponentSpec>,
    /// Load estimator; defaults to `ServiceConfig::defaults.load_estimator`.
    #[serde(default)]
    pub load_estimator: Option<ComponentSpec>,
    /// Predictor; defaults to `ServiceConfig::defaults.predictor`.
    #[serde(default)]
    pub predictor: Option<ComponentSpec>,
    /// Explicit initial state. When absent the model tries to initialize itself.
    #[serde(default)]
    pub initial_state: Option<StateDistribution>,
}

impl SessionConfig {
    /// Starts a config for the named model.
    #[must_use]
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: ComponentSpec::new(model),
            state_estimator: None,
            load_estimator: None,
            predictor: None,
            initial_state: None,
        }
    }

    /// Sets model parameters.
    pub fn model_cfg(mut self, cfg: Value) -> ProgResult<Self> {
        self.model.cfg = into_object(&self.model.name, cfg)?;
        Ok(self)
    }

    /// Sets the state estimator.
    pub fn state_estimator(mut self, name: impl Into<String>, cfg: Value) -> ProgResult<Self> {
        self.state_estimator = Some(ComponentSpec::with_cfg(name, cfg)?);
        Ok(self)
    }

    /// Sets the load estimator.
    pub fn load_estimator(mut self, name: impl Into<String>, cfg: Value) -> ProgResult<Self> {
        self.load_estimator = Some(ComponentSpec::with_cfg(name, cfg)?);
        Ok(self)
    }

    /// Sets the predictor.
    pub fn predictor(mut self, name: impl Into<String>, cfg: Value) -> ProgResult<Self> {
        self.predictor = Some(ComponentSpec::with_cfg(name, cfg)?);
        Ok(self)
    }

    /// Sets the initial state.
    #[must_use]
    pub fn initial_state(mut self, x0: impl Into<StateDistribution>) -> Self {
        self.initial_state = Some(x0.into());
        self
    }
}

/// Worker pool sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of prediction worker threads shared by all sessions.
    pub prediction_workers: usize,
    /// Maximum queued prediction jobs across all sessions.
    pub queue_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            prediction_workers: 5,
            queue_capacity: 1024,
        }
    }
}

/// Component names used when a session config leaves one unset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultComponents {
    /// Default state estimator.
    pub state_estimator: String,
    /// Default load estimator.
    pub load_estimator: String,
    /// Default predictor.
    pub predictor: String,
}

impl Default for DefaultComponents {
    fn default() -> Self {
        Self {
            state_estimator: "ParticleFilter".to_string(),
            load_estimator: "MovingAverage".to_string(),
            predictor: "MonteCarlo".to_string(),
        }
    }
}

/// Process-wide service configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Worker pool sizing.
    pub scheduler: SchedulerConfig,
    /// Default component names.
    pub defaults: DefaultComponents,
}

impl ServiceConfig {
    /// Parses a JSON document. Missing fields take their defaults.
    pub fn from_json_str(s: &str) -> ProgResult<Self> {
        serde_json::from_str(s)
            .map_err(|e| ConfigurationError::invalid("service", e.to_string()).into())
    }

    /// Applies `PROGNOS_*` environment overrides.
    pub fn apply_env(self) -> ProgResult<Self> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> ProgResult<Self> {
        if let Some(v) = lookup(ENV_PREDICTION_WORKERS) {
            self.scheduler.prediction_workers = parse_count(ENV_PREDICTION_WORKERS, &v)?;
        }
        if let Some(v) = lookup(ENV_QUEUE_CAPACITY) {
            self.scheduler.queue_capacity = parse_count(ENV_QUEUE_CAPACITY, &v)?;
        }
        Ok(self)
    }
}

fn parse_count(key: &str, raw: &str) -> ProgResult<usize> {
    match raw.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigurationError::invalid("service", format!("{key} must be a positive integer, got '{raw}'")).into()),
    }
}

fn into_object(component: &str, cfg: Value) -> ProgResult<ComponentConfig> {
    match cfg {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(ComponentConfig::new()),
        other => Err(ConfigurationError::invalid(
            component,
            format!("configuration must be a JSON object, got {other}"),
        )
        .into()),
    }
}

/// Deserializes component parameters into a typed struct.
pub(crate) fn parse_params<T: DeserializeOwned>(component: &str, cfg: &ComponentConfig) -> ProgResult<T> {
    serde_json::from_value(Value::Object(cfg.clone()))
        .map_err(|e| ConfigurationError::invalid(component, e.to_string()).into())
}
