//! Named component factories.
//!
//! Sessions name their model, state estimator and predictor as strings; the
//! catalog resolves those names to constructors. Lookups of unknown names are
//! configuration errors raised before any session state exists.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::config::ComponentConfig;
use crate::error::{ConfigurationError, ProgResult};
use crate::estimator::{ParticleFilter, StateEstimator};
use crate::model::{PrognosticsModel, ThrownObject};
use crate::predictor::{MonteCarlo, Predictor};
use crate::state::StateDistribution;

/// Builds a model from its parameters.
pub type ModelFactory = Arc<dyn Fn(&ComponentConfig) -> ProgResult<Arc<dyn PrognosticsModel>> + Send + Sync>;

/// Builds a state estimator around an initial state at `t0`.
pub type EstimatorFactory = Arc<
    dyn Fn(Arc<dyn PrognosticsModel>, &StateDistribution, f64, &ComponentConfig) -> ProgResult<Box<dyn StateEstimator>>
        + Send
        + Sync,
>;

/// Builds a predictor for a model.
pub type PredictorFactory =
    Arc<dyn Fn(Arc<dyn PrognosticsModel>, &ComponentConfig) -> ProgResult<Box<dyn Predictor>> + Send + Sync>;

/// Registry of constructible components.
#[derive(Clone, Default)]
pub struct ComponentCatalog {
    models: HashMap<String, ModelFactory>,
    estimators: HashMap<String, EstimatorFactory>,
    predictors: HashMap<String, PredictorFactory>,
}

impl fmt::Debug for ComponentCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentCatalog")
            .field("models", &sorted(self.models.keys()))
            .field("estimators", &sorted(self.estimators.keys()))
            .field("predictors", &sorted(self.predictors.keys()))
            .finish()
    }
}

fn sorted<'a>(keys: impl Iterator<Item = &'a String>) -> Vec<&'a str> {
    let mut out: Vec<&str> = keys.map(String::as_str).collect();
    out.sort_unstable();
    out
}

impl ComponentCatalog {
    /// An empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A catalog holding `ThrownObject`, `ParticleFilter` and `MonteCarlo`.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut catalog = Self::new();
        catalog.register_model("ThrownObject", |cfg| {
            Ok(Arc::new(ThrownObject::from_config(cfg)?) as Arc<dyn PrognosticsModel>)
        });
        catalog.register_estimator("ParticleFilter", |model, x0, t0, cfg| {
            Ok(Box::new(ParticleFilter::from_config(model, x0, t0, cfg)?) as Box<dyn StateEstimator>)
        });
        catalog.register_predictor("MonteCarlo", |model, cfg| {
            Ok(Box::new(MonteCarlo::from_config(model, cfg)?) as Box<dyn Predictor>)
        });
        catalog
    }

    /// Registers (or replaces) a model constructor.
    pub fn register_model<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&ComponentConfig) -> ProgResult<Arc<dyn PrognosticsModel>> + Send + Sync + 'static,
    {
        self.models.insert(name.into(), Arc::new(factory));
        self
    }

    /// Registers (or replaces) a state estimator constructor.
    pub fn register_estimator<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(Arc<dyn PrognosticsModel>, &StateDistribution, f64, &ComponentConfig) -> ProgResult<Box<dyn StateEstimator>>
            + Send
            + Sync
            + 'static,
    {
        self.estimators.insert(name.into(), Arc::new(factory));
        self
    }

    /// Registers (or replaces) a predictor constructor.
    pub fn register_predictor<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(Arc<dyn PrognosticsModel>, &ComponentConfig) -> ProgResult<Box<dyn Predictor>> + Send + Sync + 'static,
    {
        self.predictors.insert(name.into(), Arc::new(factory));
        self
    }

    /// True if a state estimator is registered under `name`.
    #[must_use]
    pub fn contains_estimator(&self, name: &str) -> bool {
        self.estimators.contains_key(name)
    }

    /// Builds the named model.
    pub fn build_model(&self, name: &str, cfg: &ComponentConfig) -> ProgResult<Arc<dyn PrognosticsModel>> {
        let factory = self
            .models
            .get(name)
            .ok_or_else(|| ConfigurationError::unknown("model", name))?;
        factory(cfg)
    }

    /// Builds the named state estimator.
    pub fn build_estimator(
        &self,
        name: &str,
        model: Arc<dyn PrognosticsModel>,
        x0: &StateDistribution,
        t0: f64,
        cfg: &ComponentConfig,
    ) -> ProgResult<Box<dyn StateEstimator>> {
        let factory = self
            .estimators
            .get(name)
            .ok_or_else(|| ConfigurationError::unknown("state estimator", name))?;
        factory(model, x0, t0, cfg)
    }

    /// Builds the named predictor.
    pub fn build_predictor(
        &self,
        name: &str,
        model: Arc<dyn PrognosticsModel>,
        cfg: &ComponentConfig,
    ) -> ProgResult<Box<dyn Predictor>> {
        let factory = self
            .predictors
            .get(name)
            .ok_or_else(|| ConfigurationError::unknown("predictor", name))?;
        factory(model, cfg)
    }

    /// Registered model names, sorted.
    #[must_use]
    pub fn model_names(&self) -> Vec<&str> {
        sorted(self.models.keys())
    }
}
