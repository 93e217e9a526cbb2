//! Object thrown straight up from a fixed height under constant gravity.

use serde::{Deserialize, Serialize};

use crate::config::{parse_params, ComponentConfig};
use crate::error::{ConfigurationError, ProgResult};
use crate::state::NamedVector;

use super::{NoiseSpec, PrognosticsModel};

const NAME: &str = "ThrownObject";

/// Parameters for [`ThrownObject`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ThrownObjectParams {
    /// Release height in metres.
    pub thrower_height: f64,
    /// Release speed in metres per second (upwards).
    pub throwing_speed: f64,
    /// Gravitational acceleration (negative is down).
    pub g: f64,
    /// Process noise standard deviation.
    pub process_noise: NoiseSpec,
    /// Measurement noise standard deviation.
    pub measurement_noise: NoiseSpec,
}

impl Default for ThrownObjectParams {
    fn default() -> Self {
        Self {
            thrower_height: 1.83,
            throwing_speed: 40.0,
            g: -9.81,
            process_noise: NoiseSpec::default(),
            measurement_noise: NoiseSpec::default(),
        }
    }
}

/// Thrown object model.
///
/// States `x` (height) and `v` (velocity); output `x`; no inputs. Events:
/// `falling` once velocity turns negative and `impact` once height reaches 0.
#[derive(Debug, Clone)]
pub struct ThrownObject {
    params: ThrownObjectParams,
    inputs: Vec<String>,
    states: Vec<String>,
    outputs: Vec<String>,
    events: Vec<String>,
    process_noise: NamedVector,
    measurement_noise: NamedVector,
    max_x: f64,
}

impl ThrownObject {
    /// Builds the model from typed parameters.
    pub fn new(params: ThrownObjectParams) -> ProgResult<Self> {
        if !(params.g < 0.0) {
            return Err(ConfigurationError::invalid(NAME, "g must be negative").into());
        }
        if !(params.throwing_speed > 0.0) {
            return Err(ConfigurationError::invalid(NAME, "throwing_speed must be positive").into());
        }
        if !params.thrower_height.is_finite() || params.thrower_height < 0.0 {
            return Err(ConfigurationError::invalid(NAME, "thrower_height must be non-negative").into());
        }

        let states = vec!["x".to_string(), "v".to_string()];
        let outputs = vec!["x".to_string()];
        let process_noise = params.process_noise.resolve(NAME, "process_noise", &states)?;
        let measurement_noise = params.measurement_noise.resolve(NAME, "measurement_noise", &outputs)?;
        let max_x = params.thrower_height - params.throwing_speed * params.throwing_speed / (2.0 * params.g);

        Ok(Self {
            params,
            inputs: Vec::new(),
            states,
            outputs,
            events: vec!["falling".to_string(), "impact".to_string()],
            process_noise,
            measurement_noise,
            max_x,
        })
    }

    /// Builds the model from JSON parameters.
    pub fn from_config(cfg: &ComponentConfig) -> ProgResult<Self> {
        Self::new(parse_params(NAME, cfg)?)
    }

    fn get(x: &NamedVector, key: &str) -> f64 {
        x.get(key).copied().unwrap_or(f64::NAN)
    }
}

impl Default for ThrownObject {
    fn default() -> Self {
        Self {
            params: ThrownObjectParams::default(),
            inputs: Vec::new(),
            states: vec!["x".to_string(), "v".to_string()],
            outputs: vec!["x".to_string()],
            events: vec!["falling".to_string(), "impact".to_string()],
            process_noise: [("v".to_string(), 0.0), ("x".to_string(), 0.0)].into_iter().collect(),
            measurement_noise: [("x".to_string(), 0.0)].into_iter().collect(),
            max_x: 1.83 + 40.0 * 40.0 / (2.0 * 9.81),
        }
    }
}

impl PrognosticsModel for ThrownObject {
    fn inputs(&self) -> &[String] {
        &self.inputs
    }

    fn states(&self) -> &[String] {
        &self.states
    }

    fn outputs(&self) -> &[String] {
        &self.outputs
    }

    fn events(&self) -> &[String] {
        &self.events
    }

    fn initialize(&self, _inputs: Option<&NamedVector>, _outputs: Option<&NamedVector>) -> ProgResult<NamedVector> {
        Ok([
            ("x".to_string(), self.params.thrower_height),
            ("v".to_string(), self.params.throwing_speed),
        ]
        .into_iter()
        .collect())
    }

    fn next_state(&self, x: &NamedVector, _u: &NamedVector, dt: f64) -> NamedVector {
        let pos = Self::get(x, "x");
        let vel = Self::get(x, "v");
        [
            ("x".to_string(), pos + vel * dt),
            ("v".to_string(), vel + self.params.g * dt),
        ]
        .into_iter()
        .collect()
    }

    fn output(&self, x: &NamedVector) -> NamedVector {
        [("x".to_string(), Self::get(x, "x"))].into_iter().collect()
    }

    fn event_state(&self, x: &NamedVector) -> NamedVector {
        [
            ("falling".to_string(), (Self::get(x, "v") / self.params.throwing_speed).max(0.0)),
            ("impact".to_string(), (Self::get(x, "x") / self.max_x).max(0.0)),
        ]
        .into_iter()
        .collect()
    }

    fn threshold_met(&self, x: &NamedVector) -> std::collections::BTreeMap<String, bool> {
        [
            ("falling".to_string(), Self::get(x, "v") < 0.0),
            ("impact".to_string(), Self::get(x, "x") <= 0.0),
        ]
        .into_iter()
        .collect()
    }

    fn process_noise(&self) -> NamedVector {
        self.process_noise.clone()
    }

    fn measurement_noise(&self) -> NamedVector {
        self.measurement_noise.clone()
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::to_value(&self.params).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    fn cfg(v: serde_json::Value) -> ComponentConfig {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn initializes_without_data() {
        let m = ThrownObject::default();
        let x0 = m.initialize(None, None).unwrap();
        assert_eq!(x0["x"], 1.83);
        assert_eq!(x0["v"], 40.0);
    }

    #[test]
    fn next_state_applies_gravity() {
        let m = ThrownObject::default();
        let x: NamedVector = [("x".to_string(), 0.0), ("v".to_string(), 20.0)].into_iter().collect();
        let x1 = m.next_state(&x, &NamedVector::new(), 0.1);
        assert!((x1["x"] - 2.0).abs() < 1e-12);
        assert!((x1["v"] - (20.0 - 0.981)).abs() < 1e-12);
    }

    #[test]
    fn event_states_and_thresholds() {
        let m = ThrownObject::default();
        let x0 = m.initialize(None, None).unwrap();
        let es = m.event_state(&x0);
        assert!((es["falling"] - 1.0).abs() < 1e-12);
        assert!(es["impact"] > 0.0 && es["impact"] < 1.0);

        let down: NamedVector = [("x".to_string(), -0.1), ("v".to_string(), -5.0)].into_iter().collect();
        let met = m.threshold_met(&down);
        assert!(met["falling"]);
        assert!(met["impact"]);
    }

    #[test]
    fn from_config_overrides_and_rejects_unknown_fields() {
        let m = ThrownObject::from_config(&cfg(json!({"throwing_speed": 20.0, "process_noise": {"x": 0.1}}))).unwrap();
        assert_eq!(m.initialize(None, None).unwrap()["v"], 20.0);
        assert_eq!(m.process_noise()["x"], 0.1);
        assert_eq!(m.process_noise()["v"], 0.0);

        let err = ThrownObject::from_config(&cfg(json!({"drag": 1.0}))).unwrap_err();
        assert!(err.is_configuration());

        let err = ThrownObject::from_config(&cfg(json!({"process_noise": {"fake_state": 0.0}}))).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn default_matches_default_params() {
        let built = ThrownObject::new(ThrownObjectParams::default()).unwrap();
        let default = ThrownObject::default();
        assert!((built.max_x - default.max_x).abs() < 1e-9);
        assert_eq!(built.process_noise, default.process_noise);
    }
}
