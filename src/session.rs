//! Prognostics sessions.
//!
//! A session binds one model instance to a state estimator, a load profile
//! and a predictor, and keeps the most recent prediction. Ingestion, state
//! changes and reads run on the caller's thread; predictions run on the
//! scheduler's workers.
//!
//! Each mutable part sits behind its own lock:
//!
//! | lock        | protects                          |
//! |-------------|-----------------------------------|
//! | `execution` | the predictor                     |
//! | `estimate`  | the state estimator               |
//! | `load`      | the load profile and input window |
//! | `futures`   | the two job slots                 |
//! | `results`   | the published prediction          |
//!
//! Locks are always taken in the order `execution`, `estimate`, `load`.
//! `futures` and `results` are never held while taking another session lock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::catalog::ComponentCatalog;
use crate::config::{ComponentConfig, ComponentSpec, DefaultComponents, SessionConfig};
use crate::error::{lock_err, ConfigurationError, ExecutionError, ProgError, ProgResult, ValidationError};
use crate::estimator::StateEstimator;
use crate::load::LoadProfile;
use crate::model::PrognosticsModel;
use crate::predictor::{EventTimes, Prediction, Predictor, Trajectory};
use crate::registry::SessionId;
use crate::scheduler::{JobSlots, PredictionScheduler, PredictionTask, ScheduleOutcome};
use crate::state::{NamedVector, StateDistribution, DEFAULT_MAP_SAMPLES};

/// A published prediction. Never mutated after publication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    /// Wall-clock publication time.
    pub completed_at: DateTime<Utc>,
    /// Timestamp of the estimate the prediction started from.
    pub basis_time: f64,
    /// Revision of the estimate the prediction started from. Every state
    /// change bumps it, even one that keeps the timestamp.
    pub revision: u64,
    /// Predicted states.
    pub states: Trajectory,
    /// Predicted outputs.
    pub outputs: Trajectory,
    /// Predicted event states.
    pub event_states: Trajectory,
    /// Predicted performance metrics.
    pub performance_metrics: Trajectory,
    /// Predicted time of each event.
    pub time_of_event: EventTimes,
}

/// The current belief and the time it refers to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Timestamp of the latest incorporated observation.
    pub time: f64,
    /// The belief.
    pub state: StateDistribution,
}

/// Non-blocking view of a session's background work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    /// Failure messages of the jobs currently held in the slots.
    pub exceptions: Vec<String>,
    /// Jobs pending or running (0, 1 or 2).
    pub in_flight: usize,
    /// Publication time of the latest prediction.
    pub last_completed_at: Option<DateTime<Utc>>,
    /// Submission time of the newest job.
    pub last_submitted_at: Option<DateTime<Utc>>,
}

/// Serializable description of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Session identifier.
    pub id: SessionId,
    /// Model component.
    pub model: ComponentSpec,
    /// State estimator component.
    pub state_estimator: ComponentSpec,
    /// Current load estimator.
    pub load_estimator: ComponentSpec,
    /// Predictor component.
    pub predictor: ComponentSpec,
    /// Whether the session has a state estimate.
    pub initialized: bool,
}

struct SessionInner {
    id: SessionId,
    catalog: Arc<ComponentCatalog>,
    scheduler: Arc<PredictionScheduler>,
    model: Arc<dyn PrognosticsModel>,
    model_spec: ComponentSpec,
    estimator_spec: ComponentSpec,
    predictor_spec: ComponentSpec,

    execution: Mutex<Box<dyn Predictor>>,
    estimate: Mutex<Option<Box<dyn StateEstimator>>>,
    /// Bumped under `estimate` on every state change.
    revision: AtomicU64,
    load: Mutex<LoadProfile>,
    futures: Mutex<JobSlots>,
    results: Mutex<Option<Arc<PredictionResult>>>,
    ended: AtomicBool,
}

/// A prognostics session. Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("model", &self.inner.model_spec.name)
            .field("ended", &self.is_ended())
            .finish_non_exhaustive()
    }
}

fn resolve(spec: Option<ComponentSpec>, default: &str) -> ComponentSpec {
    spec.unwrap_or_else(|| ComponentSpec::new(default))
}

impl Session {
    /// Builds every component named in `config` and, when a starting state
    /// is available, the state estimator.
    ///
    /// The starting state is `config.initial_state` if set, otherwise whatever
    /// the model produces without data. A model that needs data leaves the
    /// session uninitialized until the first ingestion. Unknown names and
    /// rejected parameters fail here.
    pub fn create(
        id: SessionId,
        config: SessionConfig,
        defaults: &DefaultComponents,
        catalog: Arc<ComponentCatalog>,
        scheduler: Arc<PredictionScheduler>,
    ) -> ProgResult<Self> {
        let SessionConfig {
            model: model_spec,
            state_estimator,
            load_estimator,
            predictor,
            initial_state,
        } = config;
        let estimator_spec = resolve(state_estimator, &defaults.state_estimator);
        let load_spec = resolve(load_estimator, &defaults.load_estimator);
        let predictor_spec = resolve(predictor, &defaults.predictor);

        let model = catalog.build_model(&model_spec.name, &model_spec.cfg)?;
        if !catalog.contains_estimator(&estimator_spec.name) {
            return Err(ConfigurationError::unknown("state estimator", &estimator_spec.name).into());
        }
        let load = LoadProfile::new(&load_spec.name, load_spec.cfg, model.inputs())?;
        let predictor = catalog.build_predictor(&predictor_spec.name, Arc::clone(&model), &predictor_spec.cfg)?;

        let x0 = match initial_state {
            Some(x0) => {
                ensure_state_keys(model.as_ref(), &x0)?;
                Some(x0)
            }
            None => match model.initialize(None, None) {
                Ok(values) => Some(StateDistribution::scalar(values)),
                Err(err) => {
                    debug!(session_id = %id, reason = %err, "model needs data to initialize");
                    None
                }
            },
        };
        let estimator = match &x0 {
            Some(x0) => Some(catalog.build_estimator(
                &estimator_spec.name,
                Arc::clone(&model),
                x0,
                0.0,
                &estimator_spec.cfg,
            )?),
            None => None,
        };
        let initialized = estimator.is_some();

        let session = Self {
            inner: Arc::new(SessionInner {
                id,
                catalog,
                scheduler,
                model,
                model_spec,
                estimator_spec,
                predictor_spec,
                execution: Mutex::new(predictor),
                estimate: Mutex::new(estimator),
                revision: AtomicU64::new(0),
                load: Mutex::new(load),
                futures: Mutex::new(JobSlots::default()),
                results: Mutex::new(None),
                ended: AtomicBool::new(false),
            }),
        };

        info!(
            session_id = %id,
            model = %session.inner.model_spec.name,
            initialized,
            "session created"
        );
        if initialized {
            session.schedule()?;
        }
        Ok(session)
    }

    /// Session identifier.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    /// The session's model.
    #[must_use]
    pub fn model(&self) -> &Arc<dyn PrognosticsModel> {
        &self.inner.model
    }

    /// True once the model has a concrete starting state.
    pub fn is_initialized(&self) -> ProgResult<bool> {
        Ok(self.inner.lock_estimate()?.is_some())
    }

    /// True once [`Session::end`] was called.
    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.inner.is_detached()
    }

    fn ensure_active(&self) -> ProgResult<()> {
        if self.is_ended() {
            return Err(ExecutionError::SessionNotFound { id: self.inner.id }.into());
        }
        Ok(())
    }

    fn schedule(&self) -> ProgResult<ScheduleOutcome> {
        let task: Arc<dyn PredictionTask> = Arc::clone(&self.inner) as Arc<dyn PredictionTask>;
        let outcome = self.inner.scheduler.trigger(&self.inner.futures, task)?;
        debug!(session_id = %self.inner.id, ?outcome, "prediction trigger");
        Ok(outcome)
    }

    /// Replaces the state estimator with one built around `x`.
    ///
    /// The key set of `x` must equal the model's states. On any error the
    /// previous estimator stays in place.
    pub fn set_state(&self, x: StateDistribution) -> ProgResult<ScheduleOutcome> {
        self.ensure_active()?;
        ensure_state_keys(self.inner.model.as_ref(), &x)?;
        {
            let mut estimate = self.inner.lock_estimate()?;
            let t0 = estimate.as_ref().map_or(0.0, |e| e.time());
            let spec = &self.inner.estimator_spec;
            let rebuilt = self
                .inner
                .catalog
                .build_estimator(&spec.name, Arc::clone(&self.inner.model), &x, t0, &spec.cfg)?;
            *estimate = Some(rebuilt);
            self.inner.revision.fetch_add(1, Ordering::AcqRel);
        }
        debug!(session_id = %self.inner.id, "state replaced");
        self.schedule()
    }

    /// Incorporates one observation.
    ///
    /// Every model input and output must be present and finite; extra keys
    /// are ignored. An uninitialized session first tries to initialize the
    /// model from this observation.
    pub fn ingest(&self, time: f64, inputs: &NamedVector, outputs: &NamedVector) -> ProgResult<ScheduleOutcome> {
        self.ensure_active()?;
        if !time.is_finite() {
            return Err(ValidationError::NonFiniteValue {
                field: "time".to_string(),
                value: time,
            }
            .into());
        }
        let model = self.inner.model.as_ref();
        let u = self.select(model.inputs(), model.outputs(), inputs, model.inputs())?;
        let z = self.select(model.inputs(), model.outputs(), outputs, model.outputs())?;

        {
            let mut estimate = self.inner.lock_estimate()?;
            if let Some(est) = estimate.as_mut() {
                if time < est.time() {
                    return Err(ValidationError::OutOfOrderObservation {
                        time,
                        current: est.time(),
                    }
                    .into());
                }
                est.estimate(time, &u, &z)?;
                self.inner.lock_load()?.observe(&u);
                self.inner.revision.fetch_add(1, Ordering::AcqRel);
            } else {
                self.inner.lock_load()?.observe(&u);
                let x0 = model
                    .initialize(Some(&u), Some(&z))
                    .map_err(|e| ValidationError::InsufficientData { reason: e.to_string() })?;
                let spec = &self.inner.estimator_spec;
                let est = self.inner.catalog.build_estimator(
                    &spec.name,
                    Arc::clone(&self.inner.model),
                    &StateDistribution::scalar(x0),
                    time,
                    &spec.cfg,
                )?;
                *estimate = Some(est);
                self.inner.revision.fetch_add(1, Ordering::AcqRel);
                info!(session_id = %self.inner.id, time, "session initialized from data");
            }
        }

        self.schedule()
    }

    /// Picks `keys` out of `data`, reporting every missing model variable.
    fn select(
        &self,
        inputs: &[String],
        outputs: &[String],
        data: &NamedVector,
        keys: &[String],
    ) -> ProgResult<NamedVector> {
        let missing: Vec<String> = keys.iter().filter(|k| !data.contains_key(*k)).cloned().collect();
        if !missing.is_empty() {
            return Err(ValidationError::MissingData {
                session_id: self.inner.id,
                inputs: inputs.to_vec(),
                outputs: outputs.to_vec(),
                missing,
            }
            .into());
        }
        keys.iter()
            .map(|k| {
                let v = data[k];
                if v.is_finite() {
                    Ok((k.clone(), v))
                } else {
                    Err(ProgError::from(ValidationError::NonFiniteValue {
                        field: k.clone(),
                        value: v,
                    }))
                }
            })
            .collect()
    }

    /// Swaps the load estimator. Schedules a prediction only when `trigger`
    /// is set and the session is initialized.
    pub fn set_load_estimator(
        &self,
        name: &str,
        cfg: ComponentConfig,
        trigger: bool,
    ) -> ProgResult<Option<ScheduleOutcome>> {
        self.ensure_active()?;
        self.inner
            .lock_load()?
            .set_estimator(name, cfg, self.inner.model.inputs())?;
        debug!(session_id = %self.inner.id, load_estimator = name, "load estimator replaced");
        if trigger && self.is_initialized()? {
            return self.schedule().map(Some);
        }
        Ok(None)
    }

    /// Current load estimator name and parameters.
    pub fn load_profile(&self) -> ProgResult<ComponentSpec> {
        let load = self.inner.lock_load()?;
        Ok(ComponentSpec {
            name: load.name().to_string(),
            cfg: load.cfg().clone(),
        })
    }

    /// Current belief.
    pub fn snapshot(&self) -> ProgResult<Snapshot> {
        let estimate = self.inner.lock_estimate()?;
        let est = estimate.as_ref().ok_or(ExecutionError::NotInitialized)?;
        Ok(Snapshot {
            time: est.time(),
            state: est.state(),
        })
    }

    fn map_snapshot(&self, f: impl Fn(&NamedVector) -> NamedVector) -> ProgResult<Snapshot> {
        let Snapshot { time, state } = self.snapshot()?;
        let mut rng = SmallRng::from_entropy();
        Ok(Snapshot {
            time,
            state: state.map(f, DEFAULT_MAP_SAMPLES, &mut rng),
        })
    }

    /// Model outputs evaluated on the current belief.
    pub fn output_snapshot(&self) -> ProgResult<Snapshot> {
        let model = Arc::clone(&self.inner.model);
        self.map_snapshot(|x| model.output(x))
    }

    /// Event states evaluated on the current belief.
    pub fn event_state_snapshot(&self) -> ProgResult<Snapshot> {
        let model = Arc::clone(&self.inner.model);
        self.map_snapshot(|x| model.event_state(x))
    }

    /// Performance metrics evaluated on the current belief.
    pub fn performance_metrics_snapshot(&self) -> ProgResult<Snapshot> {
        let model = Arc::clone(&self.inner.model);
        self.map_snapshot(|x| model.performance_metrics(x))
    }

    fn ensure_initialized(&self) -> ProgResult<()> {
        if self.is_initialized()? {
            Ok(())
        } else {
            Err(ExecutionError::NotInitialized.into())
        }
    }

    /// Most recently published prediction.
    pub fn latest_prediction(&self) -> ProgResult<Arc<PredictionResult>> {
        self.ensure_initialized()?;
        let results = self.inner.lock_results()?;
        results
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| ExecutionError::NoCompletedPrediction.into())
    }

    /// Status of the background jobs. Never waits on a running job.
    pub fn job_status(&self) -> ProgResult<JobStatus> {
        self.ensure_initialized()?;
        let (exceptions, in_flight, last_submitted_at) = {
            let slots = self.inner.futures.lock().map_err(|_| lock_err("session.futures"))?;
            (slots.errors(), slots.in_flight(), slots.last_submitted_at())
        };
        let last_completed_at = self.inner.lock_results()?.as_ref().map(|r| r.completed_at);
        Ok(JobStatus {
            exceptions,
            in_flight,
            last_completed_at,
            last_submitted_at,
        })
    }

    /// Serializable description. The model entry carries the model's
    /// effective parameters, defaults included.
    pub fn info(&self) -> ProgResult<SessionInfo> {
        let model = match self.inner.model.parameters() {
            serde_json::Value::Object(cfg) => ComponentSpec {
                name: self.inner.model_spec.name.clone(),
                cfg,
            },
            _ => self.inner.model_spec.clone(),
        };
        Ok(SessionInfo {
            id: self.inner.id,
            model,
            state_estimator: self.inner.estimator_spec.clone(),
            load_estimator: self.load_profile()?,
            predictor: self.inner.predictor_spec.clone(),
            initialized: self.is_initialized()?,
        })
    }

    /// Ends the session. Queued jobs are skipped and running jobs discard
    /// their results; nothing waits for them.
    pub fn end(&self) {
        if !self.inner.ended.swap(true, Ordering::AcqRel) {
            info!(session_id = %self.inner.id, "session ended");
        }
    }
}

fn ensure_state_keys(model: &dyn PrognosticsModel, x: &StateDistribution) -> ProgResult<()> {
    x.validate()?;
    let provided = x.key_set();
    if provided.len() != model.states().len() || !model.states().iter().all(|k| provided.contains(k)) {
        return Err(ValidationError::StateKeyMismatch {
            provided: provided.into_iter().collect(),
            expected: model.states().to_vec(),
        }
        .into());
    }
    Ok(())
}

impl SessionInner {
    fn lock_estimate(&self) -> ProgResult<std::sync::MutexGuard<'_, Option<Box<dyn StateEstimator>>>> {
        self.estimate.lock().map_err(|_| lock_err("session.estimate"))
    }

    fn lock_load(&self) -> ProgResult<std::sync::MutexGuard<'_, LoadProfile>> {
        self.load.lock().map_err(|_| lock_err("session.load"))
    }

    fn lock_results(&self) -> ProgResult<std::sync::MutexGuard<'_, Option<Arc<PredictionResult>>>> {
        self.results.lock().map_err(|_| lock_err("session.results"))
    }

    /// Publishes `prediction` unless one from a newer estimate revision is
    /// already published.
    fn publish(&self, basis_time: f64, revision: u64, prediction: Prediction) -> ProgResult<()> {
        let mut results = self.lock_results()?;
        let now = Utc::now();
        let completed_at = match results.as_ref() {
            Some(prev) if prev.revision > revision => {
                debug!(
                    session_id = %self.id,
                    revision,
                    published = prev.revision,
                    "discarding prediction older than published one"
                );
                return Ok(());
            }
            Some(prev) => now.max(prev.completed_at),
            None => now,
        };
        let Prediction {
            states,
            outputs,
            event_states,
            performance_metrics,
            time_of_event,
        } = prediction;
        *results = Some(Arc::new(PredictionResult {
            completed_at,
            basis_time,
            revision,
            states,
            outputs,
            event_states,
            performance_metrics,
            time_of_event,
        }));
        debug!(session_id = %self.id, basis_time, "prediction published");
        Ok(())
    }
}

impl PredictionTask for SessionInner {
    fn run_prediction(&self) -> ProgResult<()> {
        if self.is_detached() {
            return Ok(());
        }

        // `predict` takes `&self`, so a poisoned lock holds no torn state.
        let predictor = self.execution.lock().unwrap_or_else(PoisonError::into_inner);
        let (state, basis_time, revision) = {
            let estimate = self.lock_estimate()?;
            let est = estimate.as_ref().ok_or(ExecutionError::NotInitialized)?;
            (est.state(), est.time(), self.revision.load(Ordering::Acquire))
        };
        let mut load = self.lock_load()?.snapshot(basis_time, None)?;
        let prediction = predictor.predict(&state, &mut load, basis_time)?;
        drop(predictor);

        if self.is_detached() {
            debug!(session_id = %self.id, "session ended; discarding prediction");
            return Ok(());
        }
        self.publish(basis_time, revision, prediction)
    }

    fn is_detached(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }
}
