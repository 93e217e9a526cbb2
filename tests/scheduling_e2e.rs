use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;

use prognos::{
    ComponentCatalog, ComponentConfig, ExecutionError, LoadForecast, NamedVector, Prediction, Predictor,
    PrognosticsModel, PrognosticsService, ProgError, ProgResult, ScheduleOutcome, SchedulerConfig, ServiceConfig,
    SessionConfig, SessionId, StateDistribution, ValidationError,
};

/// Predictor that sleeps and tracks how many runs overlap.
#[derive(Debug)]
struct SlowPredictor {
    delay: Duration,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    runs: Arc<AtomicUsize>,
}

impl Predictor for SlowPredictor {
    fn predict(&self, _state: &StateDistribution, _load: &mut dyn LoadForecast, _t0: f64) -> ProgResult<Prediction> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        thread::sleep(self.delay);
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(Prediction::default())
    }
}

#[derive(Debug)]
struct BrokenPredictor;

impl Predictor for BrokenPredictor {
    fn predict(&self, _state: &StateDistribution, _load: &mut dyn LoadForecast, _t0: f64) -> ProgResult<Prediction> {
        Err(ExecutionError::Numerical {
            context: "BrokenPredictor".to_string(),
            reason: "diverged".to_string(),
        }
        .into())
    }
}

const TANK_AREA: f64 = 2.0;

/// Tank whose level can only be known from a measurement.
#[derive(Debug)]
struct Tank {
    inputs: Vec<String>,
    states: Vec<String>,
    outputs: Vec<String>,
    events: Vec<String>,
}

impl Tank {
    fn new() -> Self {
        Self {
            inputs: vec!["flow".to_string()],
            states: vec!["level".to_string()],
            outputs: vec!["level".to_string()],
            events: vec!["empty".to_string()],
        }
    }
}

impl PrognosticsModel for Tank {
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

    fn initialize(&self, _inputs: Option<&NamedVector>, outputs: Option<&NamedVector>) -> ProgResult<NamedVector> {
        let level = outputs
            .and_then(|z| z.get("level").copied())
            .ok_or_else(|| ValidationError::InsufficientData {
                reason: "tank level must be measured".to_string(),
            })?;
        Ok([("level".to_string(), level)].into_iter().collect())
    }

    fn next_state(&self, x: &NamedVector, u: &NamedVector, dt: f64) -> NamedVector {
        let level = x.get("level").copied().unwrap_or(0.0) + u.get("flow").copied().unwrap_or(0.0) * dt;
        [("level".to_string(), level)].into_iter().collect()
    }

    fn output(&self, x: &NamedVector) -> NamedVector {
        x.clone()
    }

    fn event_state(&self, x: &NamedVector) -> NamedVector {
        [("empty".to_string(), x.get("level").copied().unwrap_or(0.0) / 10.0)]
            .into_iter()
            .collect()
    }

    fn performance_metrics(&self, x: &NamedVector) -> NamedVector {
        [("volume".to_string(), x.get("level").copied().unwrap_or(0.0) * TANK_AREA)]
            .into_iter()
            .collect()
    }

    fn parameters(&self) -> serde_json::Value {
        json!({ "area": TANK_AREA })
    }
}

struct Counters {
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    runs: Arc<AtomicUsize>,
}

fn service_with(workers: usize) -> (PrognosticsService, Counters) {
    let counters = Counters {
        running: Arc::new(AtomicUsize::new(0)),
        peak: Arc::new(AtomicUsize::new(0)),
        runs: Arc::new(AtomicUsize::new(0)),
    };
    let mut catalog = ComponentCatalog::with_builtins();
    let (running, peak, runs) = (
        Arc::clone(&counters.running),
        Arc::clone(&counters.peak),
        Arc::clone(&counters.runs),
    );
    catalog
        .register_predictor("Slow", move |_model, cfg: &ComponentConfig| {
            let millis = cfg.get("delay_ms").and_then(serde_json::Value::as_u64).unwrap_or(100);
            Ok(Box::new(SlowPredictor {
                delay: Duration::from_millis(millis),
                running: Arc::clone(&running),
                peak: Arc::clone(&peak),
                runs: Arc::clone(&runs),
            }) as Box<dyn Predictor>)
        })
        .register_predictor("Broken", |_model, _cfg| Ok(Box::new(BrokenPredictor) as Box<dyn Predictor>))
        .register_model("Tank", |_cfg| Ok(Arc::new(Tank::new()) as Arc<dyn PrognosticsModel>));

    let svc = PrognosticsService::with_catalog(
        ServiceConfig {
            scheduler: SchedulerConfig {
                prediction_workers: workers,
                queue_capacity: 64,
            },
            ..ServiceConfig::default()
        },
        catalog,
    )
    .unwrap();
    (svc, counters)
}

fn thrown_with(svc: &PrognosticsService, predictor: &str, cfg: serde_json::Value) -> SessionId {
    svc.create_session(
        SessionConfig::new("ThrownObject")
            .state_estimator("ParticleFilter", json!({"x0_uncertainty": 0, "num_particles": 10}))
            .unwrap()
            .predictor(predictor, cfg)
            .unwrap(),
    )
    .unwrap()
}

fn x_obs(x: f64) -> NamedVector {
    [("x".to_string(), x)].into_iter().collect()
}

fn wait_idle(svc: &PrognosticsService, id: SessionId) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while svc.prediction_status(id).unwrap().in_flight > 0 {
        assert!(Instant::now() < deadline, "jobs did not finish");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn rapid_ingest_keeps_at_most_two_jobs() {
    let (svc, counters) = service_with(4);
    let id = thrown_with(&svc, "Slow", json!({"delay_ms": 50}));

    let mut coalesced = 0;
    for i in 1..=30 {
        let outcome = svc.ingest(id, f64::from(i) * 0.01, &NamedVector::new(), &x_obs(2.0)).unwrap();
        if outcome == ScheduleOutcome::Coalesced {
            coalesced += 1;
        }
        let status = svc.prediction_status(id).unwrap();
        assert!(status.in_flight <= 2, "in flight: {}", status.in_flight);
    }
    assert!(coalesced > 0);

    wait_idle(&svc, id);
    // The execution lock serializes predictions within a session.
    assert_eq!(counters.peak.load(Ordering::SeqCst), 1);
    assert!(counters.runs.load(Ordering::SeqCst) < 30);
    assert_eq!(counters.running.load(Ordering::SeqCst), 0);
}

#[test]
fn job_status_returns_while_prediction_runs() {
    let (svc, counters) = service_with(2);
    let id = thrown_with(&svc, "Slow", json!({"delay_ms": 400}));

    let deadline = Instant::now() + Duration::from_secs(5);
    while counters.running.load(Ordering::SeqCst) == 0 {
        assert!(Instant::now() < deadline, "prediction never started");
        thread::sleep(Duration::from_millis(2));
    }

    let started = Instant::now();
    let status = svc.prediction_status(id).unwrap();
    let snapshot = svc.state(id).unwrap();
    svc.ingest(id, 0.1, &NamedVector::new(), &x_obs(5.0)).unwrap();
    assert!(started.elapsed() < Duration::from_millis(100));
    assert_eq!(status.in_flight, 1);
    assert!(status.last_completed_at.is_none());
    assert_eq!(snapshot.time, 0.0);

    let err = svc.prediction(id).unwrap_err();
    assert!(matches!(err, ProgError::Execution(ExecutionError::NoCompletedPrediction)));
    assert!(err.is_retryable());

    wait_idle(&svc, id);
    let status = svc.prediction_status(id).unwrap();
    assert!(status.last_completed_at.is_some());
    assert!(status.exceptions.is_empty());
}

#[test]
fn failed_prediction_surfaces_in_status_only() {
    let (svc, _counters) = service_with(2);
    let id = thrown_with(&svc, "Broken", json!({}));

    wait_idle(&svc, id);
    let status = svc.prediction_status(id).unwrap();
    assert_eq!(status.exceptions.len(), 1);
    assert!(status.exceptions[0].contains("diverged"));

    // The session keeps accepting data.
    svc.ingest(id, 0.1, &NamedVector::new(), &x_obs(5.0)).unwrap();
    wait_idle(&svc, id);
    assert_eq!(svc.prediction_status(id).unwrap().exceptions.len(), 2);
    assert!(svc.prediction(id).unwrap_err().is_retryable());
}

#[test]
fn model_initializes_from_first_observation() {
    let (svc, _counters) = service_with(2);
    let id = svc
        .create_session(
            SessionConfig::new("Tank")
                .state_estimator("ParticleFilter", json!({"x0_uncertainty": 0, "num_particles": 10}))
                .unwrap()
                .predictor("MonteCarlo", json!({"n_samples": 3, "horizon": 5.0}))
                .unwrap(),
        )
        .unwrap();

    assert!(!svc.initialized(id).unwrap());
    assert!(matches!(
        svc.state(id).unwrap_err(),
        ProgError::Execution(ExecutionError::NotInitialized)
    ));
    assert!(matches!(
        svc.prediction_status(id).unwrap_err(),
        ProgError::Execution(ExecutionError::NotInitialized)
    ));
    assert!(matches!(
        svc.prediction(id).unwrap_err(),
        ProgError::Execution(ExecutionError::NotInitialized)
    ));

    let level: NamedVector = [("level".to_string(), 4.0)].into_iter().collect();
    let err = svc.ingest(id, 2.0, &NamedVector::new(), &level).unwrap_err();
    let ProgError::Validation(ValidationError::MissingData { missing, inputs, .. }) = err else {
        panic!("expected MissingData, got {err:?}");
    };
    assert_eq!(missing, vec!["flow".to_string()]);
    assert_eq!(inputs, vec!["flow".to_string()]);
    assert!(!svc.initialized(id).unwrap());

    let flow: NamedVector = [("flow".to_string(), 0.5)].into_iter().collect();
    svc.ingest(id, 2.0, &flow, &level).unwrap();
    assert!(svc.initialized(id).unwrap());
    let snapshot = svc.state(id).unwrap();
    assert_eq!(snapshot.time, 2.0);
    assert!((snapshot.state.mean()["level"] - 4.0).abs() < 1e-9);

    wait_idle(&svc, id);
    let result = svc.prediction(id).unwrap();
    assert_eq!(result.basis_time, 2.0);
    // Moving-average load of 0.5 fills the tank: it never empties within the horizon.
    assert_eq!(result.time_of_event.probability("empty"), 0.0);
    let last = result.states.means().last().cloned().unwrap();
    assert!(last.1["level"] > 4.0);

    let volumes = svc.predicted_performance_metrics(id).unwrap();
    assert_eq!(volumes.times, result.states.times);
    for ((_, metrics), (_, state)) in volumes.means().iter().zip(result.states.means()) {
        assert!((metrics["volume"] - state["level"] * TANK_AREA).abs() < 1e-9);
    }
    assert!((svc.performance_metrics(id).unwrap().state.mean()["volume"] - 8.0).abs() < 1e-9);
    assert_eq!(svc.session_info(id).unwrap().model.cfg["area"], TANK_AREA);
}

#[test]
fn moving_average_without_inputs_fails_job_not_call() {
    let (svc, _counters) = service_with(1);
    let x0: NamedVector = [("level".to_string(), 3.0)].into_iter().collect();
    let id = svc
        .create_session(
            SessionConfig::new("Tank")
                .predictor("MonteCarlo", json!({"n_samples": 1, "horizon": 1.0}))
                .unwrap()
                .initial_state(x0),
        )
        .unwrap();
    assert!(svc.initialized(id).unwrap());

    wait_idle(&svc, id);
    let status = svc.prediction_status(id).unwrap();
    assert_eq!(status.exceptions.len(), 1);
    assert!(status.exceptions[0].contains("flow"));

    let out = svc
        .set_load_estimator(id, "Constant", json!({"load": {"flow": -1.0}}).as_object().cloned().unwrap(), true)
        .unwrap();
    assert!(matches!(out, Some(ScheduleOutcome::Submitted(_))));
    wait_idle(&svc, id);
    assert!(svc.prediction(id).is_ok());
    assert_eq!(svc.load_profile(id).unwrap().name, "Constant");
}

#[test]
fn concurrent_creation_yields_distinct_ids() {
    let (svc, _counters) = service_with(2);
    let svc = Arc::new(svc);
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let svc = Arc::clone(&svc);
            thread::spawn(move || {
                (0..5)
                    .map(|_| {
                        svc.create_session(
                            SessionConfig::new("ThrownObject")
                                .predictor("MonteCarlo", json!({"n_samples": 1, "dt": 0.5}))
                                .unwrap(),
                        )
                        .unwrap()
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let ids: Vec<SessionId> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
    let unique: HashSet<SessionId> = ids.iter().copied().collect();
    assert_eq!(ids.len(), 40);
    assert_eq!(unique.len(), 40);
    assert_eq!(svc.list_sessions().unwrap().len(), 40);

    let infos: BTreeMap<SessionId, bool> = ids
        .iter()
        .map(|id| (*id, svc.session_info(*id).unwrap().initialized))
        .collect();
    assert!(infos.values().all(|initialized| *initialized));
    svc.shutdown().unwrap();
    assert!(svc.list_sessions().unwrap().is_empty());
}

#[test]
fn ending_session_detaches_running_job() {
    let (svc, counters) = service_with(1);
    let id = thrown_with(&svc, "Slow", json!({"delay_ms": 200}));

    let deadline = Instant::now() + Duration::from_secs(5);
    while counters.running.load(Ordering::SeqCst) == 0 {
        assert!(Instant::now() < deadline, "prediction never started");
        thread::sleep(Duration::from_millis(2));
    }
    let session = svc.session(id).unwrap();

    let started = Instant::now();
    svc.end_session(id).unwrap();
    assert!(started.elapsed() < Duration::from_millis(100));
    assert!(session.is_ended());

    while counters.running.load(Ordering::SeqCst) > 0 {
        assert!(Instant::now() < deadline, "prediction never finished");
        thread::sleep(Duration::from_millis(2));
    }
    thread::sleep(Duration::from_millis(20));
    // The result was discarded rather than published.
    assert!(matches!(
        session.latest_prediction().unwrap_err(),
        ProgError::Execution(ExecutionError::NoCompletedPrediction)
    ));
}
