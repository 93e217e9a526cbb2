use std::time::{Duration, Instant};

use serde_json::json;

use prognos::{
    ExecutionError, NamedVector, PrognosticsModel, PrognosticsService, ProgError, SchedulerConfig, ServiceConfig,
    SessionConfig, SessionId, StateDistribution, ThrownObject, ValidationError,
};

fn service() -> PrognosticsService {
    PrognosticsService::new(ServiceConfig {
        scheduler: SchedulerConfig {
            prediction_workers: 2,
            queue_capacity: 64,
        },
        ..ServiceConfig::default()
    })
    .unwrap()
}

fn vector(pairs: &[(&str, f64)]) -> NamedVector {
    pairs.iter().map(|(k, v)| ((*k).to_string(), *v)).collect()
}

fn exact_session(svc: &PrognosticsService, x0: NamedVector) -> SessionId {
    svc.create_session(
        SessionConfig::new("ThrownObject")
            .state_estimator("ParticleFilter", json!({"x0_uncertainty": 0, "num_particles": 25, "seed": 7}))
            .unwrap()
            .predictor("MonteCarlo", json!({"n_samples": 5, "dt": 0.05, "save_freq": 0.5, "seed": 7}))
            .unwrap()
            .initial_state(x0),
    )
    .unwrap()
}

fn wait_for_basis(svc: &PrognosticsService, id: SessionId, basis_time: f64) -> prognos::PredictionResult {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        match svc.prediction(id) {
            Ok(result) if (result.basis_time - basis_time).abs() < 1e-9 => return (*result).clone(),
            Ok(_) => {}
            Err(err) => assert!(err.is_retryable(), "unexpected error: {err}"),
        }
        assert!(Instant::now() < deadline, "no prediction with basis time {basis_time}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn tracking_gravity_reduces_velocity_monotonically() {
    let svc = service();
    let id = exact_session(&svc, vector(&[("x", 0.0), ("v", 20.0)]));
    assert!(svc.initialized(id).unwrap());

    let model = ThrownObject::default();
    let mut truth = vector(&[("x", 0.0), ("v", 20.0)]);
    let mut last_v = svc.state(id).unwrap().state.mean()["v"];
    assert!((last_v - 20.0).abs() < 1e-9);

    for i in 1..=10 {
        truth = model.next_state(&truth, &NamedVector::new(), 0.1);
        let z = model.output(&truth);
        svc.ingest(id, f64::from(i) / 10.0, &NamedVector::new(), &z).unwrap();

        let snapshot = svc.state(id).unwrap();
        let v = snapshot.state.mean()["v"];
        assert!(v < last_v, "velocity did not decrease at step {i}: {v} >= {last_v}");
        last_v = v;
    }

    assert!((last_v - (20.0 - 9.81)).abs() < 1e-6, "final velocity {last_v}");
    let snapshot = svc.state(id).unwrap();
    assert!((snapshot.time - 1.0).abs() < 1e-9);
}

#[test]
fn prediction_reports_impact_after_ingest() {
    let svc = service();
    let id = exact_session(&svc, vector(&[("x", 0.0), ("v", 20.0)]));
    svc.ingest(id, 0.5, &NamedVector::new(), &vector(&[("x", 8.77)])).unwrap();

    let result = wait_for_basis(&svc, id, 0.5);
    let impact = result.time_of_event.mean()["impact"].unwrap();
    // Launched at 20 m/s from the ground: impact a little after 4 s.
    assert!(impact > 3.5 && impact < 4.5, "impact at {impact}");
    assert_eq!(result.time_of_event.probability("falling"), 1.0);
    assert_eq!(result.states.times[0], 0.5);
    assert_eq!(result.outputs.len(), result.states.len());
    assert!(result.event_states.times.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn completed_at_never_moves_backwards() {
    let svc = service();
    let id = exact_session(&svc, vector(&[("x", 0.0), ("v", 20.0)]));
    let model = ThrownObject::default();
    let mut truth = vector(&[("x", 0.0), ("v", 20.0)]);

    let mut seen = Vec::new();
    for i in 1..=5 {
        truth = model.next_state(&truth, &NamedVector::new(), 0.1);
        svc.ingest(id, f64::from(i) / 10.0, &NamedVector::new(), &model.output(&truth))
            .unwrap();
        if let Ok(result) = svc.prediction(id) {
            seen.push((result.completed_at, result.basis_time));
        }
    }
    let deadline = Instant::now() + Duration::from_secs(10);
    while svc.prediction_status(id).unwrap().in_flight > 0 {
        assert!(Instant::now() < deadline, "jobs did not finish");
        std::thread::sleep(Duration::from_millis(5));
    }
    let last = svc.prediction(id).unwrap();
    seen.push((last.completed_at, last.basis_time));
    assert!(last.basis_time > 0.0);

    assert!(seen.windows(2).all(|w| w[0].0 <= w[1].0), "completed_at regressed: {seen:?}");
    assert!(seen.windows(2).all(|w| w[0].1 <= w[1].1), "basis time regressed: {seen:?}");
}

#[test]
fn numerically_failed_ingest_keeps_session_usable() {
    let svc = service();
    let id = exact_session(&svc, vector(&[("x", 0.0), ("v", 20.0)]));
    let before = svc.state(id).unwrap();

    let err = svc
        .ingest(id, 1e308, &NamedVector::new(), &vector(&[("x", 1.0)]))
        .unwrap_err();
    assert!(matches!(err, ProgError::Execution(ExecutionError::Numerical { .. })));
    assert_eq!(svc.state(id).unwrap(), before);

    svc.ingest(id, 0.1, &NamedVector::new(), &vector(&[("x", 1.95)])).unwrap();
    let after = svc.state(id).unwrap();
    assert!((after.time - 0.1).abs() < 1e-12);
    assert!(after.state.mean()["x"].is_finite());
}

#[test]
fn set_state_round_trip_and_key_mismatch() {
    let svc = service();
    let id = exact_session(&svc, vector(&[("x", 0.0), ("v", 20.0)]));

    svc.set_state(id, StateDistribution::scalar(vector(&[("x", 3.0), ("v", -1.0)])))
        .unwrap();
    let mean = svc.state(id).unwrap().state.mean();
    assert!((mean["x"] - 3.0).abs() < 1e-9);
    assert!((mean["v"] + 1.0).abs() < 1e-9);

    let before = svc.state(id).unwrap();
    let err = svc
        .set_state(id, StateDistribution::scalar(vector(&[("x", 3.0), ("a", 1.0)])))
        .unwrap_err();
    assert!(matches!(err, ProgError::Validation(ValidationError::StateKeyMismatch { .. })));
    let err = svc
        .set_state(id, StateDistribution::scalar(vector(&[("x", 3.0)])))
        .unwrap_err();
    assert!(err.is_validation());
    assert_eq!(svc.state(id).unwrap(), before);
}

#[test]
fn normal_initial_state_is_sampled() {
    let svc = service();
    let x0 = StateDistribution::multivariate_normal(
        vec!["x".to_string(), "v".to_string()],
        vec![2.0, 30.0],
        vec![vec![0.25, 0.0], vec![0.0, 1.0]],
    )
    .unwrap();
    let id = svc
        .create_session(
            SessionConfig::new("ThrownObject")
                .state_estimator("ParticleFilter", json!({"num_particles": 500, "seed": 1}))
                .unwrap()
                .initial_state(x0),
        )
        .unwrap();
    let metrics = svc.state(id).unwrap().state.metrics();
    assert!((metrics["x"].mean - 2.0).abs() < 1e-6);
    assert!((metrics["v"].std - 1.0).abs() < 0.2);
}

#[test]
fn derived_readings_and_deletion() {
    let svc = service();
    let id = exact_session(&svc, vector(&[("x", 10.0), ("v", 0.0)]));

    let output = svc.output(id).unwrap();
    assert!((output.state.mean()["x"] - 10.0).abs() < 1e-9);
    let event_state = svc.event_state(id).unwrap();
    assert!(event_state.state.mean()["falling"].abs() < 1e-9);
    assert!(event_state.state.mean()["impact"] > 0.0);
    assert!(svc.performance_metrics(id).unwrap().state.mean().is_empty());

    svc.end_session(id).unwrap();
    let err = svc.state(id).unwrap_err();
    assert!(matches!(err, ProgError::Execution(ExecutionError::SessionNotFound { .. })));
    assert!(svc.list_sessions().unwrap().is_empty());
}

#[test]
fn invalid_component_configuration_is_rejected() {
    let svc = service();
    for config in [
        SessionConfig::new("ThrownObject").model_cfg(json!({"process_noise": {"fake_state": 0.1}})),
        SessionConfig::new("ThrownObject").state_estimator("ParticleFilter", json!({"num_particles": 0})),
        SessionConfig::new("ThrownObject").predictor("MonteCarlo", json!({"dt": -1.0})),
        SessionConfig::new("ThrownObject").load_estimator("Constant", json!({})),
        SessionConfig::new("ThrownObject").load_estimator("fake_load_est", json!({})),
    ] {
        let err = svc.create_session(config.unwrap()).unwrap_err();
        assert!(err.is_configuration(), "expected configuration error, got {err}");
    }
    assert!(svc.list_sessions().unwrap().is_empty());
}
