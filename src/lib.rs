//! # Prognos - Prognostics as a Service
//!
//! Prognos hosts many independent prognostics sessions in one process. Each
//! session wraps a physical-system model, keeps a running state estimate from
//! streamed observations and refreshes a prediction of future states and event
//! times on a shared pool of background workers.
//!
//! ## Core Concepts
//!
//! - **Session**: one model instance with its estimator, load estimator and predictor
//! - **State estimate**: a probabilistic belief over the model state, tagged with a time
//! - **Load estimator**: forecasts future model inputs for forward simulation
//! - **Prediction**: simulated trajectories and a time-of-event distribution
//! - **Coalescing**: at most two prediction jobs per session; extra triggers fold in
//!
//! ## Usage
//!
//! ```rust,ignore
//! use prognos::{PrognosticsService, ServiceConfig, SessionConfig};
//!
//! let service = PrognosticsService::new(ServiceConfig::default().apply_env()?)?;
//! let id = service.create_session(
//!     SessionConfig::new("ThrownObject")
//!         .state_estimator("ParticleFilter", serde_json::json!({"x0_uncertainty": 0}))?,
//! )?;
//!
//! service.ingest(id, 0.1, &inputs, &outputs)?;
//! let belief = service.state(id)?;
//! let status = service.prediction_status(id)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod config;
pub mod error;
pub mod state;

// Components
pub mod catalog;
pub mod estimator;
pub mod load;
pub mod model;
pub mod predictor;

// Sessions and execution
pub mod registry;
pub mod scheduler;
pub mod service;
pub mod session;

// Re-export primary types at crate root for convenience
pub use catalog::ComponentCatalog;
pub use config::{ComponentConfig, ComponentSpec, DefaultComponents, SchedulerConfig, ServiceConfig, SessionConfig};
pub use error::{ConfigurationError, ExecutionError, ProgError, ProgResult, ValidationError};
pub use estimator::{ParticleFilter, ParticleFilterParams, StateEstimator};
pub use load::{InputWindow, LoadEstimator, LoadForecast, LoadProfile, MovingAverageParams};
pub use model::{NoiseSpec, PrognosticsModel, ThrownObject, ThrownObjectParams};
pub use predictor::{EventTimes, MonteCarlo, MonteCarloParams, Prediction, Predictor, Trajectory};
pub use registry::{SessionId, SessionRegistry};
pub use scheduler::{JobHandle, JobId, JobPhase, JobSlots, PredictionScheduler, PredictionTask, ScheduleOutcome};
pub use service::PrognosticsService;
pub use session::{JobStatus, PredictionResult, Session, SessionInfo, Snapshot};
pub use state::{DistributionMetrics, NamedVector, StateDistribution};
