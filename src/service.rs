//! Request surface over the registry, catalog and scheduler.

use std::sync::Arc;

use tracing::info;

use crate::catalog::ComponentCatalog;
use crate::config::{ComponentConfig, ComponentSpec, ServiceConfig, SessionConfig};
use crate::error::ProgResult;
use crate::registry::{SessionId, SessionRegistry};
use crate::scheduler::{PredictionScheduler, ScheduleOutcome};
use crate::predictor::Trajectory;
use crate::session::{JobStatus, PredictionResult, Session, SessionInfo, Snapshot};
use crate::state::{NamedVector, StateDistribution};

/// A prognostics service: owns every session and the shared prediction workers.
///
/// All operations address sessions by id and fail with `SessionNotFound` for
/// ids that were never issued or whose session has ended.
#[derive(Debug)]
pub struct PrognosticsService {
    config: ServiceConfig,
    catalog: Arc<ComponentCatalog>,
    registry: SessionRegistry,
    scheduler: Arc<PredictionScheduler>,
}

impl PrognosticsService {
    /// Starts a service with the built-in components.
    pub fn new(config: ServiceConfig) -> ProgResult<Self> {
        Self::with_catalog(config, ComponentCatalog::with_builtins())
    }

    /// Starts a service with a custom component catalog.
    pub fn with_catalog(config: ServiceConfig, catalog: ComponentCatalog) -> ProgResult<Self> {
        let scheduler = Arc::new(PredictionScheduler::new(&config.scheduler)?);
        info!(
            workers = scheduler.workers(),
            queue_capacity = scheduler.queue_capacity(),
            "prognostics service started"
        );
        Ok(Self {
            config,
            catalog: Arc::new(catalog),
            registry: SessionRegistry::new(),
            scheduler,
        })
    }

    /// Effective configuration.
    #[must_use]
    pub const fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Component catalog in use.
    #[must_use]
    pub fn catalog(&self) -> &ComponentCatalog {
        &self.catalog
    }

    /// Shared prediction scheduler.
    #[must_use]
    pub fn scheduler(&self) -> &PredictionScheduler {
        &self.scheduler
    }

    /// Creates a session and returns its id.
    pub fn create_session(&self, config: SessionConfig) -> ProgResult<SessionId> {
        let id = self.registry.allocate_id();
        let session = Session::create(
            id,
            config,
            &self.config.defaults,
            Arc::clone(&self.catalog),
            Arc::clone(&self.scheduler),
        )?;
        self.registry.insert(session)?;
        Ok(id)
    }

    /// Handle to a live session.
    pub fn session(&self, id: SessionId) -> ProgResult<Session> {
        self.registry.get(id)
    }

    /// Ids of live sessions, ascending.
    pub fn list_sessions(&self) -> ProgResult<Vec<SessionId>> {
        self.registry.ids()
    }

    /// Description of a session.
    pub fn session_info(&self, id: SessionId) -> ProgResult<SessionInfo> {
        self.session(id)?.info()
    }

    /// Whether a session has a state estimate.
    pub fn initialized(&self, id: SessionId) -> ProgResult<bool> {
        self.session(id)?.is_initialized()
    }

    /// Replaces a session's state.
    pub fn set_state(&self, id: SessionId, x: StateDistribution) -> ProgResult<ScheduleOutcome> {
        self.session(id)?.set_state(x)
    }

    /// Sends one observation to a session.
    pub fn ingest(
        &self,
        id: SessionId,
        time: f64,
        inputs: &NamedVector,
        outputs: &NamedVector,
    ) -> ProgResult<ScheduleOutcome> {
        self.session(id)?.ingest(time, inputs, outputs)
    }

    /// Swaps a session's load estimator.
    pub fn set_load_estimator(
        &self,
        id: SessionId,
        name: &str,
        cfg: ComponentConfig,
        trigger: bool,
    ) -> ProgResult<Option<ScheduleOutcome>> {
        self.session(id)?.set_load_estimator(name, cfg, trigger)
    }

    /// A session's load estimator.
    pub fn load_profile(&self, id: SessionId) -> ProgResult<ComponentSpec> {
        self.session(id)?.load_profile()
    }

    /// A session's current belief.
    pub fn state(&self, id: SessionId) -> ProgResult<Snapshot> {
        self.session(id)?.snapshot()
    }

    /// Expected outputs for a session's current belief.
    pub fn output(&self, id: SessionId) -> ProgResult<Snapshot> {
        self.session(id)?.output_snapshot()
    }

    /// Event states for a session's current belief.
    pub fn event_state(&self, id: SessionId) -> ProgResult<Snapshot> {
        self.session(id)?.event_state_snapshot()
    }

    /// Performance metrics for a session's current belief.
    pub fn performance_metrics(&self, id: SessionId) -> ProgResult<Snapshot> {
        self.session(id)?.performance_metrics_snapshot()
    }

    /// A session's latest prediction.
    pub fn prediction(&self, id: SessionId) -> ProgResult<Arc<PredictionResult>> {
        self.session(id)?.latest_prediction()
    }

    /// Performance metrics along a session's latest prediction.
    pub fn predicted_performance_metrics(&self, id: SessionId) -> ProgResult<Trajectory> {
        Ok(self.prediction(id)?.performance_metrics.clone())
    }

    /// A session's background job status.
    pub fn prediction_status(&self, id: SessionId) -> ProgResult<JobStatus> {
        self.session(id)?.job_status()
    }

    /// Ends and removes a session.
    pub fn end_session(&self, id: SessionId) -> ProgResult<()> {
        self.registry.remove(id).map(|_| ())
    }

    /// Ends every session, then drains and joins the workers.
    pub fn shutdown(&self) -> ProgResult<()> {
        self.registry.clear()?;
        self.scheduler.shutdown()?;
        info!("prognostics service stopped");
        Ok(())
    }
}
