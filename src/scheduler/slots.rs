//! Job handles and the per-session two-slot coalescing state.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ExecutionError;

/// Unique identifier for a prediction job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    /// Creates a new random job ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job:{}", self.0)
    }
}

/// Lifecycle of a prediction job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    /// Queued, not yet picked up by a worker.
    Pending,
    /// A worker is executing it.
    Running,
    /// Finished and its result was handed to the session.
    Completed,
    /// Finished with an error or panic.
    Failed,
    /// Skipped or discarded because its session ended.
    Detached,
}

impl JobPhase {
    const fn as_u8(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Completed => 2,
            Self::Failed => 3,
            Self::Detached => 4,
        }
    }

    const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Pending,
            1 => Self::Running,
            2 => Self::Completed,
            3 => Self::Failed,
            _ => Self::Detached,
        }
    }

    /// True once the job will never run again.
    #[must_use]
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Detached)
    }
}

#[derive(Debug)]
struct JobCell {
    id: JobId,
    phase: AtomicU8,
    error: OnceLock<ExecutionError>,
    submitted_at: DateTime<Utc>,
}

/// Shared view of a submitted job. Every accessor is non-blocking.
#[derive(Debug, Clone)]
pub struct JobHandle {
    cell: Arc<JobCell>,
}

impl JobHandle {
    pub(crate) fn new() -> Self {
        Self {
            cell: Arc::new(JobCell {
                id: JobId::new(),
                phase: AtomicU8::new(JobPhase::Pending.as_u8()),
                error: OnceLock::new(),
                submitted_at: Utc::now(),
            }),
        }
    }

    /// Job identifier.
    #[must_use]
    pub fn id(&self) -> JobId {
        self.cell.id
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> JobPhase {
        JobPhase::from_u8(self.cell.phase.load(Ordering::Acquire))
    }

    /// True once the job completed, failed or was detached.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.phase().is_finished()
    }

    /// Failure, if the job failed.
    #[must_use]
    pub fn error(&self) -> Option<&ExecutionError> {
        if self.phase() == JobPhase::Failed {
            self.cell.error.get()
        } else {
            None
        }
    }

    /// When the job was handed to the worker queue.
    #[must_use]
    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.cell.submitted_at
    }

    pub(crate) fn set_phase(&self, phase: JobPhase) {
        self.cell.phase.store(phase.as_u8(), Ordering::Release);
    }

    pub(crate) fn fail(&self, message: impl Into<String>) {
        let _ = self.cell.error.set(ExecutionError::PredictionJob {
            message: message.into(),
        });
        self.set_phase(JobPhase::Failed);
    }
}

/// What to do with a new trigger given the current slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotDecision {
    /// Move the newest job into the previous slot and submit into the newest.
    Rotate,
    /// Submit into the newest slot, replacing its finished job.
    ReplaceNewest,
    /// Both slots are busy; do nothing.
    Skip,
}

/// Decides how to place a new job given the phases of the two slots.
///
/// `None` means the slot is empty.
#[must_use]
pub fn coalesce(newest: Option<JobPhase>, previous: Option<JobPhase>) -> SlotDecision {
    let free = |p: Option<JobPhase>| p.map_or(true, JobPhase::is_finished);
    if free(previous) {
        SlotDecision::Rotate
    } else if free(newest) {
        SlotDecision::ReplaceNewest
    } else {
        SlotDecision::Skip
    }
}

/// The two most recent prediction jobs of a session.
#[derive(Debug, Clone, Default)]
pub struct JobSlots {
    newest: Option<JobHandle>,
    previous: Option<JobHandle>,
}

impl JobSlots {
    /// Decision for the next trigger.
    #[must_use]
    pub fn decide(&self) -> SlotDecision {
        coalesce(
            self.newest.as_ref().map(JobHandle::phase),
            self.previous.as_ref().map(JobHandle::phase),
        )
    }

    /// Places an already submitted job according to `decision`.
    pub fn place(&mut self, decision: SlotDecision, job: JobHandle) {
        match decision {
            SlotDecision::Rotate => {
                self.previous = self.newest.take();
                self.newest = Some(job);
            }
            SlotDecision::ReplaceNewest => self.newest = Some(job),
            SlotDecision::Skip => {}
        }
    }

    /// Most recently submitted job.
    #[must_use]
    pub const fn newest(&self) -> Option<&JobHandle> {
        self.newest.as_ref()
    }

    /// Job submitted before the newest one.
    #[must_use]
    pub const fn previous(&self) -> Option<&JobHandle> {
        self.previous.as_ref()
    }

    /// Both slots, newest first.
    pub fn iter(&self) -> impl Iterator<Item = &JobHandle> {
        self.newest.iter().chain(self.previous.iter())
    }

    /// Jobs pending or running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.iter().filter(|j| !j.is_finished()).count()
    }

    /// Failures of failed jobs rendered as messages, newest first.
    #[must_use]
    pub fn errors(&self) -> Vec<String> {
        self.iter().filter_map(|j| j.error().map(ToString::to_string)).collect()
    }

    /// Submission time of the newest job.
    #[must_use]
    pub fn last_submitted_at(&self) -> Option<DateTime<Utc>> {
        self.newest.as_ref().map(JobHandle::submitted_at)
    }
}
