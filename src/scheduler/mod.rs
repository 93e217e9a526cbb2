//! Background prediction scheduling.
//!
//! Predictions are slow, so sessions never run them on the caller's thread.
//! A `PredictionScheduler` owns a fixed pool of named worker threads fed by a
//! bounded queue; each session keeps at most two jobs in its [`JobSlots`] and
//! coalesces further triggers instead of queueing them.

mod slots;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
#[cfg(test)]
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{debug, warn};

use crate::config::SchedulerConfig;
use crate::error::{lock_err, ExecutionError, ProgError, ProgResult};

pub use slots::{coalesce, JobHandle, JobId, JobPhase, JobSlots, SlotDecision};

const POOL_PATH: &str = "prediction";

/// Work a scheduler can run in the background.
pub trait PredictionTask: Send + Sync {
    /// Runs one prediction and publishes its result.
    fn run_prediction(&self) -> ProgResult<()>;

    /// True once the owner no longer wants results.
    fn is_detached(&self) -> bool;
}

/// Result of a scheduling attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// A new job was queued.
    Submitted(JobId),
    /// Both slots were busy; the trigger folded into the outstanding jobs.
    Coalesced,
    /// The worker queue was full or closed; nothing was queued.
    Rejected,
}

enum Job {
    Predict {
        task: Arc<dyn PredictionTask>,
        handle: JobHandle,
    },

    #[cfg(test)]
    Sleep {
        duration: Duration,
        reply: Sender<()>,
    },
}

struct WorkerPool {
    tx: Sender<Job>,
    workers: Vec<JoinHandle<()>>,
    queue_capacity: usize,
}

impl WorkerPool {
    fn start(workers: usize, queue_capacity: usize) -> ProgResult<Self> {
        let workers = workers.max(1);
        let queue_capacity = queue_capacity.max(1);
        let (tx, rx) = bounded::<Job>(queue_capacity);

        let mut handles = Vec::with_capacity(workers);
        for idx in 0..workers {
            let rx: Receiver<Job> = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("prognos-{POOL_PATH}-{idx}"))
                .spawn(move || loop {
                    match rx.recv() {
                        Ok(Job::Predict { task, handle }) => run_job(task.as_ref(), &handle),
                        Err(_) => break,

                        #[cfg(test)]
                        Ok(Job::Sleep { duration, reply }) => {
                            thread::sleep(duration);
                            let _ = reply.send(());
                        }
                    }
                })
                .map_err(|e| ProgError::internal(format!("failed to spawn prediction worker: {e}")))?;
            handles.push(handle);
        }

        Ok(Self {
            tx,
            workers: handles,
            queue_capacity,
        })
    }

    fn try_submit(&self, job: Job) -> ProgResult<()> {
        match self.tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ExecutionError::QueueFull {
                capacity: self.queue_capacity,
            }
            .into()),
            Err(TrySendError::Disconnected(_)) => Err(ExecutionError::Disconnected {
                path: POOL_PATH.to_string(),
            }
            .into()),
        }
    }

    fn shutdown(self) {
        // Close the channel: workers drain queued jobs then exit.
        drop(self.tx);
        for handle in self.workers {
            let _ = handle.join();
        }
    }
}

fn run_job(task: &dyn PredictionTask, handle: &JobHandle) {
    if task.is_detached() {
        handle.set_phase(JobPhase::Detached);
        debug!(job_id = %handle.id(), "skipping prediction for ended session");
        return;
    }

    handle.set_phase(JobPhase::Running);
    match panic::catch_unwind(AssertUnwindSafe(|| task.run_prediction())) {
        Ok(Ok(())) if task.is_detached() => handle.set_phase(JobPhase::Detached),
        Ok(Ok(())) => handle.set_phase(JobPhase::Completed),
        Ok(Err(err)) => {
            warn!(job_id = %handle.id(), error = %err, "prediction job failed");
            handle.fail(err.to_string());
        }
        Err(payload) => {
            let message = format!("prediction panicked: {}", panic_message(payload.as_ref()));
            warn!(job_id = %handle.id(), error = %message, "prediction job failed");
            handle.fail(message);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

/// Process-wide prediction worker pool shared by all sessions.
///
/// `shutdown` drains the queue and joins the workers. Dropping the scheduler
/// without calling it closes the queue and detaches the workers, which exit
/// after finishing whatever is already queued.
pub struct PredictionScheduler {
    pool: RwLock<Option<WorkerPool>>,
    workers: usize,
    queue_capacity: usize,
    rejected: AtomicU64,
}

impl std::fmt::Debug for PredictionScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredictionScheduler")
            .field("workers", &self.workers)
            .field("queue_capacity", &self.queue_capacity)
            .field("rejected", &self.rejected_count())
            .finish_non_exhaustive()
    }
}

impl PredictionScheduler {
    /// Starts the worker pool.
    pub fn new(config: &SchedulerConfig) -> ProgResult<Self> {
        let pool = WorkerPool::start(config.prediction_workers, config.queue_capacity)?;
        debug!(
            workers = pool.workers.len(),
            queue_capacity = pool.queue_capacity,
            "prediction scheduler started"
        );
        Ok(Self {
            workers: pool.workers.len(),
            queue_capacity: pool.queue_capacity,
            pool: RwLock::new(Some(pool)),
            rejected: AtomicU64::new(0),
        })
    }

    /// Number of worker threads.
    #[must_use]
    pub const fn workers(&self) -> usize {
        self.workers
    }

    /// Maximum queued jobs.
    #[must_use]
    pub const fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// Triggers rejected because the queue was full or closed.
    #[must_use]
    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    fn try_submit(&self, job: Job) -> ProgResult<()> {
        let guard = self.pool.read().map_err(|_| lock_err("scheduler.pool"))?;
        match guard.as_ref() {
            Some(pool) => pool.try_submit(job),
            None => Err(ExecutionError::Disconnected {
                path: POOL_PATH.to_string(),
            }
            .into()),
        }
    }

    /// Queues `task` unconditionally and returns its handle.
    pub fn submit(&self, task: Arc<dyn PredictionTask>) -> ProgResult<JobHandle> {
        let handle = JobHandle::new();
        self.try_submit(Job::Predict {
            task,
            handle: handle.clone(),
        })?;
        Ok(handle)
    }

    /// Coalescing submit: decides against `slots`, submits when there is room
    /// and records the new job.
    ///
    /// `slots` stays locked across the submit so concurrent triggers cannot
    /// both claim the same slot. A full or closed queue is logged and reported
    /// as [`ScheduleOutcome::Rejected`]; it is not an error.
    pub fn trigger(&self, slots: &Mutex<JobSlots>, task: Arc<dyn PredictionTask>) -> ProgResult<ScheduleOutcome> {
        let mut slots = slots.lock().map_err(|_| lock_err("session.futures"))?;
        let decision = slots.decide();
        if decision == SlotDecision::Skip {
            debug!("both prediction slots busy; trigger coalesced");
            return Ok(ScheduleOutcome::Coalesced);
        }

        match self.submit(task) {
            Ok(handle) => {
                let id = handle.id();
                slots.place(decision, handle);
                debug!(job_id = %id, ?decision, "prediction job submitted");
                Ok(ScheduleOutcome::Submitted(id))
            }
            Err(ProgError::Execution(err @ (ExecutionError::QueueFull { .. } | ExecutionError::Disconnected { .. }))) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(error = %err, "prediction trigger rejected");
                Ok(ScheduleOutcome::Rejected)
            }
            Err(err) => Err(err),
        }
    }

    /// Closes the queue, lets the workers finish queued jobs and joins them.
    pub fn shutdown(&self) -> ProgResult<()> {
        let pool = self.pool.write().map_err(|_| lock_err("scheduler.pool"))?.take();
        if let Some(pool) = pool {
            pool.shutdown();
            debug!("prediction scheduler stopped");
        }
        Ok(())
    }

    #[cfg(test)]
    fn submit_sleep(&self, duration: Duration) -> ProgResult<Receiver<()>> {
        let (tx, rx) = bounded::<()>(1);
        self.try_submit(Job::Sleep { duration, reply: tx })?;
        Ok(rx)
    }
}

impl Drop for PredictionScheduler {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.pool.write() {
            if let Some(pool) = guard.take() {
                // Do not join: a job may still be running a long simulation.
                // Workers exit once the queue is drained and the sender is gone.
                drop(pool.tx);
                drop(pool.workers);
            }
        }
    }
}
